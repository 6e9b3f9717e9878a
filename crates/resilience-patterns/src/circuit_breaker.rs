//! Circuit breaker pattern implementation.
//!
//! The circuit breaker prevents cascading failures by stopping requests
//! to a failing dependency and allowing it time to recover.
//!
//! All state lives behind one mutex. Admission, outcome recording and every
//! transition happen inside that critical section, so two concurrent callers
//! can never both act on a pre-transition view of the circuit. The lock is
//! never held across the guarded operation or across event dispatch.

use crate::metadata;
use parking_lot::Mutex;
use resilience_core::{
    validate_config, CircuitBreakerReason, ConfigError, EventBus, EventEmitter, EventKind,
    ExceptionHandler, ExceptionPolicy, Metadata, PatternType, ResilienceError, TimeoutReason,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use validator::{Validate, ValidationError};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally
    Closed,
    /// Circuit is open, requests are rejected
    Open,
    /// Circuit is half-open, a limited number of probes test recovery
    HalfOpen,
}

impl CircuitState {
    /// Stable string code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_durations"))]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    #[validate(range(min = 1))]
    pub failure_threshold: u32,
    /// Time the circuit stays open before a probe is allowed
    #[serde(with = "humantime_serde")]
    pub recovery_timeout: Duration,
    /// Consecutive half-open successes that close the circuit
    #[validate(range(min = 1))]
    pub success_threshold: u32,
    /// Concurrent probe calls allowed while half-open
    #[validate(range(min = 1))]
    pub half_open_max_calls: u32,
    /// Per-call timeout; an expired call counts as a failure
    #[serde(with = "humantime_serde")]
    pub call_timeout: Option<Duration>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 2,
            half_open_max_calls: 1,
            call_timeout: None,
        }
    }
}

fn validate_durations(config: &CircuitBreakerConfig) -> Result<(), ValidationError> {
    if config.recovery_timeout.is_zero() {
        return Err(ValidationError::new("recovery_timeout_must_be_positive"));
    }
    if config.call_timeout.is_some_and(|t| t.is_zero()) {
        return Err(ValidationError::new("call_timeout_must_be_positive"));
    }
    Ok(())
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    /// Bumped on every transition; probe tickets from an earlier period never match
    generation: u64,
    consecutive_failures: u32,
    consecutive_successes: u32,
    half_open_in_flight: u32,
    opened_at: Option<Instant>,
    last_failure_at: Option<Instant>,
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    rejected_requests: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            generation: 0,
            consecutive_failures: 0,
            consecutive_successes: 0,
            half_open_in_flight: 0,
            opened_at: None,
            last_failure_at: None,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            rejected_requests: 0,
        }
    }

    fn open(&mut self, now: Instant) {
        self.generation += 1;
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.consecutive_successes = 0;
        self.half_open_in_flight = 0;
    }

    fn half_open(&mut self) {
        self.generation += 1;
        self.state = CircuitState::HalfOpen;
        self.consecutive_successes = 0;
        self.half_open_in_flight = 0;
    }

    fn close(&mut self) {
        self.generation += 1;
        self.state = CircuitState::Closed;
        self.opened_at = None;
        self.consecutive_failures = 0;
        self.half_open_in_flight = 0;
    }

    fn is_current_probe(&self, ticket: Ticket) -> bool {
        ticket.probe
            && self.state == CircuitState::HalfOpen
            && self.generation == ticket.generation
    }

    /// Outcomes of calls admitted outside the current half-open period only
    /// touch the cumulative counters while half-open.
    fn drives_state(&self, ticket: Ticket) -> bool {
        self.state != CircuitState::HalfOpen || self.is_current_probe(ticket)
    }

    fn release_probe(&mut self, ticket: Ticket) {
        if self.is_current_probe(ticket) {
            self.half_open_in_flight = self.half_open_in_flight.saturating_sub(1);
        }
    }
}

/// Which period admitted a call, and whether it holds a probe slot
#[derive(Debug, Clone, Copy)]
struct Ticket {
    generation: u64,
    probe: bool,
}

/// A state change observed inside the critical section, reported after it.
#[derive(Debug, Clone, Copy)]
struct Transition {
    from: CircuitState,
    to: CircuitState,
    failures: u32,
    successes: u32,
}

enum Admission {
    Admitted {
        ticket: Ticket,
        transition: Option<Transition>,
    },
    Rejected(CircuitBreakerReason),
}

/// Admission for one call through a [`CircuitBreaker`].
///
/// Hand it back through [`CircuitBreaker::on_success`] or
/// [`CircuitBreaker::on_failure`]. Dropping it unreported returns its
/// half-open probe slot without counting an outcome.
#[must_use = "report the outcome with on_success or on_failure"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    ticket: Ticket,
    settled: bool,
}

impl CallPermit<'_> {
    /// Whether this call is a half-open probe
    #[must_use]
    pub fn is_probe(&self) -> bool {
        self.ticket.probe
    }

    fn settle(mut self) -> Ticket {
        self.settled = true;
        self.ticket
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.state.lock().release_probe(self.ticket);
        }
    }
}

impl std::fmt::Debug for CallPermit<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallPermit")
            .field("breaker", &self.breaker.name)
            .field("ticket", &self.ticket)
            .finish()
    }
}

/// Circuit breaker guarding one dependency
pub struct CircuitBreaker {
    /// Breaker name
    name: String,
    /// Configuration
    config: CircuitBreakerConfig,
    /// State, counters and metrics under a single lock
    state: Mutex<BreakerState>,
    events: EventEmitter,
    exceptions: ExceptionHandler,
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    ///
    /// # Errors
    /// Returns `ConfigError` if the configuration is invalid
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Result<Self, ConfigError> {
        validate_config("circuit breaker", &config)?;
        Ok(Self::from_valid(name.into(), config))
    }

    /// Create with default configuration
    #[must_use]
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::from_valid(name.into(), CircuitBreakerConfig::default())
    }

    pub(crate) fn from_valid(name: String, config: CircuitBreakerConfig) -> Self {
        Self {
            events: EventEmitter::new(name.clone(), PatternType::CircuitBreaker),
            exceptions: ExceptionHandler::new(name.clone(), PatternType::CircuitBreaker),
            name,
            config,
            state: Mutex::new(BreakerState::new()),
        }
    }

    /// Forward events to a shared bus
    #[must_use]
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.events = self.events.with_bus(bus);
        self
    }

    /// Configure how failures are reported and surfaced
    #[must_use]
    pub fn with_exception_policy(mut self, policy: ExceptionPolicy) -> Self {
        self.exceptions = self.exceptions.with_policy(policy);
        self
    }

    /// Get the breaker name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Event subscription surface
    #[must_use]
    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    /// Get the current state
    ///
    /// An open circuit whose recovery timeout has elapsed still reports
    /// `Open` until the next admission attempt moves it to half-open.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Check whether a call may proceed.
    ///
    /// An open circuit whose recovery timeout has elapsed moves to half-open.
    /// No probe slot stays reserved; use [`try_acquire`](Self::try_acquire)
    /// to hold one for the duration of a call.
    pub async fn can_execute(&self) -> bool {
        self.admit().await.is_ok()
    }

    /// Admit one call, holding a probe slot while half-open.
    ///
    /// # Errors
    /// Returns `ResilienceError::CircuitOpen` if the call is not admitted
    pub async fn try_acquire(&self) -> Result<CallPermit<'_>, ResilienceError> {
        self.admit().await.map_err(|reason| self.rejection(reason))
    }

    /// Record a successful call admitted by [`try_acquire`](Self::try_acquire)
    pub async fn on_success(&self, permit: CallPermit<'_>) {
        debug_assert!(std::ptr::eq(permit.breaker, self));
        self.record_success(permit.settle()).await;
    }

    /// Record a failed call admitted by [`try_acquire`](Self::try_acquire).
    ///
    /// Returns `ThresholdExceeded` if this failure opened the circuit,
    /// `CallFailed` otherwise.
    pub async fn on_failure(&self, permit: CallPermit<'_>) -> CircuitBreakerReason {
        debug_assert!(std::ptr::eq(permit.breaker, self));
        self.record_failure(permit.settle(), CircuitBreakerReason::CallFailed)
            .await
    }

    /// Execute an operation through the breaker. Every error counts as a failure.
    ///
    /// # Errors
    /// - `CircuitOpen` without invoking `operation` if admission is denied
    /// - `Timeout` if the configured call timeout expires
    /// - `Failed` carrying `threshold_exceeded` or `call_failed` otherwise
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error,
    {
        self.call_if(operation, |_| true).await
    }

    /// Execute an operation, counting only errors matching `is_failure`.
    ///
    /// Errors that do not match pass through as `Operation` and leave the
    /// breaker's counters untouched.
    ///
    /// # Errors
    /// See [`call`](Self::call)
    pub async fn call_if<F, Fut, T, E, P>(
        &self,
        operation: F,
        is_failure: P,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error,
        P: Fn(&E) -> bool,
    {
        let permit = match self.admit().await {
            Ok(permit) => permit,
            Err(reason) => return Err(self.rejection(reason).widen()),
        };

        let outcome = match self.config.call_timeout {
            Some(limit) => tokio::time::timeout(limit, operation()).await.ok(),
            None => Some(operation().await),
        };

        match outcome {
            Some(Ok(value)) => {
                self.record_success(permit.settle()).await;
                Ok(value)
            }
            Some(Err(error)) if is_failure(&error) => {
                let reason = self
                    .record_failure(permit.settle(), CircuitBreakerReason::CallFailed)
                    .await;
                let ctx = self.exceptions.context(
                    reason,
                    format!("Circuit breaker '{}' recorded a failed call", self.name),
                    Some(&error),
                    self.snapshot_metadata(),
                );
                Err(self.exceptions.handle(
                    &ctx,
                    ResilienceError::Failed {
                        name: self.name.clone(),
                        pattern: PatternType::CircuitBreaker,
                        reason: reason.into(),
                        source: error,
                    },
                ))
            }
            Some(Err(error)) => {
                drop(permit);
                Err(ResilienceError::Operation(error))
            }
            None => {
                let limit = self.config.call_timeout.unwrap_or_default();
                let reason = self
                    .record_failure(permit.settle(), CircuitBreakerReason::Timeout)
                    .await;
                warn!(breaker = %self.name, timeout = ?limit, "Circuit breaker call timed out");
                let ctx = self.exceptions.context(
                    reason,
                    format!("Circuit breaker '{}' call timed out after {limit:?}", self.name),
                    None,
                    self.snapshot_metadata(),
                );
                Err(self.exceptions.handle(
                    &ctx,
                    ResilienceError::Timeout {
                        name: self.name.clone(),
                        timeout: limit,
                        reason: TimeoutReason::TimeoutExceeded,
                    },
                ))
            }
        }
    }

    /// Reset the circuit breaker to closed state and clear its metrics
    pub async fn reset(&self) {
        let old = {
            let mut st = self.state.lock();
            let old = st.state;
            let generation = st.generation + 1;
            *st = BreakerState::new();
            st.generation = generation;
            old
        };

        info!(breaker = %self.name, from = %old, "Circuit breaker manually reset");
        self.events
            .emit_with(EventKind::CircuitReset, |e| {
                e.with("old_state", old.as_str()).with("new_state", "closed")
            })
            .await;
    }

    /// Force the circuit open (for testing or manual intervention)
    pub async fn force_open(&self) {
        let transition = {
            let mut st = self.state.lock();
            let from = st.state;
            st.open(Instant::now());
            (from != CircuitState::Open).then_some(Transition {
                from,
                to: CircuitState::Open,
                failures: st.consecutive_failures,
                successes: st.consecutive_successes,
            })
        };

        if let Some(t) = transition {
            warn!(breaker = %self.name, "Circuit breaker forced open");
            self.emit_transition(t).await;
        }
    }

    /// Get current metrics
    #[must_use]
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let st = self.state.lock();
        CircuitBreakerMetrics {
            name: self.name.clone(),
            state: st.state,
            total_requests: st.total_requests,
            successful_requests: st.successful_requests,
            failed_requests: st.failed_requests,
            rejected_requests: st.rejected_requests,
            consecutive_failures: st.consecutive_failures,
            consecutive_successes: st.consecutive_successes,
            half_open_in_flight: st.half_open_in_flight,
            time_since_last_failure: st.last_failure_at.map(|at| at.elapsed()),
        }
    }

    /// The returned permit is built before any event dispatch, so a caller
    /// dropped mid-dispatch still returns its probe slot.
    async fn admit(&self) -> Result<CallPermit<'_>, CircuitBreakerReason> {
        let admission = {
            let mut st = self.state.lock();
            let now = Instant::now();
            match st.state {
                CircuitState::Closed => Admission::Admitted {
                    ticket: Ticket {
                        generation: st.generation,
                        probe: false,
                    },
                    transition: None,
                },
                CircuitState::Open => {
                    let elapsed = st
                        .opened_at
                        .map_or(Duration::ZERO, |at| now.saturating_duration_since(at));
                    if elapsed >= self.config.recovery_timeout {
                        st.half_open();
                        st.half_open_in_flight = 1;
                        Admission::Admitted {
                            ticket: Ticket {
                                generation: st.generation,
                                probe: true,
                            },
                            transition: Some(Transition {
                                from: CircuitState::Open,
                                to: CircuitState::HalfOpen,
                                failures: st.consecutive_failures,
                                successes: 0,
                            }),
                        }
                    } else {
                        st.rejected_requests += 1;
                        Admission::Rejected(CircuitBreakerReason::CircuitOpen)
                    }
                }
                CircuitState::HalfOpen => {
                    if st.half_open_in_flight < self.config.half_open_max_calls {
                        st.half_open_in_flight += 1;
                        Admission::Admitted {
                            ticket: Ticket {
                                generation: st.generation,
                                probe: true,
                            },
                            transition: None,
                        }
                    } else {
                        st.rejected_requests += 1;
                        Admission::Rejected(CircuitBreakerReason::HalfOpenRejection)
                    }
                }
            }
        };

        match admission {
            Admission::Admitted { ticket, transition } => {
                let permit = CallPermit {
                    breaker: self,
                    ticket,
                    settled: false,
                };
                if let Some(t) = transition {
                    info!(breaker = %self.name, "Circuit breaker half-open, testing");
                    self.emit_transition(t).await;
                }
                if ticket.probe {
                    self.events.emit_kind(EventKind::HalfOpenProbe).await;
                }
                Ok(permit)
            }
            Admission::Rejected(reason) => {
                debug!(breaker = %self.name, reason = %reason, "Circuit breaker rejected call");
                self.events
                    .emit_with(EventKind::RequestRejected, |e| e.with("reason", reason.as_str()))
                    .await;
                Err(reason)
            }
        }
    }

    async fn record_success(&self, ticket: Ticket) {
        let (transition, successes) = {
            let mut st = self.state.lock();
            st.total_requests += 1;
            st.successful_requests += 1;
            let counts = st.drives_state(ticket);
            st.release_probe(ticket);
            if counts {
                st.consecutive_failures = 0;
                st.consecutive_successes += 1;
            }

            let transition = (counts
                && st.state == CircuitState::HalfOpen
                && st.consecutive_successes >= self.config.success_threshold)
                .then(|| {
                    let successes = st.consecutive_successes;
                    st.close();
                    Transition {
                        from: CircuitState::HalfOpen,
                        to: CircuitState::Closed,
                        failures: 0,
                        successes,
                    }
                });
            (transition, st.consecutive_successes)
        };

        self.events
            .emit_with(EventKind::CallSuccess, |e| e.with("success_count", successes))
            .await;
        if let Some(t) = transition {
            info!(breaker = %self.name, "Circuit breaker closed");
            self.emit_transition(t).await;
        }
    }

    /// Returns the failure's classification, decided inside the lock.
    async fn record_failure(
        &self,
        ticket: Ticket,
        otherwise: CircuitBreakerReason,
    ) -> CircuitBreakerReason {
        let (reason, transition, failures) = {
            let mut st = self.state.lock();
            let now = Instant::now();
            st.total_requests += 1;
            st.failed_requests += 1;
            st.last_failure_at = Some(now);
            let counts = st.drives_state(ticket);
            st.release_probe(ticket);
            if counts {
                st.consecutive_failures += 1;
                st.consecutive_successes = 0;
            }

            let from = st.state;
            let (reason, opened) = match from {
                CircuitState::Closed if st.consecutive_failures >= self.config.failure_threshold => {
                    st.open(now);
                    (CircuitBreakerReason::ThresholdExceeded, true)
                }
                CircuitState::HalfOpen if counts => {
                    st.open(now);
                    (otherwise, true)
                }
                _ => (otherwise, false),
            };
            let transition = opened.then_some(Transition {
                from,
                to: CircuitState::Open,
                failures: st.consecutive_failures,
                successes: 0,
            });
            (reason, transition, st.consecutive_failures)
        };

        self.events
            .emit_with(EventKind::CallFailure, |e| {
                e.with("failure_count", failures).with("reason", reason.as_str())
            })
            .await;
        if let Some(t) = transition {
            warn!(
                breaker = %self.name,
                from = %t.from,
                failures = t.failures,
                "Circuit breaker opened"
            );
            self.emit_transition(t).await;
        }
        reason
    }

    async fn emit_transition(&self, t: Transition) {
        self.events
            .emit_with(EventKind::StateChange, |e| {
                e.with("old_state", t.from.as_str())
                    .with("new_state", t.to.as_str())
                    .with("failure_count", t.failures)
                    .with("success_count", t.successes)
            })
            .await;
    }

    fn rejection(&self, reason: CircuitBreakerReason) -> ResilienceError {
        let state = self.state();
        let ctx = self.exceptions.context(
            reason,
            format!("Circuit breaker '{}' is {state}", self.name),
            None,
            self.snapshot_metadata(),
        );
        self.exceptions.handle(
            &ctx,
            ResilienceError::CircuitOpen {
                name: self.name.clone(),
                reason,
            },
        )
    }

    fn snapshot_metadata(&self) -> Metadata {
        let st = self.state.lock();
        metadata(json!({
            "state": st.state.as_str(),
            "consecutive_failures": st.consecutive_failures,
            "failure_threshold": self.config.failure_threshold,
            "half_open_in_flight": st.half_open_in_flight,
        }))
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Circuit breaker metrics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerMetrics {
    /// Breaker name
    pub name: String,
    /// Current state
    pub state: CircuitState,
    /// Calls that ran and reported an outcome
    pub total_requests: u64,
    /// Successful calls
    pub successful_requests: u64,
    /// Failed calls
    pub failed_requests: u64,
    /// Calls rejected without running
    pub rejected_requests: u64,
    /// Current consecutive failure streak
    pub consecutive_failures: u32,
    /// Current consecutive success streak
    pub consecutive_successes: u32,
    /// Probe calls currently running
    pub half_open_in_flight: u32,
    /// Time since the most recent failure
    #[serde(with = "humantime_serde")]
    pub time_since_last_failure: Option<Duration>,
}

impl CircuitBreakerMetrics {
    /// Calculate failure rate
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.failed_requests as f64 / self.total_requests as f64
        }
    }
}
