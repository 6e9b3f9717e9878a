//! Water-mark backpressure.
//!
//! Tracks pending work against a hard ceiling and raises an active signal
//! when the pending count reaches the high water mark. The signal stays up
//! until the count drains to the low water mark, so producers watching it
//! do not flap between pausing and resuming.
//!
//! The manager only enforces its own ceiling. Slowing a producer is up to
//! whoever watches [`BackpressureManager::subscribe`].

use crate::metadata;
use parking_lot::Mutex;
use resilience_core::{
    validate_config, wait, BackpressureReason, ConfigError, EventBus, EventEmitter, EventKind,
    ExceptionHandler, ExceptionPolicy, PatternType, ResilienceError,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};
use validator::{Validate, ValidationError};

/// Backpressure configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_water_marks"))]
pub struct BackpressureConfig {
    /// Hard ceiling on pending work
    #[validate(range(min = 1))]
    pub max_pending: usize,
    /// Pending count that raises the signal
    pub high_water_mark: usize,
    /// Pending count that clears the signal
    pub low_water_mark: usize,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            max_pending: 1000,
            high_water_mark: 800,
            low_water_mark: 200,
        }
    }
}

fn validate_water_marks(config: &BackpressureConfig) -> Result<(), ValidationError> {
    if config.low_water_mark >= config.high_water_mark {
        return Err(ValidationError::new("low_water_mark_not_below_high_water_mark"));
    }
    if config.high_water_mark >= config.max_pending {
        return Err(ValidationError::new("high_water_mark_not_below_max_pending"));
    }
    Ok(())
}

#[derive(Debug, Default)]
struct PressureState {
    pending: usize,
    active: bool,
    peak_pending: usize,
    admitted: u64,
    rejected: u64,
    released: u64,
    ignored_releases: u64,
    /// Timed waiters in arrival order; a release hands its slot to the front
    waiters: VecDeque<oneshot::Sender<()>>,
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    High(usize),
    Low(usize),
}

/// Water-mark flow control for one stream of work
pub struct BackpressureManager {
    name: String,
    config: BackpressureConfig,
    state: Mutex<PressureState>,
    signal: watch::Sender<bool>,
    events: EventEmitter,
    exceptions: ExceptionHandler,
}

impl BackpressureManager {
    /// Create a new backpressure manager
    ///
    /// # Errors
    /// Returns `ConfigError` unless `low_water_mark < high_water_mark < max_pending`
    pub fn new(name: impl Into<String>, config: BackpressureConfig) -> Result<Self, ConfigError> {
        validate_config("backpressure", &config)?;
        Ok(Self::from_valid(name.into(), config))
    }

    /// Create with default configuration
    #[must_use]
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::from_valid(name.into(), BackpressureConfig::default())
    }

    fn from_valid(name: String, config: BackpressureConfig) -> Self {
        Self {
            events: EventEmitter::new(name.clone(), PatternType::Backpressure),
            exceptions: ExceptionHandler::new(name.clone(), PatternType::Backpressure),
            name,
            config,
            state: Mutex::new(PressureState::default()),
            signal: watch::channel(false).0,
        }
    }

    /// Forward events to a shared bus
    #[must_use]
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.events = self.events.with_bus(bus);
        self
    }

    /// Configure how rejections are reported and surfaced
    #[must_use]
    pub fn with_exception_policy(mut self, policy: ExceptionPolicy) -> Self {
        self.exceptions = self.exceptions.with_policy(policy);
        self
    }

    /// Get the manager name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &BackpressureConfig {
        &self.config
    }

    /// Event subscription surface
    #[must_use]
    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    /// Whether the signal is up
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    /// Current pending count
    #[must_use]
    pub fn pending(&self) -> usize {
        self.state.lock().pending
    }

    /// Watch the active signal
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.signal.subscribe()
    }

    /// Admit one unit of work, or reject at the ceiling
    ///
    /// # Errors
    /// `Backpressure` with `system_overloaded` when the ceiling is reached
    pub async fn acquire(&self) -> Result<(), ResilienceError> {
        match self.try_admit() {
            Ok(signal) => {
                self.report(signal).await;
                Ok(())
            }
            Err(pending) => {
                debug!(backpressure = %self.name, pending, "Backpressure ceiling reached");
                self.events
                    .emit_with(EventKind::RequestRejected, |e| {
                        e.with("pending", pending)
                            .with("reason", BackpressureReason::SystemOverloaded.as_str())
                    })
                    .await;
                Err(self.rejection(BackpressureReason::SystemOverloaded, None))
            }
        }
    }

    /// Admit one unit of work, waiting up to `timeout` for room under the
    /// ceiling.
    ///
    /// Waiters are admitted in arrival order: a release passes its slot
    /// straight to the oldest waiter, and [`acquire`](Self::acquire) refuses
    /// while anyone is queued.
    ///
    /// # Errors
    /// `Backpressure` with `timeout_acquiring` when no room frees up in time
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<(), ResilienceError> {
        let rx = match self.admit_or_enqueue() {
            Ok(signal) => {
                self.report(signal).await;
                return Ok(());
            }
            Err(rx) => rx,
        };

        let mut waiter = QueuedWaiter {
            manager: self,
            rx,
            done: false,
        };
        if let Ok(Ok(())) = wait::wait_for(&mut waiter.rx, Some(timeout), None).await {
            waiter.done = true;
            return Ok(());
        }
        if waiter.withdraw() {
            return Ok(());
        }

        self.state.lock().rejected += 1;
        warn!(backpressure = %self.name, timeout = ?timeout, "Timed out waiting for backpressure room");
        self.events
            .emit_with(EventKind::RequestRejected, |e| {
                e.with("reason", BackpressureReason::TimeoutAcquiring.as_str())
            })
            .await;
        Err(self.rejection(BackpressureReason::TimeoutAcquiring, Some(timeout)))
    }

    /// Finish one unit of work. A release with nothing pending is ignored.
    pub async fn release(&self) {
        if let Some(signal) = self.release_state() {
            self.report(Some(signal)).await;
        }
    }

    /// Wait until the signal clears. Returns `false` if `timeout` passes first.
    pub async fn wait_for_relief(&self, timeout: Option<Duration>) -> bool {
        let mut rx = self.subscribe();
        let relieved = async move { rx.wait_for(|active| !*active).await.is_ok() };
        matches!(wait::wait_for(relieved, timeout, None).await, Ok(true))
    }

    /// Run `operation` as one unit of pending work
    ///
    /// # Errors
    /// Rejections from [`acquire`](Self::acquire), or `Operation` carrying
    /// the operation's own error
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.acquire().await.map_err(ResilienceError::widen)?;
        let mut guard = PendingGuard {
            manager: self,
            armed: true,
        };
        let result = operation().await;
        guard.armed = false;
        self.release().await;
        result.map_err(ResilienceError::Operation)
    }

    /// Get current metrics
    #[must_use]
    pub fn metrics(&self) -> BackpressureMetrics {
        let st = self.state.lock();
        BackpressureMetrics {
            name: self.name.clone(),
            pending: st.pending,
            max_pending: self.config.max_pending,
            high_water_mark: self.config.high_water_mark,
            low_water_mark: self.config.low_water_mark,
            active: st.active,
            peak_pending: st.peak_pending,
            total_admitted: st.admitted,
            total_rejected: st.rejected,
            total_released: st.released,
            ignored_releases: st.ignored_releases,
            waiting: st.waiters.len(),
        }
    }

    /// `None` at the ceiling or while timed waiters are queued.
    fn admit_locked(&self, st: &mut PressureState) -> Option<Option<Signal>> {
        st.waiters.retain(|w| !w.is_closed());
        if st.pending >= self.config.max_pending || !st.waiters.is_empty() {
            return None;
        }
        st.pending += 1;
        st.admitted += 1;
        st.peak_pending = st.peak_pending.max(st.pending);

        if !st.active && st.pending >= self.config.high_water_mark {
            st.active = true;
            self.signal.send_replace(true);
            return Some(Some(Signal::High(st.pending)));
        }
        Some(None)
    }

    /// Err carries the pending count at rejection.
    fn try_admit(&self) -> Result<Option<Signal>, usize> {
        let mut st = self.state.lock();
        match self.admit_locked(&mut st) {
            Some(signal) => Ok(signal),
            None => {
                st.rejected += 1;
                Err(st.pending)
            }
        }
    }

    fn admit_or_enqueue(&self) -> Result<Option<Signal>, oneshot::Receiver<()>> {
        let mut st = self.state.lock();
        if let Some(signal) = self.admit_locked(&mut st) {
            return Ok(signal);
        }
        let (tx, rx) = oneshot::channel();
        st.waiters.push_back(tx);
        Err(rx)
    }

    fn release_state(&self) -> Option<Signal> {
        let mut st = self.state.lock();
        if st.pending == 0 {
            st.ignored_releases += 1;
            return None;
        }
        st.released += 1;
        while let Some(waiter) = st.waiters.pop_front() {
            if waiter.send(()).is_ok() {
                st.admitted += 1;
                return None;
            }
        }
        st.pending -= 1;

        if st.active && st.pending <= self.config.low_water_mark {
            st.active = false;
            self.signal.send_replace(false);
            Some(Signal::Low(st.pending))
        } else {
            None
        }
    }

    async fn report(&self, signal: Option<Signal>) {
        match signal {
            Some(Signal::High(pending)) => {
                warn!(backpressure = %self.name, pending, "Backpressure activated");
                self.events
                    .emit_with(EventKind::BackpressureHigh, |e| {
                        e.with("pending", pending)
                            .with("high_water_mark", self.config.high_water_mark)
                    })
                    .await;
            }
            Some(Signal::Low(pending)) => {
                info!(backpressure = %self.name, pending, "Backpressure relieved");
                self.events
                    .emit_with(EventKind::BackpressureLow, |e| {
                        e.with("pending", pending)
                            .with("low_water_mark", self.config.low_water_mark)
                    })
                    .await;
            }
            None => {}
        }
    }

    fn rejection(&self, reason: BackpressureReason, timeout: Option<Duration>) -> ResilienceError {
        let (pending, active) = {
            let st = self.state.lock();
            (st.pending, st.active)
        };
        let message = match timeout {
            Some(t) => format!("Backpressure '{}' had no room within {t:?}", self.name),
            None => format!(
                "Backpressure '{}' is at its ceiling of {}",
                self.name, self.config.max_pending
            ),
        };
        let ctx = self.exceptions.context(
            reason,
            message,
            None,
            metadata(json!({
                "pending": pending,
                "max_pending": self.config.max_pending,
                "active": active,
            })),
        );
        self.exceptions.handle(
            &ctx,
            ResilienceError::Backpressure {
                name: self.name.clone(),
                reason,
            },
        )
    }
}

impl std::fmt::Debug for BackpressureManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackpressureManager")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

/// Releases the pending slot of a `call` whose future was dropped.
struct PendingGuard<'a> {
    manager: &'a BackpressureManager,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.manager.release_state();
        }
    }
}

/// A queued [`BackpressureManager::acquire_timeout`] caller.
///
/// Dropped while queued, it leaves the queue and gives back any slot
/// handed to it in the meantime.
struct QueuedWaiter<'a> {
    manager: &'a BackpressureManager,
    rx: oneshot::Receiver<()>,
    done: bool,
}

impl QueuedWaiter<'_> {
    /// Leave the queue. Returns `true` if a slot was handed over first.
    fn withdraw(&mut self) -> bool {
        self.done = true;
        self.rx.close();
        let handed_over = self.rx.try_recv().is_ok();
        self.manager.state.lock().waiters.retain(|w| !w.is_closed());
        handed_over
    }
}

impl Drop for QueuedWaiter<'_> {
    fn drop(&mut self) {
        if !self.done && self.withdraw() {
            self.manager.release_state();
        }
    }
}

/// Backpressure metrics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct BackpressureMetrics {
    /// Manager name
    pub name: String,
    /// Work currently pending
    pub pending: usize,
    /// Hard ceiling
    pub max_pending: usize,
    /// Signal raise threshold
    pub high_water_mark: usize,
    /// Signal clear threshold
    pub low_water_mark: usize,
    /// Whether the signal is up
    pub active: bool,
    /// Highest observed pending count
    pub peak_pending: usize,
    /// Work admitted
    pub total_admitted: u64,
    /// Work rejected at the ceiling or after a timed-out wait
    pub total_rejected: u64,
    /// Work released
    pub total_released: u64,
    /// Releases with nothing pending
    pub ignored_releases: u64,
    /// Callers queued in `acquire_timeout`
    pub waiting: usize,
}

impl BackpressureMetrics {
    /// Pending work as a share of the ceiling
    #[must_use]
    pub fn utilization(&self) -> f64 {
        self.pending as f64 / self.max_pending as f64
    }
}
