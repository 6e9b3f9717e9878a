//! Time-bounded execution.
//!
//! [`TimeoutManager`] bounds each operation by a fixed budget.
//! [`DeadlineManager`] bounds a group of operations by one absolute deadline:
//! each call gets whatever time remains, and calls made after the deadline
//! are rejected without running.

use crate::metadata;
use parking_lot::Mutex;
use resilience_core::{
    validate_config, ConfigError, EventBus, EventEmitter, EventKind, ExceptionHandler,
    ExceptionPolicy, PatternType, ResilienceError, TimeoutReason,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use validator::{Validate, ValidationError};

/// Timeout configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_budget"))]
pub struct TimeoutConfig {
    /// Time each operation may take
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

fn validate_budget(config: &TimeoutConfig) -> Result<(), ValidationError> {
    if config.timeout.is_zero() {
        return Err(ValidationError::new("timeout_must_be_positive"));
    }
    Ok(())
}

#[derive(Debug, Default)]
struct TimerCounters {
    total: u64,
    successful: u64,
    failed: u64,
    timed_out: u64,
    rejected: u64,
    total_execution: Duration,
}

/// Bookkeeping shared by both managers.
struct Timer {
    name: String,
    counters: Mutex<TimerCounters>,
    events: EventEmitter,
    exceptions: ExceptionHandler,
}

impl Timer {
    fn new(name: String) -> Self {
        Self {
            events: EventEmitter::new(name.clone(), PatternType::Timeout),
            exceptions: ExceptionHandler::new(name.clone(), PatternType::Timeout),
            counters: Mutex::new(TimerCounters::default()),
            name,
        }
    }

    async fn run<F, Fut, T, E>(
        &self,
        limit: Duration,
        reason: TimeoutReason,
        operation: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let started = Instant::now();
        let outcome = tokio::time::timeout(limit, operation()).await;
        let elapsed = started.elapsed();

        {
            let mut c = self.counters.lock();
            c.total += 1;
            c.total_execution += elapsed;
            match &outcome {
                Ok(Ok(_)) => c.successful += 1,
                Ok(Err(_)) => c.failed += 1,
                Err(_) => c.timed_out += 1,
            }
        }

        match outcome {
            Ok(Ok(value)) => {
                self.events
                    .emit_with(EventKind::TimeoutSuccess, |e| {
                        e.with("elapsed_ms", elapsed.as_millis() as u64)
                    })
                    .await;
                Ok(value)
            }
            Ok(Err(error)) => Err(ResilienceError::Operation(error)),
            Err(_) => {
                warn!(timeout = %self.name, limit = ?limit, reason = %reason, "Operation timed out");
                self.events
                    .emit_with(EventKind::TimeoutOccurred, |e| {
                        e.with("timeout_ms", limit.as_millis() as u64)
                            .with("reason", reason.as_str())
                    })
                    .await;
                Err(self.expired(limit, reason, elapsed))
            }
        }
    }

    fn reject_expired<E>(&self) -> ResilienceError<E> {
        {
            let mut c = self.counters.lock();
            c.total += 1;
            c.rejected += 1;
        }
        debug!(timeout = %self.name, "Deadline already passed");
        self.expired(Duration::ZERO, TimeoutReason::DeadlineExceeded, Duration::ZERO)
    }

    fn expired<E>(&self, limit: Duration, reason: TimeoutReason, elapsed: Duration) -> ResilienceError<E> {
        let message = match reason {
            TimeoutReason::TimeoutExceeded => {
                format!("Operation '{}' exceeded its {limit:?} timeout", self.name)
            }
            TimeoutReason::DeadlineExceeded => {
                format!("Operation '{}' exceeded its deadline", self.name)
            }
        };
        let ctx = self.exceptions.context(
            reason,
            message,
            None,
            metadata(json!({
                "timeout_ms": limit.as_millis() as u64,
                "elapsed_ms": elapsed.as_millis() as u64,
            })),
        );
        self.exceptions.handle(
            &ctx,
            ResilienceError::Timeout {
                name: self.name.clone(),
                timeout: limit,
                reason,
            },
        )
    }

    fn metrics(&self, timeout: Duration) -> TimeoutMetrics {
        let c = self.counters.lock();
        let completed = c.successful + c.failed + c.timed_out;
        TimeoutMetrics {
            name: self.name.clone(),
            timeout,
            total_operations: c.total,
            successful_operations: c.successful,
            failed_operations: c.failed,
            timed_out_operations: c.timed_out,
            rejected_operations: c.rejected,
            average_execution_time: u32::try_from(completed)
                .ok()
                .filter(|n| *n > 0)
                .map_or(Duration::ZERO, |n| c.total_execution / n),
        }
    }
}

/// Bounds each operation by a fixed time budget
pub struct TimeoutManager {
    config: TimeoutConfig,
    timer: Timer,
}

impl TimeoutManager {
    /// Create a new timeout manager
    ///
    /// # Errors
    /// Returns `ConfigError` if the timeout is zero
    pub fn new(name: impl Into<String>, config: TimeoutConfig) -> Result<Self, ConfigError> {
        validate_config("timeout", &config)?;
        Ok(Self {
            timer: Timer::new(name.into()),
            config,
        })
    }

    /// Create with a 30 second budget
    #[must_use]
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self {
            timer: Timer::new(name.into()),
            config: TimeoutConfig::default(),
        }
    }

    /// Forward events to a shared bus
    #[must_use]
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.timer.events = self.timer.events.with_bus(bus);
        self
    }

    /// Configure how timeouts are reported and surfaced
    #[must_use]
    pub fn with_exception_policy(mut self, policy: ExceptionPolicy) -> Self {
        self.timer.exceptions = self.timer.exceptions.with_policy(policy);
        self
    }

    /// Get the manager name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.timer.name
    }

    /// Configured budget
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    /// Event subscription surface
    #[must_use]
    pub fn events(&self) -> &EventEmitter {
        &self.timer.events
    }

    /// Run `operation` within the configured budget
    ///
    /// # Errors
    /// `Timeout` with `timeout_exceeded` if the budget runs out, or
    /// `Operation` carrying the operation's own error
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_with(self.config.timeout, operation).await
    }

    /// Run `operation` within an explicit budget
    ///
    /// # Errors
    /// See [`execute`](Self::execute)
    pub async fn execute_with<F, Fut, T, E>(
        &self,
        timeout: Duration,
        operation: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.timer
            .run(timeout, TimeoutReason::TimeoutExceeded, operation)
            .await
    }

    /// Get current metrics
    #[must_use]
    pub fn metrics(&self) -> TimeoutMetrics {
        self.timer.metrics(self.config.timeout)
    }
}

impl std::fmt::Debug for TimeoutManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutManager")
            .field("name", &self.timer.name)
            .field("timeout", &self.config.timeout)
            .finish_non_exhaustive()
    }
}

/// Bounds a group of operations by one absolute deadline
pub struct DeadlineManager {
    deadline: Instant,
    budget: Duration,
    timer: Timer,
}

impl DeadlineManager {
    /// Deadline `budget` from now
    #[must_use]
    pub fn after(name: impl Into<String>, budget: Duration) -> Self {
        Self {
            deadline: Instant::now() + budget,
            budget,
            timer: Timer::new(name.into()),
        }
    }

    /// Deadline at an absolute instant
    #[must_use]
    pub fn at(name: impl Into<String>, deadline: Instant) -> Self {
        Self {
            budget: deadline.saturating_duration_since(Instant::now()),
            deadline,
            timer: Timer::new(name.into()),
        }
    }

    /// Forward events to a shared bus
    #[must_use]
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.timer.events = self.timer.events.with_bus(bus);
        self
    }

    /// Configure how deadline expiries are reported and surfaced
    #[must_use]
    pub fn with_exception_policy(mut self, policy: ExceptionPolicy) -> Self {
        self.timer.exceptions = self.timer.exceptions.with_policy(policy);
        self
    }

    /// Get the manager name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.timer.name
    }

    /// The deadline
    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left, or `None` once the deadline has passed
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        let left = self.deadline.saturating_duration_since(Instant::now());
        (!left.is_zero()).then_some(left)
    }

    /// Whether the deadline has passed
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.remaining().is_none()
    }

    /// Event subscription surface
    #[must_use]
    pub fn events(&self) -> &EventEmitter {
        &self.timer.events
    }

    /// Run `operation` within the time left before the deadline
    ///
    /// # Errors
    /// `Timeout` with `deadline_exceeded` if the deadline has passed or
    /// passes while running, or `Operation` carrying the operation's error
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match self.remaining() {
            Some(left) => {
                self.timer
                    .run(left, TimeoutReason::DeadlineExceeded, operation)
                    .await
            }
            None => {
                self.timer
                    .events
                    .emit_with(EventKind::TimeoutOccurred, |e| {
                        e.with("timeout_ms", 0_u64)
                            .with("reason", TimeoutReason::DeadlineExceeded.as_str())
                    })
                    .await;
                Err(self.timer.reject_expired())
            }
        }
    }

    /// Get current metrics; `timeout` is the original budget
    #[must_use]
    pub fn metrics(&self) -> TimeoutMetrics {
        self.timer.metrics(self.budget)
    }
}

impl std::fmt::Debug for DeadlineManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadlineManager")
            .field("name", &self.timer.name)
            .field("remaining", &self.remaining())
            .finish_non_exhaustive()
    }
}

/// Timeout metrics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct TimeoutMetrics {
    /// Manager name
    pub name: String,
    /// Budget per operation
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Operations submitted
    pub total_operations: u64,
    /// Operations that returned `Ok` in time
    pub successful_operations: u64,
    /// Operations that returned `Err` in time
    pub failed_operations: u64,
    /// Operations cut off by the budget
    pub timed_out_operations: u64,
    /// Operations rejected because the deadline had already passed
    pub rejected_operations: u64,
    /// Mean time spent in operations that ran
    #[serde(with = "humantime_serde")]
    pub average_execution_time: Duration,
}

impl TimeoutMetrics {
    /// Share of operations that ran out of time, including rejections
    #[must_use]
    pub fn timeout_rate(&self) -> f64 {
        if self.total_operations == 0 {
            0.0
        } else {
            (self.timed_out_operations + self.rejected_operations) as f64
                / self.total_operations as f64
        }
    }

    /// Share of operations that returned `Ok` in time
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.total_operations == 0 {
            0.0
        } else {
            self.successful_operations as f64 / self.total_operations as f64
        }
    }
}
