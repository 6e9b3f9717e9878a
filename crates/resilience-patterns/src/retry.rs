//! Retry policy with configurable backoff.
//!
//! Provides retry logic with exponential, linear or constant backoff,
//! multiplicative jitter, a retryable-error predicate and cancellation.

use crate::metadata;
use parking_lot::Mutex;
use rand::Rng;
use resilience_core::{
    validate_config, wait, CancellationToken, ConfigError, EventBus, EventEmitter, EventKind,
    ExceptionHandler, ExceptionPolicy, PatternType, ResilienceError, RetryReason,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use validator::{Validate, ValidationError};

/// How the delay grows between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `initial_delay * backoff_multiplier^(attempt - 1)`
    #[default]
    Exponential,
    /// `initial_delay * attempt`
    Linear,
    /// `initial_delay` every time
    Constant,
}

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_delays"))]
pub struct RetryConfig {
    /// Total attempts, including the first call
    #[validate(range(min = 1))]
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    /// Upper bound on the pre-jitter delay
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Growth factor for exponential backoff
    #[validate(range(min = 1.0))]
    pub backoff_multiplier: f64,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0 - 1.0); the delay is scaled by a random factor in
    /// `[1 - jitter, 1 + jitter]`
    #[validate(range(min = 0.0, max = 1.0))]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    /// Many quick attempts
    #[must_use]
    pub fn aggressive() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            ..Self::default()
        }
    }

    /// Few, widely spaced attempts
    #[must_use]
    pub fn conservative() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            strategy: BackoffStrategy::Linear,
            jitter: 0.3,
            ..Self::default()
        }
    }

    /// Tuned for transient network faults
    #[must_use]
    pub fn network() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(15),
            backoff_multiplier: 2.5,
            ..Self::default()
        }
    }
}

fn validate_delays(config: &RetryConfig) -> Result<(), ValidationError> {
    if config.max_delay < config.initial_delay {
        return Err(ValidationError::new("max_delay_below_initial_delay"));
    }
    Ok(())
}

#[derive(Debug, Default)]
struct RetryCounters {
    executions: u64,
    successes: u64,
    successes_after_retry: u64,
    exhausted: u64,
    non_retryable: u64,
    cancelled: u64,
    attempts: u64,
}

/// Retry policy implementation
pub struct RetryPolicy {
    name: String,
    config: RetryConfig,
    cancel: Option<CancellationToken>,
    counters: Mutex<RetryCounters>,
    events: EventEmitter,
    exceptions: ExceptionHandler,
}

impl RetryPolicy {
    /// Create a new retry policy
    ///
    /// # Errors
    /// Returns `ConfigError` if the configuration is invalid
    pub fn new(name: impl Into<String>, config: RetryConfig) -> Result<Self, ConfigError> {
        validate_config("retry", &config)?;
        Ok(Self::from_valid(name.into(), config))
    }

    /// Create with default configuration
    #[must_use]
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::from_valid(name.into(), RetryConfig::default())
    }

    fn from_valid(name: String, config: RetryConfig) -> Self {
        Self {
            events: EventEmitter::new(name.clone(), PatternType::Retry),
            exceptions: ExceptionHandler::new(name.clone(), PatternType::Retry),
            name,
            config,
            cancel: None,
            counters: Mutex::new(RetryCounters::default()),
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

    /// Abort pending and future executions when `token` fires
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Get the policy name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Event subscription surface
    #[must_use]
    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    /// Delay before retrying after failed attempt `attempt` (1-indexed),
    /// before jitter
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = match self.config.strategy {
            BackoffStrategy::Exponential => {
                let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
                self.config.backoff_multiplier.powi(exponent)
            }
            BackoffStrategy::Linear => f64::from(attempt.max(1)),
            BackoffStrategy::Constant => return self.config.initial_delay,
        };
        scale(self.config.initial_delay, factor).min(self.config.max_delay)
    }

    /// Delay before retrying after failed attempt `attempt`, with jitter
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt);
        let jitter = self.config.jitter;
        if jitter <= 0.0 {
            return base;
        }
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        scale(base, factor)
    }

    /// Execute an operation, retrying every failure
    ///
    /// # Errors
    /// - `RetryExhausted` carrying the final error once attempts run out
    /// - `Cancelled` if the cancellation token fires
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error,
    {
        self.execute_if(operation, |_| true).await
    }

    /// Execute an operation, retrying only failures matching `is_retryable`
    ///
    /// # Errors
    /// As [`execute`](Self::execute), plus `Failed` with reason
    /// `non_retryable` for a failure the predicate rejects
    pub async fn execute_if<F, Fut, T, E, P>(
        &self,
        mut operation: F,
        is_retryable: P,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error,
        P: Fn(&E) -> bool,
    {
        self.counters.lock().executions += 1;
        let mut attempt = 0;

        loop {
            if self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
                return Err(self.cancelled(attempt));
            }

            attempt += 1;
            self.counters.lock().attempts += 1;

            let error = match operation().await {
                Ok(value) => {
                    self.record_success(attempt).await;
                    return Ok(value);
                }
                Err(error) => error,
            };

            if !is_retryable(&error) {
                self.counters.lock().non_retryable += 1;
                debug!(retry = %self.name, attempt, error = %error, "Non-retryable failure");
                let ctx = self.exceptions.context(
                    RetryReason::NonRetryable,
                    format!("Retry '{}' gave up on a non-retryable failure", self.name),
                    Some(&error),
                    metadata(json!({ "attempt": attempt })),
                );
                return Err(self.exceptions.handle(
                    &ctx,
                    ResilienceError::Failed {
                        name: self.name.clone(),
                        pattern: PatternType::Retry,
                        reason: RetryReason::NonRetryable.into(),
                        source: error,
                    },
                ));
            }

            if attempt >= self.config.max_attempts {
                return Err(self.exhausted(attempt, error).await);
            }

            let delay = self.delay_for_attempt(attempt);
            warn!(
                retry = %self.name,
                attempt,
                max_attempts = self.config.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying after error"
            );
            let message = error.to_string();
            self.events
                .emit_with(EventKind::RetryAttempt, move |e| {
                    e.with("attempt", attempt)
                        .with("delay_ms", delay.as_millis() as u64)
                        .with("error", message)
                })
                .await;

            if wait::sleep(delay, self.cancel.as_ref()).await.is_err() {
                return Err(self.cancelled(attempt));
            }
        }
    }

    /// Get current metrics
    #[must_use]
    pub fn metrics(&self) -> RetryMetrics {
        let c = self.counters.lock();
        RetryMetrics {
            name: self.name.clone(),
            total_executions: c.executions,
            successful_executions: c.successes,
            successes_after_retry: c.successes_after_retry,
            exhausted_executions: c.exhausted,
            non_retryable_failures: c.non_retryable,
            cancelled_executions: c.cancelled,
            total_attempts: c.attempts,
        }
    }

    async fn record_success(&self, attempt: u32) {
        {
            let mut c = self.counters.lock();
            c.successes += 1;
            if attempt > 1 {
                c.successes_after_retry += 1;
            }
        }
        if attempt > 1 {
            debug!(retry = %self.name, attempt, "Retry succeeded");
            self.events
                .emit_with(EventKind::RetrySuccess, |e| e.with("attempts", attempt))
                .await;
        }
    }

    async fn exhausted<E: std::error::Error>(&self, attempts: u32, last: E) -> ResilienceError<E> {
        self.counters.lock().exhausted += 1;
        warn!(retry = %self.name, attempts, error = %last, "Retry attempts exhausted");
        let message = last.to_string();
        self.events
            .emit_with(EventKind::RetryExhausted, move |e| {
                e.with("attempts", attempts).with("error", message)
            })
            .await;

        let ctx = self.exceptions.context(
            RetryReason::Exhausted,
            format!("Retry '{}' exhausted after {attempts} attempts", self.name),
            Some(&last),
            metadata(json!({
                "attempts": attempts,
                "max_attempts": self.config.max_attempts,
            })),
        );
        self.exceptions.handle(
            &ctx,
            ResilienceError::RetryExhausted {
                name: self.name.clone(),
                attempts,
                last,
            },
        )
    }

    fn cancelled<E>(&self, attempts: u32) -> ResilienceError<E> {
        self.counters.lock().cancelled += 1;
        debug!(retry = %self.name, attempts, "Retry cancelled");
        ResilienceError::Cancelled {
            name: self.name.clone(),
        }
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Multiply in nanoseconds, saturating instead of overflowing.
fn scale(duration: Duration, factor: f64) -> Duration {
    let nanos = (duration.as_nanos() as f64 * factor).round();
    if nanos >= u64::MAX as f64 {
        Duration::from_nanos(u64::MAX)
    } else {
        Duration::from_nanos(nanos.max(0.0) as u64)
    }
}

/// Retry metrics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct RetryMetrics {
    /// Policy name
    pub name: String,
    /// Calls to `execute`/`execute_if`
    pub total_executions: u64,
    /// Executions that eventually returned a value
    pub successful_executions: u64,
    /// Successful executions that needed at least one retry
    pub successes_after_retry: u64,
    /// Executions that ran out of attempts
    pub exhausted_executions: u64,
    /// Executions stopped by the retryable predicate
    pub non_retryable_failures: u64,
    /// Executions stopped by cancellation
    pub cancelled_executions: u64,
    /// Operation invocations across all executions
    pub total_attempts: u64,
}

impl RetryMetrics {
    /// Average invocations per execution
    #[must_use]
    pub fn average_attempts(&self) -> f64 {
        if self.total_executions == 0 {
            0.0
        } else {
            self.total_attempts as f64 / self.total_executions as f64
        }
    }

    /// Share of executions that returned a value
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.total_executions == 0 {
            0.0
        } else {
            self.successful_executions as f64 / self.total_executions as f64
        }
    }
}

/// Builder for retry policy
#[derive(Debug)]
pub struct RetryPolicyBuilder {
    name: String,
    config: RetryConfig,
}

impl RetryPolicyBuilder {
    /// Create a new builder
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: RetryConfig::default(),
        }
    }

    /// Set total attempts
    #[must_use]
    pub fn max_attempts(mut self, n: u32) -> Self {
        self.config.max_attempts = n;
        self
    }

    /// Set the first delay
    #[must_use]
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.config.initial_delay = delay;
        self
    }

    /// Set max delay
    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.config.max_delay = delay;
        self
    }

    /// Set backoff multiplier
    #[must_use]
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.config.backoff_multiplier = multiplier;
        self
    }

    /// Set backoff strategy
    #[must_use]
    pub fn strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.config.strategy = strategy;
        self
    }

    /// Set jitter factor
    #[must_use]
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.config.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Build the policy
    ///
    /// # Errors
    /// Returns `ConfigError` if the accumulated configuration is invalid
    pub fn build(self) -> Result<RetryPolicy, ConfigError> {
        RetryPolicy::new(self.name, self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use resilience_core::{handler_fn, Reason};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Clone, PartialEq, thiserror::Error)]
    enum FetchError {
        #[error("connection reset")]
        Transient,
        #[error("bad request")]
        Permanent,
    }

    fn policy(max_attempts: u32, strategy: BackoffStrategy) -> RetryPolicy {
        RetryPolicyBuilder::new("test-retry")
            .max_attempts(max_attempts)
            .initial_delay(Duration::from_millis(100))
            .max_delay(Duration::from_millis(1000))
            .strategy(strategy)
            .jitter(0.0)
            .build()
            .expect("valid config")
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = policy(5, BackoffStrategy::Exponential);
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(5), Duration::from_millis(1000));
        assert_eq!(policy.backoff(60), Duration::from_millis(1000));
    }

    #[test]
    fn test_linear_and_constant_backoff() {
        let linear = policy(5, BackoffStrategy::Linear);
        assert_eq!(linear.backoff(1), Duration::from_millis(100));
        assert_eq!(linear.backoff(3), Duration::from_millis(300));
        assert_eq!(linear.backoff(20), Duration::from_millis(1000));

        let constant = policy(5, BackoffStrategy::Constant);
        assert_eq!(constant.backoff(1), Duration::from_millis(100));
        assert_eq!(constant.backoff(7), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicyBuilder::new("jittery")
            .initial_delay(Duration::from_millis(1000))
            .max_delay(Duration::from_secs(10))
            .strategy(BackoffStrategy::Constant)
            .jitter(0.2)
            .build()
            .expect("valid config");

        for _ in 0..200 {
            let delay = policy.delay_for_attempt(1);
            assert!(delay >= Duration::from_millis(800), "{delay:?}");
            assert!(delay <= Duration::from_millis(1200), "{delay:?}");
        }
    }

    #[test]
    fn test_presets_are_valid() {
        for config in [
            RetryConfig::default(),
            RetryConfig::aggressive(),
            RetryConfig::conservative(),
            RetryConfig::network(),
        ] {
            assert!(RetryPolicy::new("preset", config).is_ok());
        }
        assert_eq!(RetryConfig::conservative().strategy, BackoffStrategy::Linear);
        assert_eq!(RetryConfig::network().max_attempts, 4);
    }

    #[test]
    fn test_with_defaults_matches_new() {
        let defaults = RetryPolicy::with_defaults("plain");
        let explicit = RetryPolicy::new("plain", RetryConfig::default()).expect("valid config");
        assert_eq!(defaults.name(), explicit.name());
        assert_eq!(defaults.config(), explicit.config());
        assert_eq!(defaults.metrics().total_executions, 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let zero_attempts = RetryConfig {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(RetryPolicy::new("bad", zero_attempts).is_err());

        let inverted = RetryConfig {
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(1),
            ..Default::default()
        };
        assert!(RetryPolicy::new("bad", inverted).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_success_after_failures() {
        let policy = policy(3, BackoffStrategy::Exponential);
        let counter = AtomicU32::new(0);
        let counter = &counter;

        let result = policy
            .execute(move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(FetchError::Transient)
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.expect("third attempt succeeds"), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        let metrics = policy.metrics();
        assert_eq!(metrics.successes_after_retry, 1);
        assert!((metrics.average_attempts() - 3.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausted_carries_last_error() {
        let policy = policy(3, BackoffStrategy::Exponential);
        let counter = AtomicU32::new(0);
        let counter = &counter;

        let err = policy
            .execute(move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(FetchError::Transient)
            })
            .await
            .expect_err("every attempt fails");

        assert_eq!(counter.load(Ordering::SeqCst), 3);
        match err {
            ResilienceError::RetryExhausted { attempts, last, .. } => {
                assert_eq!(attempts, 3);
                assert_eq!(last, FetchError::Transient);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_delays_are_slept() {
        let policy = policy(3, BackoffStrategy::Exponential);
        let started = tokio::time::Instant::now();

        let _ = policy
            .execute(|| async { Err::<(), _>(FetchError::Transient) })
            .await;

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(310), "{elapsed:?}");
    }

    #[tokio::test]
    async fn test_non_retryable_error() {
        let policy = policy(5, BackoffStrategy::Constant);
        let counter = AtomicU32::new(0);
        let counter = &counter;

        let err = policy
            .execute_if(
                move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(FetchError::Permanent)
                },
                |e| *e == FetchError::Transient,
            )
            .await
            .expect_err("permanent failure");

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(err.reason(), Some(Reason::Retry(RetryReason::NonRetryable)));
        assert_eq!(err.into_operation_error(), Some(FetchError::Permanent));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_backoff() {
        let token = CancellationToken::new();
        let policy = policy(10, BackoffStrategy::Constant).with_cancellation(token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            token.cancel();
        });

        let err = policy
            .execute(|| async { Err::<(), _>(FetchError::Transient) })
            .await
            .expect_err("cancelled");
        canceller.await.expect("canceller completes");

        assert!(matches!(err, ResilienceError::Cancelled { .. }));
        assert_eq!(policy.metrics().cancelled_executions, 1);
        assert!(policy.metrics().total_attempts < 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_events() {
        let policy = policy(3, BackoffStrategy::Constant);
        let attempts = Arc::new(Mutex::new(Vec::new()));
        let a = attempts.clone();
        policy.events().on(
            EventKind::RetryAttempt,
            handler_fn(move |event| {
                a.lock().push(event.get("attempt").cloned().unwrap_or_default());
                Ok(())
            }),
        );
        let exhausted = Arc::new(AtomicU32::new(0));
        let x = exhausted.clone();
        policy.events().on(
            EventKind::RetryExhausted,
            handler_fn(move |_| {
                x.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        let _ = policy
            .execute(|| async { Err::<(), _>(FetchError::Transient) })
            .await;

        assert_eq!(*attempts.lock(), vec![json!(1), json!(2)]);
        assert_eq!(exhausted.load(Ordering::SeqCst), 1);
    }
}
