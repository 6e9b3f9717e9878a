//! Adaptive concurrency limiting.
//!
//! The limit follows an additive-increase/multiplicative-decrease loop:
//! every `measurement_window` completions the success rate is compared with
//! two thresholds. A healthy window raises the limit by `increase_rate`, a
//! distressed one scales it by `decrease_factor`, anything in between leaves
//! it alone.

use crate::metadata;
use parking_lot::Mutex;
use resilience_core::{
    validate_config, ConcurrencyReason, ConfigError, EventBus, EventEmitter, EventKind,
    ExceptionHandler, ExceptionPolicy, PatternType, ResilienceError,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};
use validator::{Validate, ValidationError};

/// Adaptive concurrency configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_limits"))]
pub struct AdaptiveConcurrencyConfig {
    /// Starting limit
    pub initial_limit: usize,
    /// Floor for the limit
    #[validate(range(min = 1))]
    pub min_limit: usize,
    /// Ceiling for the limit
    pub max_limit: usize,
    /// Added to the limit after a healthy window
    pub increase_rate: f64,
    /// Limit multiplier after a distressed window, in (0, 1)
    pub decrease_factor: f64,
    /// Completions per measurement window
    #[validate(range(min = 1))]
    pub measurement_window: u32,
    /// Success rate at or above which the limit grows
    #[validate(range(min = 0.0, max = 1.0))]
    pub success_threshold: f64,
    /// Success rate below which the limit shrinks
    #[validate(range(min = 0.0, max = 1.0))]
    pub failure_threshold: f64,
}

impl Default for AdaptiveConcurrencyConfig {
    fn default() -> Self {
        Self {
            initial_limit: 100,
            min_limit: 10,
            max_limit: 1000,
            increase_rate: 1.0,
            decrease_factor: 0.9,
            measurement_window: 100,
            success_threshold: 0.95,
            failure_threshold: 0.80,
        }
    }
}

fn validate_limits(config: &AdaptiveConcurrencyConfig) -> Result<(), ValidationError> {
    if config.min_limit > config.max_limit {
        return Err(ValidationError::new("min_limit_above_max_limit"));
    }
    if !(config.min_limit..=config.max_limit).contains(&config.initial_limit) {
        return Err(ValidationError::new("initial_limit_out_of_range"));
    }
    if config.increase_rate.is_nan() || config.increase_rate <= 0.0 {
        return Err(ValidationError::new("increase_rate_must_be_positive"));
    }
    if config.decrease_factor.is_nan()
        || config.decrease_factor <= 0.0
        || config.decrease_factor >= 1.0
    {
        return Err(ValidationError::new("decrease_factor_out_of_range"));
    }
    if config.failure_threshold >= config.success_threshold {
        return Err(ValidationError::new("failure_threshold_not_below_success_threshold"));
    }
    Ok(())
}

#[derive(Debug)]
struct LimiterState {
    limit: f64,
    active: usize,
    window_successes: u32,
    window_failures: u32,
    admitted: u64,
    rejected: u64,
    successes: u64,
    failures: u64,
    increases: u64,
    decreases: u64,
    ignored_releases: u64,
}

impl LimiterState {
    fn effective_limit(&self) -> usize {
        self.limit.floor() as usize
    }
}

#[derive(Debug, Clone, Copy)]
struct LimitChange {
    old: f64,
    new: f64,
    success_rate: f64,
}

/// Concurrency limiter whose limit adapts to observed success rates
pub struct AdaptiveConcurrencyLimiter {
    name: String,
    config: AdaptiveConcurrencyConfig,
    state: Mutex<LimiterState>,
    events: EventEmitter,
    exceptions: ExceptionHandler,
}

impl AdaptiveConcurrencyLimiter {
    /// Create a new limiter
    ///
    /// # Errors
    /// Returns `ConfigError` if the configuration is invalid
    pub fn new(
        name: impl Into<String>,
        config: AdaptiveConcurrencyConfig,
    ) -> Result<Self, ConfigError> {
        validate_config("adaptive concurrency", &config)?;
        Ok(Self::from_valid(name.into(), config))
    }

    /// Create with default configuration
    #[must_use]
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::from_valid(name.into(), AdaptiveConcurrencyConfig::default())
    }

    fn from_valid(name: String, config: AdaptiveConcurrencyConfig) -> Self {
        Self {
            events: EventEmitter::new(name.clone(), PatternType::AdaptiveConcurrency),
            exceptions: ExceptionHandler::new(name.clone(), PatternType::AdaptiveConcurrency),
            name,
            state: Mutex::new(LimiterState {
                limit: config.initial_limit as f64,
                active: 0,
                window_successes: 0,
                window_failures: 0,
                admitted: 0,
                rejected: 0,
                successes: 0,
                failures: 0,
                increases: 0,
                decreases: 0,
                ignored_releases: 0,
            }),
            config,
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

    /// Get the limiter name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &AdaptiveConcurrencyConfig {
        &self.config
    }

    /// Event subscription surface
    #[must_use]
    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    /// Current admission limit
    #[must_use]
    pub fn current_limit(&self) -> usize {
        self.state.lock().effective_limit()
    }

    /// Calls currently admitted
    #[must_use]
    pub fn active(&self) -> usize {
        self.state.lock().active
    }

    /// Admit a call if below the current limit
    pub async fn acquire(&self) -> bool {
        self.admit().await.is_ok()
    }

    /// Like [`acquire`](Self::acquire), reporting a rejection through the
    /// exception policy
    ///
    /// # Errors
    /// `ConcurrencyLimited` when the limit is reached
    pub async fn try_acquire(&self) -> Result<(), ResilienceError> {
        match self.admit().await {
            Ok(()) => Ok(()),
            Err((active, limit)) => {
                let ctx = self.exceptions.context(
                    ConcurrencyReason::LimitReached,
                    format!("Concurrency limiter '{}' is at its limit of {limit}", self.name),
                    None,
                    metadata(json!({ "active": active, "limit": limit })),
                );
                Err(self.exceptions.handle(
                    &ctx,
                    ResilienceError::ConcurrencyLimited {
                        name: self.name.clone(),
                        limit,
                        reason: ConcurrencyReason::LimitReached,
                    },
                ))
            }
        }
    }

    /// Record the outcome of an admitted call. A release with nothing
    /// admitted is ignored.
    pub async fn release(&self, success: bool) {
        if let Some(change) = self.release_state(Some(success)) {
            self.report(change).await;
        }
    }

    /// Run `operation` under the limit; `Ok` counts as success
    ///
    /// # Errors
    /// `ConcurrencyLimited` when the limit is reached, or `Operation`
    /// carrying the operation's own error
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.try_acquire().await.map_err(ResilienceError::widen)?;
        let mut guard = AdmittedGuard {
            limiter: self,
            armed: true,
        };
        let result = operation().await;
        guard.armed = false;
        self.release(result.is_ok()).await;
        result.map_err(ResilienceError::Operation)
    }

    /// Get current metrics
    #[must_use]
    pub fn metrics(&self) -> AdaptiveConcurrencyMetrics {
        let st = self.state.lock();
        AdaptiveConcurrencyMetrics {
            name: self.name.clone(),
            current_limit: st.effective_limit(),
            min_limit: self.config.min_limit,
            max_limit: self.config.max_limit,
            active: st.active,
            window_successes: st.window_successes,
            window_failures: st.window_failures,
            total_admitted: st.admitted,
            total_rejected: st.rejected,
            total_successes: st.successes,
            total_failures: st.failures,
            limit_increases: st.increases,
            limit_decreases: st.decreases,
            ignored_releases: st.ignored_releases,
        }
    }

    /// Err carries `(active, limit)` at rejection.
    async fn admit(&self) -> Result<(), (usize, usize)> {
        let outcome = {
            let mut st = self.state.lock();
            let limit = st.effective_limit();
            if st.active < limit {
                st.active += 1;
                st.admitted += 1;
                Ok(())
            } else {
                st.rejected += 1;
                Err((st.active, limit))
            }
        };

        if let Err((active, limit)) = outcome {
            debug!(limiter = %self.name, active, limit, "Concurrency limit reached");
            self.events
                .emit_with(EventKind::RequestRejected, |e| {
                    e.with("active", active)
                        .with("limit", limit)
                        .with("reason", ConcurrencyReason::LimitReached.as_str())
                })
                .await;
        }
        outcome
    }

    /// `None` outcome frees the slot without counting toward the window.
    fn release_state(&self, outcome: Option<bool>) -> Option<LimitChange> {
        let mut st = self.state.lock();
        if st.active == 0 {
            st.ignored_releases += 1;
            return None;
        }
        st.active -= 1;

        match outcome {
            Some(true) => {
                st.successes += 1;
                st.window_successes += 1;
            }
            Some(false) => {
                st.failures += 1;
                st.window_failures += 1;
            }
            None => return None,
        }

        let completed = st.window_successes + st.window_failures;
        if completed < self.config.measurement_window {
            return None;
        }

        let success_rate =
            f64::from(st.window_successes) / f64::from(self.config.measurement_window);
        st.window_successes = 0;
        st.window_failures = 0;

        let old = st.limit;
        if success_rate >= self.config.success_threshold {
            st.limit = (old + self.config.increase_rate).min(self.config.max_limit as f64);
        } else if success_rate < self.config.failure_threshold {
            st.limit = (old * self.config.decrease_factor).max(self.config.min_limit as f64);
        }

        if st.limit > old {
            st.increases += 1;
        } else if st.limit < old {
            st.decreases += 1;
        } else {
            return None;
        }
        Some(LimitChange {
            old,
            new: st.limit,
            success_rate,
        })
    }

    async fn report(&self, change: LimitChange) {
        info!(
            limiter = %self.name,
            old_limit = change.old,
            new_limit = change.new,
            success_rate = change.success_rate,
            "Concurrency limit updated"
        );
        self.events
            .emit_with(EventKind::LimitUpdated, |e| {
                e.with("old_limit", change.old)
                    .with("new_limit", change.new)
                    .with("success_rate", change.success_rate)
            })
            .await;
    }
}

impl std::fmt::Debug for AdaptiveConcurrencyLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveConcurrencyLimiter")
            .field("name", &self.name)
            .field("current_limit", &self.current_limit())
            .finish_non_exhaustive()
    }
}

/// Frees the slot of a `call` whose future was dropped.
struct AdmittedGuard<'a> {
    limiter: &'a AdaptiveConcurrencyLimiter,
    armed: bool,
}

impl Drop for AdmittedGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.limiter.release_state(None);
        }
    }
}

/// Adaptive concurrency metrics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct AdaptiveConcurrencyMetrics {
    /// Limiter name
    pub name: String,
    /// Current admission limit
    pub current_limit: usize,
    /// Configured floor
    pub min_limit: usize,
    /// Configured ceiling
    pub max_limit: usize,
    /// Calls currently admitted
    pub active: usize,
    /// Successes in the open window
    pub window_successes: u32,
    /// Failures in the open window
    pub window_failures: u32,
    /// Calls admitted
    pub total_admitted: u64,
    /// Calls rejected at the limit
    pub total_rejected: u64,
    /// Completions reported as success
    pub total_successes: u64,
    /// Completions reported as failure
    pub total_failures: u64,
    /// Windows that raised the limit
    pub limit_increases: u64,
    /// Windows that lowered the limit
    pub limit_decreases: u64,
    /// Releases with nothing admitted
    pub ignored_releases: u64,
}

impl AdaptiveConcurrencyMetrics {
    /// Admitted calls as a share of the current limit
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.current_limit == 0 {
            0.0
        } else {
            self.active as f64 / self.current_limit as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use resilience_core::handler_fn;

    fn aimd_limiter() -> AdaptiveConcurrencyLimiter {
        AdaptiveConcurrencyLimiter::new(
            "aimd",
            AdaptiveConcurrencyConfig {
                initial_limit: 100,
                min_limit: 10,
                max_limit: 1000,
                increase_rate: 10.0,
                decrease_factor: 0.5,
                measurement_window: 10,
                success_threshold: 0.9,
                failure_threshold: 0.5,
            },
        )
        .expect("valid config")
    }

    async fn run_window(limiter: &AdaptiveConcurrencyLimiter, successes: usize, total: usize) {
        for i in 0..total {
            assert!(limiter.acquire().await);
            limiter.release(i < successes).await;
        }
    }

    #[test]
    fn test_invalid_limits_rejected() {
        let config = AdaptiveConcurrencyConfig {
            min_limit: 500,
            max_limit: 100,
            ..Default::default()
        };
        assert!(AdaptiveConcurrencyLimiter::new("bad", config).is_err());

        let config = AdaptiveConcurrencyConfig {
            decrease_factor: 1.5,
            ..Default::default()
        };
        assert!(AdaptiveConcurrencyLimiter::new("bad", config).is_err());

        let config = AdaptiveConcurrencyConfig {
            failure_threshold: 0.99,
            ..Default::default()
        };
        assert!(AdaptiveConcurrencyLimiter::new("bad", config).is_err());
    }

    #[tokio::test]
    async fn test_additive_increase_then_multiplicative_decrease() {
        let limiter = aimd_limiter();

        run_window(&limiter, 10, 10).await;
        assert_eq!(limiter.current_limit(), 110);

        run_window(&limiter, 3, 10).await;
        assert_eq!(limiter.current_limit(), 55);

        let metrics = limiter.metrics();
        assert_eq!(metrics.limit_increases, 1);
        assert_eq!(metrics.limit_decreases, 1);
        assert_eq!(metrics.window_successes, 0);
    }

    #[tokio::test]
    async fn test_middling_window_leaves_limit() {
        let limiter = aimd_limiter();
        run_window(&limiter, 7, 10).await;
        assert_eq!(limiter.current_limit(), 100);
    }

    #[tokio::test]
    async fn test_limit_clamped_to_bounds() {
        let limiter = AdaptiveConcurrencyLimiter::new(
            "bounded",
            AdaptiveConcurrencyConfig {
                initial_limit: 12,
                min_limit: 10,
                max_limit: 15,
                increase_rate: 10.0,
                decrease_factor: 0.5,
                measurement_window: 2,
                success_threshold: 0.9,
                failure_threshold: 0.5,
            },
        )
        .expect("valid config");

        run_window(&limiter, 2, 2).await;
        assert_eq!(limiter.current_limit(), 15);
        run_window(&limiter, 0, 2).await;
        assert_eq!(limiter.current_limit(), 10);
    }

    #[tokio::test]
    async fn test_rejects_at_limit() {
        let limiter = AdaptiveConcurrencyLimiter::new(
            "tiny",
            AdaptiveConcurrencyConfig {
                initial_limit: 2,
                min_limit: 1,
                max_limit: 4,
                ..Default::default()
            },
        )
        .expect("valid config");

        assert!(limiter.acquire().await);
        assert!(limiter.acquire().await);
        let err = limiter.try_acquire().await.expect_err("limit reached");
        assert!(matches!(err, ResilienceError::ConcurrencyLimited { limit: 2, .. }));

        limiter.release(true).await;
        assert!(limiter.acquire().await);
    }

    #[tokio::test]
    async fn test_release_without_acquire_is_ignored() {
        let limiter = aimd_limiter();
        limiter.release(false).await;
        let metrics = limiter.metrics();
        assert_eq!(metrics.active, 0);
        assert_eq!(metrics.window_failures, 0);
        assert_eq!(metrics.ignored_releases, 1);
    }

    #[tokio::test]
    async fn test_limit_updated_event() {
        let limiter = aimd_limiter();
        let updates = Arc::new(Mutex::new(Vec::new()));
        let u = updates.clone();
        limiter.events().on(
            EventKind::LimitUpdated,
            handler_fn(move |event| {
                u.lock().push(event.get("new_limit").cloned().unwrap_or_default());
                Ok(())
            }),
        );

        run_window(&limiter, 10, 10).await;
        assert_eq!(*updates.lock(), vec![json!(110.0)]);
    }

    #[tokio::test]
    async fn test_call_counts_outcomes() {
        #[derive(Debug, thiserror::Error)]
        #[error("upstream 503")]
        struct Upstream;

        let limiter = aimd_limiter();
        limiter
            .call(|| async { Ok::<_, Upstream>(()) })
            .await
            .expect("succeeds");
        let _ = limiter.call(|| async { Err::<(), _>(Upstream) }).await;

        let metrics = limiter.metrics();
        assert_eq!(metrics.total_successes, 1);
        assert_eq!(metrics.total_failures, 1);
        assert_eq!(metrics.active, 0);
    }
}
