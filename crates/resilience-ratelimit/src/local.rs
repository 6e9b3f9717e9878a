//! In-process sliding-window rate limiting.
//!
//! Each `(key, rate)` pair owns a log of admission instants. The log map is
//! an LRU cache bounded by `max_limiters`, so unbounded key cardinality
//! costs at most that many windows. Test and consume happen under one lock.

use crate::metadata;
use crate::rate::{Rate, RateParseError};
use lru::LruCache;
use parking_lot::Mutex;
use resilience_core::{
    validate_config, ConfigError, EventBus, EventEmitter, EventKind, ExceptionHandler,
    ExceptionPolicy, PatternType, RateLimitReason, ResilienceError,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::VecDeque;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};
use validator::Validate;

/// Local rate limiter configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LocalRateLimiterConfig {
    /// Windows kept before the least recently used one is evicted
    #[validate(range(min = 1))]
    pub max_limiters: usize,
}

impl Default for LocalRateLimiterConfig {
    fn default() -> Self {
        Self {
            max_limiters: 10_000,
        }
    }
}

#[derive(Debug)]
struct Window {
    key: String,
    rate: Rate,
    admitted: VecDeque<Instant>,
}

impl Window {
    fn new(key: &str, rate: Rate) -> Self {
        Self {
            key: key.to_string(),
            rate,
            admitted: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: Instant) {
        let window = self.rate.window();
        while self
            .admitted
            .front()
            .is_some_and(|at| now.duration_since(*at) >= window)
        {
            self.admitted.pop_front();
        }
    }

    fn remaining(&self) -> u32 {
        self.rate
            .limit()
            .saturating_sub(u32::try_from(self.admitted.len()).unwrap_or(u32::MAX))
    }
}

#[derive(Debug)]
struct Windows {
    cache: LruCache<String, Window>,
    allowed: u64,
    rejected: u64,
    evictions: u64,
}

/// In-memory per-key rate limiter
pub struct LocalRateLimiter {
    name: String,
    config: LocalRateLimiterConfig,
    windows: Mutex<Windows>,
    events: EventEmitter,
    exceptions: ExceptionHandler,
}

impl LocalRateLimiter {
    /// Create a new limiter
    ///
    /// # Errors
    /// Returns `ConfigError` if the configuration is invalid
    pub fn new(name: impl Into<String>, config: LocalRateLimiterConfig) -> Result<Self, ConfigError> {
        validate_config("local rate limiter", &config)?;
        Ok(Self::from_valid(name.into(), config))
    }

    /// Create with default configuration
    #[must_use]
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::from_valid(name.into(), LocalRateLimiterConfig::default())
    }

    fn from_valid(name: String, config: LocalRateLimiterConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_limiters).unwrap_or(NonZeroUsize::MIN);
        Self {
            events: EventEmitter::new(name.clone(), PatternType::RateLimiter),
            exceptions: ExceptionHandler::new(name.clone(), PatternType::RateLimiter),
            name,
            windows: Mutex::new(Windows {
                cache: LruCache::new(capacity),
                allowed: 0,
                rejected: 0,
                evictions: 0,
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
    pub fn config(&self) -> &LocalRateLimiterConfig {
        &self.config
    }

    /// Event subscription surface
    #[must_use]
    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    /// Consume one unit of `rate` for `key` if any is left
    pub async fn check(&self, key: &str, rate: &Rate) -> bool {
        let (allowed, remaining) = self.try_consume(key, rate);
        if allowed {
            debug!(limiter = %self.name, key, rate = %rate, remaining, "Rate limit check passed");
            self.events
                .emit_with(EventKind::RequestAllowed, |e| {
                    e.with("key", key)
                        .with("rate", rate.to_string())
                        .with("remaining", remaining)
                })
                .await;
        } else {
            warn!(limiter = %self.name, key, rate = %rate, "Rate limit exceeded");
            self.events
                .emit_with(EventKind::RequestRejected, |e| {
                    e.with("key", key)
                        .with("rate", rate.to_string())
                        .with("reason", RateLimitReason::RateLimitExceeded.as_str())
                })
                .await;
        }
        allowed
    }

    /// [`check`](Self::check) with a rate string such as `"100/minute"`
    ///
    /// # Errors
    /// `RateParseError` when `rate` is malformed
    pub async fn check_rate_limit(&self, key: &str, rate: &str) -> Result<bool, RateParseError> {
        let rate: Rate = rate.parse()?;
        Ok(self.check(key, &rate).await)
    }

    /// Like [`check`](Self::check), reporting a rejection through the
    /// exception policy
    ///
    /// # Errors
    /// `RateLimitExceeded` when the window is exhausted
    pub async fn acquire(&self, key: &str, rate: &Rate) -> Result<(), ResilienceError> {
        if self.check(key, rate).await {
            return Ok(());
        }
        let reason = RateLimitReason::RateLimitExceeded;
        let ctx = self.exceptions.context(
            reason,
            format!("Rate limit {rate} exceeded for key '{key}'"),
            None,
            metadata(json!({ "key": key, "rate": rate.to_string(), "limiter": self.name })),
        );
        Err(self.exceptions.handle(
            &ctx,
            ResilienceError::RateLimitExceeded {
                key: key.to_string(),
                rate: rate.to_string(),
                reason,
            },
        ))
    }

    /// Run `operation` if `key` has capacity left under `rate`
    ///
    /// # Errors
    /// `RateLimitExceeded` when the window is exhausted, or `Operation`
    /// carrying the operation's own error
    pub async fn call<F, Fut, T, E>(
        &self,
        key: &str,
        rate: &Rate,
        operation: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.acquire(key, rate).await.map_err(ResilienceError::widen)?;
        operation().await.map_err(ResilienceError::Operation)
    }

    /// Units left for `key` under `rate` without consuming any
    #[must_use]
    pub fn remaining(&self, key: &str, rate: &Rate) -> u32 {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        match windows.cache.peek_mut(&window_id(key, rate)) {
            Some(window) => {
                window.prune(now);
                window.remaining()
            }
            None => rate.limit(),
        }
    }

    /// Forget every window held for `key`. Returns how many were dropped.
    pub fn reset(&self, key: &str) -> usize {
        let mut windows = self.windows.lock();
        let ids: Vec<String> = windows
            .cache
            .iter()
            .filter(|(_, w)| w.key == key)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            windows.cache.pop(id);
        }
        ids.len()
    }

    /// Windows currently held
    #[must_use]
    pub fn len(&self) -> usize {
        self.windows.lock().cache.len()
    }

    /// Whether no window is held
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get current metrics
    #[must_use]
    pub fn metrics(&self) -> LocalRateLimiterMetrics {
        let windows = self.windows.lock();
        LocalRateLimiterMetrics {
            name: self.name.clone(),
            active_limiters: windows.cache.len(),
            max_limiters: self.config.max_limiters,
            total_allowed: windows.allowed,
            total_rejected: windows.rejected,
            evictions: windows.evictions,
        }
    }

    /// Returns `(allowed, remaining)` after the attempt.
    fn try_consume(&self, key: &str, rate: &Rate) -> (bool, u32) {
        let now = Instant::now();
        let id = window_id(key, rate);
        let mut windows = self.windows.lock();

        if !windows.cache.contains(&id) && windows.cache.len() >= self.config.max_limiters {
            if let Some((evicted, _)) = windows.cache.pop_lru() {
                windows.evictions += 1;
                debug!(limiter = %self.name, evicted = %evicted, "Evicted rate limit window");
            }
        }

        let window = windows.cache.get_or_insert_mut(id, || Window::new(key, *rate));
        window.prune(now);
        let allowed = window.remaining() > 0;
        if allowed {
            window.admitted.push_back(now);
        }
        let remaining = window.remaining();

        if allowed {
            windows.allowed += 1;
        } else {
            windows.rejected += 1;
        }
        (allowed, remaining)
    }
}

fn window_id(key: &str, rate: &Rate) -> String {
    format!("{key}:{rate}")
}

impl std::fmt::Debug for LocalRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRateLimiter")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Local rate limiter metrics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct LocalRateLimiterMetrics {
    /// Limiter name
    pub name: String,
    /// Windows currently held
    pub active_limiters: usize,
    /// Window capacity
    pub max_limiters: usize,
    /// Requests admitted
    pub total_allowed: u64,
    /// Requests rejected
    pub total_rejected: u64,
    /// Windows dropped to stay within capacity
    pub evictions: u64,
}

impl LocalRateLimiterMetrics {
    /// Share of checks that were rejected
    #[must_use]
    pub fn rejection_rate(&self) -> f64 {
        let total = self.total_allowed + self.total_rejected;
        if total == 0 {
            0.0
        } else {
            self.total_rejected as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use resilience_core::handler_fn;
    use std::time::Duration;

    fn rate(s: &str) -> Rate {
        s.parse().expect("valid rate")
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = LocalRateLimiterConfig { max_limiters: 0 };
        assert!(LocalRateLimiter::new("bad", config).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_rolls_over() {
        let limiter = LocalRateLimiter::with_defaults("api");
        let three = rate("3/second");

        for _ in 0..3 {
            assert!(limiter.check("user-1", &three).await);
        }
        assert!(!limiter.check("user-1", &three).await);

        tokio::time::advance(Duration::from_millis(1_001)).await;
        assert!(limiter.check("user-1", &three).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_slides() {
        let limiter = LocalRateLimiter::with_defaults("api");
        let two = rate("2/second");

        assert!(limiter.check("k", &two).await);
        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(limiter.check("k", &two).await);
        assert!(!limiter.check("k", &two).await);

        // Only the first admission has aged out.
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(limiter.check("k", &two).await);
        assert!(!limiter.check("k", &two).await);
    }

    #[tokio::test]
    async fn test_keys_and_rates_are_independent() {
        let limiter = LocalRateLimiter::with_defaults("api");
        let one = rate("1/minute");

        assert!(limiter.check("a", &one).await);
        assert!(!limiter.check("a", &one).await);
        assert!(limiter.check("b", &one).await);
        assert!(limiter.check("a", &rate("5/minute")).await);
    }

    #[tokio::test]
    async fn test_lru_eviction_bounds_windows() {
        let limiter =
            LocalRateLimiter::new("small", LocalRateLimiterConfig { max_limiters: 2 }).expect("valid");
        let one = rate("1/hour");

        assert!(limiter.check("a", &one).await);
        assert!(limiter.check("b", &one).await);
        // Touch "a" so "b" is least recently used.
        assert!(!limiter.check("a", &one).await);
        assert!(limiter.check("c", &one).await);

        assert_eq!(limiter.len(), 2);
        assert_eq!(limiter.metrics().evictions, 1);
        // "b" lost its window and starts fresh; "a" kept its own.
        assert_eq!(limiter.remaining("b", &one), 1);
        assert_eq!(limiter.remaining("a", &one), 0);
    }

    #[tokio::test]
    async fn test_remaining_and_reset() {
        let limiter = LocalRateLimiter::with_defaults("api");
        let five = rate("5/minute");

        assert_eq!(limiter.remaining("u", &five), 5);
        assert!(limiter.check("u", &five).await);
        assert!(limiter.check("u", &five).await);
        assert_eq!(limiter.remaining("u", &five), 3);

        assert!(limiter.check("u", &rate("1/second")).await);
        assert_eq!(limiter.reset("u"), 2);
        assert_eq!(limiter.remaining("u", &five), 5);
        assert!(limiter.is_empty());
    }

    #[tokio::test]
    async fn test_check_rate_limit_parses() {
        let limiter = LocalRateLimiter::with_defaults("api");
        assert_eq!(limiter.check_rate_limit("u", "1/second").await, Ok(true));
        assert_eq!(limiter.check_rate_limit("u", "1/second").await, Ok(false));
        assert!(limiter.check_rate_limit("u", "1/fortnight").await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_checks_never_over_admit() {
        let limiter = Arc::new(LocalRateLimiter::with_defaults("api"));
        let ten = rate("10/minute");

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let limiter = limiter.clone();
                let rate = ten;
                tokio::spawn(async move { limiter.check("shared", &rate).await })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.expect("task completes") {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
        assert_eq!(limiter.metrics().total_rejected, 40);
    }

    #[tokio::test]
    async fn test_acquire_reports_rejection() {
        let limiter = LocalRateLimiter::with_defaults("api");
        let rejected = Arc::new(Mutex::new(0));
        let r = rejected.clone();
        limiter.events().on(
            EventKind::RequestRejected,
            handler_fn(move |_| {
                *r.lock() += 1;
                Ok(())
            }),
        );

        let one = rate("1/minute");
        limiter.acquire("k", &one).await.expect("first");
        let err = limiter.acquire("k", &one).await.expect_err("exhausted");
        assert!(matches!(
            err,
            ResilienceError::RateLimitExceeded {
                reason: RateLimitReason::RateLimitExceeded,
                ..
            }
        ));
        assert_eq!(*rejected.lock(), 1);
    }
}
