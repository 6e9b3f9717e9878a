//! Distributed sliding-window rate limiting.
//!
//! Authoritative state lives in a [`SortedSetStore`] shared by every
//! instance. Each check records one uniquely named member scored by the
//! current time, trims the set to the window, counts what is left and
//! admits when the count is within the limit.

use crate::metadata;
use crate::rate::{Rate, RateParseError};
use crate::store::{SortedSetStore, StoreError, StoreResult};
use chrono::Utc;
use parking_lot::Mutex;
use resilience_core::{
    validate_config, ConfigError, EventBus, EventEmitter, EventKind, ExceptionHandler,
    ExceptionPolicy, PatternType, RateLimitReason, ResilienceError,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;
use validator::Validate;

/// What to do when the store cannot be reached
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Admit the request
    #[default]
    FailOpen,
    /// Reject the request with `store_unavailable`
    FailClosed,
}

impl FailurePolicy {
    /// Stable string code
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FailOpen => "fail_open",
            Self::FailClosed => "fail_closed",
        }
    }
}

/// Wall-clock source in milliseconds since the Unix epoch
pub trait Clock: Send + Sync {
    /// Current time
    fn now_millis(&self) -> i64;
}

/// [`Clock`] reading the system time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Remote rate limiter configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RemoteRateLimiterConfig {
    /// Namespace for store keys
    #[validate(length(min = 1))]
    pub key_prefix: String,
    /// Behavior when the store fails
    pub failure_policy: FailurePolicy,
}

impl Default for RemoteRateLimiterConfig {
    fn default() -> Self {
        Self {
            key_prefix: "rate_limit".to_string(),
            failure_policy: FailurePolicy::FailOpen,
        }
    }
}

enum Decision {
    Allowed,
    Limited(u64),
    StoreDown,
}

#[derive(Debug, Default)]
struct RemoteCounters {
    allowed: u64,
    rejected: u64,
    store_failures: u64,
    failed_open: u64,
}

/// Rate limiter sharing its windows through a [`SortedSetStore`]
pub struct RemoteRateLimiter {
    name: String,
    config: RemoteRateLimiterConfig,
    store: Arc<dyn SortedSetStore>,
    clock: Arc<dyn Clock>,
    counters: Mutex<RemoteCounters>,
    events: EventEmitter,
    exceptions: ExceptionHandler,
}

impl RemoteRateLimiter {
    /// Create a limiter on `store`
    ///
    /// # Errors
    /// Returns `ConfigError` if the configuration is invalid
    pub fn new(
        name: impl Into<String>,
        config: RemoteRateLimiterConfig,
        store: Arc<dyn SortedSetStore>,
    ) -> Result<Self, ConfigError> {
        validate_config("remote rate limiter", &config)?;
        let name = name.into();
        Ok(Self {
            events: EventEmitter::new(name.clone(), PatternType::RateLimiter),
            exceptions: ExceptionHandler::new(name.clone(), PatternType::RateLimiter),
            name,
            config,
            store,
            clock: Arc::new(SystemClock),
            counters: Mutex::new(RemoteCounters::default()),
        })
    }

    /// Replace the time source
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Forward events to a shared bus
    #[must_use]
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.events = self.events.with_bus(bus);
        self
    }

    /// Configure how rejections and store failures are reported
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
    pub fn config(&self) -> &RemoteRateLimiterConfig {
        &self.config
    }

    /// Event subscription surface
    #[must_use]
    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    /// Store key for `key` under `rate`
    #[must_use]
    pub fn store_key(&self, key: &str, rate: &Rate) -> String {
        format!("{}:{}:{key}:{rate}", self.config.key_prefix, self.name)
    }

    /// Record one request for `key` and report whether it is within `rate`
    pub async fn check(&self, key: &str, rate: &Rate) -> bool {
        match self.decide(key, rate).await {
            Decision::Allowed => true,
            Decision::Limited(_) => false,
            Decision::StoreDown => self.config.failure_policy == FailurePolicy::FailOpen,
        }
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
    /// `RateLimitExceeded` with `rate_limit_exceeded` when the window is
    /// full, or `store_unavailable` when the store failed under
    /// [`FailurePolicy::FailClosed`]
    pub async fn acquire(&self, key: &str, rate: &Rate) -> Result<(), ResilienceError> {
        let (reason, count) = match self.decide(key, rate).await {
            Decision::Allowed => return Ok(()),
            Decision::StoreDown if self.config.failure_policy == FailurePolicy::FailOpen => {
                return Ok(())
            }
            Decision::StoreDown => (RateLimitReason::StoreUnavailable, None),
            Decision::Limited(count) => (RateLimitReason::RateLimitExceeded, Some(count)),
        };

        let ctx = self.exceptions.context(
            reason,
            format!("Rate limit {rate} rejected key '{key}'"),
            None,
            metadata(json!({
                "key": key,
                "rate": rate.to_string(),
                "count": count,
                "store": self.store.name(),
            })),
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

    /// Run `operation` if `key` is within `rate`
    ///
    /// # Errors
    /// `RateLimitExceeded` on rejection, or `Operation` carrying the
    /// operation's own error
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

    /// Requests left for `key` in the current window
    ///
    /// # Errors
    /// `StoreError` when the store cannot be read
    pub async fn remaining(&self, key: &str, rate: &Rate) -> StoreResult<u32> {
        let window_start = self.clock.now_millis() - window_millis(rate);
        let used = self.store.count(&self.store_key(key, rate), window_start).await?;
        Ok(u64::from(rate.limit()).saturating_sub(used) as u32)
    }

    /// Clear the window for `key` under `rate`
    ///
    /// # Errors
    /// `StoreError` when the store cannot be written
    pub async fn reset(&self, key: &str, rate: &Rate) -> StoreResult<()> {
        self.store.remove(&self.store_key(key, rate)).await
    }

    /// Get current metrics
    #[must_use]
    pub fn metrics(&self) -> RemoteRateLimiterMetrics {
        let c = self.counters.lock();
        RemoteRateLimiterMetrics {
            name: self.name.clone(),
            store: self.store.name(),
            failure_policy: self.config.failure_policy,
            total_allowed: c.allowed,
            total_rejected: c.rejected,
            store_failures: c.store_failures,
            failed_open: c.failed_open,
        }
    }

    async fn decide(&self, key: &str, rate: &Rate) -> Decision {
        let now = self.clock.now_millis();
        let member = format!("{now}-{}", Uuid::new_v4());
        let store_key = self.store_key(key, rate);

        let recorded = self
            .store
            .record(&store_key, &member, now, now - window_millis(rate), rate.window())
            .await;

        match recorded {
            Ok(count) if count <= u64::from(rate.limit()) => {
                self.counters.lock().allowed += 1;
                debug!(limiter = %self.name, key, count, limit = rate.limit(), "Rate limit check passed");
                self.events
                    .emit_with(EventKind::RequestAllowed, |e| {
                        e.with("key", key)
                            .with("rate", rate.to_string())
                            .with("count", count)
                    })
                    .await;
                Decision::Allowed
            }
            Ok(count) => {
                self.counters.lock().rejected += 1;
                warn!(limiter = %self.name, key, count, limit = rate.limit(), "Rate limit exceeded");
                self.events
                    .emit_with(EventKind::RequestRejected, |e| {
                        e.with("key", key)
                            .with("rate", rate.to_string())
                            .with("count", count)
                            .with("reason", RateLimitReason::RateLimitExceeded.as_str())
                    })
                    .await;
                Decision::Limited(count)
            }
            Err(err) => {
                self.store_unavailable(key, rate, &err).await;
                Decision::StoreDown
            }
        }
    }

    async fn store_unavailable(&self, key: &str, rate: &Rate, err: &StoreError) {
        let policy = self.config.failure_policy;
        {
            let mut c = self.counters.lock();
            c.store_failures += 1;
            match policy {
                FailurePolicy::FailOpen => c.failed_open += 1,
                FailurePolicy::FailClosed => c.rejected += 1,
            }
        }

        error!(
            limiter = %self.name,
            store = self.store.name(),
            key,
            policy = policy.as_str(),
            error = %err,
            "Rate limit store unavailable"
        );
        self.events
            .emit_with(EventKind::StoreUnavailable, |e| {
                e.with("key", key)
                    .with("rate", rate.to_string())
                    .with("store", self.store.name())
                    .with("policy", policy.as_str())
                    .with("error", err.to_string())
            })
            .await;

        if policy == FailurePolicy::FailOpen {
            let ctx = self.exceptions.context(
                RateLimitReason::StoreUnavailable,
                format!("Rate limit store '{}' unavailable, admitting key '{key}'", self.store.name()),
                Some(err as &dyn std::error::Error),
                metadata(json!({ "key": key, "rate": rate.to_string(), "policy": policy.as_str() })),
            );
            self.exceptions.notify(&ctx);
        }
    }
}

fn window_millis(rate: &Rate) -> i64 {
    i64::try_from(rate.window().as_millis()).unwrap_or(i64::MAX)
}

impl std::fmt::Debug for RemoteRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteRateLimiter")
            .field("name", &self.name)
            .field("store", &self.store.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Remote rate limiter metrics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct RemoteRateLimiterMetrics {
    /// Limiter name
    pub name: String,
    /// Backing store name
    pub store: &'static str,
    /// Behavior on store failure
    pub failure_policy: FailurePolicy,
    /// Requests admitted by the store
    pub total_allowed: u64,
    /// Requests rejected, including fail-closed store failures
    pub total_rejected: u64,
    /// Store calls that failed
    pub store_failures: u64,
    /// Requests admitted because the store failed
    pub failed_open: u64,
}
