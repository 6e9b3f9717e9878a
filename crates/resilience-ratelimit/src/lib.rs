//! # Resilience Rate Limiting
//!
//! Per-key sliding-window rate limiters:
//! - [`LocalRateLimiter`] keeps windows in process, bounded by an LRU cache
//! - [`RemoteRateLimiter`] shares windows through a sorted-set store
//!   (in memory, or Redis with the `redis` feature)

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod local;
pub mod rate;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod remote;
pub mod store;

// Re-export main types
pub use local::{LocalRateLimiter, LocalRateLimiterConfig, LocalRateLimiterMetrics};
pub use rate::{Period, Rate, RateParseError};
#[cfg(feature = "redis")]
pub use redis_store::RedisSortedSetStore;
pub use remote::{
    Clock, FailurePolicy, RemoteRateLimiter, RemoteRateLimiterConfig, RemoteRateLimiterMetrics,
    SystemClock,
};
pub use store::{InMemorySortedSetStore, SortedSetStore, StoreError, StoreResult};

use resilience_core::Metadata;

pub(crate) fn metadata(value: serde_json::Value) -> Metadata {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Metadata::new(),
    }
}
