//! # Resilience Patterns
//!
//! Primitives that guard calls to unreliable dependencies:
//! - Circuit breaker and an explicitly constructed breaker registry
//! - Bulkhead for concurrency isolation
//! - Retry policy with exponential, linear or constant backoff
//! - Fallback chains
//! - Timeout and deadline management
//! - Backpressure with water-mark hysteresis
//! - Adaptive (AIMD) concurrency limiting
//! - Basic and system-aware load shedding
//! - Composition helpers that stack the above around an operation

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod adaptive;
pub mod backpressure;
pub mod bulkhead;
pub mod circuit_breaker;
pub mod compose;
pub mod fallback;
pub mod load_shedding;
pub mod registry;
pub mod retry;
pub mod timeout;

// Re-export main types
pub use adaptive::{AdaptiveConcurrencyConfig, AdaptiveConcurrencyLimiter, AdaptiveConcurrencyMetrics};
pub use backpressure::{BackpressureConfig, BackpressureManager, BackpressureMetrics};
pub use bulkhead::{Bulkhead, BulkheadConfig, BulkheadMetrics, BulkheadPermit};
pub use circuit_breaker::{
    CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitState,
};
pub use fallback::{FallbackChain, FallbackMetrics};
pub use load_shedding::{
    BasicLoadShedder, BasicLoadShedderConfig, LoadLevel, LoadProbe, LoadShedder,
    LoadShedderMetrics, Priority, SysinfoProbe, SystemLoadShedder, SystemLoadShedderConfig,
    SystemSample,
};
pub use registry::CircuitBreakerRegistry;
pub use retry::{BackoffStrategy, RetryConfig, RetryMetrics, RetryPolicy, RetryPolicyBuilder};
pub use timeout::{DeadlineManager, TimeoutConfig, TimeoutManager, TimeoutMetrics};

use resilience_core::Metadata;

/// Turn a `json!` object literal into event/exception metadata.
pub(crate) fn metadata(value: serde_json::Value) -> Metadata {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Metadata::new(),
    }
}
