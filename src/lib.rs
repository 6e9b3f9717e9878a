//! # Resilience Toolkit
//!
//! Composable fault-tolerance primitives for async Rust services.
//!
//! The workspace is split into focused crates, re-exported here:
//! - [`core`]: errors, reason codes, the event bus and exception policies
//! - [`patterns`]: circuit breakers, bulkheads, retry, fallback, timeouts,
//!   backpressure, adaptive concurrency and load shedding
//! - [`ratelimit`]: local and store-backed sliding-window rate limiters
//! - [`config`]: TOML/YAML settings for all of the above
//! - [`telemetry`]: tracing setup, event logging and Prometheus counters
//!
//! ```no_run
//! use resilience_toolkit::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = EventBus::shared();
//! resilience_toolkit::telemetry::attach_logger(&bus);
//!
//! let breaker = Arc::new(CircuitBreaker::with_defaults("payments").with_event_bus(bus.clone()));
//! let call = compose::with_breaker(breaker, || async { Ok::<_, std::io::Error>(42) });
//! assert_eq!(call().await?, 42);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub use resilience_config as config;
pub use resilience_core as core;
pub use resilience_patterns as patterns;
pub use resilience_ratelimit as ratelimit;
pub use resilience_telemetry as telemetry;

/// Commonly used types in one import
pub mod prelude {
    pub use resilience_config::{ResilienceSettings, SettingsError};
    pub use resilience_core::{
        ConfigError, Event, EventBus, EventFilter, EventHandler, EventKind, ExceptionPolicy,
        PatternType, Reason, ResilienceError,
    };
    pub use resilience_patterns::{
        compose, AdaptiveConcurrencyLimiter, BackpressureManager, BasicLoadShedder, Bulkhead,
        CircuitBreaker, CircuitBreakerRegistry, DeadlineManager, FallbackChain, LoadShedder,
        Priority, RetryPolicy, SystemLoadShedder, TimeoutManager,
    };
    pub use resilience_ratelimit::{
        FailurePolicy, InMemorySortedSetStore, LocalRateLimiter, Rate, RemoteRateLimiter,
    };
    pub use resilience_telemetry::{EventLogger, EventMetrics};
}
