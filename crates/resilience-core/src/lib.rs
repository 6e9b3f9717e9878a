//! # Resilience Core
//!
//! Foundation shared by every resilience primitive:
//! - Error taxonomy and construction-time configuration errors
//! - Pattern-specific reason codes
//! - Event emitters and the shared event bus
//! - Exception contexts and handler policies
//! - Cancellable wait helpers

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod exception;
pub mod reason;
pub mod wait;

// Re-export commonly used types
pub use error::{validate_config, AdmissionResult, BoxError, ConfigError, ResilienceError};
pub use events::{
    async_handler_fn, handler_fn, Event, EventBus, EventEmitter, EventFilter, EventHandler,
    EventKind, Metadata, PatternType,
};
pub use exception::{ExceptionContext, ExceptionHandler, ExceptionPolicy};
pub use reason::{
    BackpressureReason, BulkheadReason, CircuitBreakerReason, ConcurrencyReason,
    FallbackReason, LoadSheddingReason, RateLimitReason, Reason, RetryReason, TimeoutReason,
};
pub use tokio_util::sync::CancellationToken;
pub use wait::WaitError;
