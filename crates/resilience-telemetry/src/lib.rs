//! # Resilience Telemetry
//!
//! Observability for resilience primitives:
//! - `tracing` subscriber setup (pretty or JSON lines)
//! - An event bus handler that logs every event
//! - Prometheus counters fed by the event bus

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod event_logger;
pub mod metrics;
pub mod tracing_setup;

// Re-export main types
pub use event_logger::{EventLogger, EventSeverity};
pub use metrics::EventMetrics;
pub use tracing_setup::{init_tracing, LogFormat, TracingConfig, TracingError};

use resilience_core::{EventBus, EventFilter};
use std::sync::Arc;

/// Register an [`EventLogger`] for every event on `bus`.
pub fn attach_logger(bus: &EventBus) {
    bus.on(EventFilter::Any, Arc::new(EventLogger::new()));
}
