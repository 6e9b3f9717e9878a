//! Forwards resilience events to `tracing`.

use async_trait::async_trait;
use resilience_core::{BoxError, Event, EventHandler, EventKind};
use tracing::{debug, info, warn};

/// How loudly an event kind is logged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSeverity {
    /// Rejections, exhaustion and store outages
    Warn,
    /// State transitions
    Info,
    /// Per-call noise
    Debug,
}

impl EventSeverity {
    /// Severity used for `kind`
    #[must_use]
    pub const fn of(kind: EventKind) -> Self {
        match kind {
            EventKind::RequestRejected
            | EventKind::RequestShed
            | EventKind::BulkheadFull
            | EventKind::QueueFull
            | EventKind::RetryExhausted
            | EventKind::TimeoutOccurred
            | EventKind::StoreUnavailable
            | EventKind::ThresholdExceeded
            | EventKind::BackpressureHigh
            | EventKind::PrimaryFailed => Self::Warn,
            EventKind::Initialized
            | EventKind::StateChange
            | EventKind::CircuitReset
            | EventKind::LimitUpdated
            | EventKind::LoadLevelChange
            | EventKind::BackpressureLow
            | EventKind::FallbackExecuted => Self::Info,
            _ => Self::Debug,
        }
    }
}

/// [`EventHandler`] that writes every event it receives to `tracing`.
///
/// Register it on a bus with `EventFilter::Any` to log all primitives.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventLogger;

impl EventLogger {
    /// Create a logger
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EventHandler for EventLogger {
    async fn handle(&self, event: &Event) -> Result<(), BoxError> {
        let metadata = serde_json::to_string(&event.metadata)?;
        let pattern_type = event.pattern_type.as_str();
        let kind = event.kind.as_str();
        match EventSeverity::of(event.kind) {
            EventSeverity::Warn => warn!(
                pattern = %event.pattern_name,
                pattern_type,
                event = kind,
                metadata = %metadata,
                "Resilience event"
            ),
            EventSeverity::Info => info!(
                pattern = %event.pattern_name,
                pattern_type,
                event = kind,
                metadata = %metadata,
                "Resilience event"
            ),
            EventSeverity::Debug => debug!(
                pattern = %event.pattern_name,
                pattern_type,
                event = kind,
                metadata = %metadata,
                "Resilience event"
            ),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use resilience_core::PatternType;

    #[test]
    fn test_severity_mapping() {
        assert_eq!(EventSeverity::of(EventKind::RequestShed), EventSeverity::Warn);
        assert_eq!(EventSeverity::of(EventKind::StateChange), EventSeverity::Info);
        assert_eq!(EventSeverity::of(EventKind::SlotAcquired), EventSeverity::Debug);
    }

    #[tokio::test]
    async fn test_handle_never_fails() {
        let event = Event::new("db", PatternType::CircuitBreaker, EventKind::StateChange)
            .with("from_state", "closed")
            .with("to_state", "open");
        EventLogger::new().handle(&event).await.expect("logs");
    }
}
