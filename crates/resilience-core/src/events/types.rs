//! Event vocabulary shared by every pattern.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Snapshot of key/value state attached to events and exception contexts.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Family of the pattern that produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    /// Circuit breaker
    CircuitBreaker,
    /// Rate limiter
    RateLimiter,
    /// Bulkhead
    Bulkhead,
    /// Load shedder
    LoadShedder,
    /// Retry policy
    Retry,
    /// Timeout or deadline manager
    Timeout,
    /// Fallback chain
    Fallback,
    /// Backpressure manager
    Backpressure,
    /// Adaptive concurrency limiter
    AdaptiveConcurrency,
}

impl PatternType {
    /// Stable string code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CircuitBreaker => "circuit_breaker",
            Self::RateLimiter => "rate_limiter",
            Self::Bulkhead => "bulkhead",
            Self::LoadShedder => "load_shedder",
            Self::Retry => "retry",
            Self::Timeout => "timeout",
            Self::Fallback => "fallback",
            Self::Backpressure => "backpressure",
            Self::AdaptiveConcurrency => "adaptive_concurrency",
        }
    }
}

impl fmt::Display for PatternType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    // Lifecycle
    /// Pattern instance created
    Initialized,

    // Circuit breaker
    /// Circuit state transition
    StateChange,
    /// Guarded call succeeded
    CallSuccess,
    /// Guarded call failed
    CallFailure,
    /// Circuit manually reset
    CircuitReset,
    /// Probe call admitted while half-open
    HalfOpenProbe,

    // Rate limiter
    /// Request admitted
    RequestAllowed,
    /// Request rejected
    RequestRejected,
    /// Limit changed
    LimitUpdated,
    /// Window rolled over
    WindowReset,
    /// Backing store could not be reached
    StoreUnavailable,

    // Bulkhead
    /// Slot granted
    SlotAcquired,
    /// Slot returned
    SlotReleased,
    /// Every slot is busy
    BulkheadFull,
    /// Waiting queue full
    QueueFull,

    // Load shedding / backpressure
    /// Request dropped
    RequestShed,
    /// Request admitted
    RequestAccepted,
    /// Load level changed
    LoadLevelChange,
    /// A threshold was crossed
    ThresholdExceeded,
    /// Pending count reached the high water mark
    BackpressureHigh,
    /// Pending count drained to the low water mark
    BackpressureLow,

    // Retry
    /// A failed attempt will be retried
    RetryAttempt,
    /// Every attempt failed
    RetryExhausted,
    /// Succeeded after at least one retry
    RetrySuccess,

    // Timeout
    /// Operation timed out
    TimeoutOccurred,
    /// Operation finished in time
    TimeoutSuccess,

    // Fallback
    /// A fallback source produced the result
    FallbackExecuted,
    /// The primary operation failed
    PrimaryFailed,
}

impl EventKind {
    /// Stable string code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::StateChange => "state_change",
            Self::CallSuccess => "call_success",
            Self::CallFailure => "call_failure",
            Self::CircuitReset => "circuit_reset",
            Self::HalfOpenProbe => "half_open_probe",
            Self::RequestAllowed => "request_allowed",
            Self::RequestRejected => "request_rejected",
            Self::LimitUpdated => "limit_updated",
            Self::WindowReset => "window_reset",
            Self::StoreUnavailable => "store_unavailable",
            Self::SlotAcquired => "slot_acquired",
            Self::SlotReleased => "slot_released",
            Self::BulkheadFull => "bulkhead_full",
            Self::QueueFull => "queue_full",
            Self::RequestShed => "request_shed",
            Self::RequestAccepted => "request_accepted",
            Self::LoadLevelChange => "load_level_change",
            Self::ThresholdExceeded => "threshold_exceeded",
            Self::BackpressureHigh => "backpressure_high",
            Self::BackpressureLow => "backpressure_low",
            Self::RetryAttempt => "retry_attempt",
            Self::RetryExhausted => "retry_exhausted",
            Self::RetrySuccess => "retry_success",
            Self::TimeoutOccurred => "timeout_occurred",
            Self::TimeoutSuccess => "timeout_success",
            Self::FallbackExecuted => "fallback_executed",
            Self::PrimaryFailed => "primary_failed",
        }
    }

    /// Whether the event reports a request that was turned away.
    #[must_use]
    pub const fn is_rejection(self) -> bool {
        matches!(
            self,
            Self::RequestRejected
                | Self::QueueFull
                | Self::BulkheadFull
                | Self::RequestShed
                | Self::TimeoutOccurred
                | Self::RetryExhausted
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which events a handler subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventFilter {
    /// Every event (the `"*"` wildcard)
    Any,
    /// A single event kind
    Kind(EventKind),
}

impl EventFilter {
    /// Whether this filter accepts the given kind.
    #[must_use]
    pub fn matches(self, kind: EventKind) -> bool {
        match self {
            Self::Any => true,
            Self::Kind(k) => k == kind,
        }
    }
}

impl From<EventKind> for EventFilter {
    fn from(kind: EventKind) -> Self {
        Self::Kind(kind)
    }
}

/// A single observation emitted by a pattern instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Name of the emitting instance
    pub pattern_name: String,
    /// Family of the emitting instance
    pub pattern_type: PatternType,
    /// What happened
    #[serde(rename = "event_type")]
    pub kind: EventKind,
    /// When it happened
    pub timestamp: DateTime<Utc>,
    /// Pattern-specific state snapshot
    #[serde(default)]
    pub metadata: Metadata,
}

impl Event {
    /// Create an event stamped with the current time.
    #[must_use]
    pub fn new(pattern_name: impl Into<String>, pattern_type: PatternType, kind: EventKind) -> Self {
        Self {
            pattern_name: pattern_name.into(),
            pattern_type,
            kind,
            timestamp: Utc::now(),
            metadata: Metadata::new(),
        }
    }

    /// Attach a metadata entry.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Replace the metadata map.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Look up a metadata entry.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.metadata.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_builder() {
        let event = Event::new("payments", PatternType::CircuitBreaker, EventKind::StateChange)
            .with("old_state", "closed")
            .with("new_state", "open");

        assert_eq!(event.pattern_name, "payments");
        assert_eq!(event.get("new_state"), Some(&serde_json::json!("open")));
    }

    #[test]
    fn test_event_serializes_with_codes() {
        let event = Event::new("api", PatternType::Backpressure, EventKind::BackpressureHigh);
        let json = serde_json::to_value(&event).expect("serialize");

        assert_eq!(json["pattern_type"], "backpressure");
        assert_eq!(json["event_type"], "backpressure_high");
    }

    #[test]
    fn test_filter_matching() {
        assert!(EventFilter::Any.matches(EventKind::QueueFull));
        assert!(EventFilter::from(EventKind::QueueFull).matches(EventKind::QueueFull));
        assert!(!EventFilter::from(EventKind::QueueFull).matches(EventKind::SlotAcquired));
    }
}
