//! Prometheus counters fed by the event bus.

use async_trait::async_trait;
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use resilience_core::{BoxError, Event, EventBus, EventFilter, EventHandler, EventKind};
use std::sync::Arc;

/// Counts events per pattern instance and kind
#[derive(Clone)]
pub struct EventMetrics {
    registry: Registry,
    events: IntCounterVec,
    rejections: IntCounterVec,
}

impl EventMetrics {
    /// Create counters in a fresh registry
    ///
    /// # Errors
    /// Returns `prometheus::Error` if the counters cannot be registered
    pub fn new() -> Result<Self, prometheus::Error> {
        Self::with_registry(Registry::new())
    }

    /// Create counters in `registry`
    ///
    /// # Errors
    /// Returns `prometheus::Error` if the counters are already registered
    pub fn with_registry(registry: Registry) -> Result<Self, prometheus::Error> {
        let events = IntCounterVec::new(
            Opts::new("resilience_events_total", "Events emitted by resilience primitives"),
            &["pattern_type", "pattern_name", "event"],
        )?;
        registry.register(Box::new(events.clone()))?;

        let rejections = IntCounterVec::new(
            Opts::new(
                "resilience_rejections_total",
                "Calls turned away by resilience primitives",
            ),
            &["pattern_type", "pattern_name"],
        )?;
        registry.register(Box::new(rejections.clone()))?;

        Ok(Self {
            registry,
            events,
            rejections,
        })
    }

    /// Subscribe to every event on `bus`
    pub fn attach(&self, bus: &EventBus) {
        bus.on(EventFilter::Any, Arc::new(self.clone()));
    }

    /// Count one event
    pub fn record(&self, event: &Event) {
        let pattern_type = event.pattern_type.as_str();
        self.events
            .with_label_values(&[pattern_type, &event.pattern_name, event.kind.as_str()])
            .inc();
        if is_rejection(event.kind) {
            self.rejections
                .with_label_values(&[pattern_type, &event.pattern_name])
                .inc();
        }
    }

    /// Events counted for one instance and kind
    #[must_use]
    pub fn event_count(&self, pattern_type: &str, pattern_name: &str, kind: EventKind) -> u64 {
        self.events
            .get_metric_with_label_values(&[pattern_type, pattern_name, kind.as_str()])
            .map_or(0, |c| c.get())
    }

    /// Rejections counted for one instance
    #[must_use]
    pub fn rejection_count(&self, pattern_type: &str, pattern_name: &str) -> u64 {
        self.rejections
            .get_metric_with_label_values(&[pattern_type, pattern_name])
            .map_or(0, |c| c.get())
    }

    /// Underlying registry, for merging into a wider exporter
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every metric in the text exposition format
    ///
    /// # Errors
    /// Returns `prometheus::Error` if encoding fails
    pub fn gather_text(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

const fn is_rejection(kind: EventKind) -> bool {
    matches!(
        kind,
        EventKind::RequestRejected
            | EventKind::RequestShed
            | EventKind::BulkheadFull
            | EventKind::QueueFull
    )
}

#[async_trait]
impl EventHandler for EventMetrics {
    async fn handle(&self, event: &Event) -> Result<(), BoxError> {
        self.record(event);
        Ok(())
    }
}

impl std::fmt::Debug for EventMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventMetrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use resilience_core::PatternType;

    #[tokio::test]
    async fn test_counts_bus_events() {
        let bus = EventBus::shared();
        let metrics = EventMetrics::new().expect("registers");
        metrics.attach(&bus);

        let shed = Event::new("api", PatternType::LoadShedder, EventKind::RequestShed);
        bus.publish(&shed).await;
        bus.publish(&shed).await;
        bus.publish(&Event::new("api", PatternType::LoadShedder, EventKind::RequestAccepted))
            .await;

        assert_eq!(metrics.event_count("load_shedder", "api", EventKind::RequestShed), 2);
        assert_eq!(metrics.event_count("load_shedder", "api", EventKind::RequestAccepted), 1);
        assert_eq!(metrics.rejection_count("load_shedder", "api"), 2);
    }

    #[test]
    fn test_gather_text_renders_counters() {
        let metrics = EventMetrics::new().expect("registers");
        metrics.record(&Event::new("db", PatternType::CircuitBreaker, EventKind::StateChange));

        let text = metrics.gather_text().expect("encodes");
        assert!(text.contains("resilience_events_total"));
        assert!(text.contains("pattern_name=\"db\""));
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Registry::new();
        EventMetrics::with_registry(registry.clone()).expect("first registers");
        assert!(EventMetrics::with_registry(registry).is_err());
    }
}
