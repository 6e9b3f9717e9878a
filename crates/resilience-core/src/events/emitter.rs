//! Per-instance event emitter.

use super::bus::EventBus;
use super::handler::{dispatch, EventHandler, HandlerRegistry};
use super::types::{Event, EventFilter, EventKind, PatternType};
use std::sync::Arc;

/// Emits events for one pattern instance to its own handlers and, when
/// attached, to a shared [`EventBus`].
///
/// Emission is lazy: when nothing local or on the bus listens for a kind,
/// [`emit_with`](Self::emit_with) returns before building the event.
pub struct EventEmitter {
    pattern_name: String,
    pattern_type: PatternType,
    handlers: HandlerRegistry,
    bus: Option<Arc<EventBus>>,
}

impl EventEmitter {
    /// Create an emitter with no handlers and no bus.
    #[must_use]
    pub fn new(pattern_name: impl Into<String>, pattern_type: PatternType) -> Self {
        Self {
            pattern_name: pattern_name.into(),
            pattern_type,
            handlers: HandlerRegistry::default(),
            bus: None,
        }
    }

    /// Forward every emitted event to `bus` as well.
    #[must_use]
    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Name of the owning instance.
    #[must_use]
    pub fn pattern_name(&self) -> &str {
        &self.pattern_name
    }

    /// Family of the owning instance.
    #[must_use]
    pub fn pattern_type(&self) -> PatternType {
        self.pattern_type
    }

    /// The attached bus, if any.
    #[must_use]
    pub fn bus(&self) -> Option<&Arc<EventBus>> {
        self.bus.as_ref()
    }

    /// Register a handler for one kind or, with [`EventFilter::Any`], for all.
    pub fn on(&self, filter: impl Into<EventFilter>, handler: Arc<dyn EventHandler>) {
        self.handlers.add(filter.into(), handler);
    }

    /// Remove a previously registered handler. Returns whether it was found.
    pub fn off(&self, filter: impl Into<EventFilter>, handler: &Arc<dyn EventHandler>) -> bool {
        self.handlers.remove(filter.into(), handler)
    }

    /// Drop every local handler.
    pub fn clear(&self) {
        self.handlers.clear();
    }

    /// Number of local handlers.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Whether any local handler or an active bus exists.
    #[must_use]
    pub fn has_handlers(&self) -> bool {
        self.handlers.len() > 0 || self.bus.as_ref().is_some_and(|b| b.is_active())
    }

    /// Whether an event of this kind would reach any handler.
    #[must_use]
    pub fn is_observed(&self, kind: EventKind) -> bool {
        self.handlers.has_handlers_for(kind)
            || self.bus.as_ref().is_some_and(|b| b.is_observing(kind))
    }

    /// Build and dispatch an event only if someone listens for `kind`.
    pub async fn emit_with<F>(&self, kind: EventKind, build: F)
    where
        F: FnOnce(Event) -> Event,
    {
        if !self.is_observed(kind) {
            return;
        }
        let event = build(Event::new(self.pattern_name.clone(), self.pattern_type, kind));
        self.dispatch(&event).await;
    }

    /// Dispatch an event with no metadata.
    pub async fn emit_kind(&self, kind: EventKind) {
        self.emit_with(kind, |event| event).await;
    }

    /// Dispatch a prebuilt event to local and bus handlers.
    pub async fn emit(&self, event: Event) {
        if !self.is_observed(event.kind) {
            return;
        }
        self.dispatch(&event).await;
    }

    async fn dispatch(&self, event: &Event) {
        let mut handlers = self.handlers.matching(event.kind);
        if let Some(bus) = &self.bus {
            handlers.extend(bus.matching(event.kind));
        }
        dispatch(handlers, event).await;
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("pattern_name", &self.pattern_name)
            .field("pattern_type", &self.pattern_type)
            .field("handlers", &self.handlers.len())
            .field("bus", &self.bus.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::handler_fn;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_emit_is_lazy_without_listeners() {
        let emitter = EventEmitter::new("lazy", PatternType::Bulkhead);
        let built = AtomicBool::new(false);

        emitter
            .emit_with(EventKind::SlotAcquired, |event| {
                built.store(true, Ordering::SeqCst);
                event
            })
            .await;

        assert!(!built.load(Ordering::SeqCst));
        assert!(!emitter.has_handlers());
    }

    #[tokio::test]
    async fn test_emit_reaches_local_and_bus() {
        let bus = EventBus::shared();
        let emitter = EventEmitter::new("both", PatternType::Retry).with_bus(bus.clone());
        let local = Arc::new(AtomicUsize::new(0));
        let global = Arc::new(Mutex::new(Vec::new()));

        let l = local.clone();
        emitter.on(
            EventKind::RetryAttempt,
            handler_fn(move |_| {
                l.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        let g = global.clone();
        bus.on(
            EventFilter::Any,
            handler_fn(move |event| {
                g.lock().push(event.pattern_name.clone());
                Ok(())
            }),
        );

        emitter.emit_with(EventKind::RetryAttempt, |e| e.with("attempt", 1)).await;
        emitter.emit_kind(EventKind::RetryExhausted).await;

        assert_eq!(local.load(Ordering::SeqCst), 1);
        assert_eq!(*global.lock(), vec!["both".to_string(), "both".to_string()]);
    }

    #[tokio::test]
    async fn test_bus_only_listener_counts_as_observed() {
        let bus = EventBus::shared();
        let emitter = EventEmitter::new("obs", PatternType::Timeout).with_bus(bus.clone());
        assert!(!emitter.is_observed(EventKind::TimeoutOccurred));

        bus.on(EventKind::TimeoutOccurred, handler_fn(|_| Ok(())));
        assert!(emitter.is_observed(EventKind::TimeoutOccurred));
        assert!(!emitter.is_observed(EventKind::TimeoutSuccess));
    }
}
