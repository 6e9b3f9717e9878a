//! Shared event bus.
//!
//! There is no implicit global instance: the composition root constructs an
//! [`EventBus`], wraps it in an `Arc` and hands it to every primitive that
//! should report to it. Shutting the bus down drops all handlers and turns
//! later publishes into no-ops.

use super::handler::{dispatch, EventHandler, HandlerRegistry};
use super::types::{Event, EventFilter, EventKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Process-wide fan-out point for events from many primitives.
#[derive(Default)]
pub struct EventBus {
    handlers: HandlerRegistry,
    closed: AtomicBool,
}

impl EventBus {
    /// Create an empty, open bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty bus already wrapped for sharing.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a handler for one kind or for every event.
    pub fn on(&self, filter: impl Into<EventFilter>, handler: Arc<dyn EventHandler>) {
        self.handlers.add(filter.into(), handler);
    }

    /// Remove a previously registered handler. Returns whether it was found.
    pub fn off(&self, filter: impl Into<EventFilter>, handler: &Arc<dyn EventHandler>) -> bool {
        self.handlers.remove(filter.into(), handler)
    }

    /// Drop every handler; the bus stays open.
    pub fn clear(&self) {
        self.handlers.clear();
    }

    /// Drop every handler and stop dispatching.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.handlers.clear();
        debug!("Event bus shut down");
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Whether the bus is open and has at least one handler.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.is_closed() && self.handlers.len() > 0
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Whether an event of this kind would reach any handler.
    #[must_use]
    pub fn is_observing(&self, kind: EventKind) -> bool {
        !self.is_closed() && self.handlers.has_handlers_for(kind)
    }

    /// Deliver an event to matching handlers.
    pub async fn publish(&self, event: &Event) {
        if !self.is_observing(event.kind) {
            return;
        }
        dispatch(self.handlers.matching(event.kind), event).await;
    }

    pub(crate) fn matching(&self, kind: EventKind) -> Vec<Arc<dyn EventHandler>> {
        if self.is_closed() {
            return Vec::new();
        }
        self.handlers.matching(kind)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("handlers", &self.handler_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{handler_fn, PatternType};
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_publish_reaches_handlers() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        bus.on(
            EventFilter::Any,
            handler_fn(move |_| {
                s.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        assert!(bus.is_active());
        bus.publish(&Event::new("x", PatternType::Retry, EventKind::RetryAttempt)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_dispatch() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        bus.on(
            EventKind::RetryAttempt,
            handler_fn(move |_| {
                s.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        bus.shutdown();
        assert!(bus.is_closed());
        assert_eq!(bus.handler_count(), 0);

        bus.on(EventFilter::Any, handler_fn(|_| Ok(())));
        assert!(!bus.is_active());
        bus.publish(&Event::new("x", PatternType::Retry, EventKind::RetryAttempt)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }
}
