//! Test doubles shared by the integration tests.

use parking_lot::Mutex;
use resilience_core::{handler_fn, Event, EventBus, EventFilter};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Failure returned by [`FlakyService`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    /// Dependency is down
    #[error("service unavailable")]
    Unavailable,
}

/// Downstream stand-in that fails a fixed number of times before recovering
#[derive(Debug, Default)]
pub struct FlakyService {
    calls: AtomicU32,
    failures: u32,
}

impl FlakyService {
    /// Fail the first `failures` calls
    pub fn failing(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            failures,
        })
    }

    /// Call the service; returns the call number on success
    pub async fn call(&self) -> Result<u32, ServiceError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.failures {
            Err(ServiceError::Unavailable)
        } else {
            Ok(n)
        }
    }

    /// Calls made so far
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Events captured from a bus
pub type Recorded = Arc<Mutex<Vec<Event>>>;

/// Record every event published on `bus`
pub fn record_events(bus: &EventBus) -> Recorded {
    let recorded: Recorded = Arc::default();
    let sink = recorded.clone();
    bus.on(
        EventFilter::Any,
        handler_fn(move |event| {
            sink.lock().push(event.clone());
            Ok(())
        }),
    );
    recorded
}
