//! Handler abstraction and the registry shared by emitters and the bus.

use super::types::{Event, EventFilter, EventKind};
use crate::error::BoxError;
use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::warn;

/// Receives events.
///
/// Synchronous closures are adapted with [`handler_fn`], async ones with
/// [`async_handler_fn`], so dispatch only ever awaits this one method.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle one event. Errors are logged by the dispatcher and dropped.
    async fn handle(&self, event: &Event) -> Result<(), BoxError>;
}

/// Adapter for synchronous closures.
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(&Event) -> Result<(), BoxError> + Send + Sync,
{
    async fn handle(&self, event: &Event) -> Result<(), BoxError> {
        (self.f)(event)
    }
}

/// Adapter for closures returning a future.
pub struct AsyncFnHandler<F, Fut> {
    f: F,
    _marker: PhantomData<fn() -> Fut>,
}

#[async_trait]
impl<F, Fut> EventHandler for AsyncFnHandler<F, Fut>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BoxError>> + Send,
{
    async fn handle(&self, event: &Event) -> Result<(), BoxError> {
        (self.f)(event.clone()).await
    }
}

/// Wrap a synchronous closure as a handler.
pub fn handler_fn<F>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(&Event) -> Result<(), BoxError> + Send + Sync + 'static,
{
    Arc::new(FnHandler { f })
}

/// Wrap an async closure as a handler.
pub fn async_handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    Arc::new(AsyncFnHandler {
        f,
        _marker: PhantomData,
    })
}

/// Ordered handler lists keyed by event kind, plus wildcard handlers.
///
/// Registration appends; dispatch snapshots the matching handlers under a
/// read lock and releases it before awaiting any of them.
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    inner: RwLock<Handlers>,
}

#[derive(Default)]
struct Handlers {
    by_kind: HashMap<EventKind, Vec<Arc<dyn EventHandler>>>,
    wildcard: Vec<Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub(crate) fn add(&self, filter: EventFilter, handler: Arc<dyn EventHandler>) {
        let mut inner = self.inner.write();
        match filter {
            EventFilter::Any => inner.wildcard.push(handler),
            EventFilter::Kind(kind) => inner.by_kind.entry(kind).or_default().push(handler),
        }
    }

    pub(crate) fn remove(&self, filter: EventFilter, handler: &Arc<dyn EventHandler>) -> bool {
        let mut inner = self.inner.write();
        let list = match filter {
            EventFilter::Any => &mut inner.wildcard,
            EventFilter::Kind(kind) => match inner.by_kind.get_mut(&kind) {
                Some(list) => list,
                None => return false,
            },
        };
        let before = list.len();
        list.retain(|h| !Arc::ptr_eq(h, handler));
        before != list.len()
    }

    pub(crate) fn clear(&self) {
        let mut inner = self.inner.write();
        inner.by_kind.clear();
        inner.wildcard.clear();
    }

    pub(crate) fn len(&self) -> usize {
        let inner = self.inner.read();
        inner.wildcard.len() + inner.by_kind.values().map(Vec::len).sum::<usize>()
    }

    pub(crate) fn has_handlers_for(&self, kind: EventKind) -> bool {
        let inner = self.inner.read();
        !inner.wildcard.is_empty() || inner.by_kind.get(&kind).is_some_and(|l| !l.is_empty())
    }

    /// Exact-kind handlers first, then wildcards, each in registration order.
    pub(crate) fn matching(&self, kind: EventKind) -> Vec<Arc<dyn EventHandler>> {
        let inner = self.inner.read();
        let mut out = Vec::new();
        if let Some(list) = inner.by_kind.get(&kind) {
            out.extend(list.iter().cloned());
        }
        out.extend(inner.wildcard.iter().cloned());
        out
    }
}

/// Run every handler concurrently; failures and panics are logged only.
pub(crate) async fn dispatch(handlers: Vec<Arc<dyn EventHandler>>, event: &Event) {
    if handlers.is_empty() {
        return;
    }

    let calls = handlers.iter().map(|handler| {
        AssertUnwindSafe(handler.handle(event)).catch_unwind()
    });

    for outcome in join_all(calls).await {
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(
                pattern = %event.pattern_name,
                event = %event.kind,
                error = %e,
                "Event handler failed"
            ),
            Err(_) => warn!(
                pattern = %event.pattern_name,
                event = %event.kind,
                "Event handler panicked"
            ),
        }
    }
}
