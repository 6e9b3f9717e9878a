//! Explicit composition of primitives.
//!
//! Each helper takes a shared primitive and a re-invocable operation and
//! returns a new re-invocable operation, so a stack reads inside-out at
//! the call site:
//!
//! ```ignore
//! let guarded = with_retry(retry, with_breaker(breaker, with_timeout(timeout, fetch)));
//! let value = guarded().await?;
//! ```
//!
//! Every layer wraps the error of the layer below, so the stack above
//! yields `ResilienceError<ResilienceError<ResilienceError<E>>>`.

use crate::{Bulkhead, CircuitBreaker, RetryPolicy, TimeoutManager};
use futures::future::{BoxFuture, FutureExt};
use resilience_core::ResilienceError;
use std::future::Future;
use std::sync::Arc;

/// Route every invocation through `breaker`
pub fn with_breaker<Op, Fut, T, E>(
    breaker: Arc<CircuitBreaker>,
    operation: Op,
) -> impl Fn() -> BoxFuture<'static, Result<T, ResilienceError<E>>> + Clone + Send + Sync + 'static
where
    Op: Fn() -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: std::error::Error + Send + 'static,
{
    move || {
        let breaker = breaker.clone();
        let operation = operation.clone();
        async move { breaker.call(operation).await }.boxed()
    }
}

/// Run every invocation inside a `bulkhead` slot
pub fn with_bulkhead<Op, Fut, T, E>(
    bulkhead: Arc<Bulkhead>,
    operation: Op,
) -> impl Fn() -> BoxFuture<'static, Result<T, ResilienceError<E>>> + Clone + Send + Sync + 'static
where
    Op: Fn() -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    move || {
        let bulkhead = bulkhead.clone();
        let operation = operation.clone();
        async move { bulkhead.execute(operation).await }.boxed()
    }
}

/// Bound every invocation by the manager's timeout
pub fn with_timeout<Op, Fut, T, E>(
    timeout: Arc<TimeoutManager>,
    operation: Op,
) -> impl Fn() -> BoxFuture<'static, Result<T, ResilienceError<E>>> + Clone + Send + Sync + 'static
where
    Op: Fn() -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    move || {
        let timeout = timeout.clone();
        let operation = operation.clone();
        async move { timeout.execute(operation).await }.boxed()
    }
}

/// Retry every invocation under `policy`
pub fn with_retry<Op, Fut, T, E>(
    policy: Arc<RetryPolicy>,
    operation: Op,
) -> impl Fn() -> BoxFuture<'static, Result<T, ResilienceError<E>>> + Clone + Send + Sync + 'static
where
    Op: Fn() -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: std::error::Error + Send + 'static,
{
    move || {
        let policy = policy.clone();
        let operation = operation.clone();
        async move { policy.execute(operation).await }.boxed()
    }
}
