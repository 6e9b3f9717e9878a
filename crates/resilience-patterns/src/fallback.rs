//! Fallback chains.
//!
//! When the primary operation fails, sources are tried in declaration order
//! until one produces a value. A static value always succeeds; a function
//! source that fails hands over to the next source.

use crate::metadata;
use futures::future::BoxFuture;
use futures::{FutureExt, TryFutureExt};
use parking_lot::Mutex;
use resilience_core::{
    BoxError, EventBus, EventEmitter, EventKind, ExceptionHandler, ExceptionPolicy,
    FallbackReason, PatternType, ResilienceError,
};
use serde::Serialize;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

type SourceFn<A, T> = Arc<dyn Fn(A) -> BoxFuture<'static, Result<T, BoxError>> + Send + Sync>;

enum FallbackSource<A, T> {
    Value(T),
    Function(SourceFn<A, T>),
}

impl<A, T> FallbackSource<A, T> {
    const fn kind(&self) -> &'static str {
        match self {
            Self::Value(_) => "value",
            Self::Function(_) => "function",
        }
    }
}

#[derive(Debug, Default)]
struct FallbackCounters {
    executions: u64,
    primary_successes: u64,
    fallback_executions: u64,
    fallback_failures: u64,
    exhausted: u64,
}

/// Ordered list of fallback sources for one operation.
///
/// `A` is the argument handed to the primary operation and to every function
/// source; `T` is the value they produce.
pub struct FallbackChain<A, T> {
    name: String,
    sources: Vec<FallbackSource<A, T>>,
    counters: Mutex<FallbackCounters>,
    events: EventEmitter,
    exceptions: ExceptionHandler,
}

impl<A, T> FallbackChain<A, T>
where
    A: Clone,
    T: Clone,
{
    /// Create an empty chain
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            events: EventEmitter::new(name.clone(), PatternType::Fallback),
            exceptions: ExceptionHandler::new(name.clone(), PatternType::Fallback),
            name,
            sources: Vec::new(),
            counters: Mutex::new(FallbackCounters::default()),
        }
    }

    /// Append a static value
    #[must_use]
    pub fn with_value(mut self, value: T) -> Self {
        self.sources.push(FallbackSource::Value(value));
        self
    }

    /// Append a function source
    #[must_use]
    pub fn with_fn<F, Fut, E>(mut self, source: F) -> Self
    where
        A: 'static,
        T: 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        self.sources.push(FallbackSource::Function(Arc::new(move |args| {
            source(args).map_err(|e| -> BoxError { e.into() }).boxed()
        })));
        self
    }

    /// Forward events to a shared bus
    #[must_use]
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.events = self.events.with_bus(bus);
        self
    }

    /// Configure how failures are reported and surfaced
    #[must_use]
    pub fn with_exception_policy(mut self, policy: ExceptionPolicy) -> Self {
        self.exceptions = self.exceptions.with_policy(policy);
        self
    }

    /// Get the chain name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of fallback sources
    #[must_use]
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Whether the chain has no sources
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Event subscription surface
    #[must_use]
    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    /// Run `primary`, falling back through the chain on failure
    ///
    /// # Errors
    /// - `Failed` with `no_fallback_defined` when the primary fails and the
    ///   chain is empty
    /// - `FallbackFailed` carrying the primary and last fallback errors when
    ///   every source fails
    pub async fn execute<F, Fut, E>(&self, args: A, primary: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce(A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error,
    {
        self.counters.lock().executions += 1;

        let primary_error = match primary(args.clone()).await {
            Ok(value) => {
                self.counters.lock().primary_successes += 1;
                return Ok(value);
            }
            Err(e) => e,
        };

        debug!(fallback = %self.name, error = %primary_error, "Primary operation failed");
        let message = primary_error.to_string();
        let sources = self.sources.len();
        self.events
            .emit_with(EventKind::PrimaryFailed, move |e| {
                e.with("error", message).with("sources", sources)
            })
            .await;

        if self.sources.is_empty() {
            self.counters.lock().exhausted += 1;
            let ctx = self.exceptions.context(
                FallbackReason::NoFallbackDefined,
                format!("Fallback '{}' has no sources", self.name),
                Some(&primary_error),
                metadata(json!({ "sources": 0 })),
            );
            return Err(self.exceptions.handle(
                &ctx,
                ResilienceError::Failed {
                    name: self.name.clone(),
                    pattern: PatternType::Fallback,
                    reason: FallbackReason::NoFallbackDefined.into(),
                    source: primary_error,
                },
            ));
        }

        let mut last_fallback: Option<BoxError> = None;
        for (index, source) in self.sources.iter().enumerate() {
            let outcome = match source {
                FallbackSource::Value(value) => Ok(value.clone()),
                FallbackSource::Function(f) => f(args.clone()).await,
            };

            match outcome {
                Ok(value) => {
                    self.counters.lock().fallback_executions += 1;
                    debug!(fallback = %self.name, index, source = source.kind(), "Fallback succeeded");
                    self.events
                        .emit_with(EventKind::FallbackExecuted, |e| {
                            e.with("source_index", index)
                                .with("source_type", source.kind())
                        })
                        .await;
                    return Ok(value);
                }
                Err(error) => {
                    self.counters.lock().fallback_failures += 1;
                    warn!(fallback = %self.name, index, error = %error, "Fallback source failed");
                    last_fallback = Some(error);
                }
            }
        }

        self.counters.lock().exhausted += 1;
        let attempted = self.sources.len();
        let ctx = self.exceptions.context(
            FallbackReason::AllFallbacksFailed,
            format!("Fallback '{}': primary and {attempted} source(s) failed", self.name),
            Some(&primary_error),
            metadata(json!({
                "sources": attempted,
                "last_fallback_error": last_fallback.as_ref().map(ToString::to_string),
            })),
        );
        Err(self.exceptions.handle(
            &ctx,
            ResilienceError::FallbackFailed {
                name: self.name.clone(),
                attempted,
                primary: primary_error,
                last_fallback,
            },
        ))
    }

    /// Get current metrics
    #[must_use]
    pub fn metrics(&self) -> FallbackMetrics {
        let c = self.counters.lock();
        FallbackMetrics {
            name: self.name.clone(),
            sources: self.sources.len(),
            total_executions: c.executions,
            primary_successes: c.primary_successes,
            fallback_executions: c.fallback_executions,
            fallback_failures: c.fallback_failures,
            exhausted_executions: c.exhausted,
        }
    }
}

impl<A, T> std::fmt::Debug for FallbackChain<A, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackChain")
            .field("name", &self.name)
            .field(
                "sources",
                &self.sources.iter().map(FallbackSource::kind).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

/// Fallback metrics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct FallbackMetrics {
    /// Chain name
    pub name: String,
    /// Configured sources
    pub sources: usize,
    /// Calls to `execute`
    pub total_executions: u64,
    /// Executions served by the primary
    pub primary_successes: u64,
    /// Executions served by a fallback source
    pub fallback_executions: u64,
    /// Individual source failures
    pub fallback_failures: u64,
    /// Executions where nothing produced a value
    pub exhausted_executions: u64,
}

impl FallbackMetrics {
    /// Share of executions served by a fallback
    #[must_use]
    pub fn fallback_rate(&self) -> f64 {
        if self.total_executions == 0 {
            0.0
        } else {
            self.fallback_executions as f64 / self.total_executions as f64
        }
    }
}
