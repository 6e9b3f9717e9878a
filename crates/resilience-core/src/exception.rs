//! Structured failure reporting.
//!
//! When a primitive rejects a call or classifies a failure it builds an
//! [`ExceptionContext`] and hands it to its [`ExceptionHandler`]. The handler
//! runs the configured callback in isolation (errors and panics are logged,
//! never propagated) and then decides which error the caller sees:
//! a caller-supplied transformation wins over a configured replacement,
//! which wins over the primitive's own typed error.

use crate::error::{BoxError, ResilienceError};
use crate::events::{Metadata, PatternType};
use crate::reason::Reason;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{error, warn};

/// Immutable snapshot of one failure.
#[derive(Debug, Clone, Serialize)]
pub struct ExceptionContext {
    /// Name of the reporting instance
    pub pattern_name: String,
    /// Family of the reporting instance
    pub pattern_type: PatternType,
    /// Pattern-specific reason code
    pub reason: Reason,
    /// Human-readable summary
    pub message: String,
    /// Display form of the underlying error, if there was one
    pub original_error: Option<String>,
    /// State snapshot at the time of failure
    pub metadata: Metadata,
    /// When the failure was recorded
    pub timestamp: DateTime<Utc>,
}

/// Observes exception contexts. An `Err` return is logged and ignored.
pub type ExceptionCallback = dyn Fn(&ExceptionContext) -> Result<(), BoxError> + Send + Sync;

/// Builds a replacement error from the context.
pub type ErrorTransformer = dyn Fn(&ExceptionContext) -> BoxError + Send + Sync;

/// Builds a replacement error from the failure message.
pub type ErrorFactory = dyn Fn(String) -> BoxError + Send + Sync;

/// How failures are observed and surfaced. Cheap to clone and share.
#[derive(Clone, Default)]
pub struct ExceptionPolicy {
    callback: Option<Arc<ExceptionCallback>>,
    replacement: Option<Arc<ErrorFactory>>,
    transformer: Option<Arc<ErrorTransformer>>,
}

impl ExceptionPolicy {
    /// Policy that surfaces the primitive's own errors and observes nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Invoke `callback` for every failure.
    #[must_use]
    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ExceptionContext) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
        self
    }

    /// Replace every surfaced error with one built from its message.
    #[must_use]
    pub fn with_replacement<F>(mut self, factory: F) -> Self
    where
        F: Fn(String) -> BoxError + Send + Sync + 'static,
    {
        self.replacement = Some(Arc::new(factory));
        self
    }

    /// Replace every surfaced error with one built from the full context.
    #[must_use]
    pub fn with_transformer<F>(mut self, transformer: F) -> Self
    where
        F: Fn(&ExceptionContext) -> BoxError + Send + Sync + 'static,
    {
        self.transformer = Some(Arc::new(transformer));
        self
    }

    /// Whether a callback is configured.
    #[must_use]
    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }
}

impl std::fmt::Debug for ExceptionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExceptionPolicy")
            .field("callback", &self.callback.is_some())
            .field("replacement", &self.replacement.is_some())
            .field("transformer", &self.transformer.is_some())
            .finish()
    }
}

/// Per-instance exception handler.
#[derive(Debug, Clone)]
pub struct ExceptionHandler {
    pattern_name: String,
    pattern_type: PatternType,
    policy: ExceptionPolicy,
}

impl ExceptionHandler {
    /// Handler with the default policy.
    #[must_use]
    pub fn new(pattern_name: impl Into<String>, pattern_type: PatternType) -> Self {
        Self {
            pattern_name: pattern_name.into(),
            pattern_type,
            policy: ExceptionPolicy::default(),
        }
    }

    /// Swap the policy.
    #[must_use]
    pub fn with_policy(mut self, policy: ExceptionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Build a context for a failure of this instance.
    pub fn context(
        &self,
        reason: impl Into<Reason>,
        message: impl Into<String>,
        original: Option<&dyn std::error::Error>,
        metadata: Metadata,
    ) -> ExceptionContext {
        ExceptionContext {
            pattern_name: self.pattern_name.clone(),
            pattern_type: self.pattern_type,
            reason: reason.into(),
            message: message.into(),
            original_error: original.map(ToString::to_string),
            metadata,
            timestamp: Utc::now(),
        }
    }

    /// Report a failure and pick the error to surface.
    ///
    /// `default` is returned unless the policy replaces it.
    pub fn handle<E>(&self, ctx: &ExceptionContext, default: ResilienceError<E>) -> ResilienceError<E> {
        self.notify(ctx);

        let replaced = if let Some(transform) = &self.policy.transformer {
            Some(transform(ctx))
        } else {
            self.policy
                .replacement
                .as_ref()
                .map(|factory| factory(ctx.message.clone()))
        };

        match replaced {
            Some(source) => ResilienceError::Transformed {
                name: ctx.pattern_name.clone(),
                pattern: ctx.pattern_type,
                reason: ctx.reason,
                source,
            },
            None => default,
        }
    }

    /// Run the callback only. Used for failures resolved without an error,
    /// such as a fail-open rate limiter.
    pub fn notify(&self, ctx: &ExceptionContext) {
        let Some(callback) = &self.policy.callback else {
            return;
        };

        match catch_unwind(AssertUnwindSafe(|| callback(ctx))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(
                pattern = %ctx.pattern_name,
                reason = %ctx.reason,
                error = %e,
                "Exception callback failed"
            ),
            Err(_) => error!(
                pattern = %ctx.pattern_name,
                reason = %ctx.reason,
                "Exception callback panicked"
            ),
        }
    }

    /// Whether the handler does any work beyond returning the default error.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.policy.callback.is_some()
            || self.policy.replacement.is_some()
            || self.policy.transformer.is_some()
    }
}
