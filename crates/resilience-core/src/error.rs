//! Error types shared by every resilience primitive.
//!
//! [`ResilienceError`] is generic over the guarded operation's own error
//! type `E`. Admission-only APIs (`acquire`, `check`) use the default
//! `E = Infallible` and are widened into the caller's error type with
//! [`ResilienceError::widen`] when composed with an operation.

use crate::events::PatternType;
use crate::reason::{
    BackpressureReason, BulkheadReason, CircuitBreakerReason, ConcurrencyReason,
    LoadSheddingReason, RateLimitReason, Reason, TimeoutReason,
};
use std::convert::Infallible;
use std::time::Duration;
use thiserror::Error;

/// Boxed, thread-safe error used where the concrete type is erased.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Outcome of a guarded call that did not produce a value.
#[derive(Debug, Error)]
pub enum ResilienceError<E = Infallible> {
    /// Circuit breaker denied admission
    #[error("Circuit breaker '{name}' rejected the call: {reason}")]
    CircuitOpen {
        /// Breaker name
        name: String,
        /// `circuit_open` or `half_open_rejection`
        reason: CircuitBreakerReason,
    },

    /// Bulkhead denied admission
    #[error("Bulkhead '{name}' rejected the call: {reason}")]
    BulkheadRejected {
        /// Bulkhead name
        name: String,
        /// `queue_full`, `timeout` or `capacity_full`
        reason: BulkheadReason,
    },

    /// Rate limiter denied admission
    #[error("Rate limit exceeded for key '{key}' ({rate}): {reason}")]
    RateLimitExceeded {
        /// Rate-limited key
        key: String,
        /// Configured rate, e.g. `100/minute`
        rate: String,
        /// Why the request was rejected
        reason: RateLimitReason,
    },

    /// Load shedder dropped the request
    #[error("Load shedder '{name}' dropped the request: {reason}")]
    LoadShed {
        /// Shedder name
        name: String,
        /// Why the request was dropped
        reason: LoadSheddingReason,
    },

    /// Backpressure ceiling reached or waiting for it timed out
    #[error("Backpressure '{name}' rejected the request: {reason}")]
    Backpressure {
        /// Manager name
        name: String,
        /// Why the request was rejected
        reason: BackpressureReason,
    },

    /// Adaptive concurrency limit reached
    #[error("Concurrency limiter '{name}' is at its limit of {limit}: {reason}")]
    ConcurrencyLimited {
        /// Limiter name
        name: String,
        /// Limit at the time of rejection
        limit: usize,
        /// Always `limit_reached`
        reason: ConcurrencyReason,
    },

    /// The operation ran out of time
    #[error("Operation '{name}' timed out after {timeout:?}: {reason}")]
    Timeout {
        /// Name of the timing primitive
        name: String,
        /// Budget that was exceeded
        timeout: Duration,
        /// Timeout or deadline
        reason: TimeoutReason,
    },

    /// Every retry attempt failed
    #[error("Retry '{name}' exhausted after {attempts} attempts")]
    RetryExhausted {
        /// Policy name
        name: String,
        /// Attempts made
        attempts: u32,
        /// Failure of the final attempt
        #[source]
        last: E,
    },

    /// The primary operation and every fallback failed
    #[error("Fallback '{name}' failed: primary and {attempted} fallback(s) failed")]
    FallbackFailed {
        /// Chain name
        name: String,
        /// Number of fallback sources tried
        attempted: usize,
        /// The primary operation's failure
        #[source]
        primary: E,
        /// The last fallback's failure, if any source was tried
        last_fallback: Option<BoxError>,
    },

    /// A wait was cancelled before it could complete
    #[error("Operation '{name}' was cancelled")]
    Cancelled {
        /// Name of the waiting primitive
        name: String,
    },

    /// The operation failed and the primitive passed the failure through
    #[error("Operation failed: {0}")]
    Operation(#[source] E),

    /// The operation failed and the primitive classified the failure
    #[error("{pattern} '{name}' recorded a failed call: {reason}")]
    Failed {
        /// Name of the classifying primitive
        name: String,
        /// Family of the classifying primitive
        pattern: PatternType,
        /// Classification, e.g. `threshold_exceeded` vs `call_failed`
        reason: Reason,
        /// The operation's error
        #[source]
        source: E,
    },

    /// An exception policy replaced the error
    #[error("{pattern} '{name}' failed ({reason}): {source}")]
    Transformed {
        /// Name of the primitive
        name: String,
        /// Family of the primitive
        pattern: PatternType,
        /// Reason of the replaced failure
        reason: Reason,
        /// Replacement error
        #[source]
        source: BoxError,
    },
}

impl<E> ResilienceError<E> {
    /// Reason code, when the error carries one.
    #[must_use]
    pub fn reason(&self) -> Option<Reason> {
        match self {
            Self::CircuitOpen { reason, .. } => Some((*reason).into()),
            Self::BulkheadRejected { reason, .. } => Some((*reason).into()),
            Self::RateLimitExceeded { reason, .. } => Some((*reason).into()),
            Self::LoadShed { reason, .. } => Some((*reason).into()),
            Self::Backpressure { reason, .. } => Some((*reason).into()),
            Self::ConcurrencyLimited { reason, .. } => Some((*reason).into()),
            Self::Timeout { reason, .. } => Some((*reason).into()),
            Self::RetryExhausted { .. } => Some(crate::reason::RetryReason::Exhausted.into()),
            Self::FallbackFailed { .. } => {
                Some(crate::reason::FallbackReason::AllFallbacksFailed.into())
            }
            Self::Failed { reason, .. } | Self::Transformed { reason, .. } => Some(*reason),
            Self::Cancelled { .. } | Self::Operation(_) => None,
        }
    }

    /// Whether the guarded operation was never invoked because a primitive
    /// turned the call away.
    #[must_use]
    pub const fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen { .. }
                | Self::BulkheadRejected { .. }
                | Self::RateLimitExceeded { .. }
                | Self::LoadShed { .. }
                | Self::Backpressure { .. }
                | Self::ConcurrencyLimited { .. }
        )
    }

    /// Whether the error is a timeout or deadline expiry.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// The operation's own error, when this error wraps one.
    pub fn into_operation_error(self) -> Option<E> {
        match self {
            Self::Operation(e)
            | Self::Failed { source: e, .. }
            | Self::RetryExhausted { last: e, .. }
            | Self::FallbackFailed { primary: e, .. } => Some(e),
            _ => None,
        }
    }

    /// Borrow the operation's own error, when this error wraps one.
    #[must_use]
    pub fn operation_error(&self) -> Option<&E> {
        match self {
            Self::Operation(e)
            | Self::Failed { source: e, .. }
            | Self::RetryExhausted { last: e, .. }
            | Self::FallbackFailed { primary: e, .. } => Some(e),
            _ => None,
        }
    }
}

impl ResilienceError<Infallible> {
    /// Re-type an admission error into any operation error type.
    #[must_use]
    pub fn widen<E>(self) -> ResilienceError<E> {
        match self {
            Self::CircuitOpen { name, reason } => ResilienceError::CircuitOpen { name, reason },
            Self::BulkheadRejected { name, reason } => {
                ResilienceError::BulkheadRejected { name, reason }
            }
            Self::RateLimitExceeded { key, rate, reason } => {
                ResilienceError::RateLimitExceeded { key, rate, reason }
            }
            Self::LoadShed { name, reason } => ResilienceError::LoadShed { name, reason },
            Self::Backpressure { name, reason } => ResilienceError::Backpressure { name, reason },
            Self::ConcurrencyLimited {
                name,
                limit,
                reason,
            } => ResilienceError::ConcurrencyLimited {
                name,
                limit,
                reason,
            },
            Self::Timeout {
                name,
                timeout,
                reason,
            } => ResilienceError::Timeout {
                name,
                timeout,
                reason,
            },
            Self::Cancelled { name } => ResilienceError::Cancelled { name },
            Self::Transformed {
                name,
                pattern,
                reason,
                source,
            } => ResilienceError::Transformed {
                name,
                pattern,
                reason,
                source,
            },
            Self::RetryExhausted { last, .. } => match last {},
            Self::FallbackFailed { primary, .. } => match primary {},
            Self::Operation(e) | Self::Failed { source: e, .. } => match e {},
        }
    }
}

/// Result alias for admission-only operations.
pub type AdmissionResult<T> = std::result::Result<T, ResilienceError>;

/// Configuration rejected at construction time.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Field-level or cross-field validation failed
    #[error("Invalid {component} configuration: {source}")]
    Invalid {
        /// Component whose configuration was rejected
        component: &'static str,
        /// Validation details
        #[source]
        source: validator::ValidationErrors,
    },
}

impl ConfigError {
    /// Wrap validation errors for a component.
    pub fn invalid(component: &'static str, source: validator::ValidationErrors) -> Self {
        Self::Invalid { component, source }
    }

    /// Component whose configuration was rejected.
    #[must_use]
    pub fn component(&self) -> &'static str {
        match self {
            Self::Invalid { component, .. } => component,
        }
    }
}

/// Validate a configuration, tagging failures with the component name.
pub fn validate_config<C: validator::Validate>(
    component: &'static str,
    config: &C,
) -> Result<(), ConfigError> {
    config
        .validate()
        .map_err(|source| ConfigError::invalid(component, source))
}
