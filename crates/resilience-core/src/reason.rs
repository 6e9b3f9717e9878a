//! Pattern-specific reason codes.
//!
//! Every rejection and every handled failure carries one of these codes so
//! that consumers (middleware, dashboards, alerting) can tell *why* a call
//! did not go through without parsing error messages. The string codes are
//! stable and appear verbatim in events, exception contexts and metrics.

use crate::events::PatternType;
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! reason_codes {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $code:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            /// Stable string code.
            #[must_use]
            pub const fn as_str(self) -> &'static str {
                match self {
                    $( Self::$variant => $code ),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

reason_codes! {
    /// Why a circuit breaker rejected or classified a call.
    CircuitBreakerReason {
        /// Admission denied while the circuit is open.
        CircuitOpen => "circuit_open",
        /// The guarded call exceeded the breaker's call timeout.
        Timeout => "timeout",
        /// Admission denied because the half-open probe budget is exhausted.
        HalfOpenRejection => "half_open_rejection",
        /// An admitted call failed without changing the circuit state.
        CallFailed => "call_failed",
        /// This failure is the one that tripped the circuit open.
        ThresholdExceeded => "threshold_exceeded",
    }
}

reason_codes! {
    /// Why a bulkhead rejected a call.
    BulkheadReason {
        /// No slot could be granted.
        CapacityFull => "capacity_full",
        /// The waiting queue was already full.
        QueueFull => "queue_full",
        /// The caller waited for a slot and gave up.
        Timeout => "timeout",
    }
}

reason_codes! {
    /// Why a timeout or deadline fired.
    TimeoutReason {
        /// The per-operation timeout elapsed.
        TimeoutExceeded => "timeout_exceeded",
        /// The shared deadline passed.
        DeadlineExceeded => "deadline_exceeded",
    }
}

reason_codes! {
    /// Why a retry policy gave up.
    RetryReason {
        /// All attempts failed.
        Exhausted => "exhausted",
        /// The failure was classified as not worth retrying.
        NonRetryable => "non_retryable",
    }
}

reason_codes! {
    /// Why a backpressure manager rejected a request.
    BackpressureReason {
        /// The pending ceiling was reached.
        SystemOverloaded => "system_overloaded",
        /// The caller waited for the ceiling to clear and gave up.
        TimeoutAcquiring => "timeout_acquiring",
    }
}

reason_codes! {
    /// Why a load shedder dropped a request.
    LoadSheddingReason {
        /// Request count, queue depth or system load exceeded its limit.
        MaxLoadExceeded => "max_load_exceeded",
        /// The current load level sheds requests of this priority.
        PriorityRejected => "priority_rejected",
    }
}

reason_codes! {
    /// Why a rate limiter rejected a request.
    RateLimitReason {
        /// The window has no remaining capacity for the key.
        RateLimitExceeded => "rate_limit_exceeded",
        /// A longer-lived quota was exhausted.
        QuotaExceeded => "quota_exceeded",
        /// The current window is exhausted.
        WindowExhausted => "window_exhausted",
        /// The backing store could not be reached.
        StoreUnavailable => "store_unavailable",
    }
}

reason_codes! {
    /// Why a fallback chain failed.
    FallbackReason {
        /// Every fallback source failed.
        AllFallbacksFailed => "all_fallbacks_failed",
        /// A single fallback source failed.
        FallbackError => "fallback_error",
        /// The chain has no sources.
        NoFallbackDefined => "no_fallback_defined",
    }
}

reason_codes! {
    /// Why an adaptive concurrency limiter rejected a request.
    ConcurrencyReason {
        /// Active requests already equal the current limit.
        LimitReached => "limit_reached",
    }
}

/// Any pattern's reason code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(untagged)]
pub enum Reason {
    /// Circuit breaker reason
    CircuitBreaker(CircuitBreakerReason),
    /// Bulkhead reason
    Bulkhead(BulkheadReason),
    /// Timeout reason
    Timeout(TimeoutReason),
    /// Retry reason
    Retry(RetryReason),
    /// Backpressure reason
    Backpressure(BackpressureReason),
    /// Load shedding reason
    LoadShedding(LoadSheddingReason),
    /// Rate limit reason
    RateLimit(RateLimitReason),
    /// Fallback reason
    Fallback(FallbackReason),
    /// Adaptive concurrency reason
    Concurrency(ConcurrencyReason),
}

impl Reason {
    /// Stable string code of the wrapped reason.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CircuitBreaker(r) => r.as_str(),
            Self::Bulkhead(r) => r.as_str(),
            Self::Timeout(r) => r.as_str(),
            Self::Retry(r) => r.as_str(),
            Self::Backpressure(r) => r.as_str(),
            Self::LoadShedding(r) => r.as_str(),
            Self::RateLimit(r) => r.as_str(),
            Self::Fallback(r) => r.as_str(),
            Self::Concurrency(r) => r.as_str(),
        }
    }

    /// The pattern family this reason belongs to.
    #[must_use]
    pub const fn pattern_type(self) -> PatternType {
        match self {
            Self::CircuitBreaker(_) => PatternType::CircuitBreaker,
            Self::Bulkhead(_) => PatternType::Bulkhead,
            Self::Timeout(_) => PatternType::Timeout,
            Self::Retry(_) => PatternType::Retry,
            Self::Backpressure(_) => PatternType::Backpressure,
            Self::LoadShedding(_) => PatternType::LoadShedder,
            Self::RateLimit(_) => PatternType::RateLimiter,
            Self::Fallback(_) => PatternType::Fallback,
            Self::Concurrency(_) => PatternType::AdaptiveConcurrency,
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

macro_rules! impl_from_reason {
    ($($source:ident => $variant:ident),+ $(,)?) => {
        $(
            impl From<$source> for Reason {
                fn from(reason: $source) -> Self {
                    Self::$variant(reason)
                }
            }
        )+
    };
}

impl_from_reason! {
    CircuitBreakerReason => CircuitBreaker,
    BulkheadReason => Bulkhead,
    TimeoutReason => Timeout,
    RetryReason => Retry,
    BackpressureReason => Backpressure,
    LoadSheddingReason => LoadShedding,
    RateLimitReason => RateLimit,
    FallbackReason => Fallback,
    ConcurrencyReason => Concurrency,
}
