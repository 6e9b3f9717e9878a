//! Cancellable suspension points.
//!
//! Every place a primitive suspends a caller (queued admission, backoff
//! delays, waiting for backpressure relief) goes through these helpers so
//! that the wait honors both an optional timeout and an optional
//! [`CancellationToken`]. Time comes from `tokio::time`, which keeps paused
//! test clocks in control of every delay.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Why a wait ended without its future completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WaitError {
    /// The timeout elapsed
    #[error("wait timed out")]
    TimedOut,
    /// The cancellation token fired
    #[error("wait cancelled")]
    Cancelled,
}

/// Await `fut`, giving up after `timeout` or when `cancel` fires.
///
/// `None` for either argument disables that bound.
pub async fn wait_for<F>(
    fut: F,
    timeout: Option<Duration>,
    cancel: Option<&CancellationToken>,
) -> Result<F::Output, WaitError>
where
    F: Future,
{
    let bounded = async {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| WaitError::TimedOut),
            None => Ok(fut.await),
        }
    };

    match cancel {
        Some(token) => {
            tokio::select! {
                biased;
                () = token.cancelled() => Err(WaitError::Cancelled),
                out = bounded => out,
            }
        }
        None => bounded.await,
    }
}

/// Sleep for `duration` unless `cancel` fires first.
pub async fn sleep(duration: Duration, cancel: Option<&CancellationToken>) -> Result<(), WaitError> {
    if duration.is_zero() {
        return match cancel {
            Some(token) if token.is_cancelled() => Err(WaitError::Cancelled),
            _ => Ok(()),
        };
    }
    wait_for(tokio::time::sleep(duration), None, cancel).await
}
