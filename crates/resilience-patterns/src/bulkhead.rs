//! Bulkhead pattern for resource isolation.
//!
//! Limits concurrent calls into a resource and bounds how many callers may
//! queue for a slot. Slots are handed out by a fair semaphore, so queued
//! callers are admitted in arrival order.

use crate::metadata;
use parking_lot::Mutex;
use resilience_core::{
    validate_config, wait, BulkheadReason, CancellationToken, ConfigError, EventBus,
    EventEmitter, EventKind, ExceptionHandler, ExceptionPolicy, PatternType, ResilienceError,
    WaitError,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};
use validator::{Validate, ValidationError};

/// Bulkhead configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_timeout"))]
pub struct BulkheadConfig {
    /// Maximum concurrent calls
    #[validate(range(min = 1))]
    pub max_concurrent: usize,
    /// Callers allowed to queue once every slot is taken
    pub max_waiting: usize,
    /// How long a queued caller waits for a slot; `None` waits indefinitely
    #[serde(with = "humantime_serde")]
    pub timeout: Option<Duration>,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_waiting: 10,
            timeout: None,
        }
    }
}

fn validate_timeout(config: &BulkheadConfig) -> Result<(), ValidationError> {
    if config.timeout.is_some_and(|t| t.is_zero()) {
        return Err(ValidationError::new("timeout_must_be_positive"));
    }
    Ok(())
}

#[derive(Debug, Default)]
struct Counters {
    active: usize,
    waiting: usize,
    peak_active: usize,
    admitted: u64,
    successful: u64,
    failed: u64,
    rejected: u64,
    total_wait: Duration,
}

impl Counters {
    fn admit(&mut self, waited: Duration) -> usize {
        self.active += 1;
        self.peak_active = self.peak_active.max(self.active);
        self.admitted += 1;
        self.total_wait += waited;
        self.active
    }
}

/// State shared between the bulkhead and its outstanding permits.
struct Shared {
    name: String,
    semaphore: Arc<Semaphore>,
    counters: Mutex<Counters>,
}

impl Shared {
    /// Give back a slot. The counter is updated before the semaphore permit
    /// is returned, so `active` never exceeds the number of held permits.
    fn release(&self, permit: OwnedSemaphorePermit) -> usize {
        let active = {
            let mut c = self.counters.lock();
            c.active = c.active.saturating_sub(1);
            c.active
        };
        drop(permit);
        debug!(bulkhead = %self.name, active, "Bulkhead slot released");
        active
    }
}

/// Leaves the waiting queue if a queued caller's future is dropped.
struct QueueSlot<'a> {
    counters: &'a Mutex<Counters>,
    armed: bool,
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut c = self.counters.lock();
            c.waiting = c.waiting.saturating_sub(1);
        }
    }
}

enum Entry {
    Admitted(OwnedSemaphorePermit, usize),
    Queued,
    QueueFull(usize),
}

/// Bulkhead limiting concurrent calls into one resource
pub struct Bulkhead {
    shared: Arc<Shared>,
    config: BulkheadConfig,
    events: EventEmitter,
    exceptions: ExceptionHandler,
}

impl Bulkhead {
    /// Create a new bulkhead
    ///
    /// # Errors
    /// Returns `ConfigError` if the configuration is invalid
    pub fn new(name: impl Into<String>, config: BulkheadConfig) -> Result<Self, ConfigError> {
        validate_config("bulkhead", &config)?;
        Ok(Self::from_valid(name.into(), config))
    }

    /// Create with default configuration
    #[must_use]
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::from_valid(name.into(), BulkheadConfig::default())
    }

    fn from_valid(name: String, config: BulkheadConfig) -> Self {
        Self {
            events: EventEmitter::new(name.clone(), PatternType::Bulkhead),
            exceptions: ExceptionHandler::new(name.clone(), PatternType::Bulkhead),
            shared: Arc::new(Shared {
                semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
                counters: Mutex::new(Counters::default()),
                name,
            }),
            config,
        }
    }

    /// Forward events to a shared bus
    #[must_use]
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.events = self.events.with_bus(bus);
        self
    }

    /// Configure how rejections are reported and surfaced
    #[must_use]
    pub fn with_exception_policy(mut self, policy: ExceptionPolicy) -> Self {
        self.exceptions = self.exceptions.with_policy(policy);
        self
    }

    /// Get the bulkhead name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &BulkheadConfig {
        &self.config
    }

    /// Event subscription surface
    #[must_use]
    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    /// Acquire a slot, queueing for at most the configured timeout
    ///
    /// # Errors
    /// - `BulkheadRejected` with `queue_full` when the waiting queue is full
    /// - `BulkheadRejected` with `timeout` when the queued wait expires
    pub async fn acquire(&self) -> Result<BulkheadPermit, ResilienceError> {
        self.acquire_with(self.config.timeout, None).await
    }

    /// Acquire a slot with an explicit wait bound and cancellation token
    ///
    /// # Errors
    /// As [`acquire`](Self::acquire), plus `Cancelled` when `cancel` fires
    /// while queued
    pub async fn acquire_with(
        &self,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> Result<BulkheadPermit, ResilienceError> {
        let entry = {
            let mut c = self.shared.counters.lock();
            match Arc::clone(&self.shared.semaphore).try_acquire_owned() {
                Ok(permit) => {
                    let active = c.admit(Duration::ZERO);
                    Entry::Admitted(permit, active)
                }
                Err(_) if c.waiting >= self.config.max_waiting => {
                    c.rejected += 1;
                    Entry::QueueFull(c.active)
                }
                Err(_) => {
                    c.waiting += 1;
                    Entry::Queued
                }
            }
        };

        match entry {
            Entry::Admitted(permit, active) => Ok(self.admitted(permit, active, Duration::ZERO).await),
            Entry::QueueFull(active) => {
                debug!(bulkhead = %self.name(), active, "Bulkhead queue full");
                self.events
                    .emit_with(EventKind::QueueFull, |e| {
                        e.with("active", active)
                            .with("max_waiting", self.config.max_waiting)
                    })
                    .await;
                Err(self.rejection(BulkheadReason::QueueFull, None))
            }
            Entry::Queued => self.wait_for_slot(timeout, cancel).await,
        }
    }

    async fn wait_for_slot(
        &self,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> Result<BulkheadPermit, ResilienceError> {
        let mut queued = QueueSlot {
            counters: &self.shared.counters,
            armed: true,
        };
        let started = Instant::now();
        let outcome = wait::wait_for(
            Arc::clone(&self.shared.semaphore).acquire_owned(),
            timeout,
            cancel,
        )
        .await;
        let waited = started.elapsed();

        queued.armed = false;
        let admitted = {
            let mut c = self.shared.counters.lock();
            c.waiting = c.waiting.saturating_sub(1);
            match outcome {
                Ok(Ok(permit)) => Ok((permit, c.admit(waited))),
                Ok(Err(_)) => {
                    c.rejected += 1;
                    Err(Some(BulkheadReason::CapacityFull))
                }
                Err(WaitError::TimedOut) => {
                    c.rejected += 1;
                    Err(Some(BulkheadReason::Timeout))
                }
                Err(WaitError::Cancelled) => Err(None),
            }
        };

        match admitted {
            Ok((permit, active)) => Ok(self.admitted(permit, active, waited).await),
            Err(Some(reason)) => {
                warn!(
                    bulkhead = %self.name(),
                    reason = %reason,
                    waited_ms = waited.as_millis() as u64,
                    "Bulkhead rejected queued call"
                );
                self.events
                    .emit_with(EventKind::BulkheadFull, |e| {
                        e.with("reason", reason.as_str())
                            .with("waited_ms", waited.as_millis() as u64)
                    })
                    .await;
                Err(self.rejection(reason, timeout))
            }
            Err(None) => Err(ResilienceError::Cancelled {
                name: self.name().to_string(),
            }),
        }
    }

    async fn admitted(
        &self,
        permit: OwnedSemaphorePermit,
        active: usize,
        waited: Duration,
    ) -> BulkheadPermit {
        debug!(bulkhead = %self.name(), active, "Bulkhead slot acquired");
        self.events
            .emit_with(EventKind::SlotAcquired, |e| {
                e.with("active", active)
                    .with("wait_time_ms", waited.as_millis() as u64)
            })
            .await;
        BulkheadPermit {
            shared: Arc::clone(&self.shared),
            permit: Some(permit),
        }
    }

    /// Run `operation` inside a slot.
    ///
    /// The slot is released on every exit path, including when the
    /// returned future is dropped mid-flight.
    ///
    /// # Errors
    /// Rejections from [`acquire`](Self::acquire), or `Operation` carrying
    /// the operation's own error
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.acquire().await.map_err(ResilienceError::widen)?;
        let result = operation().await;
        {
            let mut c = self.shared.counters.lock();
            if result.is_ok() {
                c.successful += 1;
            } else {
                c.failed += 1;
            }
        }
        self.release(permit).await;
        result.map_err(ResilienceError::Operation)
    }

    /// Give back a slot and emit `slot_released`.
    ///
    /// Dropping the permit also releases it, without the event.
    pub async fn release(&self, mut permit: BulkheadPermit) {
        if let Some(held) = permit.permit.take() {
            let active = permit.shared.release(held);
            self.events
                .emit_with(EventKind::SlotReleased, |e| e.with("active", active))
                .await;
        }
    }

    /// Slots currently free
    #[must_use]
    pub fn available_slots(&self) -> usize {
        self.shared.semaphore.available_permits()
    }

    /// Check if every slot is taken
    #[must_use]
    pub fn is_at_capacity(&self) -> bool {
        self.available_slots() == 0
    }

    /// Get current metrics
    #[must_use]
    pub fn metrics(&self) -> BulkheadMetrics {
        let c = self.shared.counters.lock();
        BulkheadMetrics {
            name: self.shared.name.clone(),
            max_concurrent: self.config.max_concurrent,
            max_waiting: self.config.max_waiting,
            active: c.active,
            waiting: c.waiting,
            peak_active: c.peak_active,
            total_requests: c.admitted + c.rejected,
            successful_requests: c.successful,
            failed_requests: c.failed,
            rejected_requests: c.rejected,
            average_wait: u32::try_from(c.admitted)
                .ok()
                .filter(|n| *n > 0)
                .map_or(Duration::ZERO, |n| c.total_wait / n),
        }
    }

    fn rejection(&self, reason: BulkheadReason, timeout: Option<Duration>) -> ResilienceError {
        let (active, waiting) = {
            let c = self.shared.counters.lock();
            (c.active, c.waiting)
        };
        let message = match reason {
            BulkheadReason::QueueFull => format!(
                "Bulkhead '{}' queue is full ({waiting}/{})",
                self.name(),
                self.config.max_waiting
            ),
            BulkheadReason::Timeout => format!(
                "Bulkhead '{}' wait timed out after {:?}",
                self.name(),
                timeout.unwrap_or_default()
            ),
            BulkheadReason::CapacityFull => format!("Bulkhead '{}' is at capacity", self.name()),
        };
        let ctx = self.exceptions.context(
            reason,
            message,
            None,
            metadata(json!({
                "active": active,
                "waiting": waiting,
                "max_concurrent": self.config.max_concurrent,
                "max_waiting": self.config.max_waiting,
            })),
        );
        self.exceptions.handle(
            &ctx,
            ResilienceError::BulkheadRejected {
                name: self.name().to_string(),
                reason,
            },
        )
    }
}

impl std::fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bulkhead")
            .field("name", &self.shared.name)
            .field("config", &self.config)
            .field("available", &self.available_slots())
            .finish_non_exhaustive()
    }
}

/// A slot in a bulkhead
///
/// The slot is released when the permit is dropped or handed to
/// [`Bulkhead::release`].
pub struct BulkheadPermit {
    shared: Arc<Shared>,
    permit: Option<OwnedSemaphorePermit>,
}

impl BulkheadPermit {
    /// Name of the bulkhead this permit belongs to
    #[must_use]
    pub fn bulkhead_name(&self) -> &str {
        &self.shared.name
    }
}

impl Drop for BulkheadPermit {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            self.shared.release(permit);
        }
    }
}

impl std::fmt::Debug for BulkheadPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkheadPermit")
            .field("bulkhead", &self.shared.name)
            .field("held", &self.permit.is_some())
            .finish()
    }
}

/// Bulkhead metrics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct BulkheadMetrics {
    /// Bulkhead name
    pub name: String,
    /// Configured concurrency
    pub max_concurrent: usize,
    /// Configured queue size
    pub max_waiting: usize,
    /// Calls holding a slot
    pub active: usize,
    /// Callers queued for a slot
    pub waiting: usize,
    /// Highest observed `active`
    pub peak_active: usize,
    /// Admissions plus rejections
    pub total_requests: u64,
    /// Executions that returned `Ok`
    pub successful_requests: u64,
    /// Executions that returned `Err`
    pub failed_requests: u64,
    /// Callers turned away
    pub rejected_requests: u64,
    /// Mean time admitted callers spent queued
    #[serde(with = "humantime_serde")]
    pub average_wait: Duration,
}

impl BulkheadMetrics {
    /// Share of slots in use
    #[must_use]
    pub fn utilization(&self) -> f64 {
        self.active as f64 / self.max_concurrent as f64
    }

    /// Share of requests rejected
    #[must_use]
    pub fn rejection_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.rejected_requests as f64 / self.total_requests as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, thiserror::Error)]
    #[error("query failed")]
    struct QueryFailed;

    fn bulkhead(max_concurrent: usize, max_waiting: usize, timeout: Option<Duration>) -> Bulkhead {
        Bulkhead::new(
            "test-bulkhead",
            BulkheadConfig {
                max_concurrent,
                max_waiting,
                timeout,
            },
        )
        .expect("valid config")
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = BulkheadConfig {
            max_concurrent: 0,
            ..Default::default()
        };
        assert!(Bulkhead::new("bad", config).is_err());

        let config = BulkheadConfig {
            timeout: Some(Duration::ZERO),
            ..Default::default()
        };
        assert!(Bulkhead::new("bad", config).is_err());
    }

    #[tokio::test]
    async fn test_bulkhead_acquire_and_release() {
        let bh = bulkhead(2, 0, None);
        let first = bh.acquire().await.expect("slot 1");
        let _second = bh.acquire().await.expect("slot 2");
        assert!(bh.is_at_capacity());
        assert_eq!(bh.metrics().active, 2);

        bh.release(first).await;
        assert_eq!(bh.available_slots(), 1);
        assert_eq!(bh.metrics().active, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_running_one_queued_one_rejected() {
        let bh = Arc::new(bulkhead(2, 1, None));
        let first = bh.acquire().await.expect("slot 1");
        let _second = bh.acquire().await.expect("slot 2");

        let queued = {
            let bh = bh.clone();
            tokio::spawn(async move { bh.acquire().await.map(|p| p.bulkhead_name().to_string()) })
        };
        settle().await;
        assert_eq!(bh.metrics().waiting, 1);

        let err = bh.acquire().await.expect_err("queue is full");
        assert!(matches!(
            err,
            ResilienceError::BulkheadRejected {
                reason: BulkheadReason::QueueFull,
                ..
            }
        ));

        drop(first);
        let name = queued.await.expect("task completes").expect("queued caller admitted");
        assert_eq!(name, "test-bulkhead");
        assert_eq!(bh.metrics().rejected_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_four_simultaneous_calls() {
        let bh = bulkhead(2, 1, None);
        let running = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let (running, peak) = (&running, &peak);

        let call = move || async move {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(1)).await;
            running.fetch_sub(1, Ordering::SeqCst);
            Ok::<_, QueryFailed>(())
        };

        let results = futures::future::join_all((0..4).map(|_| bh.execute(call))).await;
        let rejected: Vec<_> = results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .filter_map(ResilienceError::reason)
            .collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 3);
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].as_str(), "queue_full");
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(bh.metrics().peak_active, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_wait_times_out() {
        let bh = bulkhead(1, 1, Some(Duration::from_millis(100)));
        let _held = bh.acquire().await.expect("slot");

        let err = bh.acquire().await.expect_err("wait should time out");
        assert_eq!(err.reason().map(|r| r.as_str()), Some("timeout"));
        assert_eq!(bh.metrics().waiting, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_wait() {
        let bh = bulkhead(1, 1, None);
        let _held = bh.acquire().await.expect("slot");
        let token = CancellationToken::new();
        token.cancel();

        let err = bh
            .acquire_with(None, Some(&token))
            .await
            .expect_err("cancelled");
        assert!(matches!(err, ResilienceError::Cancelled { .. }));
        assert_eq!(bh.metrics().waiting, 0);
    }

    #[tokio::test]
    async fn test_execute_releases_on_error() {
        let bh = bulkhead(1, 0, None);
        let err = bh
            .execute(|| async { Err::<(), _>(QueryFailed) })
            .await
            .expect_err("operation fails");
        assert!(matches!(err, ResilienceError::Operation(QueryFailed)));

        let metrics = bh.metrics();
        assert_eq!(metrics.active, 0);
        assert_eq!(metrics.failed_requests, 1);
        assert_eq!(bh.available_slots(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_execution_releases_slot() {
        let bh = bulkhead(1, 0, None);
        let pending = bh.execute(|| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, QueryFailed>(())
        });
        let timed_out = tokio::time::timeout(Duration::from_secs(1), pending).await;
        assert!(timed_out.is_err());
        assert_eq!(bh.metrics().active, 0);
        assert_eq!(bh.available_slots(), 1);
    }

    #[tokio::test]
    async fn test_slot_events() {
        let bh = bulkhead(1, 0, None);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        bh.events().on(
            resilience_core::EventFilter::Any,
            resilience_core::handler_fn(move |event| {
                s.lock().push(event.kind);
                Ok(())
            }),
        );

        let permit = bh.acquire().await.expect("slot");
        let _ = bh.acquire().await;
        bh.release(permit).await;

        assert_eq!(
            *seen.lock(),
            vec![EventKind::SlotAcquired, EventKind::QueueFull, EventKind::SlotReleased]
        );
    }
}
