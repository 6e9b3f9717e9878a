//! Load shedding.
//!
//! Shedders decide at admission time whether a request should be dropped
//! outright instead of queued. [`BasicLoadShedder`] looks only at request
//! counts; [`SystemLoadShedder`] also samples host CPU and memory.

mod basic;
mod system;

pub use basic::{BasicLoadShedder, BasicLoadShedderConfig};
pub use system::{LoadProbe, SysinfoProbe, SystemLoadShedder, SystemLoadShedderConfig, SystemSample};

use crate::metadata;
use async_trait::async_trait;
use parking_lot::Mutex;
use resilience_core::{
    EventEmitter, EventKind, ExceptionHandler, LoadSheddingReason, PatternType, ResilienceError,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use tracing::warn;

/// Request priority as seen by a shedder
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Dropped first under pressure
    Low,
    /// Default priority
    #[default]
    Normal,
    /// Bypasses queue-depth shedding
    High,
}

impl Priority {
    /// Stable string code
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

/// Coarse load classification
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadLevel {
    /// Plenty of headroom
    #[default]
    Normal,
    /// Above 60% utilization
    Elevated,
    /// Above 75% utilization
    High,
    /// Above 90% utilization
    Critical,
}

impl LoadLevel {
    /// Classify request utilization, given as a percentage
    #[must_use]
    pub fn from_utilization(percent: f64) -> Self {
        if percent > 90.0 {
            Self::Critical
        } else if percent > 75.0 {
            Self::High
        } else if percent > 60.0 {
            Self::Elevated
        } else {
            Self::Normal
        }
    }

    /// Classify host load from CPU and memory percentages
    #[must_use]
    pub fn from_system(cpu_percent: f64, memory_percent: f64) -> Self {
        if cpu_percent > 90.0 || memory_percent > 90.0 {
            Self::Critical
        } else if cpu_percent > 75.0 || memory_percent > 80.0 {
            Self::High
        } else if cpu_percent > 60.0 || memory_percent > 70.0 {
            Self::Elevated
        } else {
            Self::Normal
        }
    }

    /// Stable string code
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Elevated => "elevated",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for LoadLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Admission surface shared by every shedder
#[async_trait]
pub trait LoadShedder: Send + Sync {
    /// Shedder name
    fn name(&self) -> &str;

    /// Admit a request or drop it
    ///
    /// # Errors
    /// `LoadShed` when the request is dropped
    async fn acquire(&self, priority: Priority) -> Result<(), ResilienceError>;

    /// Return an admitted request's slot. Never drives the count below zero.
    fn release(&self);

    /// Report the depth of the caller's own queue
    fn set_queue_depth(&self, depth: usize);

    /// Current load level
    fn load_level(&self) -> LoadLevel;

    /// Current metrics
    fn metrics(&self) -> LoadShedderMetrics;

    /// Event subscription surface
    fn events(&self) -> &EventEmitter;
}

/// Run `operation` behind `shedder`, releasing the slot however it ends
///
/// # Errors
/// `LoadShed` when the request is dropped, or `Operation` carrying the
/// operation's own error
pub async fn execute<S, F, Fut, T, E>(
    shedder: &S,
    priority: Priority,
    operation: F,
) -> Result<T, ResilienceError<E>>
where
    S: LoadShedder + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    shedder
        .acquire(priority)
        .await
        .map_err(ResilienceError::widen)?;
    let _slot = SlotGuard { shedder };
    operation().await.map_err(ResilienceError::Operation)
}

struct SlotGuard<'a, S: LoadShedder + ?Sized> {
    shedder: &'a S,
}

impl<S: LoadShedder + ?Sized> Drop for SlotGuard<'_, S> {
    fn drop(&mut self) {
        self.shedder.release();
    }
}

/// Load shedder metrics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct LoadShedderMetrics {
    /// Shedder name
    pub name: String,
    /// `basic` or `system`
    pub kind: &'static str,
    /// Requests currently admitted
    pub active_requests: usize,
    /// Last reported queue depth
    pub queue_depth: usize,
    /// Admitted request ceiling
    pub max_requests: usize,
    /// Queue depth ceiling
    pub max_queue_depth: usize,
    /// Requests admitted
    pub total_accepted: u64,
    /// Requests dropped
    pub total_shed: u64,
    /// Current load level
    pub load_level: LoadLevel,
    /// Last sampled CPU usage, system shedder only
    pub cpu_percent: Option<f64>,
    /// Last sampled memory usage, system shedder only
    pub memory_percent: Option<f64>,
}

impl LoadShedderMetrics {
    /// Admitted requests as a percentage of the ceiling
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.max_requests == 0 {
            0.0
        } else {
            self.active_requests as f64 / self.max_requests as f64 * 100.0
        }
    }

    /// Share of decisions that dropped the request
    #[must_use]
    pub fn shed_rate(&self) -> f64 {
        let total = self.total_accepted + self.total_shed;
        if total == 0 {
            0.0
        } else {
            self.total_shed as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct ShedState {
    pub(crate) active: usize,
    pub(crate) queue_depth: usize,
    pub(crate) accepted: u64,
    pub(crate) shed: u64,
}

/// Bookkeeping shared by both shedders. The caller supplies the verdict.
pub(crate) struct ShedCore {
    pub(crate) name: String,
    pub(crate) state: Mutex<ShedState>,
    pub(crate) events: EventEmitter,
    pub(crate) exceptions: ExceptionHandler,
}

impl ShedCore {
    pub(crate) fn new(name: String) -> Self {
        Self {
            events: EventEmitter::new(name.clone(), PatternType::LoadShedder),
            exceptions: ExceptionHandler::new(name.clone(), PatternType::LoadShedder),
            name,
            state: Mutex::new(ShedState::default()),
        }
    }

    /// `verdict` sees the state under the lock and returns why to shed, if at all.
    pub(crate) async fn admit<V>(
        &self,
        priority: Priority,
        level: LoadLevel,
        verdict: V,
    ) -> Result<(), ResilienceError>
    where
        V: FnOnce(&ShedState) -> Option<LoadSheddingReason>,
    {
        let (outcome, active, queue_depth) = {
            let mut st = self.state.lock();
            let outcome = match verdict(&st) {
                Some(reason) => {
                    st.shed += 1;
                    Err(reason)
                }
                None => {
                    st.active += 1;
                    st.accepted += 1;
                    Ok(())
                }
            };
            (outcome, st.active, st.queue_depth)
        };

        match outcome {
            Ok(()) => {
                self.events
                    .emit_with(EventKind::RequestAccepted, |e| {
                        e.with("active_requests", active)
                            .with("priority", priority.as_str())
                            .with("load_level", level.as_str())
                    })
                    .await;
                Ok(())
            }
            Err(reason) => {
                warn!(
                    shedder = %self.name,
                    active,
                    queue_depth,
                    priority = %priority,
                    load_level = %level,
                    reason = reason.as_str(),
                    "Shedding request"
                );
                self.events
                    .emit_with(EventKind::RequestShed, |e| {
                        e.with("active_requests", active)
                            .with("queue_depth", queue_depth)
                            .with("priority", priority.as_str())
                            .with("load_level", level.as_str())
                            .with("reason", reason.as_str())
                    })
                    .await;
                let ctx = self.exceptions.context(
                    reason,
                    format!("Load shedder '{}' dropped a {priority} priority request", self.name),
                    None,
                    metadata(json!({
                        "active_requests": active,
                        "queue_depth": queue_depth,
                        "priority": priority.as_str(),
                        "load_level": level.as_str(),
                    })),
                );
                Err(self.exceptions.handle(
                    &ctx,
                    ResilienceError::LoadShed {
                        name: self.name.clone(),
                        reason,
                    },
                ))
            }
        }
    }

    pub(crate) fn release(&self) {
        let mut st = self.state.lock();
        st.active = st.active.saturating_sub(1);
    }

    pub(crate) fn set_queue_depth(&self, depth: usize) {
        self.state.lock().queue_depth = depth;
    }
}
