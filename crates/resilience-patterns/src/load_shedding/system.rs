use super::{LoadLevel, LoadShedder, LoadShedderMetrics, Priority, ShedCore, ShedState};
use async_trait::async_trait;
use parking_lot::Mutex;
use resilience_core::{
    validate_config, ConfigError, EventBus, EventEmitter, EventKind, ExceptionPolicy,
    LoadSheddingReason, ResilienceError,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tokio::time::Instant;
use tracing::info;
use validator::Validate;

/// Host load at one point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SystemSample {
    /// Global CPU usage, 0-100
    pub cpu_percent: f64,
    /// Used memory as a share of total, 0-100
    pub memory_percent: f64,
}

impl SystemSample {
    /// Load level implied by this sample
    #[must_use]
    pub fn load_level(&self) -> LoadLevel {
        LoadLevel::from_system(self.cpu_percent, self.memory_percent)
    }
}

/// Source of host load samples
pub trait LoadProbe: Send + Sync {
    /// Take a fresh sample
    fn sample(&self) -> SystemSample;
}

/// [`LoadProbe`] backed by `sysinfo`
pub struct SysinfoProbe {
    system: Mutex<System>,
}

impl SysinfoProbe {
    /// Create a probe. The first CPU reading after creation is zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadProbe for SysinfoProbe {
    fn sample(&self) -> SystemSample {
        let mut system = self.system.lock();
        system.refresh_cpu_usage();
        system.refresh_memory();

        let total = system.total_memory();
        let memory_percent = if total == 0 {
            0.0
        } else {
            system.used_memory() as f64 / total as f64 * 100.0
        };
        SystemSample {
            cpu_percent: f64::from(system.global_cpu_usage()),
            memory_percent,
        }
    }
}

impl std::fmt::Debug for SysinfoProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SysinfoProbe").finish_non_exhaustive()
    }
}

/// System-aware load shedder configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SystemLoadShedderConfig {
    /// Admitted request ceiling
    #[validate(range(min = 1))]
    pub max_requests: usize,
    /// Queue depth at which normal and low priority requests are dropped
    pub max_queue_depth: usize,
    /// CPU percentage above which normal and low priority requests are dropped
    #[validate(range(min = 0.0, max = 100.0))]
    pub cpu_threshold: f64,
    /// Memory percentage above which normal and low priority requests are dropped
    #[validate(range(min = 0.0, max = 100.0))]
    pub memory_threshold: f64,
    /// How long a sample is reused before the probe is asked again
    #[serde(with = "humantime_serde")]
    pub check_interval: Duration,
}

impl Default for SystemLoadShedderConfig {
    fn default() -> Self {
        Self {
            max_requests: 1000,
            max_queue_depth: 500,
            cpu_threshold: 85.0,
            memory_threshold: 85.0,
            check_interval: Duration::from_secs(1),
        }
    }
}

impl SystemLoadShedderConfig {
    fn verdict(
        &self,
        st: &ShedState,
        priority: Priority,
        sample: SystemSample,
    ) -> Option<LoadSheddingReason> {
        let level = sample.load_level();
        if st.active >= self.max_requests || level == LoadLevel::Critical {
            return Some(LoadSheddingReason::MaxLoadExceeded);
        }
        if priority == Priority::High {
            return None;
        }
        if st.queue_depth >= self.max_queue_depth
            || sample.cpu_percent > self.cpu_threshold
            || sample.memory_percent > self.memory_threshold
        {
            return Some(LoadSheddingReason::MaxLoadExceeded);
        }
        if priority == Priority::Low && level >= LoadLevel::High {
            return Some(LoadSheddingReason::PriorityRejected);
        }
        None
    }
}

#[derive(Debug, Default)]
struct SampleCache {
    taken_at: Option<Instant>,
    sample: SystemSample,
    level: LoadLevel,
}

/// Sheds on request count plus host CPU and memory
pub struct SystemLoadShedder {
    core: ShedCore,
    config: SystemLoadShedderConfig,
    probe: Arc<dyn LoadProbe>,
    cache: Mutex<SampleCache>,
}

impl SystemLoadShedder {
    /// Create a shedder sampling the host through `sysinfo`
    ///
    /// # Errors
    /// Returns `ConfigError` if the configuration is invalid
    pub fn new(name: impl Into<String>, config: SystemLoadShedderConfig) -> Result<Self, ConfigError> {
        Self::with_probe(name, config, Arc::new(SysinfoProbe::new()))
    }

    /// Create a shedder with a custom load source
    ///
    /// # Errors
    /// Returns `ConfigError` if the configuration is invalid
    pub fn with_probe(
        name: impl Into<String>,
        config: SystemLoadShedderConfig,
        probe: Arc<dyn LoadProbe>,
    ) -> Result<Self, ConfigError> {
        validate_config("system load shedder", &config)?;
        Ok(Self {
            core: ShedCore::new(name.into()),
            config,
            probe,
            cache: Mutex::new(SampleCache::default()),
        })
    }

    /// Forward events to a shared bus
    #[must_use]
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.core.events = self.core.events.with_bus(bus);
        self
    }

    /// Configure how dropped requests are reported and surfaced
    #[must_use]
    pub fn with_exception_policy(mut self, policy: ExceptionPolicy) -> Self {
        self.core.exceptions = self.core.exceptions.with_policy(policy);
        self
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &SystemLoadShedderConfig {
        &self.config
    }

    /// Requests currently admitted
    #[must_use]
    pub fn active(&self) -> usize {
        self.core.state.lock().active
    }

    /// Latest sample, refreshed once `check_interval` has passed. Also
    /// returns `(old, new)` when the load level moved.
    fn sample(&self) -> (SystemSample, Option<(LoadLevel, LoadLevel)>) {
        let mut cache = self.cache.lock();
        let fresh = cache
            .taken_at
            .is_some_and(|at| at.elapsed() < self.config.check_interval);
        if fresh {
            return (cache.sample, None);
        }

        let sample = self.probe.sample();
        let level = sample.load_level();
        let change = (level != cache.level).then_some((cache.level, level));
        cache.taken_at = Some(Instant::now());
        cache.sample = sample;
        cache.level = level;
        (sample, change)
    }
}

#[async_trait]
impl LoadShedder for SystemLoadShedder {
    fn name(&self) -> &str {
        &self.core.name
    }

    async fn acquire(&self, priority: Priority) -> Result<(), ResilienceError> {
        let (sample, change) = self.sample();
        if let Some((old, new)) = change {
            info!(
                shedder = %self.core.name,
                old_level = %old,
                new_level = %new,
                cpu_percent = sample.cpu_percent,
                memory_percent = sample.memory_percent,
                "Load level changed"
            );
            self.core
                .events
                .emit_with(EventKind::LoadLevelChange, |e| {
                    e.with("old_level", old.as_str())
                        .with("new_level", new.as_str())
                        .with("cpu_percent", sample.cpu_percent)
                        .with("memory_percent", sample.memory_percent)
                })
                .await;
        }

        let config = &self.config;
        self.core
            .admit(priority, sample.load_level(), |st| {
                config.verdict(st, priority, sample)
            })
            .await
    }

    fn release(&self) {
        self.core.release();
    }

    fn set_queue_depth(&self, depth: usize) {
        self.core.set_queue_depth(depth);
    }

    /// Level from the last sample taken by `acquire`
    fn load_level(&self) -> LoadLevel {
        self.cache.lock().level
    }

    fn metrics(&self) -> LoadShedderMetrics {
        let sample = self.cache.lock().sample;
        let st = self.core.state.lock();
        LoadShedderMetrics {
            name: self.core.name.clone(),
            kind: "system",
            active_requests: st.active,
            queue_depth: st.queue_depth,
            max_requests: self.config.max_requests,
            max_queue_depth: self.config.max_queue_depth,
            total_accepted: st.accepted,
            total_shed: st.shed,
            load_level: sample.load_level(),
            cpu_percent: Some(sample.cpu_percent),
            memory_percent: Some(sample.memory_percent),
        }
    }

    fn events(&self) -> &EventEmitter {
        &self.core.events
    }
}

impl std::fmt::Debug for SystemLoadShedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemLoadShedder")
            .field("name", &self.core.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
