use super::{LoadLevel, LoadShedder, LoadShedderMetrics, Priority, ShedCore, ShedState};
use async_trait::async_trait;
use resilience_core::{
    validate_config, ConfigError, EventBus, EventEmitter, ExceptionPolicy, LoadSheddingReason,
    ResilienceError,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use validator::Validate;

/// Request-count load shedder configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct BasicLoadShedderConfig {
    /// Admitted request ceiling
    #[validate(range(min = 1))]
    pub max_requests: usize,
    /// Queue depth at which normal and low priority requests are dropped
    pub max_queue_depth: usize,
}

impl Default for BasicLoadShedderConfig {
    fn default() -> Self {
        Self {
            max_requests: 1000,
            max_queue_depth: 500,
        }
    }
}

impl BasicLoadShedderConfig {
    pub(crate) fn verdict(&self, st: &ShedState, priority: Priority) -> Option<LoadSheddingReason> {
        if st.active >= self.max_requests {
            return Some(LoadSheddingReason::MaxLoadExceeded);
        }
        if priority != Priority::High && st.queue_depth >= self.max_queue_depth {
            return Some(LoadSheddingReason::MaxLoadExceeded);
        }
        None
    }

    pub(crate) fn level(&self, active: usize) -> LoadLevel {
        LoadLevel::from_utilization(active as f64 / self.max_requests as f64 * 100.0)
    }
}

/// Sheds on admitted request count and reported queue depth
pub struct BasicLoadShedder {
    core: ShedCore,
    config: BasicLoadShedderConfig,
}

impl BasicLoadShedder {
    /// Create a new shedder
    ///
    /// # Errors
    /// Returns `ConfigError` if the configuration is invalid
    pub fn new(name: impl Into<String>, config: BasicLoadShedderConfig) -> Result<Self, ConfigError> {
        validate_config("load shedder", &config)?;
        Ok(Self {
            core: ShedCore::new(name.into()),
            config,
        })
    }

    /// Create with default configuration
    #[must_use]
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self {
            core: ShedCore::new(name.into()),
            config: BasicLoadShedderConfig::default(),
        }
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
    pub fn config(&self) -> &BasicLoadShedderConfig {
        &self.config
    }

    /// Requests currently admitted
    #[must_use]
    pub fn active(&self) -> usize {
        self.core.state.lock().active
    }
}

#[async_trait]
impl LoadShedder for BasicLoadShedder {
    fn name(&self) -> &str {
        &self.core.name
    }

    async fn acquire(&self, priority: Priority) -> Result<(), ResilienceError> {
        let level = self.load_level();
        let config = &self.config;
        self.core
            .admit(priority, level, |st| config.verdict(st, priority))
            .await
    }

    fn release(&self) {
        self.core.release();
    }

    fn set_queue_depth(&self, depth: usize) {
        self.core.set_queue_depth(depth);
    }

    fn load_level(&self) -> LoadLevel {
        self.config.level(self.core.state.lock().active)
    }

    fn metrics(&self) -> LoadShedderMetrics {
        let st = self.core.state.lock();
        LoadShedderMetrics {
            name: self.core.name.clone(),
            kind: "basic",
            active_requests: st.active,
            queue_depth: st.queue_depth,
            max_requests: self.config.max_requests,
            max_queue_depth: self.config.max_queue_depth,
            total_accepted: st.accepted,
            total_shed: st.shed,
            load_level: self.config.level(st.active),
            cpu_percent: None,
            memory_percent: None,
        }
    }

    fn events(&self) -> &EventEmitter {
        &self.core.events
    }
}

impl std::fmt::Debug for BasicLoadShedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicLoadShedder")
            .field("name", &self.core.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
