//! Named circuit breakers.
//!
//! The registry is an ordinary value: build one at the composition root and
//! pass it to whatever needs shared breakers. Breakers it creates report to
//! the registry's event bus, if one was attached.

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitState};
use dashmap::DashMap;
use resilience_core::{validate_config, ConfigError, EventBus};
use std::sync::Arc;
use tracing::info;

/// Registry of circuit breakers keyed by name
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    default_config: CircuitBreakerConfig,
    bus: Option<Arc<EventBus>>,
}

impl CircuitBreakerRegistry {
    /// Create a registry whose breakers use `default_config`
    ///
    /// # Errors
    /// Returns `ConfigError` if the default configuration is invalid
    pub fn new(default_config: CircuitBreakerConfig) -> Result<Self, ConfigError> {
        validate_config("circuit breaker", &default_config)?;
        Ok(Self {
            breakers: DashMap::new(),
            default_config,
            bus: None,
        })
    }

    /// Create with default breaker configuration
    #[must_use]
    pub fn with_defaults() -> Self {
        Self {
            breakers: DashMap::new(),
            default_config: CircuitBreakerConfig::default(),
            bus: None,
        }
    }

    /// Attach breakers created from now on to `bus`
    #[must_use]
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Get the breaker called `name`, creating it with the default config
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                info!(breaker = %name, "Registering circuit breaker");
                Arc::new(self.attach(CircuitBreaker::from_valid(
                    name.to_string(),
                    self.default_config.clone(),
                )))
            })
            .clone()
    }

    /// Get the breaker called `name`, creating it with `config` if missing.
    ///
    /// An existing breaker is returned unchanged, whatever its config.
    ///
    /// # Errors
    /// Returns `ConfigError` if a breaker must be created and `config` is invalid
    pub fn get_or_create_with(
        &self,
        name: &str,
        config: CircuitBreakerConfig,
    ) -> Result<Arc<CircuitBreaker>, ConfigError> {
        if let Some(existing) = self.breakers.get(name) {
            return Ok(existing.clone());
        }
        let breaker = Arc::new(self.attach(CircuitBreaker::new(name, config)?));
        Ok(self
            .breakers
            .entry(name.to_string())
            .or_insert(breaker)
            .clone())
    }

    /// Look up a breaker without creating it
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| b.clone())
    }

    /// Remove a breaker; callers holding it keep a working instance
    pub fn remove(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.remove(name).map(|(_, b)| b)
    }

    /// Number of registered breakers
    #[must_use]
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    /// Whether no breaker is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Metrics for every breaker, sorted by name
    #[must_use]
    pub fn all_metrics(&self) -> Vec<CircuitBreakerMetrics> {
        let mut metrics: Vec<_> = self.breakers.iter().map(|b| b.metrics()).collect();
        metrics.sort_by(|a, b| a.name.cmp(&b.name));
        metrics
    }

    /// Names of breakers currently open, sorted
    #[must_use]
    pub fn open_circuits(&self) -> Vec<String> {
        let mut open: Vec<_> = self
            .breakers
            .iter()
            .filter(|b| b.state() == CircuitState::Open)
            .map(|b| b.key().clone())
            .collect();
        open.sort();
        open
    }

    /// Reset every breaker to closed
    pub async fn reset_all(&self) {
        let breakers: Vec<_> = self.breakers.iter().map(|b| b.value().clone()).collect();
        for breaker in breakers {
            breaker.reset().await;
        }
    }

    /// Drop every breaker
    pub fn clear(&self) {
        self.breakers.clear();
    }

    fn attach(&self, breaker: CircuitBreaker) -> CircuitBreaker {
        match &self.bus {
            Some(bus) => breaker.with_event_bus(bus.clone()),
            None => breaker,
        }
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
