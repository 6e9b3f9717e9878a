//! Named primitive configurations loaded from TOML or YAML.
//!
//! ```toml
//! [circuit_breakers.payments]
//! failure_threshold = 3
//! recovery_timeout = "30s"
//!
//! [bulkheads.database]
//! max_concurrent = 4
//! timeout = "250ms"
//!
//! [rates]
//! api = "100/minute"
//!
//! [telemetry]
//! format = "json"
//! ```

use crate::error::{SettingsError, SettingsResult};
use resilience_core::{validate_config, EventBus};
use resilience_patterns::{
    AdaptiveConcurrencyConfig, AdaptiveConcurrencyLimiter, BackpressureConfig,
    BackpressureManager, BasicLoadShedder, BasicLoadShedderConfig, Bulkhead, BulkheadConfig,
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, RetryConfig, RetryPolicy,
    SystemLoadShedder, SystemLoadShedderConfig, TimeoutConfig, TimeoutManager,
};
use resilience_ratelimit::{
    LocalRateLimiter, LocalRateLimiterConfig, Rate, RemoteRateLimiter, RemoteRateLimiterConfig,
    SortedSetStore,
};
use resilience_telemetry::{init_tracing, TracingConfig, TracingError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use validator::Validate;

/// On-disk settings format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsFormat {
    /// `.toml`
    Toml,
    /// `.yaml` or `.yml`
    Yaml,
}

impl SettingsFormat {
    /// Pick the format from a file extension
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()?.to_ascii_lowercase().as_str() {
            "toml" => Some(Self::Toml),
            "yaml" | "yml" => Some(Self::Yaml),
            _ => None,
        }
    }
}

/// Every configurable primitive, keyed by instance name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceSettings {
    /// Config used by the breaker registry for names not listed below
    pub circuit_breaker_defaults: CircuitBreakerConfig,
    /// Named circuit breakers
    pub circuit_breakers: BTreeMap<String, CircuitBreakerConfig>,
    /// Named bulkheads
    pub bulkheads: BTreeMap<String, BulkheadConfig>,
    /// Named retry policies
    pub retries: BTreeMap<String, RetryConfig>,
    /// Named timeout budgets
    pub timeouts: BTreeMap<String, TimeoutConfig>,
    /// Named backpressure managers
    pub backpressure: BTreeMap<String, BackpressureConfig>,
    /// Named adaptive concurrency limiters
    pub adaptive_concurrency: BTreeMap<String, AdaptiveConcurrencyConfig>,
    /// Named basic load shedders
    pub load_shedders: BTreeMap<String, BasicLoadShedderConfig>,
    /// Named system-aware load shedders
    pub system_load_shedders: BTreeMap<String, SystemLoadShedderConfig>,
    /// Named in-process rate limiters
    pub rate_limiters: BTreeMap<String, LocalRateLimiterConfig>,
    /// Named store-backed rate limiters
    pub remote_rate_limiters: BTreeMap<String, RemoteRateLimiterConfig>,
    /// Named rates such as `"100/minute"`
    pub rates: BTreeMap<String, Rate>,
    /// Log output
    pub telemetry: TracingConfig,
}

const CIRCUIT_BREAKERS: &str = "circuit_breakers";
const BULKHEADS: &str = "bulkheads";
const RETRIES: &str = "retries";
const TIMEOUTS: &str = "timeouts";
const BACKPRESSURE: &str = "backpressure";
const ADAPTIVE: &str = "adaptive_concurrency";
const LOAD_SHEDDERS: &str = "load_shedders";
const SYSTEM_LOAD_SHEDDERS: &str = "system_load_shedders";
const RATE_LIMITERS: &str = "rate_limiters";
const REMOTE_RATE_LIMITERS: &str = "remote_rate_limiters";
const RATES: &str = "rates";

impl ResilienceSettings {
    /// Load and validate a settings file, picking the format from its extension
    pub fn from_file(path: impl AsRef<Path>) -> SettingsResult<Self> {
        let path = path.as_ref();
        let format = SettingsFormat::from_path(path)
            .ok_or_else(|| SettingsError::UnsupportedFormat(path.to_path_buf()))?;
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let settings = match format {
            SettingsFormat::Toml => Self::from_toml_str(&content)?,
            SettingsFormat::Yaml => Self::from_yaml_str(&content)?,
        };
        info!(
            path = %path.display(),
            instances = settings.instance_count(),
            "Loaded resilience settings"
        );
        Ok(settings)
    }

    /// Parse and validate TOML settings
    pub fn from_toml_str(content: &str) -> SettingsResult<Self> {
        let settings: Self = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse and validate YAML settings
    pub fn from_yaml_str(content: &str) -> SettingsResult<Self> {
        let settings: Self = serde_yaml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate every entry; the error names the first offending section and entry
    pub fn validate(&self) -> SettingsResult<()> {
        validate_config(CIRCUIT_BREAKERS, &self.circuit_breaker_defaults).map_err(|source| {
            SettingsError::Invalid {
                section: "circuit_breaker_defaults",
                name: "default".to_string(),
                source,
            }
        })?;
        check_section(CIRCUIT_BREAKERS, &self.circuit_breakers)?;
        check_section(BULKHEADS, &self.bulkheads)?;
        check_section(RETRIES, &self.retries)?;
        check_section(TIMEOUTS, &self.timeouts)?;
        check_section(BACKPRESSURE, &self.backpressure)?;
        check_section(ADAPTIVE, &self.adaptive_concurrency)?;
        check_section(LOAD_SHEDDERS, &self.load_shedders)?;
        check_section(SYSTEM_LOAD_SHEDDERS, &self.system_load_shedders)?;
        check_section(RATE_LIMITERS, &self.rate_limiters)?;
        check_section(REMOTE_RATE_LIMITERS, &self.remote_rate_limiters)?;
        debug!(instances = self.instance_count(), "Resilience settings validated");
        Ok(())
    }

    /// Number of named primitive entries across all sections
    #[must_use]
    pub fn instance_count(&self) -> usize {
        self.circuit_breakers.len()
            + self.bulkheads.len()
            + self.retries.len()
            + self.timeouts.len()
            + self.backpressure.len()
            + self.adaptive_concurrency.len()
            + self.load_shedders.len()
            + self.system_load_shedders.len()
            + self.rate_limiters.len()
            + self.remote_rate_limiters.len()
    }

    /// Install the configured `tracing` subscriber
    pub fn init_telemetry(&self) -> Result<bool, TracingError> {
        init_tracing(&self.telemetry)
    }

    /// Look up a named rate
    pub fn rate(&self, name: &str) -> SettingsResult<Rate> {
        lookup(RATES, &self.rates, name).copied()
    }

    /// Build a breaker registry holding every named breaker.
    ///
    /// Names not listed fall back to `circuit_breaker_defaults`.
    pub fn build_registry(
        &self,
        bus: Option<Arc<EventBus>>,
    ) -> SettingsResult<CircuitBreakerRegistry> {
        let mut registry = CircuitBreakerRegistry::new(self.circuit_breaker_defaults.clone())
            .map_err(|source| SettingsError::Invalid {
                section: "circuit_breaker_defaults",
                name: "default".to_string(),
                source,
            })?;
        if let Some(bus) = bus {
            registry = registry.with_event_bus(bus);
        }
        for (name, config) in &self.circuit_breakers {
            registry
                .get_or_create_with(name, config.clone())
                .map_err(invalid(CIRCUIT_BREAKERS, name))?;
        }
        Ok(registry)
    }

    /// Build the circuit breaker called `name`
    pub fn build_circuit_breaker(&self, name: &str) -> SettingsResult<CircuitBreaker> {
        let config = lookup(CIRCUIT_BREAKERS, &self.circuit_breakers, name)?;
        CircuitBreaker::new(name, config.clone()).map_err(invalid(CIRCUIT_BREAKERS, name))
    }

    /// Build the bulkhead called `name`
    pub fn build_bulkhead(&self, name: &str) -> SettingsResult<Bulkhead> {
        let config = lookup(BULKHEADS, &self.bulkheads, name)?;
        Bulkhead::new(name, config.clone()).map_err(invalid(BULKHEADS, name))
    }

    /// Build the retry policy called `name`
    pub fn build_retry_policy(&self, name: &str) -> SettingsResult<RetryPolicy> {
        let config = lookup(RETRIES, &self.retries, name)?;
        RetryPolicy::new(name, config.clone()).map_err(invalid(RETRIES, name))
    }

    /// Build the timeout manager called `name`
    pub fn build_timeout_manager(&self, name: &str) -> SettingsResult<TimeoutManager> {
        let config = lookup(TIMEOUTS, &self.timeouts, name)?;
        TimeoutManager::new(name, config.clone()).map_err(invalid(TIMEOUTS, name))
    }

    /// Build the backpressure manager called `name`
    pub fn build_backpressure(&self, name: &str) -> SettingsResult<BackpressureManager> {
        let config = lookup(BACKPRESSURE, &self.backpressure, name)?;
        BackpressureManager::new(name, config.clone()).map_err(invalid(BACKPRESSURE, name))
    }

    /// Build the adaptive concurrency limiter called `name`
    pub fn build_adaptive_limiter(&self, name: &str) -> SettingsResult<AdaptiveConcurrencyLimiter> {
        let config = lookup(ADAPTIVE, &self.adaptive_concurrency, name)?;
        AdaptiveConcurrencyLimiter::new(name, config.clone()).map_err(invalid(ADAPTIVE, name))
    }

    /// Build the basic load shedder called `name`
    pub fn build_load_shedder(&self, name: &str) -> SettingsResult<BasicLoadShedder> {
        let config = lookup(LOAD_SHEDDERS, &self.load_shedders, name)?;
        BasicLoadShedder::new(name, config.clone()).map_err(invalid(LOAD_SHEDDERS, name))
    }

    /// Build the system-aware load shedder called `name`
    pub fn build_system_load_shedder(&self, name: &str) -> SettingsResult<SystemLoadShedder> {
        let config = lookup(SYSTEM_LOAD_SHEDDERS, &self.system_load_shedders, name)?;
        SystemLoadShedder::new(name, config.clone()).map_err(invalid(SYSTEM_LOAD_SHEDDERS, name))
    }

    /// Build the in-process rate limiter called `name`
    pub fn build_rate_limiter(&self, name: &str) -> SettingsResult<LocalRateLimiter> {
        let config = lookup(RATE_LIMITERS, &self.rate_limiters, name)?;
        LocalRateLimiter::new(name, config.clone()).map_err(invalid(RATE_LIMITERS, name))
    }

    /// Build the store-backed rate limiter called `name` on `store`
    pub fn build_remote_rate_limiter(
        &self,
        name: &str,
        store: Arc<dyn SortedSetStore>,
    ) -> SettingsResult<RemoteRateLimiter> {
        let config = lookup(REMOTE_RATE_LIMITERS, &self.remote_rate_limiters, name)?;
        RemoteRateLimiter::new(name, config.clone(), store)
            .map_err(invalid(REMOTE_RATE_LIMITERS, name))
    }
}

fn check_section<C: Validate>(
    section: &'static str,
    entries: &BTreeMap<String, C>,
) -> SettingsResult<()> {
    for (name, config) in entries {
        validate_config(section, config).map_err(invalid(section, name))?;
    }
    Ok(())
}

fn lookup<'a, C>(
    section: &'static str,
    entries: &'a BTreeMap<String, C>,
    name: &str,
) -> SettingsResult<&'a C> {
    entries.get(name).ok_or_else(|| SettingsError::UnknownEntry {
        section,
        name: name.to_string(),
    })
}

fn invalid<'a>(
    section: &'static str,
    name: &'a str,
) -> impl FnOnce(resilience_core::ConfigError) -> SettingsError + 'a {
    move |source| SettingsError::Invalid {
        section,
        name: name.to_string(),
        source,
    }
}
