//! Subscriber setup for `tracing` output.

use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Output format of the log layer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

/// Tracing configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TracingConfig {
    /// Install a subscriber at all
    pub enabled: bool,
    /// Service name attached to the startup record
    pub service_name: String,
    /// Default filter directive; `RUST_LOG` takes precedence when set
    pub log_level: String,
    /// Line format
    pub format: LogFormat,
    /// Include the event target
    pub with_target: bool,
    /// Include source file and line
    pub with_source_location: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            service_name: "resilience-toolkit".to_string(),
            log_level: "info".to_string(),
            format: LogFormat::Pretty,
            with_target: true,
            with_source_location: false,
        }
    }
}

impl TracingConfig {
    /// Create a configuration for `service_name`
    #[must_use]
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    /// Set the default filter directive
    #[must_use]
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Set the line format
    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Build the filter: `RUST_LOG` if set, else `log_level`
    ///
    /// # Errors
    /// `InvalidFilter` when `log_level` is not a valid directive
    pub fn filter(&self) -> Result<EnvFilter, TracingError> {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.log_level))
            .map_err(|e| TracingError::InvalidFilter(e.to_string()))
    }
}

/// Install a global subscriber. Returns `false` when disabled.
///
/// # Errors
/// `InvalidFilter` for a bad level directive, `Init` when a global
/// subscriber is already installed
pub fn init_tracing(config: &TracingConfig) -> Result<bool, TracingError> {
    if !config.enabled {
        return Ok(false);
    }

    let filter = config.filter()?;
    let layer = match config.format {
        LogFormat::Pretty => fmt::layer()
            .with_target(config.with_target)
            .with_file(config.with_source_location)
            .with_line_number(config.with_source_location)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_target(config.with_target)
            .with_file(config.with_source_location)
            .with_line_number(config.with_source_location)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init()
        .map_err(|e| TracingError::Init(e.to_string()))?;

    info!(service = %config.service_name, format = ?config.format, "Tracing initialized");
    Ok(true)
}

/// Tracing initialization error
#[derive(Debug, thiserror::Error)]
pub enum TracingError {
    /// Failed to install the subscriber
    #[error("Failed to initialize tracing: {0}")]
    Init(String),
    /// The filter directive did not parse
    #[error("Invalid log filter: {0}")]
    InvalidFilter(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_from_empty_document() {
        let config: TracingConfig = serde_json::from_str("{}").expect("deserializes");
        assert_eq!(config, TracingConfig::default());

        let config: TracingConfig =
            serde_json::from_str(r#"{"format": "json", "log_level": "debug"}"#).expect("deserializes");
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_disabled_installs_nothing() {
        let config = TracingConfig {
            enabled: false,
            ..Default::default()
        };
        assert!(!init_tracing(&config).expect("disabled is not an error"));
    }

    #[test]
    fn test_second_init_fails() {
        let config = TracingConfig::new("test").with_log_level("warn");
        let first = init_tracing(&config);
        let second = init_tracing(&config);
        assert!(first.is_ok());
        assert!(matches!(second, Err(TracingError::Init(_))));
    }
}
