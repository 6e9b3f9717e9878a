//! Settings errors.

use resilience_core::ConfigError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading, validating or applying settings
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The settings file could not be read
    #[error("Failed to read settings file {path}: {source}")]
    Read {
        /// File that failed
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The file extension names no supported format
    #[error("Unsupported settings format for {0} (expected .toml, .yaml or .yml)")]
    UnsupportedFormat(PathBuf),

    /// TOML parse failure
    #[error("Failed to parse TOML settings: {0}")]
    Toml(#[from] toml::de::Error),

    /// YAML parse failure
    #[error("Failed to parse YAML settings: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// One named entry failed validation
    #[error("Invalid settings for {section}.{name}: {source}")]
    Invalid {
        /// Section holding the entry
        section: &'static str,
        /// Entry name
        name: String,
        /// Validation details
        #[source]
        source: ConfigError,
    },

    /// A builder asked for an entry that is not configured
    #[error("No {section} named '{name}' is configured")]
    UnknownEntry {
        /// Section searched
        section: &'static str,
        /// Missing entry name
        name: String,
    },
}

impl SettingsError {
    /// Section and entry name of a validation failure
    #[must_use]
    pub fn entry(&self) -> Option<(&'static str, &str)> {
        match self {
            Self::Invalid { section, name, .. } | Self::UnknownEntry { section, name } => {
                Some((section, name.as_str()))
            }
            _ => None,
        }
    }
}

/// Result alias for settings operations
pub type SettingsResult<T> = Result<T, SettingsError>;
