//! # Resilience Config
//!
//! File-based settings for every resilience primitive:
//! - Named configurations per primitive, loaded from TOML or YAML
//! - Validation that reports the offending section and entry
//! - Builders that construct validated primitives by name

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod settings;

// Re-export main types
pub use error::{SettingsError, SettingsResult};
pub use settings::{ResilienceSettings, SettingsFormat};
