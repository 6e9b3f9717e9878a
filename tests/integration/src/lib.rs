//! Integration tests for the resilience toolkit
//!
//! Covers behavior that spans crates:
//! - Composition stacks built from several primitives
//! - Settings files driving primitive construction
//! - Event bus fan-out into logging and Prometheus counters
//! - Store-backed rate limiting shared across limiter instances
//! - Property tests for idempotent release

pub mod helpers;

pub use helpers::*;

#[cfg(test)]
mod composition_tests;
#[cfg(test)]
mod config_tests;
#[cfg(test)]
mod event_tests;
#[cfg(test)]
mod property_tests;
#[cfg(test)]
mod rate_limit_tests;
