//! Sorted-set stores backing the remote limiter.
//!
//! A store keeps, per key, a set of members scored by admission time in
//! milliseconds. One sliding-window step is a single atomic call so several
//! limiter instances sharing a store never interleave inside a step.

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;
use thiserror::Error;

/// Error talking to a sorted-set store
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached
    #[error("Store connection error: {0}")]
    Connection(String),

    /// The store answered with an error
    #[error("Store command failed: {0}")]
    Command(String),

    /// The store is not usable right now
    #[error("Store not available: {0}")]
    Unavailable(String),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Backend for the remote sliding-window limiter
#[async_trait]
pub trait SortedSetStore: Send + Sync {
    /// Atomically add `member` scored `now_ms`, drop members scored below
    /// `window_start_ms`, refresh the key's TTL and return the member count.
    async fn record(
        &self,
        key: &str,
        member: &str,
        now_ms: i64,
        window_start_ms: i64,
        ttl: Duration,
    ) -> StoreResult<u64>;

    /// Members scored at or after `window_start_ms`
    async fn count(&self, key: &str, window_start_ms: i64) -> StoreResult<u64>;

    /// Drop `key` entirely
    async fn remove(&self, key: &str) -> StoreResult<()>;

    /// Check the store is reachable
    async fn health_check(&self) -> StoreResult<()>;

    /// Backend name for metrics
    fn name(&self) -> &'static str;
}

#[derive(Debug, Default)]
struct ScoredSet {
    members: Vec<(i64, String)>,
    expires_at_ms: i64,
}

/// Process-local store, for single-instance use and tests
#[derive(Debug, Default)]
pub struct InMemorySortedSetStore {
    sets: DashMap<String, ScoredSet>,
}

impl InMemorySortedSetStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys currently held, including expired ones not yet touched
    #[must_use]
    pub fn len(&self) -> usize {
        self.sets.len()
    }

    /// Whether no key is held
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

#[async_trait]
impl SortedSetStore for InMemorySortedSetStore {
    async fn record(
        &self,
        key: &str,
        member: &str,
        now_ms: i64,
        window_start_ms: i64,
        ttl: Duration,
    ) -> StoreResult<u64> {
        let mut set = self.sets.entry(key.to_string()).or_default();
        if set.expires_at_ms != 0 && set.expires_at_ms <= now_ms {
            set.members.clear();
        }
        set.members.push((now_ms, member.to_string()));
        set.members.retain(|(score, _)| *score >= window_start_ms);
        set.expires_at_ms = now_ms.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX));
        Ok(set.members.len() as u64)
    }

    async fn count(&self, key: &str, window_start_ms: i64) -> StoreResult<u64> {
        Ok(self.sets.get(key).map_or(0, |set| {
            set.members
                .iter()
                .filter(|(score, _)| *score >= window_start_ms)
                .count() as u64
        }))
    }

    async fn remove(&self, key: &str) -> StoreResult<()> {
        self.sets.remove(key);
        Ok(())
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
