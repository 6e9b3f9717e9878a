//! Redis-backed sorted-set store.

use crate::store::{SortedSetStore, StoreError, StoreResult};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tracing::info;

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
            Self::Connection(err.to_string())
        } else {
            Self::Command(err.to_string())
        }
    }
}

/// [`SortedSetStore`] on a shared Redis deployment
#[derive(Clone)]
pub struct RedisSortedSetStore {
    connection: ConnectionManager,
}

impl RedisSortedSetStore {
    /// Connect to `url`, e.g. `redis://localhost:6379`
    ///
    /// # Errors
    /// `Connection` if the URL is invalid or the server is unreachable
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        info!(url = %url, "Redis rate limit store connected");
        Ok(Self { connection })
    }

    /// Wrap an existing connection manager
    #[must_use]
    pub fn from_connection(connection: ConnectionManager) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl SortedSetStore for RedisSortedSetStore {
    async fn record(
        &self,
        key: &str,
        member: &str,
        now_ms: i64,
        window_start_ms: i64,
        ttl: Duration,
    ) -> StoreResult<u64> {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let mut conn = self.connection.clone();
        let (count,): (u64,) = redis::pipe()
            .atomic()
            .cmd("ZADD")
            .arg(key)
            .arg(now_ms)
            .arg(member)
            .ignore()
            .cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(format!("({window_start_ms}"))
            .ignore()
            .cmd("ZCARD")
            .arg(key)
            .cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_ms)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn count(&self, key: &str, window_start_ms: i64) -> StoreResult<u64> {
        let mut conn = self.connection.clone();
        let count: u64 = redis::cmd("ZCOUNT")
            .arg(key)
            .arg(window_start_ms)
            .arg("+inf")
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn remove(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.connection.clone();
        redis::cmd("DEL").arg(key).query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn health_check(&self) -> StoreResult<()> {
        let mut conn = self.connection.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(StoreError::Unavailable(format!("unexpected PING reply: {pong}")))
        }
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

impl std::fmt::Debug for RedisSortedSetStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisSortedSetStore").finish_non_exhaustive()
    }
}
