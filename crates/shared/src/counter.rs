//! Shared fixed-window counters
//!
//! Rate-limit windows must be shared by every server instance, so the
//! production counter lives in Redis. `INCR` and `EXPIRE` go out in one
//! atomic pipeline: a key can never be left without a TTL.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::error::{StoreError, StoreResult};

#[async_trait]
pub trait WindowCounter: Send + Sync {
    /// Increment `key` and return the new value. The key expires after `ttl`.
    async fn increment(&self, key: &str, ttl: Duration) -> StoreResult<u64>;
}

/// Redis-backed window counter
#[derive(Clone)]
pub struct RedisWindowCounter {
    conn: ConnectionManager,
}

impl RedisWindowCounter {
    /// Connect to Redis. The connection manager reconnects on its own after
    /// transient failures.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| StoreError::Counter(format!("Failed to create Redis client: {}", e)))?;
        let conn = ConnectionManager::new(client).await?;
        tracing::info!("Redis window counter connected");
        Ok(Self { conn })
    }
}

#[async_trait]
impl WindowCounter for RedisWindowCounter {
    async fn increment(&self, key: &str, ttl: Duration) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        let (count,): (u64,) = redis::pipe()
            .atomic()
            .incr(key, 1u64)
            .expire(key, ttl.as_secs().max(1) as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }
}

/// Process-local window counter for tests and single-instance development
#[derive(Clone, Default)]
pub struct MemoryWindowCounter {
    windows: Arc<Mutex<HashMap<String, (u64, OffsetDateTime)>>>,
}

impl MemoryWindowCounter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WindowCounter for MemoryWindowCounter {
    async fn increment(&self, key: &str, ttl: Duration) -> StoreResult<u64> {
        let now = OffsetDateTime::now_utc();
        let mut windows = self.windows.lock().await;

        // Drop expired keys so long-running processes don't accumulate them
        windows.retain(|_, (_, expires_at)| *expires_at > now);

        let entry = windows
            .entry(key.to_string())
            .or_insert((0, now + ttl));
        entry.0 += 1;
        Ok(entry.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_counter_counts_per_key() {
        let counter = MemoryWindowCounter::new();
        let ttl = Duration::from_secs(60);

        assert_eq!(counter.increment("a", ttl).await.unwrap(), 1);
        assert_eq!(counter.increment("a", ttl).await.unwrap(), 2);
        assert_eq!(counter.increment("b", ttl).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_memory_counter_expires_keys() {
        let counter = MemoryWindowCounter::new();

        counter.increment("a", Duration::ZERO).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(
            counter
                .increment("a", Duration::from_secs(60))
                .await
                .unwrap(),
            1
        );
    }
}
