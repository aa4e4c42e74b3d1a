//! Redis Ephemeral Store
//!
//! Implements EphemeralStore against a Redis server shared by every
//! instance of the service.

use crate::domain::ports::{EphemeralStore, StoreError, WindowOutcome};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{RedisError, Script};
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore, SemaphorePermit};

/// Prune, count, and conditionally add in one server-side step.
///
/// KEYS[1] window key; ARGV: now_ms, window_ms, limit, member.
/// Returns {admitted, count, oldest_ms}.
const SLIDING_WINDOW_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now - window)
local count = redis.call('ZCARD', KEYS[1])
if count < limit then
  redis.call('ZADD', KEYS[1], now, ARGV[4])
  redis.call('PEXPIRE', KEYS[1], window)
  return {1, count + 1, 0}
end
local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
return {0, count, (oldest[2] and tonumber(oldest[2])) or 0}
"#;

/// Keys fetched per SCAN round-trip.
const SCAN_BATCH: usize = 200;

/// Redis-backed ephemeral store.
///
/// The connection is established lazily on first use and re-established
/// by the connection manager after drops. Until Redis is reachable every
/// call returns [`StoreError::Unavailable`]. At most `max_connections`
/// commands are in flight at once; further callers wait for a slot.
pub struct RedisStore {
    client: redis::Client,
    connection: Mutex<Option<ConnectionManager>>,
    permits: Semaphore,
    max_connections: usize,
    window_script: Script,
}

impl RedisStore {
    /// Create a store for the given URL (no I/O happens here).
    pub fn open(url: &str, max_connections: usize) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)
            .map_err(|e| StoreError::Command(format!("invalid redis url {:?}: {}", url, e)))?;
        let max_connections = max_connections.max(1);

        Ok(Self {
            client,
            connection: Mutex::new(None),
            permits: Semaphore::new(max_connections),
            max_connections,
            window_script: Script::new(SLIDING_WINDOW_SCRIPT),
        })
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Wait for a command slot, then hand out the shared connection.
    async fn conn(&self) -> Result<(SemaphorePermit<'_>, ConnectionManager), StoreError> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| StoreError::Unavailable("redis store closed".to_string()))?;

        let mut connection = self.connection.lock().await;
        if let Some(manager) = connection.as_ref() {
            return Ok((permit, manager.clone()));
        }

        let manager = ConnectionManager::new(self.client.clone())
            .await
            .map_err(classify)?;
        tracing::info!("redis store connected");
        *connection = Some(manager.clone());
        Ok((permit, manager))
    }
}

/// Map a Redis error to the store taxonomy.
fn classify(e: RedisError) -> StoreError {
    if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout() {
        StoreError::Unavailable(e.to_string())
    } else {
        StoreError::Command(e.to_string())
    }
}

#[async_trait]
impl EphemeralStore for RedisStore {
    async fn ping(&self) -> Result<(), StoreError> {
        let (_permit, mut conn) = self.conn().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let (_permit, mut conn) = self.conn().await?;
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(classify)?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let (_permit, mut conn) = self.conn().await?;
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let (_permit, mut conn) = self.conn().await?;
        let removed: u64 = redis::cmd("DEL")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(classify)?;
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let (_permit, mut conn) = self.conn().await?;
        let exists: bool = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(classify)?;
        Ok(exists)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let (_permit, mut conn) = self.conn().await?;
        let updated: bool = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await
            .map_err(classify)?;
        Ok(updated)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let (_permit, mut conn) = self.conn().await?;
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        // SCAN instead of KEYS so large keyspaces don't block the server.
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(classify)?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn sliding_window_admit(
        &self,
        key: &str,
        now_ms: u64,
        window: Duration,
        limit: u64,
    ) -> Result<WindowOutcome, StoreError> {
        let (_permit, mut conn) = self.conn().await?;
        let member = format!("{}-{}", now_ms, uuid::Uuid::new_v4());

        let mut invocation = self.window_script.prepare_invoke();
        invocation
            .key(key)
            .arg(now_ms)
            .arg(window.as_millis() as u64)
            .arg(limit)
            .arg(member);

        let (admitted, count, oldest): (i64, u64, u64) = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(classify)?;

        Ok(WindowOutcome {
            admitted: admitted == 1,
            count,
            oldest_ms: if admitted == 1 { None } else { Some(oldest) },
        })
    }

    async fn close(&self) {
        self.permits.close();
        if self.connection.lock().await.take().is_some() {
            tracing::info!("redis store connection released");
        }
    }
}
