//! Connection Pool
//!
//! Bounded pool of SQLite connections for the database the service
//! fronts. Sized from the scaling profile: `pool_size` connections are
//! kept idle for reuse and up to `max_overflow` more may be opened under
//! load, then closed on release.

use parking_lot::Mutex;
use rusqlite::Connection;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Path of the SQLite database file
    pub path: String,
    /// Connections kept for reuse
    pub pool_size: usize,
    /// Extra connections allowed beyond `pool_size`
    pub max_overflow: usize,
    /// How long `acquire` waits for a free slot
    pub acquire_timeout: Duration,
    /// Connections older than this are closed instead of reused
    pub max_lifetime: Duration,
}

impl PoolConfig {
    pub fn new(path: impl Into<String>, pool_size: usize) -> Self {
        Self {
            path: path.into(),
            pool_size,
            max_overflow: pool_size * 2,
            ..Default::default()
        }
    }

    /// Upper bound on simultaneously open connections.
    pub fn max_connections(&self) -> usize {
        (self.pool_size + self.max_overflow).max(1)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            path: "app.db".to_string(),
            pool_size: 5,
            max_overflow: 10,
            acquire_timeout: Duration::from_secs(5),
            max_lifetime: Duration::from_secs(3600),
        }
    }
}

/// A pooled connection.
pub struct PooledConnection {
    conn: Connection,
    /// When this connection was opened
    created_at: Instant,
}

impl PooledConnection {
    fn new(conn: Connection) -> Self {
        Self {
            conn,
            created_at: Instant::now(),
        }
    }

    /// Check if this connection has exceeded its lifetime.
    pub fn is_expired(&self, max_lifetime: Duration) -> bool {
        self.created_at.elapsed() > max_lifetime
    }
}

/// Pool errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PoolError {
    /// No slot freed up within the acquire timeout
    #[error("connection pool exhausted")]
    PoolExhausted,
    /// Opening a connection failed
    #[error("connection error: {0}")]
    ConnectError(String),
    /// The query itself failed
    #[error("query error: {0}")]
    Query(String),
    /// The pool was shut down
    #[error("connection pool closed")]
    Closed,
}

/// Pool statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolStats {
    /// Connections currently checked out
    pub in_use: usize,
    /// Connections waiting for reuse
    pub idle: usize,
    /// Upper bound on open connections
    pub max_connections: usize,
}

/// Counts a checked-out connection until dropped, including when the
/// caller's future is cancelled mid-query.
struct CheckedOut<'a>(&'a AtomicUsize);

impl<'a> CheckedOut<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for CheckedOut<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Database connection pool.
///
/// A semaphore bounds open connections to `pool_size + max_overflow`.
/// Queries run on the blocking thread pool so they never stall the
/// async scheduler.
pub struct DatabasePool {
    config: PoolConfig,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<PooledConnection>>,
    in_use: AtomicUsize,
}

impl DatabasePool {
    /// Create a new pool. Connections are opened on demand.
    pub fn new(config: PoolConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_connections()));
        Self {
            config,
            permits,
            idle: Mutex::new(VecDeque::new()),
            in_use: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Run `f` with a pooled connection.
    pub async fn with_connection<T, F>(&self, f: F) -> Result<T, PoolError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = match tokio::time::timeout(
            self.config.acquire_timeout,
            self.permits.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::Closed),
            Err(_) => return Err(PoolError::PoolExhausted),
        };

        let pooled = match self.take_idle() {
            Some(pooled) => pooled,
            None => self.open().await?,
        };

        let checked_out = CheckedOut::new(&self.in_use);
        let outcome = tokio::task::spawn_blocking(move || {
            let result = f(&pooled.conn);
            (pooled, result)
        })
        .await;
        drop(checked_out);
        drop(permit);

        match outcome {
            Ok((pooled, Ok(value))) => {
                self.release(pooled);
                Ok(value)
            }
            // The connection may be in an unknown state; drop it
            Ok((_, Err(e))) => Err(PoolError::Query(e.to_string())),
            Err(e) => Err(PoolError::Query(format!("blocking task failed: {}", e))),
        }
    }

    /// Round-trip `SELECT 1`. Never errors; failures log and return false.
    pub async fn health_check(&self) -> bool {
        match self
            .with_connection(|conn| conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)))
            .await
        {
            Ok(1) => true,
            Ok(other) => {
                tracing::error!("database health check returned {}", other);
                false
            }
            Err(e) => {
                tracing::error!("database health check failed: {}", e);
                false
            }
        }
    }

    fn take_idle(&self) -> Option<PooledConnection> {
        let mut idle = self.idle.lock();
        while let Some(pooled) = idle.pop_front() {
            if pooled.is_expired(self.config.max_lifetime) {
                tracing::debug!("discarding expired database connection");
                continue;
            }
            return Some(pooled);
        }
        None
    }

    async fn open(&self) -> Result<PooledConnection, PoolError> {
        let path = self.config.path.clone();
        tokio::task::spawn_blocking(move || Connection::open(path))
            .await
            .map_err(|e| PoolError::ConnectError(e.to_string()))?
            .map(PooledConnection::new)
            .map_err(|e| PoolError::ConnectError(e.to_string()))
    }

    fn release(&self, pooled: PooledConnection) {
        if self.permits.is_closed() || pooled.is_expired(self.config.max_lifetime) {
            return;
        }
        let mut idle = self.idle.lock();
        // Overflow connections are closed rather than kept
        if idle.len() < self.config.pool_size {
            idle.push_back(pooled);
        }
    }

    /// Get pool statistics.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            in_use: self.in_use.load(Ordering::SeqCst),
            idle: self.idle.lock().len(),
            max_connections: self.config.max_connections(),
        }
    }

    /// Stop handing out connections and close the idle ones.
    pub fn close(&self) {
        self.permits.close();
        let closed = {
            let mut idle = self.idle.lock();
            let n = idle.len();
            idle.clear();
            n
        };
        tracing::info!("database pool closed ({} idle connections released)", closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_pool(pool_size: usize) -> (tempfile::TempDir, DatabasePool) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db").to_string_lossy().to_string();
        (dir, DatabasePool::new(PoolConfig::new(path, pool_size)))
    }

    #[test]
    fn test_pool_config_sizing() {
        let config = PoolConfig::new("x.db", 20);
        assert_eq!(config.max_overflow, 40);
        assert_eq!(config.max_connections(), 60);
    }

    #[tokio::test]
    async fn test_health_check_ok() {
        let (_dir, pool) = temp_pool(2);
        assert!(pool.health_check().await);
        assert_eq!(pool.stats().idle, 1);
        assert_eq!(pool.stats().in_use, 0);
    }

    #[tokio::test]
    async fn test_cancelled_query_is_not_counted_in_use() {
        let (_dir, pool) = temp_pool(2);
        assert!(pool.health_check().await);

        let slow = pool.with_connection(|conn| {
            std::thread::sleep(Duration::from_millis(200));
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
        });
        assert!(tokio::time::timeout(Duration::from_millis(20), slow)
            .await
            .is_err());

        assert_eq!(pool.stats().in_use, 0);
    }

    #[tokio::test]
    async fn test_health_check_unreachable_database() {
        let pool = DatabasePool::new(PoolConfig::new("/nonexistent-dir/sub/app.db", 2));
        assert!(!pool.health_check().await);
    }

    #[tokio::test]
    async fn test_connections_are_reused() {
        let (_dir, pool) = temp_pool(2);
        pool.with_connection(|c| c.execute("CREATE TABLE t (v INTEGER)", []))
            .await
            .unwrap();
        pool.with_connection(|c| c.execute("INSERT INTO t VALUES (42)", []))
            .await
            .unwrap();

        let v: i64 = pool
            .with_connection(|c| c.query_row("SELECT v FROM t", [], |r| r.get(0)))
            .await
            .unwrap();
        assert_eq!(v, 42);
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn test_query_error_surfaces() {
        let (_dir, pool) = temp_pool(1);
        let err = pool
            .with_connection(|c| c.execute("SELECT * FROM missing", []))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Query(_)));
        // Pool still works afterwards
        assert!(pool.health_check().await);
    }

    #[tokio::test]
    async fn test_exhausted_pool_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db").to_string_lossy().to_string();
        let pool = Arc::new(DatabasePool::new(PoolConfig {
            path,
            pool_size: 1,
            max_overflow: 0,
            acquire_timeout: Duration::from_millis(50),
            ..Default::default()
        }));

        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let holder = pool.clone();
        let held = tokio::spawn(async move {
            holder
                .with_connection(move |_| {
                    let _ = started_tx.send(());
                    std::thread::sleep(Duration::from_millis(300));
                    Ok(())
                })
                .await
        });
        started_rx.await.unwrap();

        let err = pool.with_connection(|_| Ok(())).await.unwrap_err();
        assert_eq!(err, PoolError::PoolExhausted);
        held.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_closed_pool_rejects() {
        let (_dir, pool) = temp_pool(1);
        assert!(pool.health_check().await);
        pool.close();

        assert_eq!(pool.stats().idle, 0);
        let err = pool.with_connection(|_| Ok(())).await.unwrap_err();
        assert_eq!(err, PoolError::Closed);
        assert!(!pool.health_check().await);
    }
}
