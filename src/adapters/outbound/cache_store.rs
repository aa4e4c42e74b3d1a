//! Cache Store
//!
//! JSON-serializing cache façade over an EphemeralStore. Store outages
//! degrade to misses rather than errors.

use crate::domain::ports::{EphemeralStore, StoreError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Cache façade for computed results.
///
/// Keys are passed through verbatim; build them with
/// [`crate::domain::keys::CacheKey`].
#[derive(Clone)]
pub struct CacheStore {
    store: Arc<dyn EphemeralStore>,
    default_ttl: Duration,
}

impl CacheStore {
    pub fn new(store: Arc<dyn EphemeralStore>, default_ttl: Duration) -> Self {
        Self { store, default_ttl }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Get a cached value. Missing, expired, undecodable, or unreachable
    /// entries are all a miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.store.get(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                log_store_error("get", key, &e);
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(value) => {
                tracing::debug!("cache hit for {}", key);
                Some(value)
            }
            Err(e) => {
                tracing::warn!("cache entry {} could not be decoded: {}", key, e);
                None
            }
        }
    }

    /// Store a value. `ttl` defaults to the configured TTL; every write
    /// refreshes it. Returns false if the value was not stored.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Option<Duration>) -> bool {
        let encoded = match serde_json::to_string(value) {
            Ok(encoded) => encoded,
            Err(e) => {
                log_store_error("set", key, &StoreError::Serialization(e.to_string()));
                return false;
            }
        };

        match self
            .store
            .set_ex(key, &encoded, ttl.unwrap_or(self.default_ttl))
            .await
        {
            Ok(()) => true,
            Err(e) => {
                log_store_error("set", key, &e);
                false
            }
        }
    }

    /// Delete one entry. Returns true if it existed.
    pub async fn delete(&self, key: &str) -> bool {
        match self.store.delete(&[key.to_string()]).await {
            Ok(n) => n > 0,
            Err(e) => {
                log_store_error("delete", key, &e);
                false
            }
        }
    }

    pub async fn exists(&self, key: &str) -> bool {
        match self.store.exists(key).await {
            Ok(exists) => exists,
            Err(e) => {
                log_store_error("exists", key, &e);
                false
            }
        }
    }

    /// Delete every entry matching a glob pattern, returning the count.
    pub async fn invalidate_pattern(&self, pattern: &str) -> usize {
        let keys = match self.store.keys(pattern).await {
            Ok(keys) => keys,
            Err(e) => {
                log_store_error("invalidate", pattern, &e);
                return 0;
            }
        };

        let removed = match self.store.delete(&keys).await {
            Ok(n) => n as usize,
            Err(e) => {
                log_store_error("invalidate", pattern, &e);
                0
            }
        };

        tracing::info!("invalidated {} cache entries matching {}", removed, pattern);
        removed
    }

    /// Return the cached value for `key`, or run `producer`, cache its
    /// success, and return it. Producer errors are returned uncached.
    pub async fn get_or_insert_with<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        producer: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(hit) = self.get(key).await {
            return Ok(hit);
        }

        let value = producer().await?;
        if self.set(key, &value, ttl).await {
            tracing::debug!("cache set for {}", key);
        }
        Ok(value)
    }
}

fn log_store_error(op: &str, key: &str, e: &StoreError) {
    if e.is_unavailable() {
        tracing::warn!("cache {} for {} skipped: {}", op, key, e);
    } else {
        tracing::error!("cache {} error for {}: {}", op, key, e);
    }
}
