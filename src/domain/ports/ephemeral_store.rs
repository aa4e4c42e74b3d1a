//! Ephemeral Store Port
//!
//! Defines the interface to the shared, process-external key-value store
//! that holds cache entries, sessions, and rate-limit windows.

use async_trait::async_trait;
use std::time::Duration;

/// Errors surfaced by an ephemeral store.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached (connection refused, dropped, timed out).
    #[error("ephemeral store unavailable: {0}")]
    Unavailable(String),
    /// A value could not be (de)serialized by a façade.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// The store rejected the command.
    #[error("store command failed: {0}")]
    Command(String),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Outcome of an atomic sliding-window admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowOutcome {
    /// Whether the request was admitted (and recorded)
    pub admitted: bool,
    /// Requests in the window after this evaluation
    pub count: u64,
    /// Timestamp (ms) of the oldest request still in the window, if rejected
    pub oldest_ms: Option<u64>,
}

/// Shared key-value store with expiry.
///
/// This is an outbound port. The cache and session façades and the rate
/// limiter reach shared state only through it, using the key conventions
/// in [`crate::domain::keys`].
#[async_trait]
pub trait EphemeralStore: Send + Sync {
    /// Round-trip to the store.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Get a value, `None` if missing or expired.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Set a value with an expiry. Always refreshes the TTL.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Delete keys, returning how many existed.
    async fn delete(&self, keys: &[String]) -> Result<u64, StoreError>;

    /// Check whether a key exists.
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// (Re)set a key's expiry. Returns false if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// List keys matching a glob pattern.
    ///
    /// Patterns follow Redis `MATCH` syntax: `*`, `?`, `[...]` classes
    /// with ranges and `^` negation, and `\` escapes.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    /// Atomically prune a sorted window and admit one more entry if room.
    ///
    /// Removes every entry with a score `<= now_ms - window`, counts the
    /// rest, and if `count < limit` records `now_ms` and resets the key's
    /// expiry to `window`. The whole sequence is a single atomic step
    /// against the store.
    async fn sliding_window_admit(
        &self,
        key: &str,
        now_ms: u64,
        window: Duration,
        limit: u64,
    ) -> Result<WindowOutcome, StoreError>;

    /// Release the store's connections. Every later command fails with
    /// [`StoreError::Unavailable`].
    async fn close(&self);
}
