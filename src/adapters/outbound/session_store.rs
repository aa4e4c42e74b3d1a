//! Session Store
//!
//! Session state shared across instances, stored under `session:<id>`.

use crate::domain::keys;
use crate::domain::ports::EphemeralStore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Default lifetime of a session.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(3600);

/// Session façade over an EphemeralStore.
///
/// Like the cache, a store outage reads as "no session" and writes
/// report failure instead of erroring.
#[derive(Clone)]
pub struct SessionStore {
    store: Arc<dyn EphemeralStore>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(store: Arc<dyn EphemeralStore>) -> Self {
        Self::with_ttl(store, DEFAULT_SESSION_TTL)
    }

    pub fn with_ttl(store: Arc<dyn EphemeralStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Create (or overwrite) a session.
    pub async fn create<T: Serialize + ?Sized>(&self, session_id: &str, data: &T) -> bool {
        self.write(session_id, data, self.ttl).await
    }

    /// Create a session with an explicit lifetime.
    pub async fn create_with_ttl<T: Serialize + ?Sized>(
        &self,
        session_id: &str,
        data: &T,
        ttl: Duration,
    ) -> bool {
        self.write(session_id, data, ttl).await
    }

    pub async fn get<T: DeserializeOwned>(&self, session_id: &str) -> Option<T> {
        let key = keys::session(session_id);
        match self.store.get(&key).await {
            Ok(Some(raw)) => serde_json::from_str(&raw)
                .map_err(|e| tracing::warn!("session {} could not be decoded: {}", session_id, e))
                .ok(),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("session lookup for {} failed: {}", session_id, e);
                None
            }
        }
    }

    /// Replace a session's data and refresh its lifetime.
    pub async fn update<T: Serialize + ?Sized>(&self, session_id: &str, data: &T) -> bool {
        self.write(session_id, data, self.ttl).await
    }

    pub async fn delete(&self, session_id: &str) -> bool {
        match self.store.delete(&[keys::session(session_id)]).await {
            Ok(n) => n > 0,
            Err(e) => {
                tracing::warn!("session delete for {} failed: {}", session_id, e);
                false
            }
        }
    }

    async fn write<T: Serialize + ?Sized>(&self, session_id: &str, data: &T, ttl: Duration) -> bool {
        let encoded = match serde_json::to_string(data) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::error!("session {} could not be encoded: {}", session_id, e);
                return false;
            }
        };

        match self
            .store
            .set_ex(&keys::session(session_id), &encoded, ttl)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("session write for {} failed: {}", session_id, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::outbound::MemoryStore;
    use serde_json::json;

    fn sessions() -> (Arc<MemoryStore>, SessionStore) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), SessionStore::new(store))
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let (store, sessions) = sessions();
        assert!(sessions.create("abc", &json!({"user_id": 7})).await);

        let data: serde_json::Value = sessions.get("abc").await.unwrap();
        assert_eq!(data["user_id"], 7);
        assert!(store.exists("session:abc").await.unwrap());
    }

    #[tokio::test]
    async fn test_update_replaces_data() {
        let (_, sessions) = sessions();
        sessions.create("abc", &json!({"step": 1})).await;
        sessions.update("abc", &json!({"step": 2})).await;

        let data: serde_json::Value = sessions.get("abc").await.unwrap();
        assert_eq!(data["step"], 2);
    }

    #[tokio::test]
    async fn test_expired_session_is_miss() {
        let (_, sessions) = sessions();
        sessions
            .create_with_ttl("abc", &json!({}), Duration::from_millis(30))
            .await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(sessions.get::<serde_json::Value>("abc").await.is_none());
    }

    #[tokio::test]
    async fn test_delete() {
        let (_, sessions) = sessions();
        sessions.create("abc", &json!({})).await;
        assert!(sessions.delete("abc").await);
        assert!(sessions.get::<serde_json::Value>("abc").await.is_none());
    }

    #[tokio::test]
    async fn test_store_outage_reads_as_missing() {
        let (store, sessions) = sessions();
        sessions.create("abc", &json!({})).await;
        store.set_available(false);

        assert!(sessions.get::<serde_json::Value>("abc").await.is_none());
        assert!(!sessions.create("def", &json!({})).await);
    }
}
