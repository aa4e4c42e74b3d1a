//! Rate Limiter
//!
//! Sliding-window rate limiting per caller identity, with the window kept
//! in the shared ephemeral store so every instance sees the same counts.

use crate::domain::keys;
use crate::domain::ports::EphemeralStore;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Rate limiter configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum requests per window
    pub max_requests: u64,
    /// Length of the trailing window
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window: Duration::from_secs(60),
        }
    }
}

/// Result of a rate limit check.
#[derive(Debug, Clone, PartialEq)]
pub enum RateLimitResult {
    /// Request is allowed
    Allowed { remaining: u64 },
    /// Request is rate limited
    Limited { retry_after_ms: u64 },
}

impl RateLimitResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitResult::Allowed { .. })
    }
}

/// Sliding-window rate limiter.
///
/// Admission is a single atomic prune/count/add against the store, so two
/// concurrent callers at `max_requests - 1` cannot both get in. When the
/// store is unreachable the limiter fails open.
pub struct RateLimiter {
    config: RateLimitConfig,
    store: Arc<dyn EphemeralStore>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, store: Arc<dyn EphemeralStore>) -> Self {
        Self { config, store }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// Check (and record) a request from `identity`.
    pub async fn check(&self, identity: &str) -> RateLimitResult {
        self.check_at(identity, Self::now_ms()).await
    }

    /// Check a request as if it arrived at `now_ms` (unix milliseconds).
    pub async fn check_at(&self, identity: &str, now_ms: u64) -> RateLimitResult {
        let key = keys::rate_limit(identity);
        let window_ms = self.config.window.as_millis() as u64;

        match self
            .store
            .sliding_window_admit(&key, now_ms, self.config.window, self.config.max_requests)
            .await
        {
            Ok(outcome) if outcome.admitted => RateLimitResult::Allowed {
                remaining: self.config.max_requests.saturating_sub(outcome.count),
            },
            Ok(outcome) => {
                let retry_after_ms = outcome
                    .oldest_ms
                    .map(|oldest| (oldest + window_ms).saturating_sub(now_ms))
                    .unwrap_or(window_ms);
                tracing::debug!("rate limited {} ({} in window)", identity, outcome.count);
                RateLimitResult::Limited { retry_after_ms }
            }
            Err(e) => {
                tracing::warn!("rate limiter store error for {}, allowing: {}", identity, e);
                RateLimitResult::Allowed {
                    remaining: self.config.max_requests,
                }
            }
        }
    }

    /// Shorthand for `check(identity).is_allowed()`.
    pub async fn is_allowed(&self, identity: &str) -> bool {
        self.check(identity).await.is_allowed()
    }

    /// Forget a caller's window.
    pub async fn clear(&self, identity: &str) -> bool {
        match self.store.delete(&[keys::rate_limit(identity)]).await {
            Ok(n) => n > 0,
            Err(e) => {
                tracing::warn!("rate limiter clear for {} failed: {}", identity, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::outbound::MemoryStore;

    fn limiter(max_requests: u64, window: Duration) -> (Arc<MemoryStore>, RateLimiter) {
        let store = Arc::new(MemoryStore::new());
        let limiter = RateLimiter::new(RateLimitConfig { max_requests, window }, store.clone());
        (store, limiter)
    }

    #[test]
    fn test_rate_limit_config_default() {
        let config = RateLimitConfig::default();
        assert_eq!(config.max_requests, 100);
        assert_eq!(config.window, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_ceiling_then_window_elapses() {
        let (_, limiter) = limiter(3, Duration::from_secs(60));
        let t0 = 1_700_000_000_000;

        assert_eq!(
            limiter.check_at("client", t0).await,
            RateLimitResult::Allowed { remaining: 2 }
        );
        assert!(limiter.check_at("client", t0 + 10).await.is_allowed());
        assert_eq!(
            limiter.check_at("client", t0 + 20).await,
            RateLimitResult::Allowed { remaining: 0 }
        );

        assert_eq!(
            limiter.check_at("client", t0 + 30).await,
            RateLimitResult::Limited {
                retry_after_ms: 60_000 - 30
            }
        );

        // Every recorded stamp is now older than the window
        assert!(limiter.check_at("client", t0 + 20 + 60_000).await.is_allowed());
    }

    #[tokio::test]
    async fn test_rejected_requests_are_not_recorded() {
        let (_, limiter) = limiter(1, Duration::from_secs(60));
        let t0 = 1_000_000;

        assert!(limiter.check_at("c", t0).await.is_allowed());
        for i in 1..5 {
            assert!(!limiter.check_at("c", t0 + i * 1_000).await.is_allowed());
        }
        // Only the first stamp counted, so it frees up exactly one window later
        assert!(limiter.check_at("c", t0 + 60_001).await.is_allowed());
    }

    #[tokio::test]
    async fn test_identities_isolated() {
        let (_, limiter) = limiter(1, Duration::from_secs(60));

        assert!(limiter.is_allowed("10.0.0.1").await);
        assert!(!limiter.is_allowed("10.0.0.1").await);
        assert!(limiter.is_allowed("10.0.0.2").await);
    }

    #[tokio::test]
    async fn test_window_key_expires() {
        let (store, limiter) = limiter(5, Duration::from_millis(30));
        limiter.check("c").await;
        assert!(store.exists("rate_limit:c").await.unwrap());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!store.exists("rate_limit:c").await.unwrap());
    }

    #[tokio::test]
    async fn test_clear() {
        let (_, limiter) = limiter(1, Duration::from_secs(60));
        assert!(limiter.is_allowed("c").await);
        assert!(!limiter.is_allowed("c").await);

        assert!(limiter.clear("c").await);
        assert!(limiter.is_allowed("c").await);
    }

    #[tokio::test]
    async fn test_store_outage_fails_open() {
        let (store, limiter) = limiter(1, Duration::from_secs(60));
        store.set_available(false);

        for _ in 0..5 {
            assert!(limiter.is_allowed("c").await);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_never_exceed_ceiling() {
        let (_, limiter) = limiter(25, Duration::from_secs(60));
        let limiter = Arc::new(limiter);
        let mut handles = vec![];

        for _ in 0..10 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                let mut allowed = 0;
                for _ in 0..10 {
                    if limiter.is_allowed("shared").await {
                        allowed += 1;
                    }
                }
                allowed
            }));
        }

        let mut total = 0;
        for h in handles {
            total += h.await.unwrap();
        }
        assert_eq!(total, 25);
    }
}
