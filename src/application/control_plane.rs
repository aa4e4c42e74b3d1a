//! Control Plane - Main application use case
//!
//! Owns every resilience and scaling component and offers the calls the
//! request boundary makes: admit a caller, run work under protection,
//! pick an instance, report health, and shut down.

use crate::adapters::outbound::{CacheStore, SessionStore, DEFAULT_SESSION_TTL};
use crate::config::{AppConfig, ScalingConfig};
use crate::domain::entities::Instance;
use crate::domain::ports::EphemeralStore;
use crate::domain::services::Algorithm;
use crate::infrastructure::circuit_breaker::{BreakerError, CircuitBreaker, CircuitBreakerConfig};
use crate::infrastructure::connection_pool::DatabasePool;
use crate::infrastructure::health_checker::{HealthCheckConfig, HealthChecker, PROBE_TIMEOUT};
use crate::infrastructure::health_report::{HealthChecks, HealthReport, MemoryStats};
use crate::infrastructure::rate_limiter::{RateLimitConfig, RateLimitResult, RateLimiter};
use crate::infrastructure::registry::{InstanceRegistry, RegistryError};
use crate::infrastructure::shutdown::{ShutdownController, WorkGuard};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// How often expired affinity bindings are swept.
const BINDING_GC_INTERVAL: Duration = Duration::from_secs(60);

/// Why the boundary turned a caller away.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ControlError {
    #[error("rate limit exceeded, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("shutting down, not accepting new work")]
    ShuttingDown,
}

/// The control plane.
///
/// Constructed once at startup and shared by handle with whatever
/// boundary code needs it.
pub struct ControlPlane {
    scaling: ScalingConfig,
    algorithm: Algorithm,
    health_path: String,
    version: String,
    environment: String,
    store: Arc<dyn EphemeralStore>,
    database: Arc<DatabasePool>,
    registry: Arc<InstanceRegistry>,
    breaker: CircuitBreaker,
    limiter: RateLimiter,
    cache: CacheStore,
    sessions: SessionStore,
    shutdown: ShutdownController,
}

impl ControlPlane {
    /// Wire every component from the loaded configuration.
    pub fn new(
        config: &AppConfig,
        store: Arc<dyn EphemeralStore>,
        database: Arc<DatabasePool>,
    ) -> Self {
        let scaling = config.scaling.clone();

        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: scaling.breaker_failure_threshold,
            recovery_timeout: scaling.breaker_recovery_timeout,
        });
        let limiter = RateLimiter::new(
            RateLimitConfig {
                max_requests: scaling.rate_limit_max_requests,
                window: scaling.rate_limit_window,
            },
            store.clone(),
        );
        let cache = CacheStore::new(store.clone(), scaling.default_ttl);
        let sessions = SessionStore::new(store.clone());

        tracing::info!(
            "control plane configured for {} (pool {}+{}, lb={}, breaker={}, rate_limit={}, affinity={})",
            scaling.mode,
            scaling.connection_pool_size,
            scaling.max_overflow(),
            scaling.enable_load_balancing,
            scaling.enable_circuit_breaker,
            scaling.enable_rate_limiting,
            scaling.enable_session_affinity,
        );

        Self {
            algorithm: config.lb_algorithm,
            health_path: config.health_path.clone(),
            version: config.version.clone(),
            environment: config.environment.clone(),
            scaling,
            store,
            database,
            registry: Arc::new(InstanceRegistry::new()),
            breaker,
            limiter,
            cache,
            sessions,
            shutdown: ShutdownController::new(),
        }
    }

    /// Admit a unit of work from `identity`.
    ///
    /// The returned guard counts as in-flight work until dropped.
    pub async fn admit(&self, identity: &str) -> Result<WorkGuard, ControlError> {
        let guard = self.begin_work()?;

        if self.scaling.enable_rate_limiting {
            if let RateLimitResult::Limited { retry_after_ms } = self.limiter.check(identity).await {
                return Err(ControlError::RateLimited { retry_after_ms });
            }
        }

        Ok(guard)
    }

    /// Track a unit of work that is not subject to rate limiting.
    pub fn begin_work(&self) -> Result<WorkGuard, ControlError> {
        self.shutdown.try_begin().ok_or(ControlError::ShuttingDown)
    }

    /// Run `f` under the circuit for `operation`.
    pub async fn protect<T, E, F, Fut>(&self, operation: &str, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.scaling.enable_circuit_breaker {
            return f().await.map_err(BreakerError::Inner);
        }
        self.breaker.call(operation, f).await
    }

    /// Like [`protect`](Self::protect), but only errors matching
    /// `counts_as_failure` move the circuit toward open.
    pub async fn protect_classified<T, E, F, Fut, C>(
        &self,
        operation: &str,
        f: F,
        counts_as_failure: C,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> bool,
    {
        if !self.scaling.enable_circuit_breaker {
            return f().await.map_err(BreakerError::Inner);
        }
        self.breaker.call_classified(operation, f, counts_as_failure).await
    }

    /// Pick a downstream instance.
    ///
    /// With load balancing disabled this is always the first healthy
    /// instance in registration order.
    pub fn select_instance(&self) -> Result<Instance, RegistryError> {
        if !self.scaling.enable_load_balancing {
            return self
                .registry
                .healthy_instances()
                .into_iter()
                .next()
                .ok_or(RegistryError::NoHealthyInstance);
        }
        self.registry.select(self.algorithm)
    }

    /// Pick a downstream instance for a caller, honoring session affinity
    /// when it is enabled.
    pub fn select_for(&self, affinity_key: &str) -> Result<Instance, RegistryError> {
        if self.scaling.enable_session_affinity && self.scaling.enable_load_balancing {
            return self.registry.select_with_affinity(affinity_key, self.algorithm);
        }
        self.select_instance()
    }

    /// Build the aggregate health report.
    pub async fn health_report(&self) -> HealthReport {
        let (database, store) = tokio::join!(self.database.health_check(), self.store.ping());

        let store = match store {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("ephemeral store health check failed: {}", e);
                false
            }
        };

        let report = HealthReport::new(
            &self.version,
            &self.environment,
            HealthChecks {
                database,
                store,
                memory: MemoryStats::sample(),
            },
        );
        if report.is_unhealthy() {
            tracing::warn!("health report: database={} store={}", database, store);
        }
        report
    }

    /// A health checker probing this plane's registry.
    pub fn health_checker(&self) -> HealthChecker {
        HealthChecker::new(
            HealthCheckConfig {
                interval: self.scaling.health_check_interval,
                timeout: PROBE_TIMEOUT,
                path: self.health_path.clone(),
                ..Default::default()
            },
            self.registry.clone(),
        )
    }

    /// Spawn the periodic health sweep and, with affinity on, the binding GC.
    /// Both stop when shutdown begins.
    pub fn start_background_tasks(&self) -> Vec<JoinHandle<()>> {
        let mut tasks = vec![Arc::new(self.health_checker()).start(self.shutdown.subscribe())];
        if self.scaling.enable_session_affinity {
            tasks.push(self.registry.start_binding_gc(
                DEFAULT_SESSION_TTL,
                BINDING_GC_INTERVAL,
                self.shutdown.subscribe(),
            ));
        }
        tasks
    }

    /// Stop admitting work, wait for in-flight work to drain, then release
    /// the store connections and the database pool. Returns false if the
    /// drain timed out.
    pub async fn shutdown(&self) -> bool {
        self.shutdown.shutdown();

        let drained = self
            .shutdown
            .wait_for_drain(self.scaling.graceful_shutdown_timeout)
            .await;
        self.store.close().await;
        self.database.close();

        tracing::info!("control plane shut down (drained: {})", drained);
        drained
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_shutdown()
    }

    pub fn scaling(&self) -> &ScalingConfig {
        &self.scaling
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn health_path(&self) -> &str {
        &self.health_path
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn shutdown_controller(&self) -> &ShutdownController {
        &self.shutdown
    }
}
