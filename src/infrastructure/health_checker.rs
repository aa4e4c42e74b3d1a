//! Active Health Checker
//!
//! Periodically probes every registered instance's HTTP health endpoint
//! and feeds the outcome back into the registry.

use crate::domain::entities::Instance;
use crate::infrastructure::registry::InstanceRegistry;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Per-probe timeout. Independent of the check interval.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default cap on probes in flight at once.
pub const MAX_CONCURRENT_PROBES: usize = 16;

/// Health check configuration.
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    /// Interval between sweeps
    pub interval: Duration,
    /// Timeout for each probe
    pub timeout: Duration,
    /// Probes running concurrently within one sweep
    pub max_concurrent_probes: usize,
    /// Path of each instance's health endpoint
    pub path: String,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: PROBE_TIMEOUT,
            max_concurrent_probes: MAX_CONCURRENT_PROBES,
            path: "/health".to_string(),
        }
    }
}

/// Result of a health check.
#[derive(Debug, Clone)]
pub enum HealthCheckResult {
    Success { latency_ms: u64 },
    Failure { error: String, latency_ms: u64 },
}

impl HealthCheckResult {
    pub fn is_success(&self) -> bool {
        matches!(self, HealthCheckResult::Success { .. })
    }
}

type HealthCallback = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// Active health checker for registered instances.
///
/// One failed probe marks an instance unhealthy and one successful probe
/// restores it. A probe that times out is a failure and is not retried
/// until the next sweep.
pub struct HealthChecker {
    config: HealthCheckConfig,
    registry: Arc<InstanceRegistry>,
    client: reqwest::Client,
    /// Callback when health changes
    on_health_change: Option<HealthCallback>,
}

impl HealthChecker {
    pub fn new(config: HealthCheckConfig, registry: Arc<InstanceRegistry>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            });

        Self {
            config,
            registry,
            client,
            on_health_change: None,
        }
    }

    /// Set callback for health status changes.
    pub fn on_health_change<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, bool) + Send + Sync + 'static,
    {
        self.on_health_change = Some(Arc::new(callback));
        self
    }

    pub fn config(&self) -> &HealthCheckConfig {
        &self.config
    }

    /// Probe one instance.
    pub async fn probe(&self, instance: &Instance) -> HealthCheckResult {
        let url = instance.health_url(&self.config.path);
        let start = Instant::now();

        let result = match tokio::time::timeout(self.config.timeout, self.client.get(&url).send())
            .await
        {
            Ok(Ok(resp)) if resp.status().is_success() => Ok(()),
            Ok(Ok(resp)) => Err(format!("unhealthy status: {}", resp.status())),
            Ok(Err(e)) => Err(format!("request failed: {}", e)),
            Err(_) => Err("probe timeout".to_string()),
        };

        let latency_ms = start.elapsed().as_millis() as u64;
        match result {
            Ok(()) => HealthCheckResult::Success { latency_ms },
            Err(error) => HealthCheckResult::Failure { error, latency_ms },
        }
    }

    /// Probe every registered instance once and update the registry.
    ///
    /// Each instance is marked as soon as its own probe finishes, so a slow
    /// instance does not hold back the others. Returns the number of
    /// instances that probed healthy.
    pub async fn check_all(&self) -> usize {
        let instances = self.registry.all();
        let fan_out = self.config.max_concurrent_probes.max(1);

        stream::iter(instances)
            .map(|instance| async move {
                let result = self.probe(&instance).await;
                (instance, result)
            })
            .buffer_unordered(fan_out)
            .fold(0, |healthy, (instance, result)| async move {
                if let HealthCheckResult::Failure { error, latency_ms } = &result {
                    tracing::debug!(
                        "probe of {} failed after {}ms: {}",
                        instance.id,
                        latency_ms,
                        error
                    );
                }
                self.record(&instance.id, result.is_success());
                healthy + usize::from(result.is_success())
            })
            .await
    }

    fn record(&self, instance_id: &str, healthy: bool) {
        if self.registry.mark_health(instance_id, healthy) {
            if let Some(callback) = &self.on_health_change {
                callback(instance_id, healthy);
            }
        }
    }

    /// Run sweeps every `interval` until shutdown is signalled.
    pub fn start(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let healthy = self.check_all().await;
                        tracing::debug!(
                            "health sweep: {}/{} instances healthy",
                            healthy,
                            self.registry.len()
                        );
                    }
                    _ = shutdown.recv() => {
                        tracing::info!("health checker stopped");
                        break;
                    }
                }
            }
        })
    }
}
