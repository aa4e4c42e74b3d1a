//! Instance Registry
//!
//! Owns the fleet of service instances and the shared selection state:
//! the round-robin cursor, active-connection counters, and affinity
//! bindings. Selection logic itself lives in [`LoadBalancer`].

use crate::domain::entities::{Binding, Instance};
use crate::domain::services::{Algorithm, LoadBalancer};
use dashmap::DashMap;
use parking_lot::RwLock;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Registry errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RegistryError {
    #[error("instance {0} is already registered")]
    DuplicateInstance(String),
    #[error("no healthy instance available")]
    NoHealthyInstance,
    #[error("unknown selection algorithm: {0}")]
    UnknownAlgorithm(String),
}

/// Registry of service instances.
///
/// Instances are kept in registration order; a re-registration replaces
/// the entry in place so the order is stable.
pub struct InstanceRegistry {
    instances: RwLock<Vec<Instance>>,
    cursor: AtomicUsize,
    connections: DashMap<String, usize>,
    bindings: Arc<DashMap<String, Binding>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self {
            instances: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            connections: DashMap::new(),
            bindings: Arc::new(DashMap::new()),
        }
    }

    /// Add or replace an instance (last write wins). The entry starts healthy.
    pub fn register(&self, id: &str, host: &str, port: u16, weight: u32) -> Instance {
        let instance = Instance::new(id, host, port, weight);
        let mut instances = self.instances.write();
        match instances.iter_mut().find(|i| i.id == id) {
            Some(existing) => {
                tracing::info!("instance {} re-registered at {}", id, instance.url());
                *existing = instance.clone();
            }
            None => {
                tracing::info!("instance {} registered at {}", id, instance.url());
                instances.push(instance.clone());
            }
        }
        instance
    }

    /// Add an instance, failing if the id is already present.
    pub fn register_strict(
        &self,
        id: &str,
        host: &str,
        port: u16,
        weight: u32,
    ) -> Result<Instance, RegistryError> {
        let mut instances = self.instances.write();
        if instances.iter().any(|i| i.id == id) {
            return Err(RegistryError::DuplicateInstance(id.to_string()));
        }
        let instance = Instance::new(id, host, port, weight);
        tracing::info!("instance {} registered at {}", id, instance.url());
        instances.push(instance.clone());
        Ok(instance)
    }

    /// Remove an instance. Returns false if it was not registered.
    pub fn deregister(&self, id: &str) -> bool {
        let removed = {
            let mut instances = self.instances.write();
            let before = instances.len();
            instances.retain(|i| i.id != id);
            instances.len() != before
        };

        if removed {
            self.connections.remove(id);
            self.bindings.retain(|_, b| b.instance_id != id);
            tracing::info!("instance {} deregistered", id);
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<Instance> {
        self.instances.read().iter().find(|i| i.id == id).cloned()
    }

    /// Every registered instance, in registration order.
    pub fn all(&self) -> Vec<Instance> {
        self.instances.read().clone()
    }

    pub fn len(&self) -> usize {
        self.instances.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.read().is_empty()
    }

    /// Snapshot of healthy instances, in registration order.
    pub fn healthy_instances(&self) -> Vec<Instance> {
        self.instances
            .read()
            .iter()
            .filter(|i| i.healthy)
            .cloned()
            .collect()
    }

    /// Record a probe outcome. Returns true if the healthy flag changed.
    pub fn mark_health(&self, id: &str, healthy: bool) -> bool {
        let mut instances = self.instances.write();
        let Some(instance) = instances.iter_mut().find(|i| i.id == id) else {
            return false;
        };

        instance.last_health_check = Some(SystemTime::now());
        if instance.healthy == healthy {
            return false;
        }
        instance.healthy = healthy;

        if healthy {
            tracing::info!("instance {} is now healthy", id);
        } else {
            tracing::warn!("instance {} is now unhealthy", id);
        }
        true
    }

    /// Pick one healthy instance.
    pub fn select(&self, algorithm: Algorithm) -> Result<Instance, RegistryError> {
        let healthy = self.healthy_instances();
        if healthy.is_empty() {
            return Err(RegistryError::NoHealthyInstance);
        }

        let picked = match algorithm {
            Algorithm::RoundRobin => {
                let ticket = self.cursor.fetch_add(1, Ordering::Relaxed);
                LoadBalancer::pick_round_robin(&healthy, ticket)
            }
            Algorithm::Weighted => {
                let total = LoadBalancer::total_weight(&healthy) as f64;
                let draw = rand::thread_rng().gen_range(0.0..total);
                LoadBalancer::pick_weighted(&healthy, draw)
            }
            Algorithm::LeastConnections => {
                LoadBalancer::pick_least_connections(&healthy, |id| self.active_connections(id))
            }
        };

        picked.cloned().ok_or(RegistryError::NoHealthyInstance)
    }

    /// Pick an instance by algorithm name, e.g. `"round_robin"`.
    pub fn select_by_name(&self, algorithm: &str) -> Result<Instance, RegistryError> {
        let algorithm = algorithm
            .parse::<Algorithm>()
            .map_err(|_| RegistryError::UnknownAlgorithm(algorithm.to_string()))?;
        self.select(algorithm)
    }

    /// Pick an instance for an affinity key.
    ///
    /// A key bound to a still-healthy instance keeps it; otherwise a fresh
    /// selection is made and the key is rebound.
    pub fn select_with_affinity(
        &self,
        key: &str,
        algorithm: Algorithm,
    ) -> Result<Instance, RegistryError> {
        if let Some(mut binding) = self.bindings.get_mut(key) {
            if let Some(instance) = self.get(&binding.instance_id).filter(|i| i.healthy) {
                binding.touch();
                return Ok(instance);
            }
        }

        let instance = self.select(algorithm)?;
        self.bindings
            .insert(key.to_string(), Binding::new(instance.id.clone()));
        tracing::debug!("bound {} to instance {}", key, instance.id);
        Ok(instance)
    }

    /// Instance currently bound to an affinity key.
    pub fn binding(&self, key: &str) -> Option<String> {
        self.bindings.get(key).map(|b| b.instance_id.clone())
    }

    /// Remove bindings unused for longer than `ttl`.
    pub fn cleanup_bindings(&self, ttl: Duration) -> usize {
        let before = self.bindings.len();
        self.bindings.retain(|_, b| !b.is_expired(ttl));
        before.saturating_sub(self.bindings.len())
    }

    /// Spawn a periodic sweep of expired affinity bindings that runs until
    /// shutdown is signalled.
    pub fn start_binding_gc(
        self: &Arc<Self>,
        ttl: Duration,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = registry.cleanup_bindings(ttl);
                        if removed > 0 {
                            tracing::debug!("binding GC removed {} expired entries", removed);
                        }
                    }
                    _ = shutdown.recv() => {
                        tracing::debug!("binding GC stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Record a connection opened to an instance.
    pub fn connection_started(&self, id: &str) {
        *self.connections.entry(id.to_string()).or_insert(0) += 1;
    }

    /// Record a connection closed to an instance.
    pub fn connection_ended(&self, id: &str) {
        if let Some(mut count) = self.connections.get_mut(id) {
            *count = count.saturating_sub(1);
        }
    }

    pub fn active_connections(&self, id: &str) -> usize {
        self.connections.get(id).map(|c| *c).unwrap_or(0)
    }

    /// Track a connection for the lifetime of the returned guard.
    pub fn connection_guard(self: &Arc<Self>, id: &str) -> ActiveConnection {
        self.connection_started(id);
        ActiveConnection {
            registry: Arc::clone(self),
            instance_id: id.to_string(),
        }
    }
}

impl Default for InstanceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for an active connection to an instance.
pub struct ActiveConnection {
    registry: Arc<InstanceRegistry>,
    instance_id: String,
}

impl ActiveConnection {
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.registry.connection_ended(&self.instance_id);
    }
}
