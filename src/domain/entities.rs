//! Domain Entities - Core business objects
//!
//! These entities represent the fleet the control plane balances across.
//! They have no external dependencies and contain only business logic.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant, SystemTime};

/// One addressable deployment of the service.
///
/// Instances are created on registration and mutated only by health
/// checks (`healthy`, `last_health_check`). The registry removes them on
/// deregistration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    /// Caller-assigned unique identifier
    pub id: String,
    /// Hostname or IP address
    pub host: String,
    /// Port the service listens on
    pub port: u16,
    /// Relative weight for weighted selection (always >= 1)
    pub weight: u32,
    /// When this instance was (last) registered
    pub registered_at: SystemTime,
    /// When the last health probe completed
    pub last_health_check: Option<SystemTime>,
    /// Whether this instance is currently eligible for selection
    pub healthy: bool,
}

impl Instance {
    /// Create a new, healthy instance.
    ///
    /// A weight of zero is treated as one.
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16, weight: u32) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
            weight: weight.max(1),
            registered_at: SystemTime::now(),
            last_health_check: None,
            healthy: true,
        }
    }

    /// Base URL of the instance.
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// URL of the instance's health endpoint.
    pub fn health_url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.url(), path)
        } else {
            format!("{}/{}", self.url(), path)
        }
    }
}

/// Affinity binding from a caller key to an instance.
///
/// Once a caller is assigned to an instance, later selections for the
/// same key return the same instance until the binding expires.
#[derive(Debug, Clone)]
pub struct Binding {
    /// ID of the instance this key is bound to
    pub instance_id: String,
    /// When the binding was created
    pub created_at: Instant,
    /// Last time this binding was used
    pub last_seen: Instant,
}

impl Binding {
    pub fn new(instance_id: String) -> Self {
        let now = Instant::now();
        Self {
            instance_id,
            created_at: now,
            last_seen: now,
        }
    }

    /// Update the last_seen timestamp.
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Check if the binding has not been used within the TTL.
    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.last_seen.elapsed() > ttl
    }
}
