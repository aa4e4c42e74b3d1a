//! Aggregate Health Report
//!
//! The readiness view of the whole process: database and store
//! reachability plus host memory pressure. Upstream instances are not
//! part of it; a dead instance only leaves the healthy pool.

use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};
use sysinfo::System;

/// Memory utilization above which the process reports `degraded`.
pub const MEMORY_HIGH_WATER_PERCENT: f64 = 90.0;

/// Overall process status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Host memory snapshot, in bytes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryStats {
    pub total: u64,
    pub available: u64,
    /// Used share of total memory, 0-100
    pub percent: f64,
}

impl MemoryStats {
    pub fn new(total: u64, available: u64) -> Self {
        let percent = if total == 0 {
            0.0
        } else {
            (total.saturating_sub(available) as f64 / total as f64) * 100.0
        };
        Self {
            total,
            available,
            percent,
        }
    }

    /// Read current host memory.
    pub fn sample() -> Option<Self> {
        let mut system = System::new();
        system.refresh_memory();
        let total = system.total_memory();
        if total == 0 {
            // Not supported on this platform
            return None;
        }
        Some(Self::new(total, system.available_memory()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthChecks {
    pub database: bool,
    pub store: bool,
    pub memory: Option<MemoryStats>,
}

/// Aggregate health report served to readiness probes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: SystemStatus,
    /// Unix seconds
    pub timestamp: u64,
    pub version: String,
    pub environment: String,
    pub checks: HealthChecks,
}

impl HealthReport {
    /// Build a report from check results taken now.
    pub fn new(version: &str, environment: &str, checks: HealthChecks) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            status: evaluate(&checks),
            timestamp,
            version: version.to_string(),
            environment: environment.to_string(),
            checks,
        }
    }

    pub fn is_unhealthy(&self) -> bool {
        self.status == SystemStatus::Unhealthy
    }
}

/// Derive the overall status. A failed dependency outranks memory pressure.
pub fn evaluate(checks: &HealthChecks) -> SystemStatus {
    if !checks.database || !checks.store {
        return SystemStatus::Unhealthy;
    }
    match &checks.memory {
        Some(memory) if memory.percent > MEMORY_HIGH_WATER_PERCENT => SystemStatus::Degraded,
        _ => SystemStatus::Healthy,
    }
}
