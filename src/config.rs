use crate::domain::services::Algorithm;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Deployment tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingMode {
    Development,
    Staging,
    Production,
    HighTraffic,
}

impl ScalingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScalingMode::Development => "development",
            ScalingMode::Staging => "staging",
            ScalingMode::Production => "production",
            ScalingMode::HighTraffic => "high_traffic",
        }
    }

    /// Parse a mode name, falling back to Production for anything unknown.
    ///
    /// The fallback is logged so a typo in the deployment setting is visible.
    pub fn from_str_or_production(s: &str) -> Self {
        match s.parse() {
            Ok(mode) => mode,
            Err(_) => {
                tracing::warn!("unknown scaling mode {:?}, using production profile", s);
                ScalingMode::Production
            }
        }
    }
}

impl fmt::Display for ScalingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScalingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "development" | "dev" => Ok(ScalingMode::Development),
            "staging" => Ok(ScalingMode::Staging),
            "production" | "prod" => Ok(ScalingMode::Production),
            "high_traffic" => Ok(ScalingMode::HighTraffic),
            other => Err(format!("unknown scaling mode: {}", other)),
        }
    }
}

/// Sizing for every control-plane component.
///
/// Obtained only through [`ScalingConfig::for_mode`]; read-only after
/// startup.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScalingConfig {
    pub mode: ScalingMode,
    pub max_workers: usize,
    pub connection_pool_size: usize,
    pub store_connection_limit: usize,
    pub default_ttl: Duration,
    pub enable_load_balancing: bool,
    pub enable_circuit_breaker: bool,
    pub enable_rate_limiting: bool,
    pub enable_session_affinity: bool,
    pub health_check_interval: Duration,
    pub graceful_shutdown_timeout: Duration,
    /// Requests admitted per caller per window
    pub rate_limit_max_requests: u64,
    pub rate_limit_window: Duration,
    /// Failures before a circuit opens
    pub breaker_failure_threshold: u32,
    /// Quiet period after the last failure before a probe is allowed
    pub breaker_recovery_timeout: Duration,
}

impl ScalingConfig {
    /// The fully populated profile for a mode.
    pub fn for_mode(mode: ScalingMode) -> Self {
        match mode {
            ScalingMode::Development => Self {
                mode,
                max_workers: 1,
                connection_pool_size: 5,
                store_connection_limit: 5,
                default_ttl: Duration::from_secs(300),
                enable_load_balancing: false,
                enable_circuit_breaker: false,
                enable_rate_limiting: false,
                enable_session_affinity: false,
                health_check_interval: Duration::from_secs(30),
                graceful_shutdown_timeout: Duration::from_secs(10),
                rate_limit_max_requests: 100,
                rate_limit_window: Duration::from_secs(60),
                breaker_failure_threshold: 5,
                breaker_recovery_timeout: Duration::from_secs(60),
            },
            ScalingMode::Staging => Self {
                mode,
                max_workers: 2,
                connection_pool_size: 10,
                store_connection_limit: 10,
                default_ttl: Duration::from_secs(600),
                enable_load_balancing: true,
                enable_circuit_breaker: true,
                enable_rate_limiting: true,
                enable_session_affinity: true,
                health_check_interval: Duration::from_secs(20),
                graceful_shutdown_timeout: Duration::from_secs(15),
                rate_limit_max_requests: 100,
                rate_limit_window: Duration::from_secs(60),
                breaker_failure_threshold: 5,
                breaker_recovery_timeout: Duration::from_secs(60),
            },
            ScalingMode::Production => Self {
                mode,
                max_workers: 4,
                connection_pool_size: 20,
                store_connection_limit: 20,
                default_ttl: Duration::from_secs(1800),
                enable_load_balancing: true,
                enable_circuit_breaker: true,
                enable_rate_limiting: true,
                enable_session_affinity: true,
                health_check_interval: Duration::from_secs(10),
                graceful_shutdown_timeout: Duration::from_secs(30),
                rate_limit_max_requests: 100,
                rate_limit_window: Duration::from_secs(60),
                breaker_failure_threshold: 5,
                breaker_recovery_timeout: Duration::from_secs(60),
            },
            ScalingMode::HighTraffic => Self {
                mode,
                max_workers: 8,
                connection_pool_size: 50,
                store_connection_limit: 50,
                default_ttl: Duration::from_secs(3600),
                enable_load_balancing: true,
                enable_circuit_breaker: true,
                enable_rate_limiting: true,
                enable_session_affinity: true,
                health_check_interval: Duration::from_secs(5),
                graceful_shutdown_timeout: Duration::from_secs(60),
                rate_limit_max_requests: 1000,
                rate_limit_window: Duration::from_secs(60),
                breaker_failure_threshold: 10,
                breaker_recovery_timeout: Duration::from_secs(30),
            },
        }
    }

    /// Profile for a mode name; unknown names get the production profile.
    pub fn from_mode_name(name: &str) -> Self {
        Self::for_mode(ScalingMode::from_str_or_production(name))
    }

    /// Connections the pool may open beyond `connection_pool_size`.
    pub fn max_overflow(&self) -> usize {
        self.connection_pool_size * 2
    }

    /// Multi-threaded runtime with `max_workers` worker threads.
    pub fn build_runtime(&self) -> std::io::Result<tokio::runtime::Runtime> {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.max_workers.max(1))
            .thread_name("scale-plane-worker")
            .enable_all()
            .build()
    }
}

/// Which ephemeral store backs the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Redis,
    Memory,
}

/// Process configuration loaded from the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub scaling: ScalingConfig,
    pub store_backend: StoreBackend,
    pub redis_url: String,
    pub database_path: String,
    pub health_path: String,
    /// Selection algorithm used when load balancing is enabled
    pub lb_algorithm: Algorithm,
    pub version: String,
    pub environment: String,
    pub debug: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            scaling: ScalingConfig::for_mode(ScalingMode::Production),
            store_backend: StoreBackend::Redis,
            redis_url: "redis://localhost:6379".to_string(),
            database_path: "app.db".to_string(),
            health_path: "/health".to_string(),
            lb_algorithm: Algorithm::RoundRobin,
            version: "1.0.0".to_string(),
            environment: "production".to_string(),
            debug: false,
        }
    }
}

pub fn load_config() -> anyhow::Result<AppConfig> {
    load_config_from(|key| std::env::var(key).ok())
}

/// Build the configuration from an arbitrary variable lookup.
///
/// Unparsable values abort startup; missing values take defaults.
pub fn load_config_from<F>(var: F) -> anyhow::Result<AppConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = AppConfig::default();

    let listen_addr = match var("SCALEPLANE_LISTEN_ADDR") {
        Some(v) => v
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid SCALEPLANE_LISTEN_ADDR {:?}: {}", v, e))?,
        None => defaults.listen_addr,
    };

    let environment = var("ENVIRONMENT").unwrap_or(defaults.environment);

    // An explicit mode wins; otherwise the environment name selects the profile.
    let mode_name = var("SCALEPLANE_MODE").unwrap_or_else(|| environment.clone());
    let scaling = ScalingConfig::from_mode_name(&mode_name);

    let store_backend = match var("SCALEPLANE_STORE").as_deref() {
        None | Some("redis") => StoreBackend::Redis,
        Some("memory") => StoreBackend::Memory,
        Some(other) => anyhow::bail!("invalid SCALEPLANE_STORE {:?} (expected redis|memory)", other),
    };

    let redis_url = var("REDIS_URL").unwrap_or(defaults.redis_url);

    let database_path = var("DATABASE_URL")
        .map(|v| v.trim_start_matches("sqlite://").to_string())
        .unwrap_or(defaults.database_path);

    let health_path = match var("SCALEPLANE_HEALTH_PATH") {
        Some(p) if p.starts_with('/') => p,
        Some(p) => format!("/{}", p),
        None => defaults.health_path,
    };

    let lb_algorithm = match var("SCALEPLANE_LB_ALGORITHM") {
        Some(v) => v
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid SCALEPLANE_LB_ALGORITHM: {}", e))?,
        None => defaults.lb_algorithm,
    };

    let version = var("APP_VERSION").unwrap_or(defaults.version);

    let debug = var("DEBUG").is_some();

    Ok(AppConfig {
        listen_addr,
        scaling,
        store_backend,
        redis_url,
        database_path,
        health_path,
        lb_algorithm,
        version,
        environment,
        debug,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tracing_test::traced_test;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("development".parse(), Ok(ScalingMode::Development));
        assert_eq!("dev".parse(), Ok(ScalingMode::Development));
        assert_eq!("staging".parse(), Ok(ScalingMode::Staging));
        assert_eq!("PROD".parse(), Ok(ScalingMode::Production));
        assert_eq!("high-traffic".parse(), Ok(ScalingMode::HighTraffic));
        assert!("turbo".parse::<ScalingMode>().is_err());
    }

    #[test]
    #[traced_test]
    fn test_unknown_mode_falls_back_to_production() {
        assert_eq!(
            ScalingMode::from_str_or_production("turbo"),
            ScalingMode::Production
        );
        assert!(logs_contain("unknown scaling mode"));
        assert_eq!(
            ScalingConfig::from_mode_name(""),
            ScalingConfig::for_mode(ScalingMode::Production)
        );
    }

    #[test]
    fn test_development_profile() {
        let cfg = ScalingConfig::for_mode(ScalingMode::Development);
        assert_eq!(cfg.max_workers, 1);
        assert_eq!(cfg.connection_pool_size, 5);
        assert_eq!(cfg.default_ttl, Duration::from_secs(300));
        assert!(!cfg.enable_load_balancing);
        assert!(!cfg.enable_circuit_breaker);
        assert!(!cfg.enable_rate_limiting);
        assert!(!cfg.enable_session_affinity);
        assert_eq!(cfg.health_check_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_profiles_scale_up() {
        let modes = [
            ScalingMode::Development,
            ScalingMode::Staging,
            ScalingMode::Production,
            ScalingMode::HighTraffic,
        ];
        let configs: Vec<_> = modes.iter().map(|m| ScalingConfig::for_mode(*m)).collect();

        for pair in configs.windows(2) {
            assert!(pair[0].connection_pool_size < pair[1].connection_pool_size);
            assert!(pair[0].max_workers < pair[1].max_workers);
            assert!(pair[0].health_check_interval > pair[1].health_check_interval);
            assert!(pair[0].graceful_shutdown_timeout < pair[1].graceful_shutdown_timeout);
        }
        for (mode, cfg) in modes.iter().zip(&configs) {
            assert_eq!(cfg.mode, *mode);
        }
    }

    #[test]
    fn test_max_overflow() {
        let cfg = ScalingConfig::for_mode(ScalingMode::Production);
        assert_eq!(cfg.max_overflow(), 40);
    }

    #[test]
    fn test_runtime_sized_by_profile() {
        for mode in [ScalingMode::Development, ScalingMode::HighTraffic] {
            let scaling = ScalingConfig::for_mode(mode);
            let runtime = scaling.build_runtime().unwrap();
            assert_eq!(runtime.metrics().num_workers(), scaling.max_workers);
        }

        let mut scaling = ScalingConfig::for_mode(ScalingMode::Development);
        scaling.max_workers = 0;
        assert_eq!(scaling.build_runtime().unwrap().metrics().num_workers(), 1);
    }

    #[test]
    fn test_load_config_defaults() {
        let cfg = load_config_from(lookup(&[])).unwrap();
        assert_eq!(cfg.listen_addr.port(), 8000);
        assert_eq!(cfg.scaling.mode, ScalingMode::Production);
        assert_eq!(cfg.store_backend, StoreBackend::Redis);
        assert_eq!(cfg.redis_url, "redis://localhost:6379");
        assert_eq!(cfg.version, "1.0.0");
        assert_eq!(cfg.environment, "production");
        assert_eq!(cfg.lb_algorithm, Algorithm::RoundRobin);
        assert!(!cfg.debug);
    }

    #[test]
    fn test_load_config_mode_from_environment() {
        let cfg = load_config_from(lookup(&[("ENVIRONMENT", "staging")])).unwrap();
        assert_eq!(cfg.scaling.mode, ScalingMode::Staging);

        let cfg = load_config_from(lookup(&[
            ("ENVIRONMENT", "staging"),
            ("SCALEPLANE_MODE", "high_traffic"),
        ]))
        .unwrap();
        assert_eq!(cfg.scaling.mode, ScalingMode::HighTraffic);
        assert_eq!(cfg.environment, "staging");
    }

    #[test]
    fn test_load_config_overrides() {
        let cfg = load_config_from(lookup(&[
            ("SCALEPLANE_LISTEN_ADDR", "127.0.0.1:9000"),
            ("SCALEPLANE_STORE", "memory"),
            ("DATABASE_URL", "sqlite:///tmp/app.db"),
            ("APP_VERSION", "2.3.4"),
            ("SCALEPLANE_LB_ALGORITHM", "least_connections"),
            ("SCALEPLANE_HEALTH_PATH", "ready"),
            ("DEBUG", "1"),
        ]))
        .unwrap();
        assert_eq!(cfg.lb_algorithm, Algorithm::LeastConnections);
        assert_eq!(cfg.health_path, "/ready");
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:9000");
        assert_eq!(cfg.store_backend, StoreBackend::Memory);
        assert_eq!(cfg.database_path, "/tmp/app.db");
        assert_eq!(cfg.version, "2.3.4");
        assert!(cfg.debug);
    }

    #[test]
    fn test_load_config_rejects_malformed_values() {
        assert!(load_config_from(lookup(&[("SCALEPLANE_LISTEN_ADDR", "nope")])).is_err());
        assert!(load_config_from(lookup(&[("SCALEPLANE_STORE", "etcd")])).is_err());
        assert!(load_config_from(lookup(&[("SCALEPLANE_LB_ALGORITHM", "random")])).is_err());
    }
}
