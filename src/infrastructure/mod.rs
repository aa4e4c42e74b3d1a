//! Infrastructure Layer
//!
//! Cross-cutting resilience and scaling components.

pub mod circuit_breaker;
pub mod connection_pool;
pub mod health_checker;
pub mod health_report;
pub mod rate_limiter;
pub mod registry;
pub mod shutdown;

pub use circuit_breaker::{BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use connection_pool::{DatabasePool, PoolConfig, PoolError};
pub use health_checker::{HealthCheckConfig, HealthChecker};
pub use health_report::{HealthReport, SystemStatus};
pub use rate_limiter::{RateLimitConfig, RateLimitResult, RateLimiter};
pub use registry::{InstanceRegistry, RegistryError};
pub use shutdown::{shutdown_signal, ShutdownController, WorkGuard};
