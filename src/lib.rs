//! scale-plane Library
//!
//! Resilience and scaling control plane: instance registry and load
//! balancing, health checking, circuit breaking, rate limiting, shared
//! cache and session state, and graceful shutdown.

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use application::{ControlError, ControlPlane};
pub use config::{load_config, AppConfig, ScalingConfig, ScalingMode};
pub use domain::entities::{Binding, Instance};
pub use domain::ports::{EphemeralStore, StoreError};
pub use domain::services::{Algorithm, LoadBalancer};
