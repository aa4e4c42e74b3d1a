//! Application Layer
//!
//! Use cases composed from the domain and infrastructure.

pub mod control_plane;

pub use control_plane::{ControlError, ControlPlane};
