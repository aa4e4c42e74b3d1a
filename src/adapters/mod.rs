//! Adapters Layer
//!
//! Inbound adapters drive the application; outbound adapters implement
//! domain ports.

pub mod inbound;
pub mod outbound;
