//! Domain Layer
//!
//! Entities, key naming, selection algorithms, and the ports the
//! infrastructure implements.

pub mod entities;
pub mod keys;
pub mod ports;
pub mod services;
