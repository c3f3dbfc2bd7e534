// src/utils/mod.rs
//! Common utilities: errors, configuration, observability

pub mod config;
pub mod errors;
pub mod observability;

pub use config::SupervisorConfig;
pub use errors::{FleetError, Result};
pub use observability::init_tracing;
