// src/lib.rs
//! Agent fleet runtime library
//!
//! Single-host runtime for hosting independently packaged agent
//! programs. The crate splits into:
//!
//! - **supervisor**: process spawning, liveness monitoring, restart
//!   policy, port allocation, resource caps, log capture, control API
//! - **router**: deployment resolution, RPC routing, HTTP reverse proxy
//! - **runtime**: the worker side: boot lifecycle, HTTP/RPC/UI
//!   surfaces, environment configuration
//! - **loader**: package archives, manifests, content hashing,
//!   dependency environments, the handler registry
//! - **utils**: configuration, errors, observability

pub mod loader;
pub mod router;
pub mod runtime;
pub mod supervisor;
pub mod utils;

pub use utils::config::SupervisorConfig;
pub use utils::errors::{FleetError, Result};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
