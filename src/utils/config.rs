// src/utils/config.rs
//! Supervisor configuration
//!
//! Layered loading: built-in defaults, then an optional `fleet.yaml`,
//! then `FLEET_*` environment variables (double underscore separates
//! nesting, e.g. `FLEET_SERVER__PORT=9000`).

use crate::utils::errors::{FleetError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Control API server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind host for the control API
    pub host: String,

    /// Control API port
    pub port: u16,

    /// Router (RPC + HTTP proxy) port
    pub router_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7070,
            router_port: 7071,
        }
    }
}

/// Fleet supervision settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    /// First port handed out to workers
    pub port_range_start: u16,

    /// Last port handed out to workers (inclusive)
    pub port_range_end: u16,

    /// Monitor loop interval in seconds
    pub monitor_interval_secs: u64,

    /// Graceful stop timeout in seconds before SIGKILL
    pub stop_timeout_secs: u64,

    /// Program used to launch workers
    pub worker_program: String,

    /// Control-plane URL injected into worker environments
    pub control_plane_url: String,

    /// Optional fallback endpoint consulted when routing resolution fails
    pub fallback_endpoint: Option<String>,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            port_range_start: 30000,
            port_range_end: 30999,
            monitor_interval_secs: 5,
            stop_timeout_secs: 10,
            worker_program: "fleet-worker".to_string(),
            control_plane_url: "http://127.0.0.1:7070".to_string(),
            fallback_endpoint: None,
        }
    }
}

/// Package storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for extracted packages and environments
    pub data_dir: PathBuf,

    /// Local package cache consulted before remote installs
    pub package_cache_dir: Option<PathBuf>,

    /// Maximum package archive size in megabytes
    pub max_package_mb: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/agent-fleet"),
            package_cache_dir: None,
            max_package_mb: 256,
        }
    }
}

/// Top-level supervisor configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub server: ServerConfig,
    pub fleet: FleetConfig,
    pub storage: StorageConfig,
}

impl SupervisorConfig {
    /// Load configuration from `fleet.yaml` (optional) and `FLEET_*` env vars
    pub fn load() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::File::with_name("fleet").required(false))
            .add_source(config::Environment::with_prefix("FLEET").separator("__"))
            .build()
            .map_err(|e| FleetError::Config(e.to_string()))?;

        let parsed: SupervisorConfig = cfg
            .try_deserialize()
            .map_err(|e| FleetError::Config(e.to_string()))?;

        parsed.validate()?;
        Ok(parsed)
    }

    /// Validate cross-field invariants; fail fast on violation
    pub fn validate(&self) -> Result<()> {
        if self.fleet.port_range_start == 0 {
            return Err(FleetError::Config("port range must not start at 0".into()));
        }
        if self.fleet.port_range_end < self.fleet.port_range_start {
            return Err(FleetError::Config(format!(
                "invalid port range {}-{}",
                self.fleet.port_range_start, self.fleet.port_range_end
            )));
        }
        if self.fleet.monitor_interval_secs == 0 {
            return Err(FleetError::Config("monitor interval must be > 0".into()));
        }
        if self.storage.max_package_mb == 0 {
            return Err(FleetError::Config("max package size must be > 0".into()));
        }
        Ok(())
    }
}
