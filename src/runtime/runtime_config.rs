// src/runtime/runtime_config.rs
//! Worker environment configuration
//!
//! The supervisor hands a worker its entire configuration through
//! `FLEET_*` environment variables. Parsing is fail-fast: an invalid
//! value aborts startup before any surface binds.

use crate::utils::errors::{FleetError, Result};
use std::collections::HashMap;
use std::path::PathBuf;

/// Default soft boot budget
pub const DEFAULT_BOOT_BUDGET_MS: u64 = 30_000;

/// Default hard-limit multiplier over the soft budget
pub const DEFAULT_HARD_LIMIT_MULT: f64 = 2.0;

/// Default package size ceiling
pub const DEFAULT_MAX_PACKAGE_MB: u64 = 256;

/// Validated worker configuration
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub agent_id: String,
    pub package_id: String,
    pub deployment_id: String,

    pub http_port: u16,
    pub rpc_port: u16,
    pub ui_port: Option<u16>,

    /// Mount point for agent HTTP routes
    pub base_path: String,

    /// Serve UI assets from the HTTP surface instead of a separate port
    pub multiplex: bool,

    pub boot_budget_ms: u64,
    pub boot_hard_limit_mult: f64,
    pub max_package_mb: u64,

    /// Local package artifact placed by the supervisor
    pub package_path: Option<PathBuf>,

    /// Remote package reference (https:// or s3:// only)
    pub package_ref: Option<String>,

    pub control_plane_url: Option<String>,
}

impl RuntimeConfig {
    /// Build from the process environment
    pub fn from_env() -> Result<Self> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_vars(&vars)
    }

    /// Build from an explicit variable map (tests)
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self> {
        let agent_id = require_non_blank(vars, "FLEET_AGENT_ID")?;
        let package_id = vars
            .get("FLEET_PACKAGE_ID")
            .cloned()
            .unwrap_or_else(|| "unpackaged".to_string());
        let deployment_id = vars
            .get("FLEET_DEPLOYMENT_ID")
            .filter(|v| !v.trim().is_empty())
            .cloned()
            .unwrap_or_else(|| agent_id.clone());

        let http_port = parse_port(vars, "FLEET_HTTP_PORT")?;
        let rpc_port = parse_port(vars, "FLEET_RPC_PORT")?;
        let ui_port = match vars.get("FLEET_UI_PORT") {
            Some(_) => Some(parse_port(vars, "FLEET_UI_PORT")?),
            None => None,
        };

        let multiplex = parse_bool(vars.get("FLEET_MULTIPLEX"));

        if http_port == rpc_port {
            return Err(FleetError::Config(
                "FLEET_HTTP_PORT and FLEET_RPC_PORT must differ".into(),
            ));
        }
        if let Some(ui) = ui_port {
            if ui == rpc_port {
                return Err(FleetError::Config(
                    "FLEET_UI_PORT must differ from FLEET_RPC_PORT".into(),
                ));
            }
            // UI may share the HTTP port only when multiplexed onto it.
            if ui == http_port && !multiplex {
                return Err(FleetError::Config(
                    "FLEET_UI_PORT equals FLEET_HTTP_PORT without FLEET_MULTIPLEX".into(),
                ));
            }
        }

        let base_path = vars
            .get("FLEET_BASE_PATH")
            .cloned()
            .unwrap_or_else(|| "/api".to_string());
        validate_base_path(&base_path)?;

        let boot_budget_ms = parse_u64(vars, "FLEET_BOOT_BUDGET_MS", DEFAULT_BOOT_BUDGET_MS)?;
        if boot_budget_ms == 0 {
            return Err(FleetError::Config(
                "FLEET_BOOT_BUDGET_MS must be greater than 0".into(),
            ));
        }

        let boot_hard_limit_mult = match vars.get("FLEET_BOOT_HARD_LIMIT_MULT") {
            Some(raw) => raw.parse::<f64>().map_err(|_| {
                FleetError::Config(format!("invalid FLEET_BOOT_HARD_LIMIT_MULT: {}", raw))
            })?,
            None => DEFAULT_HARD_LIMIT_MULT,
        };
        if boot_hard_limit_mult < 0.0 || !boot_hard_limit_mult.is_finite() {
            return Err(FleetError::Config(
                "FLEET_BOOT_HARD_LIMIT_MULT must be >= 0".into(),
            ));
        }

        let max_package_mb = parse_u64(vars, "FLEET_MAX_PACKAGE_MB", DEFAULT_MAX_PACKAGE_MB)?;

        let package_ref = vars
            .get("FLEET_PACKAGE_REF")
            .filter(|v| !v.trim().is_empty())
            .cloned();
        if let Some(reference) = &package_ref {
            if !reference.starts_with("https://") && !reference.starts_with("s3://") {
                return Err(FleetError::Config(format!(
                    "FLEET_PACKAGE_REF must be https:// or s3://, got {}",
                    reference
                )));
            }
        }

        Ok(Self {
            agent_id,
            package_id,
            deployment_id,
            http_port,
            rpc_port,
            ui_port,
            base_path,
            multiplex,
            boot_budget_ms,
            boot_hard_limit_mult,
            max_package_mb,
            package_path: vars.get("FLEET_PACKAGE_PATH").map(PathBuf::from),
            package_ref,
            control_plane_url: vars.get("FLEET_CONTROL_PLANE_URL").cloned(),
        })
    }

    /// Whether UI assets are served from the HTTP surface
    pub fn ui_multiplexed(&self) -> bool {
        self.multiplex || self.ui_port.is_none()
    }
}

fn require_non_blank(vars: &HashMap<String, String>, key: &str) -> Result<String> {
    match vars.get(key) {
        Some(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        _ => Err(FleetError::Config(format!("{} is required", key))),
    }
}

fn parse_port(vars: &HashMap<String, String>, key: &str) -> Result<u16> {
    let raw = vars
        .get(key)
        .ok_or_else(|| FleetError::Config(format!("{} is required", key)))?;
    let port: u16 = raw
        .parse()
        .map_err(|_| FleetError::Config(format!("invalid {}: {}", key, raw)))?;
    if port == 0 {
        return Err(FleetError::Config(format!("{} cannot be 0", key)));
    }
    Ok(port)
}

fn parse_u64(vars: &HashMap<String, String>, key: &str, default: u64) -> Result<u64> {
    match vars.get(key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| FleetError::Config(format!("invalid {}: {}", key, raw))),
        None => Ok(default),
    }
}

fn parse_bool(value: Option<&String>) -> bool {
    matches!(
        value.map(|v| v.to_ascii_lowercase()).as_deref(),
        Some("1") | Some("true") | Some("yes")
    )
}

/// Base paths mount agent routes; keep them simple and unambiguous
fn validate_base_path(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(FleetError::Config(format!(
            "base path must start with '/': {}",
            path
        )));
    }
    if path.contains("//") {
        return Err(FleetError::Config(format!(
            "base path cannot contain '//': {}",
            path
        )));
    }
    let valid = path
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '-'));
    if !valid {
        return Err(FleetError::Config(format!(
            "base path has invalid characters: {}",
            path
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_vars() -> HashMap<String, String> {
        let mut vars = HashMap::new();
        vars.insert("FLEET_AGENT_ID".into(), "a1".into());
        vars.insert("FLEET_HTTP_PORT".into(), "30001".into());
        vars.insert("FLEET_RPC_PORT".into(), "30002".into());
        vars
    }

    #[test]
    fn test_minimal_config() {
        let config = RuntimeConfig::from_vars(&base_vars()).unwrap();
        assert_eq!(config.agent_id, "a1");
        assert_eq!(config.deployment_id, "a1");
        assert_eq!(config.base_path, "/api");
        assert_eq!(config.boot_budget_ms, DEFAULT_BOOT_BUDGET_MS);
        assert!(config.ui_multiplexed());
    }

    #[test]
    fn test_blank_agent_id_rejected() {
        let mut vars = base_vars();
        vars.insert("FLEET_AGENT_ID".into(), "   ".into());
        assert!(RuntimeConfig::from_vars(&vars).is_err());

        vars.remove("FLEET_AGENT_ID");
        assert!(RuntimeConfig::from_vars(&vars).is_err());
    }

    #[test]
    fn test_port_collisions() {
        let mut vars = base_vars();
        vars.insert("FLEET_RPC_PORT".into(), "30001".into());
        assert!(RuntimeConfig::from_vars(&vars).is_err());

        let mut vars = base_vars();
        vars.insert("FLEET_UI_PORT".into(), "30002".into());
        assert!(RuntimeConfig::from_vars(&vars).is_err());

        // UI == HTTP requires multiplex.
        let mut vars = base_vars();
        vars.insert("FLEET_UI_PORT".into(), "30001".into());
        assert!(RuntimeConfig::from_vars(&vars).is_err());
        vars.insert("FLEET_MULTIPLEX".into(), "true".into());
        assert!(RuntimeConfig::from_vars(&vars).is_ok());
    }

    #[test]
    fn test_invalid_ports() {
        let mut vars = base_vars();
        vars.insert("FLEET_HTTP_PORT".into(), "0".into());
        assert!(RuntimeConfig::from_vars(&vars).is_err());

        let mut vars = base_vars();
        vars.insert("FLEET_HTTP_PORT".into(), "70000".into());
        assert!(RuntimeConfig::from_vars(&vars).is_err());
    }

    #[test]
    fn test_base_path_rules() {
        for bad in ["api", "/api//v1", "/api path", "/api?x"] {
            let mut vars = base_vars();
            vars.insert("FLEET_BASE_PATH".into(), bad.into());
            assert!(RuntimeConfig::from_vars(&vars).is_err(), "{}", bad);
        }

        let mut vars = base_vars();
        vars.insert("FLEET_BASE_PATH".into(), "/agents/a-1_x".into());
        assert!(RuntimeConfig::from_vars(&vars).is_ok());
    }

    #[test]
    fn test_boot_budget_rules() {
        let mut vars = base_vars();
        vars.insert("FLEET_BOOT_BUDGET_MS".into(), "0".into());
        assert!(RuntimeConfig::from_vars(&vars).is_err());

        let mut vars = base_vars();
        vars.insert("FLEET_BOOT_HARD_LIMIT_MULT".into(), "-1".into());
        assert!(RuntimeConfig::from_vars(&vars).is_err());

        // Zero multiplier disables the hard limit but is valid config.
        let mut vars = base_vars();
        vars.insert("FLEET_BOOT_HARD_LIMIT_MULT".into(), "0".into());
        let config = RuntimeConfig::from_vars(&vars).unwrap();
        assert_eq!(config.boot_hard_limit_mult, 0.0);
    }

    #[test]
    fn test_package_ref_schemes() {
        let mut vars = base_vars();
        vars.insert("FLEET_PACKAGE_REF".into(), "file:///tmp/pkg.zip".into());
        assert!(RuntimeConfig::from_vars(&vars).is_err());

        let mut vars = base_vars();
        vars.insert("FLEET_PACKAGE_REF".into(), "/tmp/pkg.zip".into());
        assert!(RuntimeConfig::from_vars(&vars).is_err());

        for good in ["https://pkgs.example/a.zip", "s3://bucket/a.zip"] {
            let mut vars = base_vars();
            vars.insert("FLEET_PACKAGE_REF".into(), good.into());
            assert!(RuntimeConfig::from_vars(&vars).is_ok(), "{}", good);
        }
    }
}
