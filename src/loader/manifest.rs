// src/loader/manifest.rs
//! Agent package manifest (`agent.yaml`)
//!
//! Every package ships a root manifest declaring its identity, its
//! entrypoint handler, and which surfaces it exposes. Validation is
//! strict: a package without a name, a semantic version, and an
//! entrypoint never loads.

use crate::utils::errors::{FleetError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Manifest file name expected at the archive root
pub const MANIFEST_FILE: &str = "agent.yaml";

/// Declared RPC surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcEntry {
    /// Typed handler name resolved through the handler registry
    pub handler: String,
}

/// Declared HTTP mount
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpEntry {
    /// Mount point relative to the worker base path
    pub mount: String,
}

/// Declared UI surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiEntry {
    /// Asset directory relative to the package root
    pub assets: String,

    /// Base path the UI is served under
    pub base_path: String,
}

/// Root manifest of an agent package
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentManifest {
    /// Package name
    pub name: String,

    /// Semantic version (`major.minor.patch`)
    pub version: String,

    /// Entrypoint handler name
    pub entrypoint: String,

    /// Optional RPC surface declaration
    #[serde(default)]
    pub rpc: Option<RpcEntry>,

    /// Optional HTTP mount declaration
    #[serde(default)]
    pub http: Option<HttpEntry>,

    /// Optional UI surface declaration
    #[serde(default)]
    pub ui: Option<UiEntry>,

    /// Dependency list for the isolated environment
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl AgentManifest {
    /// Parse a manifest from YAML text
    pub fn from_yaml(text: &str) -> Result<Self> {
        let manifest: AgentManifest = serde_yaml::from_str(text)
            .map_err(|e| FleetError::PackageValidation(format!("invalid manifest: {}", e)))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Read and parse `agent.yaml` from a package directory
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        let text = std::fs::read_to_string(&path).map_err(|_| {
            FleetError::PackageValidation(format!("missing {} in package root", MANIFEST_FILE))
        })?;
        Self::from_yaml(&text)
    }

    /// Validate required fields
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(FleetError::PackageValidation("name must be non-blank".into()));
        }
        if !is_semver(&self.version) {
            return Err(FleetError::PackageValidation(format!(
                "version must be semantic (major.minor.patch), got {:?}",
                self.version
            )));
        }
        if self.entrypoint.trim().is_empty() {
            return Err(FleetError::PackageValidation(
                "entrypoint must be non-blank".into(),
            ));
        }
        Ok(())
    }

    /// Package identity string (`name@version`)
    pub fn identity(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }
}

/// Check `major.minor.patch` with numeric components
fn is_semver(version: &str) -> bool {
    let parts: Vec<&str> = version.split('.').collect();
    parts.len() == 3
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}
