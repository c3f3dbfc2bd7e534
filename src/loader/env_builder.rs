// src/loader/env_builder.rs
//! Isolated dependency environments
//!
//! Each package's dependency list is hashed; environments are keyed by
//! `(owner, hash)` so identical dependency sets are reused without a
//! reinstall, while two owners never share an environment even when
//! their package names collide.

use crate::loader::package_loader::sha256_hex;
use crate::utils::errors::{FleetError, Result};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

/// Marker file written after a successful install
pub const ENV_MARKER: &str = ".fleet-env-ok";

/// Builds and reuses isolated dependency environments
pub struct EnvBuilder {
    /// Root under which per-owner environments live
    envs_root: PathBuf,

    /// Local package cache consulted before the remote index
    cache_dir: Option<PathBuf>,

    /// Interpreter used to create the environment
    interpreter: String,
}

impl EnvBuilder {
    /// Create a builder rooted at `envs_root`
    pub fn new(envs_root: impl Into<PathBuf>, cache_dir: Option<PathBuf>) -> Self {
        Self {
            envs_root: envs_root.into(),
            cache_dir,
            interpreter: "python3".to_string(),
        }
    }

    /// Override the interpreter program (tests, alternative runtimes)
    pub fn with_interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.interpreter = interpreter.into();
        self
    }

    /// Hash of a dependency list, order-insensitive
    pub fn dependency_hash(dependencies: &[String]) -> String {
        let mut sorted: Vec<&str> = dependencies.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        sha256_hex(sorted.join("\n").as_bytes())
    }

    /// Directory an environment for `(owner_id, hash)` lives in
    pub fn env_dir(&self, owner_id: &str, hash: &str) -> PathBuf {
        self.envs_root.join(owner_id).join(&hash[..12])
    }

    /// Ensure an environment exists for the dependency list.
    ///
    /// Returns `None` for packages with no dependencies. An existing
    /// environment passing the validity check is reused as-is; anything
    /// else is rebuilt from scratch. Install failures are fatal to the
    /// load operation.
    pub async fn ensure(&self, owner_id: &str, dependencies: &[String]) -> Result<Option<PathBuf>> {
        if dependencies.is_empty() {
            return Ok(None);
        }

        let hash = Self::dependency_hash(dependencies);
        let dir = self.env_dir(owner_id, &hash);

        if is_valid(&dir) {
            info!("Reusing environment {:?} for owner {}", dir, owner_id);
            return Ok(Some(dir));
        }

        if dir.exists() {
            debug!("Discarding invalid environment at {:?}", dir);
            std::fs::remove_dir_all(&dir)?;
        }

        self.build(&dir, dependencies).await?;
        std::fs::write(dir.join(ENV_MARKER), hash.as_bytes())?;
        info!("Built environment {:?} for owner {}", dir, owner_id);

        Ok(Some(dir))
    }

    /// Create the environment and install dependencies into it
    async fn build(&self, dir: &Path, dependencies: &[String]) -> Result<()> {
        if let Some(parent) = dir.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let status = Command::new(&self.interpreter)
            .arg("-m")
            .arg("venv")
            .arg(dir)
            .status()
            .await
            .map_err(|e| FleetError::Package(format!("failed to run {}: {}", self.interpreter, e)))?;

        if !status.success() {
            return Err(FleetError::Package(format!(
                "environment creation failed with status {}",
                status
            )));
        }

        let pip = dir.join("bin").join("pip");
        let mut install = Command::new(&pip);
        install.arg("install");

        // Prefer the local cache; pip falls back to the remote index
        // for anything the cache does not carry.
        if let Some(cache) = &self.cache_dir {
            install.arg("--find-links").arg(cache);
        }
        install.args(dependencies);

        let status = install
            .status()
            .await
            .map_err(|e| FleetError::Package(format!("failed to run pip: {}", e)))?;

        if !status.success() {
            return Err(FleetError::Package(format!(
                "dependency install failed with status {}",
                status
            )));
        }

        Ok(())
    }
}

/// Lightweight validity check: marker present, interpreter present
fn is_valid(dir: &Path) -> bool {
    dir.join(ENV_MARKER).exists() && dir.join("bin").join("python3").exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deps(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_dependency_hash_order_insensitive() {
        let a = EnvBuilder::dependency_hash(&deps(&["requests==2.31.0", "pyyaml==6.0"]));
        let b = EnvBuilder::dependency_hash(&deps(&["pyyaml==6.0", "requests==2.31.0"]));
        assert_eq!(a, b);
    }

    #[test]
    fn test_dependency_hash_differs() {
        let a = EnvBuilder::dependency_hash(&deps(&["requests==2.31.0"]));
        let b = EnvBuilder::dependency_hash(&deps(&["requests==2.32.0"]));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_no_dependencies_no_environment() {
        let dir = tempfile::tempdir().unwrap();
        let builder = EnvBuilder::new(dir.path(), None);
        let env = builder.ensure("a1", &[]).await.unwrap();
        assert!(env.is_none());
    }

    #[tokio::test]
    async fn test_valid_environment_reused() {
        let dir = tempfile::tempdir().unwrap();
        let builder = EnvBuilder::new(dir.path(), None);

        let list = deps(&["requests==2.31.0"]);
        let hash = EnvBuilder::dependency_hash(&list);
        let env = builder.env_dir("a1", &hash);

        // Fake a previously built, valid environment.
        std::fs::create_dir_all(env.join("bin")).unwrap();
        std::fs::write(env.join("bin").join("python3"), b"").unwrap();
        std::fs::write(env.join(ENV_MARKER), hash.as_bytes()).unwrap();

        let reused = builder.ensure("a1", &list).await.unwrap().unwrap();
        assert_eq!(reused, env);
    }

    #[tokio::test]
    async fn test_owners_never_share_environments() {
        let dir = tempfile::tempdir().unwrap();
        let builder = EnvBuilder::new(dir.path(), None);

        let hash = EnvBuilder::dependency_hash(&deps(&["requests==2.31.0"]));
        assert_ne!(builder.env_dir("a1", &hash), builder.env_dir("a2", &hash));
    }

    #[tokio::test]
    async fn test_install_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        // `false` exits non-zero immediately, standing in for a broken
        // interpreter.
        let builder = EnvBuilder::new(dir.path(), None).with_interpreter("false");

        let err = builder
            .ensure("a1", &deps(&["requests==2.31.0"]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "package_error");
    }
}
