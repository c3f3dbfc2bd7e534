// src/loader/package_loader.rs
//! Secure package loader
//!
//! Extracts agent package archives into content-addressed directories:
//!
//! - SHA-256 content hash, verified against a reference digest when given
//! - zip-slip rejection: no entry may resolve outside the extraction root
//! - manifest validation before the package is accepted
//! - atomic relocation into the final location, replacing prior
//!   extractions of the same package while reusing identical content

use crate::loader::manifest::AgentManifest;
use crate::utils::errors::{FleetError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Lifecycle status of a loaded package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageStatus {
    Pending,
    Loading,
    Ready,
    Error,
}

/// A validated, extracted agent package
#[derive(Debug, Clone)]
pub struct AgentPackage {
    /// `name@version`
    pub identity: String,

    /// Parsed manifest
    pub manifest: AgentManifest,

    /// Owning agent identifier
    pub owner_id: String,

    /// Final extraction directory
    pub install_dir: PathBuf,

    /// SHA-256 of the archive bytes, hex encoded
    pub content_hash: String,

    /// Isolated dependency environment, when one was materialized
    pub env_dir: Option<PathBuf>,

    /// Lifecycle status
    pub status: PackageStatus,
}

/// Extracts and validates agent package archives
pub struct PackageLoader {
    /// Root under which `packages/` and `tmp/` live
    root: PathBuf,

    /// Maximum accepted archive / extracted size in bytes
    max_bytes: u64,
}

impl PackageLoader {
    /// Create a loader rooted at `root`
    pub fn new(root: impl Into<PathBuf>, max_package_mb: u64) -> Self {
        Self {
            root: root.into(),
            max_bytes: max_package_mb * 1024 * 1024,
        }
    }

    /// Load a package archive for `owner_id`.
    ///
    /// When `expected_digest` is given, the archive's SHA-256 must match
    /// before any content is used.
    pub fn load(
        &self,
        archive_path: &Path,
        owner_id: &str,
        expected_digest: Option<&str>,
    ) -> Result<AgentPackage> {
        let bytes = std::fs::read(archive_path)?;

        if bytes.len() as u64 > self.max_bytes {
            return Err(FleetError::Package(format!(
                "archive is {} bytes, limit is {}",
                bytes.len(),
                self.max_bytes
            )));
        }

        let content_hash = sha256_hex(&bytes);
        if let Some(expected) = expected_digest {
            if !expected.eq_ignore_ascii_case(&content_hash) {
                return Err(FleetError::DigestMismatch {
                    expected: expected.to_string(),
                    actual: content_hash,
                });
            }
        }

        // Extract into a scratch directory first; nothing lands in the
        // final location until the package validates.
        let scratch = self.root.join("tmp").join(ulid::Ulid::new().to_string());
        std::fs::create_dir_all(&scratch)?;

        let extracted = self.extract(&bytes, &scratch);
        let manifest = extracted.and_then(|_| AgentManifest::from_dir(&scratch));

        let manifest = match manifest {
            Ok(manifest) => manifest,
            Err(e) => {
                let _ = std::fs::remove_dir_all(&scratch);
                return Err(e);
            }
        };

        let package_dir = self.root.join("packages").join(&manifest.name);
        let final_dir = package_dir.join(&content_hash[..12]);

        if final_dir.exists() {
            // Identical content already extracted; reuse it as-is.
            debug!("Reusing existing extraction at {:?}", final_dir);
            let _ = std::fs::remove_dir_all(&scratch);
        } else {
            std::fs::create_dir_all(&package_dir)?;

            // Stale extractions of the same package are replaced, not merged.
            if let Ok(entries) = std::fs::read_dir(&package_dir) {
                for entry in entries.flatten() {
                    if entry.path() != final_dir {
                        let _ = std::fs::remove_dir_all(entry.path());
                    }
                }
            }

            std::fs::rename(&scratch, &final_dir)?;
            info!(
                "Extracted package {} to {:?}",
                manifest.identity(),
                final_dir
            );
        }

        Ok(AgentPackage {
            identity: manifest.identity(),
            manifest,
            owner_id: owner_id.to_string(),
            install_dir: final_dir,
            content_hash,
            env_dir: None,
            status: PackageStatus::Ready,
        })
    }

    /// Extract a zip archive into `dest`, rejecting escaping entries
    fn extract(&self, bytes: &[u8], dest: &Path) -> Result<()> {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
            .map_err(|e| FleetError::Package(format!("unreadable archive: {}", e)))?;

        let mut total_uncompressed: u64 = 0;

        for index in 0..archive.len() {
            let mut entry = archive
                .by_index(index)
                .map_err(|e| FleetError::Package(format!("corrupt archive entry: {}", e)))?;

            // Zip-slip check: the resolved path must stay inside `dest`.
            let relative = match entry.enclosed_name() {
                Some(path) => path.to_path_buf(),
                None => {
                    warn!("Rejecting archive entry {:?}: escapes root", entry.name());
                    return Err(FleetError::PathTraversal(entry.name().to_string()));
                }
            };

            total_uncompressed = total_uncompressed.saturating_add(entry.size());
            if total_uncompressed > self.max_bytes {
                return Err(FleetError::Package(format!(
                    "extracted size exceeds limit of {} bytes",
                    self.max_bytes
                )));
            }

            let target = dest.join(relative);
            if entry.is_dir() {
                std::fs::create_dir_all(&target)?;
            } else {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let mut out = std::fs::File::create(&target)?;
                std::io::copy(&mut entry, &mut out)?;
            }
        }

        Ok(())
    }
}

/// Hex-encoded SHA-256 of a byte slice
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();

    let mut out = String::with_capacity(64);
    for byte in digest {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MANIFEST: &str = "name: echo-agent\nversion: 1.0.0\nentrypoint: echo\n";

    fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            let options = zip::write::FileOptions::default();
            for (name, data) in entries {
                writer.start_file(*name, options).unwrap();
                writer.write_all(data).unwrap();
            }
            writer.finish().unwrap();
        }
        cursor.into_inner()
    }

    fn write_archive(dir: &Path, bytes: &[u8]) -> PathBuf {
        let path = dir.join("pkg.zip");
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn test_load_valid_package() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = build_zip(&[("agent.yaml", MANIFEST.as_bytes()), ("code.py", b"print()")]);
        let archive = write_archive(dir.path(), &bytes);

        let loader = PackageLoader::new(dir.path(), 16);
        let package = loader.load(&archive, "a1", None).unwrap();

        assert_eq!(package.identity, "echo-agent@1.0.0");
        assert_eq!(package.content_hash.len(), 64);
        assert!(package.install_dir.join("agent.yaml").exists());
        assert!(package.install_dir.join("code.py").exists());
        assert_eq!(package.status, PackageStatus::Ready);
    }

    #[test]
    fn test_zip_slip_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = build_zip(&[
            ("agent.yaml", MANIFEST.as_bytes()),
            ("../../evil.txt", b"bad"),
        ]);
        let archive = write_archive(dir.path(), &bytes);

        let loader = PackageLoader::new(dir.path(), 16);
        let err = loader.load(&archive, "a1", None).unwrap_err();
        assert_eq!(err.kind(), "path_traversal");

        // Nothing may be written outside the scratch directory.
        assert!(!dir.path().join("evil.txt").exists());
        assert!(!dir.path().parent().unwrap().join("evil.txt").exists());
    }

    #[test]
    fn test_missing_manifest_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = build_zip(&[("code.py", b"print()")]);
        let archive = write_archive(dir.path(), &bytes);

        let loader = PackageLoader::new(dir.path(), 16);
        let err = loader.load(&archive, "a1", None).unwrap_err();
        assert_eq!(err.kind(), "package_validation_error");
    }

    #[test]
    fn test_digest_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = build_zip(&[("agent.yaml", MANIFEST.as_bytes())]);
        let archive = write_archive(dir.path(), &bytes);

        let loader = PackageLoader::new(dir.path(), 16);
        let err = loader
            .load(&archive, "a1", Some(&"0".repeat(64)))
            .unwrap_err();
        assert_eq!(err.kind(), "digest_mismatch");
    }

    #[test]
    fn test_digest_match_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = build_zip(&[("agent.yaml", MANIFEST.as_bytes())]);
        let digest = sha256_hex(&bytes);
        let archive = write_archive(dir.path(), &bytes);

        let loader = PackageLoader::new(dir.path(), 16);
        assert!(loader.load(&archive, "a1", Some(&digest)).is_ok());
    }

    #[test]
    fn test_identical_content_reused() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = build_zip(&[("agent.yaml", MANIFEST.as_bytes())]);
        let archive = write_archive(dir.path(), &bytes);

        let loader = PackageLoader::new(dir.path(), 16);
        let first = loader.load(&archive, "a1", None).unwrap();
        let second = loader.load(&archive, "a1", None).unwrap();
        assert_eq!(first.install_dir, second.install_dir);
        assert_eq!(first.content_hash, second.content_hash);
    }

    #[test]
    fn test_oversized_extraction_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let big = vec![0u8; 2 * 1024 * 1024];
        let bytes = build_zip(&[("agent.yaml", MANIFEST.as_bytes()), ("blob.bin", &big)]);
        let archive = write_archive(dir.path(), &bytes);

        let loader = PackageLoader::new(dir.path(), 1);
        let err = loader.load(&archive, "a1", None).unwrap_err();
        assert_eq!(err.kind(), "package_error");
    }

    #[test]
    fn test_sha256_hex_known_value() {
        // SHA-256 of the empty string
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
