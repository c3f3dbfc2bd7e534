// src/loader/mod.rs
//! Secure package loading
//!
//! This module materializes agent packages into isolated, content-addressed
//! execution environments:
//!
//! - **Manifest**: `agent.yaml` parsing and validation
//! - **Package Loader**: archive extraction with zip-slip rejection and
//!   SHA-256 verification
//! - **Env Builder**: per-owner dependency environments with hash-keyed reuse
//! - **Registry**: static handler registration replacing dynamic import

pub mod env_builder;
pub mod manifest;
pub mod package_loader;
pub mod registry;

pub use env_builder::EnvBuilder;
pub use manifest::{AgentManifest, HttpEntry, RpcEntry, UiEntry};
pub use package_loader::{AgentPackage, PackageLoader, PackageStatus};
pub use registry::{AgentHandler, HandlerRegistry};
