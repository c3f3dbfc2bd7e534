// src/utils/errors.rs
//! Error types for the fleet runtime
//!
//! A single error enum covers the whole taxonomy: configuration,
//! package loading, process supervision, routing, and shutdown.
//! Callers of the control API and RPC surfaces always see a stable
//! `kind` string plus a human-readable message, never a stack trace.

use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, FleetError>;

/// Fleet runtime errors
#[derive(Debug, Error)]
pub enum FleetError {
    /// Invalid or missing configuration; fatal at startup, never retried
    #[error("configuration error: {0}")]
    Config(String),

    /// Package manifest missing or malformed
    #[error("package validation failed: {0}")]
    PackageValidation(String),

    /// Archive entry resolves outside the extraction root (zip-slip)
    #[error("package entry escapes extraction root: {0}")]
    PathTraversal(String),

    /// Reference digest does not match the downloaded content
    #[error("package digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// Generic package load/install failure
    #[error("package error: {0}")]
    Package(String),

    /// Port pool exhausted
    #[error("no ports available in range {start}-{end}")]
    NoPortsAvailable { start: u16, end: u16 },

    /// A live process already exists for this id
    #[error("process already running: {0}")]
    AlreadyRunning(String),

    /// OS-level spawn failure
    #[error("failed to spawn process: {0}")]
    SpawnFailed(String),

    /// Restart policy spent; record parked in `failed`
    #[error("restart policy exhausted for {id} after {restarts} restarts")]
    RestartExhausted { id: String, restarts: u32 },

    /// No routing key found in request metadata
    #[error("missing routing key in request metadata")]
    MissingRoutingKey,

    /// Routing key resolved to no known deployment
    #[error("deployment not found: {0}")]
    DeploymentNotFound(String),

    /// No worker endpoint could be resolved for the deployment
    #[error("no agent available for deployment {0}")]
    NoAgentAvailable(String),

    /// Worker endpoint resolved but could not be reached
    #[error("worker unreachable: {0}")]
    Unreachable(String),

    /// A bounded call exceeded its deadline
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// Best-effort shutdown step failed; never blocks remaining steps
    #[error("shutdown step failed: {0}")]
    Shutdown(String),

    /// Internal runtime failure
    #[error("runtime error: {0}")]
    Runtime(String),

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FleetError {
    /// Stable machine-readable kind, used in structured API error bodies
    pub fn kind(&self) -> &'static str {
        match self {
            FleetError::Config(_) => "configuration_error",
            FleetError::PackageValidation(_) => "package_validation_error",
            FleetError::PathTraversal(_) => "path_traversal",
            FleetError::DigestMismatch { .. } => "digest_mismatch",
            FleetError::Package(_) => "package_error",
            FleetError::NoPortsAvailable { .. } => "no_ports_available",
            FleetError::AlreadyRunning(_) => "already_running",
            FleetError::SpawnFailed(_) => "spawn_failed",
            FleetError::RestartExhausted { .. } => "restart_exhausted",
            FleetError::MissingRoutingKey => "missing_routing_key",
            FleetError::DeploymentNotFound(_) => "deployment_not_found",
            FleetError::NoAgentAvailable(_) => "no_agent_available",
            FleetError::Unreachable(_) => "worker_unreachable",
            FleetError::Timeout(_) => "timeout",
            FleetError::Shutdown(_) => "shutdown_error",
            FleetError::Runtime(_) => "runtime_error",
            FleetError::Io(_) => "io_error",
        }
    }

    /// HTTP status code for control API responses
    pub fn http_status(&self) -> u16 {
        match self {
            FleetError::Config(_)
            | FleetError::PackageValidation(_)
            | FleetError::PathTraversal(_)
            | FleetError::DigestMismatch { .. }
            | FleetError::MissingRoutingKey => 400,
            FleetError::DeploymentNotFound(_) => 404,
            FleetError::AlreadyRunning(_) => 409,
            FleetError::NoPortsAvailable { .. } | FleetError::NoAgentAvailable(_) => 503,
            FleetError::Unreachable(_) => 503,
            FleetError::Timeout(_) => 504,
            _ => 500,
        }
    }

    /// Structured JSON body for HTTP/RPC callers
    pub fn to_body(&self) -> serde_json::Value {
        serde_json::json!({
            "error": {
                "kind": self.kind(),
                "message": self.to_string(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_is_stable() {
        assert_eq!(FleetError::MissingRoutingKey.kind(), "missing_routing_key");
        assert_eq!(
            FleetError::NoPortsAvailable { start: 1, end: 2 }.kind(),
            "no_ports_available"
        );
    }

    #[test]
    fn test_structured_body() {
        let err = FleetError::DeploymentNotFound("a1".into());
        let body = err.to_body();
        assert_eq!(body["error"]["kind"], "deployment_not_found");
        assert!(body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("a1"));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: FleetError = io.into();
        assert_eq!(err.kind(), "io_error");
    }
}
