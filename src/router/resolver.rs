// src/router/resolver.rs
//! Deployment endpoint resolution
//!
//! Maps a deployment identifier to a live worker endpoint. Resolution
//! order: local route table (with a fast TCP reachability probe), then
//! an external deployment registry, then a static fallback endpoint.
//! Results are never cached across calls; redeploys replace endpoints.

use crate::utils::errors::{FleetError, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tracing::debug;

/// Reachability probe connect timeout
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// A worker network endpoint for one deployment
#[derive(Debug, Clone, Serialize)]
pub struct RouteEntry {
    /// Deployment identifier (the routing key)
    pub deployment_id: String,

    /// Worker host
    pub host: String,

    /// Worker HTTP surface port
    pub http_port: u16,

    /// Worker RPC surface port
    pub rpc_port: u16,

    /// Whether the worker has flipped ready
    pub ready: bool,
}

impl RouteEntry {
    pub fn rpc_addr(&self) -> String {
        format!("{}:{}", self.host, self.rpc_port)
    }

    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.host, self.http_port)
    }
}

/// Shared deployment -> endpoint table.
///
/// At most one authoritative entry per identifier; inserts replace
/// stale entries outright rather than merging.
#[derive(Clone, Default)]
pub struct RouteTable {
    inner: Arc<RwLock<HashMap<String, RouteEntry>>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, entry: RouteEntry) {
        let mut inner = self.inner.write().await;
        debug!(
            "Route {} -> {}:{} (rpc {})",
            entry.deployment_id, entry.host, entry.http_port, entry.rpc_port
        );
        inner.insert(entry.deployment_id.clone(), entry);
    }

    pub async fn remove(&self, deployment_id: &str) {
        self.inner.write().await.remove(deployment_id);
    }

    /// Publish a readiness change for an existing entry
    pub async fn set_ready(&self, deployment_id: &str, ready: bool) {
        if let Some(entry) = self.inner.write().await.get_mut(deployment_id) {
            entry.ready = ready;
        }
    }

    pub async fn get(&self, deployment_id: &str) -> Option<RouteEntry> {
        self.inner.read().await.get(deployment_id).cloned()
    }

    pub async fn all(&self) -> Vec<RouteEntry> {
        self.inner.read().await.values().cloned().collect()
    }
}

/// External deployment registry (cloud service registry, etcd, ...)
#[async_trait]
pub trait DeploymentRegistry: Send + Sync {
    async fn lookup(&self, deployment_id: &str) -> Option<RouteEntry>;
}

/// Resolves deployment identifiers to reachable worker endpoints
pub struct Resolver {
    table: RouteTable,
    registry: Option<Arc<dyn DeploymentRegistry>>,
    fallback: Option<RouteEntry>,
    probe_timeout: Duration,
}

impl Resolver {
    pub fn new(
        table: RouteTable,
        registry: Option<Arc<dyn DeploymentRegistry>>,
        fallback: Option<RouteEntry>,
    ) -> Self {
        Self {
            table,
            registry,
            fallback,
            probe_timeout: PROBE_TIMEOUT,
        }
    }

    /// Shorten the probe timeout (tests)
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Resolve a deployment id to a worker endpoint.
    ///
    /// `DeploymentNotFound` when nothing knows the id at all;
    /// `NoAgentAvailable` when the id is known but no endpoint is
    /// currently reachable.
    pub async fn resolve(&self, deployment_id: &str) -> Result<RouteEntry> {
        let mut known = false;

        if let Some(entry) = self.table.get(deployment_id).await {
            known = true;
            if entry.ready && self.probe(&entry).await {
                return Ok(entry);
            }
            debug!("Local endpoint for {} not reachable", deployment_id);
        }

        if let Some(registry) = &self.registry {
            if let Some(entry) = registry.lookup(deployment_id).await {
                return Ok(entry);
            }
        }

        if let Some(fallback) = &self.fallback {
            let mut entry = fallback.clone();
            entry.deployment_id = deployment_id.to_string();
            return Ok(entry);
        }

        if known {
            Err(FleetError::NoAgentAvailable(deployment_id.to_string()))
        } else {
            Err(FleetError::DeploymentNotFound(deployment_id.to_string()))
        }
    }

    /// Fast TCP reachability check against the worker's RPC port
    async fn probe(&self, entry: &RouteEntry) -> bool {
        tokio::time::timeout(self.probe_timeout, TcpStream::connect(entry.rpc_addr()))
            .await
            .map(|conn| conn.is_ok())
            .unwrap_or(false)
    }
}

/// Parse a `host:port` fallback endpoint into a route entry
pub fn fallback_entry(endpoint: &str) -> Option<RouteEntry> {
    let (host, port) = endpoint.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    Some(RouteEntry {
        deployment_id: String::new(),
        host: host.to_string(),
        http_port: port,
        rpc_port: port,
        ready: true,
    })
}
