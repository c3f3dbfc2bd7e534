// src/supervisor/process_manager.rs
//! Worker process supervision
//!
//! Owns the process-record and port tables, spawns worker processes,
//! monitors liveness, and restarts crashed workers per policy with
//! exponential backoff. All table mutations happen behind a single
//! mutex owned here; status queries take snapshot copies.

use crate::router::resolver::{RouteEntry, RouteTable};
use crate::supervisor::log_aggregator::{LogAggregator, LogLevel};
use crate::supervisor::port_allocator::PortAllocator;
use crate::supervisor::resource_manager::{ResourceLimits, ResourceManager, ResourceUsage};
use crate::utils::errors::{FleetError, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body_util::Full;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Readiness health-probe timeout
pub const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Lifecycle state of a supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
    Failed,
}

impl ProcessState {
    /// States that count as live for duplicate-spawn checks
    pub fn is_live(self) -> bool {
        matches!(
            self,
            ProcessState::Starting | ProcessState::Running | ProcessState::Stopping
        )
    }
}

/// Restart policy kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicyKind {
    Never,
    Always,
    OnFailure,
}

/// Rules governing automatic relaunch of a crashed worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartPolicy {
    pub kind: RestartPolicyKind,
    pub max_restarts: u32,
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            kind: RestartPolicyKind::OnFailure,
            max_restarts: 3,
            base_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 60_000,
        }
    }
}

impl RestartPolicy {
    /// Backoff delay before restart number `restart_count + 1`.
    ///
    /// Computed from the count of restarts already performed, so the
    /// first restart waits exactly `base_delay_ms`.
    pub fn delay_for(&self, restart_count: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(restart_count as i32);
        let ms = (self.base_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(ms as u64)
    }

    /// Whether a crash with `exit_code` warrants another restart
    pub fn should_restart(&self, exit_code: Option<i32>, restart_count: u32) -> bool {
        if restart_count >= self.max_restarts {
            return false;
        }
        match self.kind {
            RestartPolicyKind::Never => false,
            RestartPolicyKind::Always => true,
            // Killed-by-signal (no exit code) counts as failure.
            RestartPolicyKind::OnFailure => exit_code != Some(0),
        }
    }
}

/// Request to spawn a worker for an agent package
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnSpec {
    pub agent_id: String,
    pub package_id: String,
    pub package_path: PathBuf,

    /// Deployment identifier used as the routing key; defaults to the
    /// agent id
    #[serde(default)]
    pub deployment_id: Option<String>,

    /// Extra environment variables for the worker
    #[serde(default)]
    pub env: Vec<(String, String)>,

    #[serde(default)]
    pub restart_policy: RestartPolicy,

    #[serde(default)]
    pub limits: Option<ResourceLimits>,
}

impl SpawnSpec {
    /// Derived process identifier
    pub fn process_id(&self) -> String {
        format!("{}-{}", self.agent_id, self.package_id)
    }

    /// Routing key this worker serves
    pub fn deployment_key(&self) -> String {
        self.deployment_id
            .clone()
            .unwrap_or_else(|| self.agent_id.clone())
    }
}

/// Record of one supervised process
#[derive(Debug, Clone, Serialize)]
pub struct ProcessRecord {
    pub id: String,
    pub agent_id: String,
    pub package_id: String,
    pub deployment_key: String,
    pub http_port: u16,
    pub rpc_port: u16,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub restart_count: u32,
    pub last_restart_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub last_error: Option<String>,

    #[serde(skip_serializing)]
    pub spec: SpawnSpec,
}

/// Snapshot returned by status queries
#[derive(Debug, Clone, Serialize)]
pub struct ProcessSnapshot {
    #[serde(flatten)]
    pub record: ProcessRecord,
    pub usage: Option<ResourceUsage>,
}

/// Process manager configuration
#[derive(Debug, Clone)]
pub struct ProcessManagerConfig {
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub monitor_interval: Duration,
    pub stop_timeout: Duration,
    pub worker_program: String,
    pub worker_args: Vec<String>,
    pub control_plane_url: String,
}

impl Default for ProcessManagerConfig {
    fn default() -> Self {
        Self {
            port_range_start: 30000,
            port_range_end: 30999,
            monitor_interval: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(10),
            worker_program: "fleet-worker".to_string(),
            worker_args: Vec::new(),
            control_plane_url: "http://127.0.0.1:7070".to_string(),
        }
    }
}

struct Inner {
    records: HashMap<String, ProcessRecord>,
    children: HashMap<String, Child>,
    ports: PortAllocator,
}

/// Supervisor core: spawn, stop, monitor, restart
pub struct ProcessManager {
    inner: Mutex<Inner>,
    logs: Arc<LogAggregator>,
    resources: ResourceManager,
    routes: RouteTable,
    client: Client<HttpConnector, Full<Bytes>>,
    config: ProcessManagerConfig,
}

impl ProcessManager {
    pub fn new(config: ProcessManagerConfig, logs: Arc<LogAggregator>, routes: RouteTable) -> Self {
        let ports = PortAllocator::new(config.port_range_start, config.port_range_end);
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self {
            inner: Mutex::new(Inner {
                records: HashMap::new(),
                children: HashMap::new(),
                ports,
            }),
            logs,
            resources: ResourceManager::new(),
            routes,
            client,
            config,
        }
    }

    /// Spawn a fresh worker for `spec`
    pub async fn spawn(&self, spec: SpawnSpec) -> Result<ProcessRecord> {
        self.spawn_with_history(spec, 0, None).await
    }

    /// Spawn carrying restart history forward from a crashed predecessor
    async fn spawn_with_history(
        &self,
        spec: SpawnSpec,
        restart_count: u32,
        last_restart_at: Option<DateTime<Utc>>,
    ) -> Result<ProcessRecord> {
        let id = spec.process_id();

        let (http_port, rpc_port) = {
            let mut inner = self.inner.lock().await;

            if let Some(existing) = inner.records.get(&id) {
                if existing.state.is_live() {
                    return Err(FleetError::AlreadyRunning(id));
                }
            }

            let http_port = inner.ports.allocate(&id)?;
            let rpc_port = match inner.ports.allocate(&id) {
                Ok(port) => port,
                Err(e) => {
                    inner.ports.release(http_port);
                    return Err(e);
                }
            };

            // Record exists from the moment ports are held, so status
            // and duplicate-spawn checks see the launch in flight.
            inner.records.insert(
                id.clone(),
                ProcessRecord {
                    id: id.clone(),
                    agent_id: spec.agent_id.clone(),
                    package_id: spec.package_id.clone(),
                    deployment_key: spec.deployment_key(),
                    http_port,
                    rpc_port,
                    state: ProcessState::Starting,
                    pid: None,
                    started_at: Utc::now(),
                    stopped_at: None,
                    restart_count,
                    last_restart_at,
                    exit_code: None,
                    last_error: None,
                    spec: spec.clone(),
                },
            );
            (http_port, rpc_port)
        };

        debug!("Spawning worker {} on ports {}/{}", id, http_port, rpc_port);

        let mut command = Command::new(&self.config.worker_program);
        command
            .args(&self.config.worker_args)
            .env("FLEET_AGENT_ID", &spec.agent_id)
            .env("FLEET_PACKAGE_ID", &spec.package_id)
            .env("FLEET_PACKAGE_PATH", &spec.package_path)
            .env("FLEET_HTTP_PORT", http_port.to_string())
            .env("FLEET_RPC_PORT", rpc_port.to_string())
            .env("FLEET_DEPLOYMENT_ID", spec.deployment_key())
            .env("FLEET_CONTROL_PLANE_URL", &self.config.control_plane_url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        for (key, value) in &spec.env {
            command.env(key, value);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let message = format!("{}: {}", id, e);
                let mut inner = self.inner.lock().await;
                inner.ports.release_owner(&id);
                if let Some(record) = inner.records.get_mut(&id) {
                    record.state = ProcessState::Failed;
                    record.last_error = Some(message.clone());
                }
                return Err(FleetError::SpawnFailed(message));
            }
        };

        let pid = child.id();
        self.logs
            .attach(&id, child.stdout.take(), child.stderr.take())
            .await;

        if let (Some(pid), Some(limits)) = (pid, &spec.limits) {
            if let Err(e) = self.resources.apply(pid, limits) {
                warn!("Resource limits for {} not applied: {}", id, e);
            }
        }

        let record = {
            let mut inner = self.inner.lock().await;
            inner.children.insert(id.clone(), child);
            match inner.records.get_mut(&id) {
                Some(record) => {
                    record.state = ProcessState::Running;
                    record.pid = pid;
                    record.clone()
                }
                None => return Err(FleetError::Runtime(format!("record vanished for {}", id))),
            }
        };

        // Published unready; the monitor's health probe flips readiness
        // once the worker actually reports healthy.
        self.routes
            .insert(RouteEntry {
                deployment_id: record.deployment_key.clone(),
                host: "127.0.0.1".to_string(),
                http_port,
                rpc_port,
                ready: false,
            })
            .await;

        info!("Worker {} running (pid {:?})", id, pid);
        Ok(record)
    }

    /// One readiness pass: probe each running worker's health endpoint
    /// and publish the outcome to the route table
    pub async fn probe_readiness(&self) {
        let targets: Vec<(String, String, u16)> = {
            let inner = self.inner.lock().await;
            inner
                .records
                .values()
                .filter(|record| record.state == ProcessState::Running)
                .map(|record| {
                    (
                        record.id.clone(),
                        record.deployment_key.clone(),
                        record.http_port,
                    )
                })
                .collect()
        };

        for (id, deployment_key, http_port) in targets {
            let healthy = self.health_ok(http_port).await;
            if let Some(entry) = self.routes.get(&deployment_key).await {
                if entry.ready != healthy {
                    info!("Worker {} readiness -> {}", id, healthy);
                }
            }
            self.routes.set_ready(&deployment_key, healthy).await;
        }
    }

    /// GET the worker's health endpoint; only a 200 counts as ready
    async fn health_ok(&self, http_port: u16) -> bool {
        let uri = format!("http://127.0.0.1:{}/health", http_port);
        let req = match hyper::Request::builder()
            .uri(uri)
            .body(Full::new(Bytes::new()))
        {
            Ok(req) => req,
            Err(_) => return false,
        };

        match tokio::time::timeout(HEALTH_PROBE_TIMEOUT, self.client.request(req)).await {
            Ok(Ok(response)) => response.status() == hyper::StatusCode::OK,
            _ => false,
        }
    }

    /// Stop a worker gracefully, force-killing after `timeout`.
    ///
    /// Idempotent: unknown or already-stopped ids are a no-op. Ports and
    /// log buffers are released only after the OS process has exited.
    pub async fn stop(&self, id: &str, timeout: Duration) -> Result<()> {
        let (child, deployment_key, pid) = {
            let mut inner = self.inner.lock().await;
            let record = match inner.records.get_mut(id) {
                Some(record) => record,
                None => return Ok(()),
            };
            if !record.state.is_live() {
                return Ok(());
            }
            record.state = ProcessState::Stopping;
            let deployment_key = record.deployment_key.clone();
            let pid = record.pid;
            (inner.children.remove(id), deployment_key, pid)
        };

        let mut exit_code = None;
        if let Some(mut child) = child {
            if let Some(pid) = child.id() {
                terminate(pid);
            }

            match tokio::time::timeout(timeout, child.wait()).await {
                Ok(Ok(status)) => {
                    exit_code = status.code();
                    debug!("Worker {} exited with {:?}", id, status);
                }
                Ok(Err(e)) => warn!("Error waiting for {}: {}", id, e),
                Err(_) => {
                    warn!("Worker {} did not exit in {:?}, killing", id, timeout);
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                }
            }
        }

        {
            let mut inner = self.inner.lock().await;
            if let Some(record) = inner.records.get_mut(id) {
                record.state = ProcessState::Stopped;
                record.stopped_at = Some(Utc::now());
                record.exit_code = exit_code;
                record.pid = None;
            }
            inner.ports.release_owner(id);
        }

        self.routes.remove(&deployment_key).await;
        self.logs.evict(id).await;
        if let Some(pid) = pid {
            self.resources.cleanup(pid);
        }

        info!("Worker {} stopped", id);
        Ok(())
    }

    /// Stop then relaunch a worker with its original spec.
    ///
    /// Operator-initiated; resets the restart history.
    pub async fn restart(&self, id: &str) -> Result<ProcessRecord> {
        let spec = {
            let inner = self.inner.lock().await;
            inner
                .records
                .get(id)
                .map(|record| record.spec.clone())
                .ok_or_else(|| FleetError::DeploymentNotFound(id.to_string()))?
        };

        self.stop(id, self.config.stop_timeout).await?;
        self.spawn(spec).await
    }

    /// Launch the background monitor loop
    pub fn start_monitor(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.config.monitor_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                manager.poll_exits().await;
                manager.probe_readiness().await;
            }
        })
    }

    /// One monitor pass: reap exited workers and apply restart policy
    pub async fn poll_exits(self: &Arc<Self>) {
        let exited: Vec<(String, Option<i32>)> = {
            let mut inner = self.inner.lock().await;
            let mut exited = Vec::new();

            for (id, child) in inner.children.iter_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    exited.push((id.clone(), status.code()));
                }
            }

            for (id, code) in &exited {
                inner.children.remove(id);
                inner.ports.release_owner(id);
                if let Some(record) = inner.records.get_mut(id) {
                    record.state = ProcessState::Crashed;
                    record.exit_code = *code;
                    record.stopped_at = Some(Utc::now());
                    record.pid = None;
                }
            }

            exited
        };

        for (id, code) in exited {
            self.handle_crash(&id, code).await;
        }
    }

    /// Evaluate the restart policy for a crashed worker
    async fn handle_crash(self: &Arc<Self>, id: &str, exit_code: Option<i32>) {
        let (spec, restart_count, deployment_key, pid) = {
            let inner = self.inner.lock().await;
            match inner.records.get(id) {
                Some(record) => (
                    record.spec.clone(),
                    record.restart_count,
                    record.deployment_key.clone(),
                    record.pid,
                ),
                None => return,
            }
        };

        warn!("Worker {} crashed with exit code {:?}", id, exit_code);
        self.routes.remove(&deployment_key).await;
        if let Some(pid) = pid {
            self.resources.cleanup(pid);
        }

        let policy = spec.restart_policy.clone();
        if policy.should_restart(exit_code, restart_count) {
            // Delay derives from restarts already performed, so the
            // sequence is base, base*m, base*m^2, ... capped.
            let delay = policy.delay_for(restart_count);
            info!(
                "Restarting {} in {:?} (attempt {}/{})",
                id,
                delay,
                restart_count + 1,
                policy.max_restarts
            );
            self.logs
                .append(
                    id,
                    LogLevel::Warn,
                    format!(
                        "crashed with exit code {:?}; restart {}/{} in {:?}",
                        exit_code,
                        restart_count + 1,
                        policy.max_restarts,
                        delay
                    ),
                )
                .await;

            let manager = Arc::clone(self);
            let id = id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                match manager
                    .spawn_with_history(spec, restart_count + 1, Some(Utc::now()))
                    .await
                {
                    Ok(_) => debug!("Worker {} restarted", id),
                    Err(e) => error!("Restart of {} failed: {}", id, e),
                }
            });
        } else {
            let exhausted = restart_count >= policy.max_restarts
                && !matches!(policy.kind, RestartPolicyKind::Never);

            if exhausted {
                let err = FleetError::RestartExhausted {
                    id: id.to_string(),
                    restarts: restart_count,
                };
                error!("{}; operator action required", err);
                let mut inner = self.inner.lock().await;
                if let Some(record) = inner.records.get_mut(id) {
                    record.state = ProcessState::Failed;
                    record.last_error = Some(err.to_string());
                }
            } else {
                debug!("Worker {} not restarted per policy", id);
            }

            self.logs.evict(id).await;
        }
    }

    /// Snapshot of all process records with live resource usage
    pub async fn status(&self) -> Vec<ProcessSnapshot> {
        let records: Vec<ProcessRecord> = {
            let inner = self.inner.lock().await;
            inner.records.values().cloned().collect()
        };

        records
            .into_iter()
            .map(|record| {
                let usage = match (record.state, record.pid) {
                    (ProcessState::Running, Some(pid)) => self.resources.usage(pid),
                    _ => None,
                };
                ProcessSnapshot { record, usage }
            })
            .collect()
    }

    /// Snapshot of a single record
    pub async fn record(&self, id: &str) -> Option<ProcessRecord> {
        let inner = self.inner.lock().await;
        inner.records.get(id).cloned()
    }

    /// Number of ports currently held (tests, diagnostics)
    pub async fn allocated_ports(&self) -> usize {
        self.inner.lock().await.ports.allocated_count()
    }

    /// Graceful stop timeout from configuration
    pub fn stop_timeout(&self) -> Duration {
        self.config.stop_timeout
    }
}

/// Send SIGTERM to a PID
fn terminate(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    debug!("Sending SIGTERM to PID {}", pid);
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        warn!("Failed to send SIGTERM to {}: {}", pid, e);
    }
}
