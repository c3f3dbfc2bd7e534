// src/runtime/lifecycle.rs
//! Worker lifecycle controller
//!
//! Drives a worker through boot, readiness, and drain:
//! `Init -> LoadingPackage -> StartingSurfaces -> WaitingReady -> Ready
//! -> Draining -> Stopped`, with `Failed` reachable from any pre-Ready
//! state. Readiness is a shared flag the HTTP health endpoint reads;
//! the router only routes to workers that have flipped it.

use crate::loader::env_builder::EnvBuilder;
use crate::loader::manifest::AgentManifest;
use crate::loader::package_loader::PackageLoader;
use crate::loader::registry::{AgentHandler, HandlerRegistry};
use crate::runtime::boot_metrics::BootMetrics;
use crate::runtime::http_surface::{effective_base_path, HttpSurface};
use crate::runtime::rpc_surface::{RpcRequest, RpcResponse, RpcSurface};
use crate::runtime::runtime_config::RuntimeConfig;
use crate::runtime::ui_surface::UiSurface;
use crate::utils::errors::{FleetError, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Per-attempt timeout for the self readiness probe
const PROBE_ATTEMPT_TIMEOUT: Duration = Duration::from_millis(250);

/// Overall readiness probe deadline
const PROBE_DEADLINE: Duration = Duration::from_secs(2);

/// Drain grace between unreadiness and surface teardown
const DRAIN_GRACE: Duration = Duration::from_secs(3);

/// Lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Init,
    LoadingPackage,
    StartingSurfaces,
    WaitingReady,
    Ready,
    Draining,
    Stopped,
    Failed,
}

/// Boot-budget evaluation outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootVerdict {
    Ok,
    Warn,
    Fatal,
}

/// Evaluate a finished boot against the soft budget and hard limit.
///
/// A multiplier of 0 disables the hard limit entirely.
pub fn boot_budget_verdict(total: Duration, budget_ms: u64, hard_mult: f64) -> BootVerdict {
    let total_ms = total.as_millis() as f64;
    let budget = budget_ms as f64;

    if hard_mult > 0.0 && total_ms > budget * hard_mult {
        BootVerdict::Fatal
    } else if total_ms > budget {
        BootVerdict::Warn
    } else {
        BootVerdict::Ok
    }
}

/// Drives one worker from boot to drain
pub struct RuntimeLifecycleController {
    config: RuntimeConfig,
    registry: HandlerRegistry,
    state: LifecycleState,
    ready: Arc<AtomicBool>,
    metrics: Arc<Mutex<BootMetrics>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    /// Downloaded/installed artifact removed on drain
    artifact: Option<PathBuf>,
}

impl RuntimeLifecycleController {
    pub fn new(config: RuntimeConfig, registry: HandlerRegistry) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            registry,
            state: LifecycleState::Init,
            ready: Arc::new(AtomicBool::new(false)),
            metrics: Arc::new(Mutex::new(BootMetrics::new())),
            shutdown_tx,
            shutdown_rx,
            artifact: None,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    fn transition(&mut self, next: LifecycleState) {
        info!("Lifecycle {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn begin_phase(&self, phase: &str) {
        if let Ok(mut metrics) = self.metrics.lock() {
            metrics.begin(phase);
        }
    }

    fn end_phase(&self, phase: &str) {
        if let Ok(mut metrics) = self.metrics.lock() {
            metrics.end(phase);
        }
    }

    /// Boot, serve until a stop signal, then drain
    pub async fn run(&mut self) -> Result<()> {
        match self.boot().await {
            Ok(()) => {}
            Err(e) => {
                self.transition(LifecycleState::Failed);
                return Err(e);
            }
        }

        wait_for_stop_signal().await;
        self.drain().await;
        Ok(())
    }

    async fn boot(&mut self) -> Result<()> {
        self.transition(LifecycleState::LoadingPackage);
        self.begin_phase("load_package");
        let (manifest, assets_root) = self.load_package().await?;
        self.end_phase("load_package");

        let handler_name = manifest
            .rpc
            .as_ref()
            .map(|rpc| rpc.handler.as_str())
            .unwrap_or(&manifest.entrypoint);
        let handler = self.registry.resolve(handler_name)?;

        self.transition(LifecycleState::StartingSurfaces);
        self.start_surfaces(&manifest, handler, assets_root).await?;

        self.transition(LifecycleState::WaitingReady);
        self.begin_phase("wait_ready");
        self.await_readiness().await?;
        self.end_phase("wait_ready");
        self.ready.store(true, Ordering::SeqCst);
        self.transition(LifecycleState::Ready);

        let total = self
            .metrics
            .lock()
            .map(|mut metrics| metrics.finalize())
            .unwrap_or_default();
        match boot_budget_verdict(total, self.config.boot_budget_ms, self.config.boot_hard_limit_mult)
        {
            BootVerdict::Ok => info!("Boot completed in {:?}", total),
            BootVerdict::Warn => warn!(
                "Boot took {:?}, over the {}ms budget",
                total, self.config.boot_budget_ms
            ),
            BootVerdict::Fatal => {
                return Err(FleetError::Runtime(format!(
                    "boot took {:?}, over the hard limit ({}ms x {})",
                    total, self.config.boot_budget_ms, self.config.boot_hard_limit_mult
                )));
            }
        }
        Ok(())
    }

    /// Load and validate the package artifact, if one was provided
    async fn load_package(&mut self) -> Result<(AgentManifest, Option<PathBuf>)> {
        let archive = match &self.config.package_path {
            Some(path) => path.clone(),
            None => {
                // Development mode: no package, built-in handler only.
                debug!("No package artifact; running built-in entrypoint");
                return Ok((
                    AgentManifest {
                        name: self.config.agent_id.clone(),
                        version: "0.0.0".to_string(),
                        entrypoint: "echo".to_string(),
                        rpc: None,
                        http: None,
                        ui: None,
                        dependencies: Vec::new(),
                    },
                    None,
                ));
            }
        };

        let root = std::env::temp_dir().join("agent-fleet");
        let loader = PackageLoader::new(&root, self.config.max_package_mb);
        let owner = self.config.agent_id.clone();
        let archive_for_task = archive.clone();

        // Extraction and hashing are blocking file work.
        let mut package = tokio::task::spawn_blocking(move || {
            loader.load(&archive_for_task, &owner, None)
        })
        .await
        .map_err(|e| FleetError::Runtime(format!("package load task failed: {}", e)))??;

        if !package.manifest.dependencies.is_empty() {
            let envs = EnvBuilder::new(root.join("envs"), None);
            package.env_dir = envs
                .ensure(&self.config.agent_id, &package.manifest.dependencies)
                .await?;
        }

        self.artifact = Some(archive);
        let assets_root = package
            .manifest
            .ui
            .as_ref()
            .map(|ui| package.install_dir.join(&ui.assets));
        info!("Loaded package {}", package.identity);
        Ok((package.manifest, assets_root))
    }

    async fn start_surfaces(
        &mut self,
        manifest: &AgentManifest,
        handler: Arc<dyn AgentHandler>,
        assets_root: Option<PathBuf>,
    ) -> Result<()> {
        self.begin_phase("start_rpc");
        let rpc = Arc::new(RpcSurface::new(
            self.config.agent_id.clone(),
            manifest.clone(),
            Arc::clone(&handler),
            Arc::clone(&self.ready),
        ));
        spawn_surface(rpc.serve(self.config.rpc_port, self.shutdown_rx.clone()), "rpc");
        wait_for_port(self.config.rpc_port).await?;
        self.end_phase("start_rpc");

        self.begin_phase("start_http");
        let multiplexed_ui = if self.config.ui_multiplexed() {
            assets_root.as_ref().map(|root| {
                let base = manifest
                    .ui
                    .as_ref()
                    .map(|ui| ui.base_path.clone())
                    .unwrap_or_else(|| "/ui".to_string());
                (base, root.clone())
            })
        } else {
            None
        };
        // Agent routes live under the configured base plus any mount
        // the manifest declares.
        let base_path = effective_base_path(
            &self.config.base_path,
            manifest.http.as_ref().map(|http| http.mount.as_str()),
        );
        let http = Arc::new(HttpSurface::new(
            self.config.agent_id.clone(),
            manifest.clone(),
            handler,
            Arc::clone(&self.ready),
            base_path,
            Arc::clone(&self.metrics),
            multiplexed_ui,
        ));
        spawn_surface(
            http.serve(self.config.http_port, self.shutdown_rx.clone()),
            "http",
        );
        wait_for_port(self.config.http_port).await?;
        self.end_phase("start_http");

        if let (Some(ui_port), Some(root), false) =
            (self.config.ui_port, assets_root, self.config.ui_multiplexed())
        {
            self.begin_phase("start_ui");
            let ui = Arc::new(UiSurface::new(root));
            spawn_surface(ui.serve(ui_port, self.shutdown_rx.clone()), "ui");
            wait_for_port(ui_port).await?;
            self.end_phase("start_ui");
        }

        Ok(())
    }

    /// Probe our own RPC health until it answers or the deadline passes
    async fn await_readiness(&self) -> Result<()> {
        let client: Client<_, Full<Bytes>> =
            Client::builder(TokioExecutor::new()).build_http();
        let uri = format!("http://127.0.0.1:{}/rpc", self.config.rpc_port);
        let deadline = Instant::now() + PROBE_DEADLINE;

        while Instant::now() < deadline {
            let probe = RpcRequest {
                id: ulid::Ulid::new().to_string(),
                method: "agent.health".to_string(),
                params: Value::Null,
            };
            let body = serde_json::to_vec(&probe).unwrap_or_default();
            let req = hyper::Request::builder()
                .method(hyper::Method::POST)
                .uri(&uri)
                .header("content-type", "application/json")
                .body(Full::new(Bytes::from(body)))
                .map_err(|e| FleetError::Runtime(e.to_string()))?;

            let attempt = tokio::time::timeout(PROBE_ATTEMPT_TIMEOUT, client.request(req)).await;
            if let Ok(Ok(response)) = attempt {
                if let Ok(collected) = response.into_body().collect().await {
                    let bytes = collected.to_bytes();
                    if let Ok(parsed) = serde_json::from_slice::<RpcResponse>(&bytes) {
                        if parsed.success {
                            return Ok(());
                        }
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        Err(FleetError::Timeout(PROBE_DEADLINE))
    }

    /// Ordered, best-effort teardown; no step aborts the rest
    pub async fn drain(&mut self) {
        self.transition(LifecycleState::Draining);

        // Unready first so the router stops sending traffic, then let
        // in-flight work finish before tearing surfaces down.
        self.ready.store(false, Ordering::SeqCst);
        tokio::time::sleep(DRAIN_GRACE).await;

        if self.shutdown_tx.send(true).is_err() {
            warn!("No surfaces listening for shutdown");
        }

        if let Some(artifact) = self.artifact.take() {
            match std::fs::remove_file(&artifact) {
                Ok(()) => debug!("Removed package artifact {:?}", artifact),
                Err(e) => warn!("Failed to remove artifact {:?}: {}", artifact, e),
            }
        }

        self.transition(LifecycleState::Stopped);
    }
}

fn spawn_surface(
    future: impl std::future::Future<Output = Result<()>> + Send + 'static,
    name: &'static str,
) {
    tokio::spawn(async move {
        if let Err(e) = future.await {
            error!("{} surface exited with error: {}", name, e);
        }
    });
}

/// Wait until a local port accepts connections
async fn wait_for_port(port: u16) -> Result<()> {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    Err(FleetError::Runtime(format!(
        "surface on port {} never started listening",
        port
    )))
}

/// Resolve on SIGTERM or ctrl-c
async fn wait_for_stop_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = term.recv() => info!("Received SIGTERM"),
        _ = tokio::signal::ctrl_c() => info!("Received interrupt"),
    }
}
