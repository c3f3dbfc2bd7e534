// src/runtime/http_surface.rs
//! Worker HTTP surface
//!
//! Serves `GET /health` (gated on readiness), `GET /meta`, agent
//! routes under the configured base path, and, when multiplexed, UI
//! assets. Health returns 503 until the lifecycle controller flips the
//! readiness flag, so the router never sends traffic to a booting
//! worker.

use crate::loader::manifest::AgentManifest;
use crate::loader::registry::AgentHandler;
use crate::runtime::boot_metrics::BootMetrics;
use crate::runtime::ui_surface;
use crate::utils::errors::Result;
use bytes::Bytes;
use chrono::Utc;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// The worker's HTTP endpoint
pub struct HttpSurface {
    agent_id: String,
    manifest: AgentManifest,
    handler: Arc<dyn AgentHandler>,
    ready: Arc<AtomicBool>,
    base_path: String,
    metrics: Arc<Mutex<BootMetrics>>,

    /// Asset root when the UI is multiplexed onto this surface
    ui_assets: Option<(String, PathBuf)>,
}

impl HttpSurface {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agent_id: String,
        manifest: AgentManifest,
        handler: Arc<dyn AgentHandler>,
        ready: Arc<AtomicBool>,
        base_path: String,
        metrics: Arc<Mutex<BootMetrics>>,
        ui_assets: Option<(String, PathBuf)>,
    ) -> Self {
        Self {
            agent_id,
            manifest,
            handler,
            ready,
            base_path,
            metrics,
            ui_assets,
        }
    }

    /// Serve until `shutdown` flips true
    pub async fn serve(
        self: Arc<Self>,
        port: u16,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        info!("HTTP surface listening on port {}", port);

        loop {
            let (stream, _) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = shutdown.changed() => {
                    info!("HTTP surface shutting down");
                    return Ok(());
                }
            };

            let surface = Arc::clone(&self);
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let surface = Arc::clone(&surface);
                    async move { Ok::<_, std::convert::Infallible>(surface.handle(req).await) }
                });
                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    error!("HTTP connection error: {}", e);
                }
            });
        }
    }

    /// Dispatch one request
    pub async fn handle<B>(&self, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body + Send,
        B::Data: Send,
        B::Error: std::fmt::Display,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        debug!("HTTP {} {}", method, path);

        if method == Method::GET && path == "/health" {
            return self.handle_health();
        }
        if method == Method::GET && path == "/meta" {
            return self.handle_meta();
        }

        if let Some((ui_base, assets_root)) = &self.ui_assets {
            if let Some(asset_path) = strip_base(&path, ui_base) {
                return ui_surface::serve_asset(assets_root, asset_path).await;
            }
        }

        if let Some(action_path) = strip_base(&path, &self.base_path) {
            return self.handle_agent_route(action_path, req).await;
        }

        json_response(
            StatusCode::NOT_FOUND,
            json!({"error": {"kind": "not_found", "message": format!("no route: {}", path)}}),
        )
    }

    fn handle_health(&self) -> Response<Full<Bytes>> {
        let ready = self.ready.load(Ordering::SeqCst);
        let mut surfaces = vec!["rpc", "http"];
        if self.ui_assets.is_some() {
            surfaces.push("ui");
        }

        let body = json!({
            "ok": ready,
            "agent_id": self.agent_id,
            "surfaces": surfaces,
            "timestamp": Utc::now(),
        });
        let status = if ready {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };
        json_response(status, body)
    }

    fn handle_meta(&self) -> Response<Full<Bytes>> {
        let boot = self
            .metrics
            .lock()
            .map(|metrics| metrics.to_json())
            .unwrap_or(Value::Null);
        json_response(
            StatusCode::OK,
            json!({
                "agent_id": self.agent_id,
                "package": self.manifest.identity(),
                "manifest": self.manifest,
                "boot": boot,
                "runtime_version": env!("CARGO_PKG_VERSION"),
            }),
        )
    }

    /// Route `{base_path}/{action}` to the agent handler; the request
    /// body (JSON, possibly empty) becomes the payload
    async fn handle_agent_route<B>(&self, action_path: &str, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body + Send,
        B::Data: Send,
        B::Error: std::fmt::Display,
    {
        let action = action_path.trim_matches('/').to_string();
        if action.is_empty() {
            return json_response(
                StatusCode::BAD_REQUEST,
                json!({"error": {"kind": "invalid_params", "message": "missing action segment"}}),
            );
        }

        let bytes = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                return json_response(
                    StatusCode::BAD_REQUEST,
                    json!({"error": {"kind": "invalid_params", "message": e.to_string()}}),
                )
            }
        };
        let payload = if bytes.is_empty() {
            Value::Null
        } else {
            match serde_json::from_slice(&bytes) {
                Ok(payload) => payload,
                Err(e) => {
                    return json_response(
                        StatusCode::BAD_REQUEST,
                        json!({"error": {"kind": "invalid_params", "message": e.to_string()}}),
                    )
                }
            }
        };

        match self.handler.invoke(&action, payload).await {
            Ok(result) => json_response(StatusCode::OK, result),
            Err(e) => {
                let status = StatusCode::from_u16(e.http_status())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                json_response(status, e.to_body())
            }
        }
    }
}

/// Combine the configured base path with a manifest-declared mount.
///
/// The mount nests under the base (`/api` + `tools` -> `/api/tools`);
/// an empty or slash-only mount leaves the base unchanged.
pub fn effective_base_path(base: &str, mount: Option<&str>) -> String {
    let base = base.trim_end_matches('/');
    let mount = mount.unwrap_or("").trim_matches('/');
    if mount.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, mount)
    }
}

/// Strip a mount prefix from a path, respecting segment boundaries
fn strip_base<'a>(path: &'a str, base: &str) -> Option<&'a str> {
    let rest = path.strip_prefix(base)?;
    if rest.is_empty() {
        return Some("/");
    }
    rest.starts_with('/').then_some(rest)
}

fn json_response(status: StatusCode, value: Value) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(&value).unwrap_or_default();
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::registry::EchoHandler;

    fn surface(ready: bool) -> HttpSurface {
        let manifest = AgentManifest::from_yaml(
            "name: echo-agent\nversion: 1.0.0\nentrypoint: echo\n",
        )
        .unwrap();
        HttpSurface::new(
            "a1".to_string(),
            manifest,
            Arc::new(EchoHandler),
            Arc::new(AtomicBool::new(ready)),
            "/api".to_string(),
            Arc::new(Mutex::new(BootMetrics::new())),
            None,
        )
    }

    fn request(method: Method, uri: &str, body: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap()
    }

    async fn body_json(response: Response<Full<Bytes>>) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_effective_base_path() {
        assert_eq!(effective_base_path("/api", Some("tools")), "/api/tools");
        assert_eq!(effective_base_path("/api", Some("/tools/")), "/api/tools");
        assert_eq!(effective_base_path("/api", Some("/")), "/api");
        assert_eq!(effective_base_path("/api", Some("")), "/api");
        assert_eq!(effective_base_path("/api", None), "/api");
        assert_eq!(effective_base_path("/api/", Some("tools")), "/api/tools");
    }

    #[test]
    fn test_strip_base() {
        assert_eq!(strip_base("/api/act", "/api"), Some("/act"));
        assert_eq!(strip_base("/api", "/api"), Some("/"));
        assert_eq!(strip_base("/apix/act", "/api"), None);
        assert_eq!(strip_base("/other", "/api"), None);
    }

    #[tokio::test]
    async fn test_health_gated_on_readiness() {
        let booting = surface(false);
        let response = booting.handle(request(Method::GET, "/health", "")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(response).await["ok"], false);

        let ready = surface(true);
        let response = ready.handle(request(Method::GET, "/health", "")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["ok"], true);
        assert_eq!(body["agent_id"], "a1");
    }

    #[tokio::test]
    async fn test_meta_reports_manifest_and_boot() {
        let surface = surface(true);
        {
            let mut metrics = surface.metrics.lock().unwrap();
            metrics.begin("start_http");
            metrics.end("start_http");
            metrics.finalize();
        }

        let response = surface.handle(request(Method::GET, "/meta", "")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["package"], "echo-agent@1.0.0");
        assert!(body["boot"]["total_ms"].is_u64());
    }

    #[tokio::test]
    async fn test_agent_route_invokes_handler() {
        let surface = surface(true);
        let response = surface
            .handle(request(Method::POST, "/api/greet", r#"{"who":"fleet"}"#))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["action"], "greet");
        assert_eq!(body["params"]["who"], "fleet");
    }

    #[tokio::test]
    async fn test_manifest_mount_nests_under_base() {
        let manifest = AgentManifest::from_yaml(
            "name: echo-agent\nversion: 1.0.0\nentrypoint: echo\nhttp:\n  mount: tools\n",
        )
        .unwrap();
        let base = effective_base_path(
            "/api",
            manifest.http.as_ref().map(|http| http.mount.as_str()),
        );
        let surface = HttpSurface::new(
            "a1".to_string(),
            manifest,
            Arc::new(EchoHandler),
            Arc::new(AtomicBool::new(true)),
            base,
            Arc::new(Mutex::new(BootMetrics::new())),
            None,
        );

        let response = surface
            .handle(request(Method::POST, "/api/tools/greet", "{}"))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["action"], "greet");

        // The bare base no longer carries agent routes.
        let response = surface.handle(request(Method::POST, "/api/greet", "{}")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_route_404() {
        let surface = surface(true);
        let response = surface.handle(request(Method::GET, "/elsewhere", "")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_multiplexed_ui_assets() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<p>ui</p>").unwrap();

        let manifest = AgentManifest::from_yaml(
            "name: echo-agent\nversion: 1.0.0\nentrypoint: echo\n",
        )
        .unwrap();
        let surface = HttpSurface::new(
            "a1".to_string(),
            manifest,
            Arc::new(EchoHandler),
            Arc::new(AtomicBool::new(true)),
            "/api".to_string(),
            Arc::new(Mutex::new(BootMetrics::new())),
            Some(("/ui".to_string(), dir.path().to_path_buf())),
        );

        let response = surface.handle(request(Method::GET, "/ui/", "")).await;
        assert_eq!(response.status(), StatusCode::OK);

        let escape = surface
            .handle(request(Method::GET, "/ui/../secret", ""))
            .await;
        assert_eq!(escape.status(), StatusCode::FORBIDDEN);
    }
}
