// src/runtime/ui_surface.rs
//! Worker UI surface
//!
//! Serves a package's static UI assets, either on its own port or
//! multiplexed onto the HTTP surface. Asset paths are resolved
//! component-by-component so a request can never escape the asset root.

use crate::utils::errors::Result;
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Resolve a request path against the asset root.
///
/// Rejects any path whose components are not plain names; `..`, roots,
/// and drive prefixes never resolve. Empty paths resolve to
/// `index.html`.
pub fn resolve_asset(root: &Path, request_path: &str) -> Option<PathBuf> {
    let trimmed = request_path.trim_start_matches('/');
    let relative = if trimmed.is_empty() { "index.html" } else { trimmed };

    let mut resolved = root.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            _ => return None,
        }
    }
    Some(resolved)
}

/// Content type from a file extension
pub fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("ico") => "image/x-icon",
        Some("wasm") => "application/wasm",
        _ => "application/octet-stream",
    }
}

/// Load an asset into an HTTP response
pub async fn serve_asset(root: &Path, request_path: &str) -> Response<Full<Bytes>> {
    let resolved = match resolve_asset(root, request_path) {
        Some(resolved) => resolved,
        None => return status_response(StatusCode::FORBIDDEN, "forbidden"),
    };

    match tokio::fs::read(&resolved).await {
        Ok(bytes) => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", content_type(&resolved))
            .body(Full::new(Bytes::from(bytes)))
            .unwrap_or_default(),
        Err(_) => status_response(StatusCode::NOT_FOUND, "not found"),
    }
}

fn status_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(message.to_string())))
        .unwrap_or_default()
}

/// Standalone static asset server for a dedicated UI port
pub struct UiSurface {
    assets_root: PathBuf,
}

impl UiSurface {
    pub fn new(assets_root: PathBuf) -> Self {
        Self { assets_root }
    }

    /// Serve assets until `shutdown` flips true
    pub async fn serve(
        self: Arc<Self>,
        port: u16,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        info!("UI surface listening on port {}", port);

        loop {
            let (stream, _) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = shutdown.changed() => {
                    info!("UI surface shutting down");
                    return Ok(());
                }
            };

            let surface = Arc::clone(&self);
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                    let surface = Arc::clone(&surface);
                    async move {
                        debug!("UI asset request: {}", req.uri().path());
                        let response = serve_asset(&surface.assets_root, req.uri().path()).await;
                        Ok::<_, std::convert::Infallible>(response)
                    }
                });
                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    error!("UI connection error: {}", e);
                }
            });
        }
    }
}
