// src/router/mod.rs
//! Request routing front-end
//!
//! One listener serves both traffic shapes: `/rpc` carries RPC calls
//! keyed by a deployment header, and `/{deployment_id}/...` is reverse
//! proxied to that deployment's worker HTTP surface.

pub mod http_proxy;
pub mod resolver;
pub mod rpc_router;

pub use http_proxy::HttpProxy;
pub use resolver::{fallback_entry, DeploymentRegistry, Resolver, RouteEntry, RouteTable};
pub use rpc_router::RpcRouter;

use crate::utils::errors::Result;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Body;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Router front-end over the RPC router and HTTP proxy
pub struct FleetRouter {
    rpc: RpcRouter,
    proxy: HttpProxy,
}

impl FleetRouter {
    pub fn new(resolver: Arc<Resolver>) -> Self {
        Self {
            rpc: RpcRouter::new(Arc::clone(&resolver)),
            proxy: HttpProxy::new(resolver),
        }
    }

    /// Serve routed traffic until `shutdown` resolves
    pub async fn serve(
        self: Arc<Self>,
        addr: SocketAddr,
        shutdown: impl std::future::Future<Output = ()>,
    ) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("Router listening on {}", addr);

        tokio::pin!(shutdown);
        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = &mut shutdown => {
                    info!("Router shutting down");
                    return Ok(());
                }
            };

            let router = Arc::clone(&self);
            tokio::spawn(async move {
                debug!("Router connection from {}", peer);
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let router = Arc::clone(&router);
                    async move { Ok::<_, std::convert::Infallible>(router.handle(req).await) }
                });
                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Router connection error: {}", e);
                }
            });
        }
    }

    /// Dispatch one routed request
    pub async fn handle<B>(&self, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body + Send,
        B::Data: Send,
        B::Error: std::fmt::Display,
    {
        let path = req.uri().path().to_string();
        let query = req.uri().query().map(str::to_string);

        let result = if path == "/rpc" {
            self.rpc.route(req).await
        } else {
            match split_deployment_path(&path, query.as_deref()) {
                Some((deployment_id, remainder)) => {
                    self.proxy.forward(&deployment_id, &remainder, req).await
                }
                None => {
                    return error_response(
                        StatusCode::NOT_FOUND,
                        &crate::utils::errors::FleetError::DeploymentNotFound(path),
                    )
                }
            }
        };

        result.unwrap_or_else(|e| {
            let status =
                StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            error_response(status, &e)
        })
    }
}

/// Split `/{deployment_id}/rest` into the routing key and the upstream
/// path (with query string reattached)
fn split_deployment_path(path: &str, query: Option<&str>) -> Option<(String, String)> {
    let trimmed = path.strip_prefix('/')?;
    if trimmed.is_empty() {
        return None;
    }

    let (deployment_id, rest) = match trimmed.split_once('/') {
        Some((id, rest)) => (id, format!("/{}", rest)),
        None => (trimmed, "/".to_string()),
    };

    let remainder = match query {
        Some(query) => format!("{}?{}", rest, query),
        None => rest,
    };
    Some((deployment_id.to_string(), remainder))
}

fn error_response(
    status: StatusCode,
    err: &crate::utils::errors::FleetError,
) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(&err.to_body()).unwrap_or_default();
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_default()
}
