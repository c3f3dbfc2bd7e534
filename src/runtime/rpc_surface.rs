// src/runtime/rpc_surface.rs
//! Worker RPC surface
//!
//! JSON-RPC-style endpoint served over HTTP at `POST /rpc`. Requests
//! carry `{id, method, params}`; responses carry `{id, success,
//! result, error, duration_ms}`. Methods: `agent.health`,
//! `agent.describe`, `agent.ping`, `agent.invoke`.

use crate::loader::manifest::AgentManifest;
use crate::loader::registry::AgentHandler;
use crate::utils::errors::Result;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// RPC request envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// RPC error payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorBody {
    pub code: String,
    pub message: String,
}

/// RPC response envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorBody>,
    pub duration_ms: u64,
}

impl RpcResponse {
    fn ok(id: String, result: Value, started: Instant) -> Self {
        Self {
            id,
            success: true,
            result: Some(result),
            error: None,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    fn err(id: String, code: &str, message: String, started: Instant) -> Self {
        Self {
            id,
            success: false,
            result: None,
            error: Some(RpcErrorBody {
                code: code.to_string(),
                message,
            }),
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// The worker's RPC endpoint
pub struct RpcSurface {
    agent_id: String,
    manifest: AgentManifest,
    handler: Arc<dyn AgentHandler>,
    ready: Arc<AtomicBool>,
}

impl RpcSurface {
    pub fn new(
        agent_id: String,
        manifest: AgentManifest,
        handler: Arc<dyn AgentHandler>,
        ready: Arc<AtomicBool>,
    ) -> Self {
        Self {
            agent_id,
            manifest,
            handler,
            ready,
        }
    }

    /// Serve `POST /rpc` until `shutdown` flips true
    pub async fn serve(
        self: Arc<Self>,
        port: u16,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        info!("RPC surface listening on port {}", port);

        loop {
            let (stream, _) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = shutdown.changed() => {
                    info!("RPC surface shutting down");
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
                    error!("RPC connection error: {}", e);
                }
            });
        }
    }

    async fn handle(&self, req: Request<hyper::body::Incoming>) -> Response<Full<Bytes>> {
        if req.method() != Method::POST || req.uri().path() != "/rpc" {
            return plain_response(StatusCode::NOT_FOUND, "not found");
        }

        let bytes = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => return plain_response(StatusCode::BAD_REQUEST, &e.to_string()),
        };

        let started = Instant::now();
        let response = match serde_json::from_slice::<RpcRequest>(&bytes) {
            Ok(request) => self.dispatch(request).await,
            Err(e) => RpcResponse::err(
                String::new(),
                "invalid_request",
                format!("malformed RPC envelope: {}", e),
                started,
            ),
        };

        let body = serde_json::to_vec(&response).unwrap_or_default();
        Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(body)))
            .unwrap_or_default()
    }

    /// Dispatch one RPC request to its method
    pub async fn dispatch(&self, request: RpcRequest) -> RpcResponse {
        let started = Instant::now();
        let RpcRequest { id, method, params } = request;
        debug!("RPC {} ({})", method, id);

        match method.as_str() {
            "agent.health" => {
                let ready = self.ready.load(Ordering::SeqCst);
                RpcResponse::ok(
                    id,
                    json!({
                        "ok": true,
                        "agent_id": self.agent_id,
                        "ready": ready,
                    }),
                    started,
                )
            }
            "agent.describe" => RpcResponse::ok(
                id,
                json!({
                    "agent_id": self.agent_id,
                    "package": self.manifest.identity(),
                    "entrypoint": self.manifest.entrypoint,
                    "actions": self.handler.actions(),
                }),
                started,
            ),
            "agent.ping" => RpcResponse::ok(id, json!({ "pong": true }), started),
            "agent.invoke" => {
                let action = match params.get("action").and_then(Value::as_str) {
                    Some(action) => action.to_string(),
                    None => {
                        return RpcResponse::err(
                            id,
                            "invalid_params",
                            "agent.invoke requires a string `action` param".to_string(),
                            started,
                        )
                    }
                };
                let payload = params.get("payload").cloned().unwrap_or(Value::Null);

                match self.handler.invoke(&action, payload).await {
                    Ok(result) => RpcResponse::ok(id, result, started),
                    Err(e) => RpcResponse::err(id, e.kind(), e.to_string(), started),
                }
            }
            other => RpcResponse::err(
                id,
                "unknown_method",
                format!("unknown RPC method: {}", other),
                started,
            ),
        }
    }
}

fn plain_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(message.to_string())))
        .unwrap_or_default()
}
