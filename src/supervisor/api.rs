// src/supervisor/api.rs
//! Supervisor control API
//!
//! Small HTTP surface for operators and the control plane: inspect
//! fleet status, spawn/stop/restart workers, and query captured logs.
//! Every error response carries the structured `{"error": {...}}` body.

use crate::supervisor::log_aggregator::{LogAggregator, LogLevel};
use crate::supervisor::process_manager::{ProcessManager, SpawnSpec};
use crate::utils::errors::{FleetError, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Default line limit for log queries
const DEFAULT_LOG_LIMIT: usize = 100;

/// Control API over a running process manager
pub struct SupervisorApi {
    manager: Arc<ProcessManager>,
    logs: Arc<LogAggregator>,
}

impl SupervisorApi {
    pub fn new(manager: Arc<ProcessManager>, logs: Arc<LogAggregator>) -> Self {
        Self { manager, logs }
    }

    /// Serve the control API until `shutdown` resolves
    pub async fn serve(
        self: Arc<Self>,
        addr: SocketAddr,
        shutdown: impl std::future::Future<Output = ()>,
    ) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("Control API listening on {}", addr);

        tokio::pin!(shutdown);
        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = &mut shutdown => {
                    info!("Control API shutting down");
                    return Ok(());
                }
            };

            let api = Arc::clone(&self);
            tokio::spawn(async move {
                debug!("Control connection from {}", peer);
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let api = Arc::clone(&api);
                    async move { Ok::<_, std::convert::Infallible>(api.handle(req).await) }
                });
                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Control connection error: {}", e);
                }
            });
        }
    }

    /// Dispatch one request. Generic over the body so tests can drive
    /// it without a socket.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body + Send,
        B::Data: Send,
        B::Error: std::fmt::Display,
    {
        let method: Method = req.method().clone();
        let path = req.uri().path().to_string();
        let query = req.uri().query().map(str::to_string);

        let result = match (method.as_str(), path.as_str()) {
            ("GET", "/health") => {
                Ok(json_response(StatusCode::OK, serde_json::json!({"status": "ok"})))
            }
            ("GET", "/status") => self.handle_status().await,
            ("POST", "/spawn") => match read_json::<SpawnSpec, _>(req).await {
                Ok(spec) => self.handle_spawn(spec).await,
                Err(e) => Err(e),
            },
            ("POST", path) if path.starts_with("/stop/") => {
                self.handle_stop(&path["/stop/".len()..]).await
            }
            ("POST", path) if path.starts_with("/restart/") => {
                self.handle_restart(&path["/restart/".len()..]).await
            }
            ("GET", "/logs") => self.handle_logs(query.as_deref()).await,
            ("DELETE", "/logs") => {
                self.logs.clear().await;
                Ok(json_response(StatusCode::OK, serde_json::json!({"cleared": true})))
            }
            _ => Ok(error_response(
                StatusCode::NOT_FOUND,
                &FleetError::Runtime(format!("no such endpoint: {}", path)),
            )),
        };

        result.unwrap_or_else(|e| {
            let status =
                StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            error_response(status, &e)
        })
    }

    async fn handle_status(&self) -> Result<Response<Full<Bytes>>> {
        let snapshots = self.manager.status().await;
        Ok(json_response(
            StatusCode::OK,
            serde_json::json!({ "processes": snapshots }),
        ))
    }

    async fn handle_spawn(&self, spec: SpawnSpec) -> Result<Response<Full<Bytes>>> {
        let record = self.manager.spawn(spec).await?;
        Ok(json_response(StatusCode::CREATED, serde_json::to_value(&record).unwrap_or_default()))
    }

    async fn handle_stop(&self, id: &str) -> Result<Response<Full<Bytes>>> {
        self.manager.stop(id, self.manager.stop_timeout()).await?;
        Ok(json_response(
            StatusCode::OK,
            serde_json::json!({"stopped": id}),
        ))
    }

    async fn handle_restart(&self, id: &str) -> Result<Response<Full<Bytes>>> {
        let record = self.manager.restart(id).await?;
        Ok(json_response(StatusCode::OK, serde_json::to_value(&record).unwrap_or_default()))
    }

    async fn handle_logs(&self, query: Option<&str>) -> Result<Response<Full<Bytes>>> {
        let params = parse_query(query.unwrap_or(""));
        let process_id = params.get("process_id").map(String::as_str);
        let level = params.get("level").and_then(|v| LogLevel::parse(v));
        let limit = params
            .get("limit")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_LOG_LIMIT);

        let entries = self.logs.query(process_id, level, limit).await;
        Ok(json_response(
            StatusCode::OK,
            serde_json::json!({ "entries": entries }),
        ))
    }
}

/// Read and deserialize a JSON request body
async fn read_json<T, B>(req: Request<B>) -> Result<T>
where
    T: serde::de::DeserializeOwned,
    B: Body + Send,
    B::Data: Send,
    B::Error: std::fmt::Display,
{
    let bytes = req
        .into_body()
        .collect()
        .await
        .map_err(|e| FleetError::Runtime(format!("body read error: {}", e)))?
        .to_bytes();
    serde_json::from_slice(&bytes)
        .map_err(|e| FleetError::Config(format!("invalid request body: {}", e)))
}

/// Parse a query string into key/value pairs (no percent decoding;
/// control API values are plain identifiers)
fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

fn json_response(status: StatusCode, value: serde_json::Value) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(&value).unwrap_or_default();
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_default()
}

fn error_response(status: StatusCode, err: &FleetError) -> Response<Full<Bytes>> {
    json_response(status, err.to_body())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::resolver::RouteTable;
    use crate::supervisor::process_manager::ProcessManagerConfig;
    use std::time::Duration;

    fn test_api() -> SupervisorApi {
        let logs = Arc::new(LogAggregator::default());
        let config = ProcessManagerConfig {
            port_range_start: 42000,
            port_range_end: 42099,
            worker_program: "sleep".to_string(),
            worker_args: vec!["30".to_string()],
            stop_timeout: Duration::from_secs(2),
            ..Default::default()
        };
        let manager = Arc::new(ProcessManager::new(
            config,
            Arc::clone(&logs),
            RouteTable::new(),
        ));
        SupervisorApi::new(manager, logs)
    }

    fn request(method: Method, uri: &str, body: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap()
    }

    async fn body_json(response: Response<Full<Bytes>>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let api = test_api();
        let response = api.handle(request(Method::GET, "/health", "")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_unknown_endpoint() {
        let api = test_api();
        let response = api.handle(request(Method::GET, "/nope", "")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_spawn_stop_roundtrip() {
        let api = test_api();
        let spec = serde_json::json!({
            "agent_id": "a1",
            "package_id": "pkg-1.0.0",
            "package_path": "/tmp/pkg.zip",
        });

        let response = api
            .handle(request(Method::POST, "/spawn", &spec.to_string()))
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let record = body_json(response).await;
        assert_eq!(record["state"], "running");
        assert_eq!(record["id"], "a1-pkg-1.0.0");

        let status = api.handle(request(Method::GET, "/status", "")).await;
        let status = body_json(status).await;
        assert_eq!(status["processes"].as_array().unwrap().len(), 1);

        let stopped = api
            .handle(request(Method::POST, "/stop/a1-pkg-1.0.0", ""))
            .await;
        assert_eq!(stopped.status(), StatusCode::OK);

        // Stop is idempotent.
        let again = api
            .handle(request(Method::POST, "/stop/a1-pkg-1.0.0", ""))
            .await;
        assert_eq!(again.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_duplicate_spawn_conflict() {
        let api = test_api();
        let spec = serde_json::json!({
            "agent_id": "a1",
            "package_id": "pkg-1.0.0",
            "package_path": "/tmp/pkg.zip",
        })
        .to_string();

        let first = api.handle(request(Method::POST, "/spawn", &spec)).await;
        assert_eq!(first.status(), StatusCode::CREATED);

        let second = api.handle(request(Method::POST, "/spawn", &spec)).await;
        assert_eq!(second.status(), StatusCode::CONFLICT);
        let body = body_json(second).await;
        assert_eq!(body["error"]["kind"], "already_running");

        api.manager
            .stop("a1-pkg-1.0.0", Duration::from_secs(2))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_invalid_spawn_body() {
        let api = test_api();
        let response = api
            .handle(request(Method::POST, "/spawn", "{not json"))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_log_query_filters() {
        let api = test_api();
        api.logs.append("p1", LogLevel::Info, "started").await;
        api.logs.append("p1", LogLevel::Error, "boom").await;
        api.logs.append("p2", LogLevel::Info, "other").await;

        let response = api
            .handle(request(Method::GET, "/logs?process_id=p1&level=error", ""))
            .await;
        let body = body_json(response).await;
        let entries = body["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["message"], "boom");

        let cleared = api.handle(request(Method::DELETE, "/logs", "")).await;
        assert_eq!(cleared.status(), StatusCode::OK);
        let empty = api.handle(request(Method::GET, "/logs", "")).await;
        assert!(body_json(empty).await["entries"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_parse_query() {
        let params = parse_query("a=1&b=two&junk");
        assert_eq!(params.get("a").unwrap(), "1");
        assert_eq!(params.get("b").unwrap(), "two");
        assert!(!params.contains_key("junk"));
    }
}
