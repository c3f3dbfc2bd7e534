// src/router/rpc_router.rs
//! RPC request routing
//!
//! Extracts the deployment routing key from request metadata, resolves
//! a worker endpoint, and relays the RPC body to the worker's RPC
//! surface. Worker responses (including worker-side errors) are relayed
//! verbatim; the router only synthesizes errors it produced itself.

use crate::router::resolver::Resolver;
use crate::utils::errors::{FleetError, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::header::HeaderMap;
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Accepted routing-key header spellings, checked in order
pub const ROUTING_HEADERS: [&str; 3] =
    ["x-deployment-id", "deployment-id", "x-agent-deployment"];

/// Deadline for short control methods (health, describe, ping)
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for agent invocations, which may run real work
pub const INVOKE_TIMEOUT: Duration = Duration::from_secs(300);

/// Routes RPC calls to resolved worker endpoints
pub struct RpcRouter {
    resolver: Arc<Resolver>,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl RpcRouter {
    pub fn new(resolver: Arc<Resolver>) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self { resolver, client }
    }

    /// Route one RPC request to its worker and relay the response
    pub async fn route<B>(&self, req: Request<B>) -> Result<Response<Full<Bytes>>>
    where
        B: Body + Send,
        B::Data: Send,
        B::Error: std::fmt::Display,
    {
        let deployment_id = extract_routing_key(req.headers())?;
        let entry = self.resolver.resolve(&deployment_id).await?;

        let body = req
            .into_body()
            .collect()
            .await
            .map_err(|e| FleetError::Runtime(format!("body read error: {}", e)))?
            .to_bytes();

        let timeout = timeout_for(&body);
        debug!(
            "Routing RPC for {} to {} (deadline {:?})",
            deployment_id,
            entry.rpc_addr(),
            timeout
        );

        let worker_req = Request::builder()
            .method(hyper::Method::POST)
            .uri(format!("http://{}/rpc", entry.rpc_addr()))
            .header("content-type", "application/json")
            .body(Full::new(body))
            .map_err(|e| FleetError::Runtime(format!("request build error: {}", e)))?;

        let response = match tokio::time::timeout(timeout, self.client.request(worker_req)).await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!("Worker {} unreachable: {}", entry.rpc_addr(), e);
                return Err(FleetError::Unreachable(entry.rpc_addr()));
            }
            Err(_) => return Err(FleetError::Timeout(timeout)),
        };

        let (parts, body) = response.into_parts();
        let bytes = body
            .collect()
            .await
            .map_err(|e| FleetError::Runtime(format!("response body error: {}", e)))?
            .to_bytes();
        Ok(Response::from_parts(parts, Full::new(bytes)))
    }
}

/// First routing-key header present wins
pub fn extract_routing_key(headers: &HeaderMap) -> Result<String> {
    for name in ROUTING_HEADERS {
        if let Some(value) = headers.get(name) {
            if let Ok(value) = value.to_str() {
                if !value.trim().is_empty() {
                    return Ok(value.trim().to_string());
                }
            }
        }
    }
    Err(FleetError::MissingRoutingKey)
}

/// Pick a deadline by peeking at the RPC method in the body.
///
/// Invocations get the long deadline; everything else (health,
/// describe, ping, malformed bodies the worker will reject anyway)
/// gets the short one.
fn timeout_for(body: &[u8]) -> Duration {
    let method = serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("method").and_then(|m| m.as_str()).map(str::to_string));

    match method.as_deref() {
        Some("agent.invoke") => INVOKE_TIMEOUT,
        _ => CONTROL_TIMEOUT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::resolver::{RouteEntry, RouteTable};
    use hyper::header::HeaderValue;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;
    use tokio::net::TcpListener;

    #[test]
    fn test_routing_key_precedence() {
        let mut headers = HeaderMap::new();
        headers.insert("deployment-id", HeaderValue::from_static("second"));
        headers.insert("x-agent-deployment", HeaderValue::from_static("third"));
        assert_eq!(extract_routing_key(&headers).unwrap(), "second");

        headers.insert("x-deployment-id", HeaderValue::from_static("first"));
        assert_eq!(extract_routing_key(&headers).unwrap(), "first");
    }

    #[test]
    fn test_missing_routing_key() {
        let headers = HeaderMap::new();
        let err = extract_routing_key(&headers).unwrap_err();
        assert_eq!(err.kind(), "missing_routing_key");

        let mut blank = HeaderMap::new();
        blank.insert("x-deployment-id", HeaderValue::from_static("  "));
        assert!(extract_routing_key(&blank).is_err());
    }

    #[test]
    fn test_timeout_selection() {
        assert_eq!(
            timeout_for(br#"{"id":"1","method":"agent.invoke","params":{}}"#),
            INVOKE_TIMEOUT
        );
        assert_eq!(
            timeout_for(br#"{"id":"1","method":"agent.health"}"#),
            CONTROL_TIMEOUT
        );
        assert_eq!(timeout_for(b"not json"), CONTROL_TIMEOUT);
    }

    /// Minimal worker stub that echoes the request body back
    async fn echo_worker() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(|req: Request<hyper::body::Incoming>| async {
                        let bytes = req.into_body().collect().await.unwrap().to_bytes();
                        Ok::<_, std::convert::Infallible>(Response::new(Full::new(bytes)))
                    });
                    let _ = http1::Builder::new().serve_connection(io, service).await;
                });
            }
        });

        port
    }

    #[tokio::test]
    async fn test_routes_to_resolved_worker() {
        let port = echo_worker().await;

        let table = RouteTable::new();
        table
            .insert(RouteEntry {
                deployment_id: "a1".to_string(),
                host: "127.0.0.1".to_string(),
                http_port: port,
                rpc_port: port,
                ready: true,
            })
            .await;

        let router = RpcRouter::new(Arc::new(Resolver::new(table, None, None)));
        let req = Request::builder()
            .header("x-deployment-id", "a1")
            .body(Full::new(Bytes::from(
                r#"{"id":"1","method":"agent.ping"}"#,
            )))
            .unwrap();

        let response = router.route(req).await.unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(std::str::from_utf8(&body).unwrap().contains("agent.ping"));
    }

    #[tokio::test]
    async fn test_unknown_deployment_rejected() {
        let router = RpcRouter::new(Arc::new(Resolver::new(RouteTable::new(), None, None)));
        let req = Request::builder()
            .header("x-deployment-id", "ghost")
            .body(Full::new(Bytes::from("{}")))
            .unwrap();

        let err = router.route(req).await.unwrap_err();
        assert_eq!(err.kind(), "deployment_not_found");
    }
}
