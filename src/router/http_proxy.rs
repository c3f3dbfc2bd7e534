// src/router/http_proxy.rs
//! HTTP reverse proxy to worker HTTP surfaces
//!
//! Relays a request to the worker serving a deployment, preserving the
//! path remainder, query string, body, and headers. Host and
//! content-length are recomputed for the upstream hop rather than
//! forwarded.

use crate::router::resolver::Resolver;
use crate::utils::errors::{FleetError, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Upstream response deadline
pub const PROXY_TIMEOUT: Duration = Duration::from_secs(30);

/// Headers never forwarded upstream
const DROPPED_HEADERS: [&str; 2] = ["host", "content-length"];

/// Reverse proxy over resolved worker endpoints
pub struct HttpProxy {
    resolver: Arc<Resolver>,
    client: Client<HttpConnector, Full<Bytes>>,
    timeout: Duration,
}

impl HttpProxy {
    pub fn new(resolver: Arc<Resolver>) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self {
            resolver,
            client,
            timeout: PROXY_TIMEOUT,
        }
    }

    /// Shorten the upstream deadline (tests)
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Forward a request to the worker serving `deployment_id`.
    ///
    /// `path` is the remainder after the deployment segment was
    /// stripped, including the query string.
    pub async fn forward<B>(
        &self,
        deployment_id: &str,
        path: &str,
        req: Request<B>,
    ) -> Result<Response<Full<Bytes>>>
    where
        B: Body + Send,
        B::Data: Send,
        B::Error: std::fmt::Display,
    {
        let entry = self.resolver.resolve(deployment_id).await?;
        let target = format!("http://{}{}", entry.http_addr(), path);
        debug!("Proxying {} {} -> {}", req.method(), deployment_id, target);

        let (parts, body) = req.into_parts();
        let bytes = body
            .collect()
            .await
            .map_err(|e| FleetError::Runtime(format!("body read error: {}", e)))?
            .to_bytes();

        let mut builder = Request::builder().method(parts.method).uri(target);
        for (name, value) in parts.headers.iter() {
            if DROPPED_HEADERS.contains(&name.as_str()) {
                continue;
            }
            builder = builder.header(name, value);
        }
        let upstream_req = builder
            .body(Full::new(bytes))
            .map_err(|e| FleetError::Runtime(format!("request build error: {}", e)))?;

        let response =
            match tokio::time::timeout(self.timeout, self.client.request(upstream_req)).await {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    warn!("Worker {} unreachable: {}", entry.http_addr(), e);
                    return Err(FleetError::Unreachable(entry.http_addr()));
                }
                Err(_) => return Err(FleetError::Timeout(self.timeout)),
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
