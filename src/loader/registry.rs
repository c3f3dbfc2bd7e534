// src/loader/registry.rs
//! Static handler registry
//!
//! Packages declare a typed handler name in their manifest; the loader
//! resolves it here instead of using dynamic import or reflection. A
//! handler implements the generic named-action invocation contract of
//! the RPC surface.

use crate::utils::errors::{FleetError, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// An agent entrypoint capable of handling named-action invocations
#[async_trait]
pub trait AgentHandler: Send + Sync {
    /// Handle a named action with string-keyed parameters
    async fn invoke(&self, action: &str, params: Value) -> Result<Value>;

    /// Actions this handler advertises via `agent.describe`
    fn actions(&self) -> Vec<String>;
}

/// Registry mapping handler names to implementations
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn AgentHandler>>,
}

impl HandlerRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with built-in handlers
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("echo", Arc::new(EchoHandler));
        registry
    }

    /// Register a handler under a typed name
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn AgentHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    /// Resolve a handler by the name declared in a manifest
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn AgentHandler>> {
        self.handlers.get(name).cloned().ok_or_else(|| {
            FleetError::PackageValidation(format!("no registered handler named {:?}", name))
        })
    }
}

/// Built-in handler that echoes its parameters back
pub struct EchoHandler;

#[async_trait]
impl AgentHandler for EchoHandler {
    async fn invoke(&self, action: &str, params: Value) -> Result<Value> {
        Ok(json!({ "action": action, "params": params }))
    }

    fn actions(&self) -> Vec<String> {
        vec!["echo".to_string()]
    }
}
