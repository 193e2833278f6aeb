//! Scripted response behaviours.
//!
//! A resource may name a script that decides its response at request time.
//! The engine owns the embedding contract — the `ScriptService` trait, the
//! runtime context handed to scripts, and the response-builder DSL — while
//! a concrete engine (Rhai) supplies the language.

mod rhai_engine;
mod service;

pub use rhai_engine::RhaiScriptService;
pub use service::ScriptedResponseService;

use crate::behaviour::ReadWriteResponseBehaviour;
use crate::config::{PluginConfig, ResourceConfig};
use crate::exchange::HttpExchange;
use crate::store::StoreFactory;
use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Compiles (once) and executes a script, returning the behaviour the
/// script described. Execution is synchronous and single-threaded within
/// one request; implementations must be safe to call from many requests in
/// parallel.
pub trait ScriptService: Send + Sync {
    fn execute_script(
        &self,
        plugin_config: Arc<PluginConfig>,
        resource_config: Option<Arc<ResourceConfig>>,
        runtime_context: RuntimeContext,
    ) -> Result<ReadWriteResponseBehaviour>;
}

/// Read-only request view exposed to scripts as `context`.
#[derive(Debug, Clone, Default)]
pub struct ScriptRequestContext {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub body: String,
    pub path_params: HashMap<String, String>,
}

impl ScriptRequestContext {
    pub fn from_exchange(exchange: &HttpExchange) -> Self {
        let request = exchange.request();

        let headers = request
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let query = request
            .query()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Self {
            method: request.method().to_string(),
            path: request.path().to_string(),
            headers,
            query,
            body: request.body_string(),
            path_params: exchange.path_params().clone(),
        }
    }
}

/// Logger handed to scripts, scoped to the script file's basename.
#[derive(Clone)]
pub struct ScriptLogger {
    name: Arc<str>,
}

impl ScriptLogger {
    pub fn new(name: &str) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn debug(&self, message: &str) {
        tracing::debug!(script = %self.name, "{}", message);
    }

    pub fn info(&self, message: &str) {
        tracing::info!(script = %self.name, "{}", message);
    }

    pub fn warn(&self, message: &str) {
        tracing::warn!(script = %self.name, "{}", message);
    }

    pub fn error(&self, message: &str) {
        tracing::error!(script = %self.name, "{}", message);
    }
}

/// Everything a script execution receives from the engine.
pub struct RuntimeContext {
    /// Resolved script file
    pub script_path: PathBuf,
    pub request: ScriptRequestContext,
    /// Process environment snapshot exposed as `env`
    pub env: HashMap<String, String>,
    /// Additional bindings contributed by lifecycle listeners
    pub bindings: HashMap<String, Value>,
    /// Present when the stores feature is enabled
    pub stores: Option<Arc<StoreFactory>>,
    pub logger: ScriptLogger,
}
