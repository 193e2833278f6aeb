//! Configuration types for the mock engine.
//!
//! One configuration document describes a single plugin instance: a default
//! content type, an optional root response used for fallbacks, and an ordered
//! list of matchable resources. Documents are parsed once at startup and are
//! immutable for the lifetime of the process.

mod loader;

pub use loader::{discover_configs, load_plugin_config, load_store_config, StoreBackendConfig};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Parsed form of one plugin configuration document.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginConfig {
    /// Registered short name of the plugin handling this document
    pub plugin: String,

    /// Directory containing the source document; relative response and
    /// script files resolve against it. Populated after parsing.
    #[serde(skip)]
    pub parent_dir: PathBuf,

    /// Default content type for responses that do not set one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,

    /// Root response configuration, used when no resource matches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseConfig>,

    /// Overlay the root response configuration onto resources as defaults
    #[serde(default)]
    pub defaults_from_root_response: bool,

    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
}

/// A single matchable endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceConfig {
    /// HTTP method; absent means any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    /// Path template; `{name}` segments match one non-empty segment
    pub path: String,

    /// Required query parameters (exact values)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub query_params: HashMap<String, String>,

    /// Required headers (names case-insensitive)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub request_headers: HashMap<String, String>,

    /// Request body matcher; at most one per resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_body: Option<BodyMatchConfig>,

    /// Content type override for this resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,

    #[serde(default)]
    pub response: ResponseConfig,

    /// Named value captures, keyed by capture name
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub capture: HashMap<String, CaptureConfig>,
}

impl ResourceConfig {
    /// Stable identifier used in logs.
    pub fn resource_id(&self) -> String {
        format!(
            "{} {}",
            self.method.as_deref().unwrap_or("*"),
            self.path
        )
    }
}

/// How to answer a matched request.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,

    /// Response file, relative to the configuration document's directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Inline response body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,

    /// Named specification example (specification-backed plugins only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example_name: Option<String>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,

    /// Script computing the response behaviour, relative to the document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_file: Option<String>,

    /// Run the body through the template transformer chain
    #[serde(default)]
    pub template: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performance: Option<PerformanceConfig>,
}

/// Latency simulation settings.
///
/// When `exact_delay_ms` is set it wins. Otherwise a delay is drawn
/// uniformly from `[min_delay_ms, max_delay_ms)` — the upper bound is
/// exclusive, except that equal bounds yield exactly `min_delay_ms`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exact_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
}

/// Request body constraint. Exactly one of the selector fields should be
/// set; `value` combined with `json_path` or `x_path` means "selector result
/// equals value" rather than literal body equality.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BodyMatchConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
}

/// Where in the request lifecycle a capture runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CapturePhase {
    #[default]
    RequestReceived,
    ResponseSent,
}

/// Extraction of one named value from a request into a store.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_param: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_param: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_header: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_path: Option<String>,
    /// Placeholder expression evaluated against the request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    #[serde(default, rename = "const", skip_serializing_if = "Option::is_none")]
    pub const_value: Option<String>,

    /// Store key; defaults to the capture name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<ItemCaptureConfig>,

    /// Target store; defaults to the engine's capture store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store: Option<ItemCaptureConfig>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub phase: CapturePhase,
}

fn default_enabled() -> bool {
    true
}

/// Nested capture used to derive a store key or store name from the
/// request. Cannot itself nest further.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemCaptureConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_param: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_param: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_header: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    #[serde(default, rename = "const", skip_serializing_if = "Option::is_none")]
    pub const_value: Option<String>,
}
