//! End-to-end response pipeline.
//!
//! Coordinates behaviour construction (§ the behaviour factory and the
//! scripted response service), latency simulation, header emission, body
//! rendering from inline data or cached files, and post-flush captures.

mod file_cache;

pub use file_cache::ResponseFileCache;

use crate::behaviour::{BehaviourFactory, BehaviourType, ReadWriteResponseBehaviour, ResponseBehaviour};
use crate::capture::CaptureEngine;
use crate::config::{CapturePhase, PerformanceConfig, PluginConfig, ResourceConfig};
use crate::exchange::HttpExchange;
use crate::features::{self, EngineFeatures};
use crate::lifecycle::EngineLifecycleHooks;
use crate::script::ScriptedResponseService;
use crate::EngineError;
use bytes::Bytes;
use rand::Rng;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Tried in order when a behaviour yields no body. Returning `Ok(true)`
/// means the sender produced a response.
pub type ResponseSender =
    Arc<dyn Fn(&mut HttpExchange, &ResponseBehaviour) -> anyhow::Result<bool> + Send + Sync>;

pub const CONTENT_TYPE: &str = "Content-Type";
pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_PLAIN: &str = "text/plain";

pub struct ResponseService {
    hooks: Arc<EngineLifecycleHooks>,
    scripted: Arc<ScriptedResponseService>,
    captures: Arc<CaptureEngine>,
    file_cache: ResponseFileCache,
}

impl ResponseService {
    pub fn new(
        hooks: Arc<EngineLifecycleHooks>,
        scripted: Arc<ScriptedResponseService>,
        captures: Arc<CaptureEngine>,
        features: EngineFeatures,
    ) -> Self {
        Self {
            hooks,
            scripted,
            captures,
            file_cache: ResponseFileCache::new(features::response_file_cache_entries(), features),
        }
    }

    /// Build the behaviour for the resolved resource (or the plugin's root
    /// response), simulate latency, render and flush the body, then run
    /// `response_sent` captures.
    pub async fn respond(
        &self,
        plugin_config: Arc<PluginConfig>,
        resource_config: Option<Arc<ResourceConfig>>,
        exchange: &mut HttpExchange,
        fallback_senders: &[ResponseSender],
    ) -> Result<(), EngineError> {
        self.hooks.for_each(|listener| {
            listener.before_building_response(exchange, resource_config.as_deref())
        });

        let behaviour = self
            .build_behaviour(&plugin_config, resource_config.as_ref(), exchange)
            .await?
            .build();

        if behaviour.behaviour_type() == BehaviourType::ShortCircuit {
            exchange.response.set_status_code(behaviour.status_code());
            for (name, value) in behaviour.headers() {
                exchange.response.put_header(name, value);
            }
            exchange.response.end(None);
            return Ok(());
        }

        if let Some(delay) = effective_delay(behaviour.performance()) {
            info!(
                "Delaying mock response for {} {} by {:?}",
                exchange.request().method(),
                exchange.request().path(),
                delay
            );
            tokio::time::sleep(delay).await;
        }

        self.send_response_internal(
            &plugin_config,
            resource_config.as_deref(),
            exchange,
            &behaviour,
            fallback_senders,
        )
        .await?;

        if let Some(resource) = resource_config.as_deref() {
            self.captures
                .run_captures(resource, CapturePhase::ResponseSent, exchange);
        }
        Ok(())
    }

    async fn build_behaviour(
        &self,
        plugin_config: &Arc<PluginConfig>,
        resource_config: Option<&Arc<ResourceConfig>>,
        exchange: &HttpExchange,
    ) -> Result<ReadWriteResponseBehaviour, EngineError> {
        let response_config = match resource_config {
            Some(resource) => &resource.response,
            None => plugin_config
                .response
                .as_ref()
                .ok_or(EngineError::RouteNotFound)?,
        };
        let status_code = BehaviourFactory::status_code_for(response_config);

        let mut behaviour = match &response_config.script_file {
            None => {
                debug!(
                    "Using default HTTP {} response behaviour for {} {}",
                    status_code,
                    exchange.request().method(),
                    exchange.request().path()
                );
                BehaviourFactory::build(status_code, response_config)
            }
            Some(script_file) => {
                let mut behaviour = self
                    .scripted
                    .determine_response_from_script(
                        Arc::clone(plugin_config),
                        resource_config.cloned(),
                        script_file,
                        exchange,
                    )
                    .await?;

                if behaviour.behaviour_type() == BehaviourType::Default {
                    BehaviourFactory::populate(status_code, response_config, &mut behaviour);
                }
                behaviour
            }
        };

        if plugin_config.defaults_from_root_response {
            if let Some(root) = &plugin_config.response {
                trace!("Inheriting root response configuration as defaults");
                BehaviourFactory::populate(status_code, root, &mut behaviour);
            }
        }

        Ok(behaviour)
    }

    async fn send_response_internal(
        &self,
        plugin_config: &PluginConfig,
        resource_config: Option<&ResourceConfig>,
        exchange: &mut HttpExchange,
        behaviour: &ResponseBehaviour,
        fallback_senders: &[ResponseSender],
    ) -> Result<(), EngineError> {
        trace!(
            "Sending mock response for {} with status code {}",
            exchange.request().path(),
            behaviour.status_code()
        );

        exchange.response.set_status_code(behaviour.status_code());
        for (name, value) in behaviour.headers() {
            exchange.response.put_header(name, value);
        }

        if let Some(file) = behaviour.response_file() {
            self.serve_response_file(plugin_config, resource_config, exchange, behaviour, file)
                .await
        } else if let Some(data) = behaviour.response_data() {
            debug!(
                "Serving response data ({} bytes) for {}",
                data.len(),
                exchange.request().path()
            );
            let data = data.to_string();
            self.write_response_data(plugin_config, resource_config, exchange, behaviour, None, data);
            Ok(())
        } else {
            self.fallback(exchange, behaviour, fallback_senders);
            Ok(())
        }
    }

    /// Reply with a static file, read through the content cache when the
    /// behaviour is templated and streamed directly otherwise.
    async fn serve_response_file(
        &self,
        plugin_config: &PluginConfig,
        resource_config: Option<&ResourceConfig>,
        exchange: &mut HttpExchange,
        behaviour: &ResponseBehaviour,
        file: &str,
    ) -> Result<(), EngineError> {
        let path = resolve_response_file(plugin_config, file)?;
        info!(
            "Serving response file {} for {} with status code {}",
            path.display(),
            exchange.request().path(),
            behaviour.status_code()
        );

        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string);

        if behaviour.is_template() {
            let contents = self.file_cache.get_or_load(&path).await.map_err(|e| {
                EngineError::Render(format!("failed to read response file {file}: {e}"))
            })?;
            self.write_response_data(
                plugin_config,
                resource_config,
                exchange,
                behaviour,
                filename.as_deref(),
                contents,
            );
        } else {
            if !path.is_file() {
                return Err(EngineError::Render(format!(
                    "response file {file} not found"
                )));
            }
            set_content_type_if_absent(
                exchange,
                resource_config,
                plugin_config,
                filename.as_deref(),
            );
            exchange.response.send_file(path);
        }
        Ok(())
    }

    /// Write response data, running the template transformer chain when the
    /// behaviour asks for it.
    fn write_response_data(
        &self,
        plugin_config: &PluginConfig,
        resource_config: Option<&ResourceConfig>,
        exchange: &mut HttpExchange,
        behaviour: &ResponseBehaviour,
        filename_hint: Option<&str>,
        data: String,
    ) {
        set_content_type_if_absent(exchange, resource_config, plugin_config, filename_hint);

        let data = if behaviour.is_template() {
            self.hooks.transform_template(exchange, data)
        } else {
            data
        };

        exchange.response.end(Some(Bytes::from(data)));
    }

    fn fallback(
        &self,
        exchange: &mut HttpExchange,
        behaviour: &ResponseBehaviour,
        senders: &[ResponseSender],
    ) {
        for sender in senders {
            match sender(exchange, behaviour) {
                Ok(true) => return,
                Ok(false) => continue,
                Err(e) => warn!("Error invoking response sender: {}", e),
            }
        }
        info!(
            "Response file and data are blank - returning empty response for {}",
            exchange.request().path()
        );
        exchange.response.end(None);
    }

    /// Read a behaviour's response file and parse it as a JSON array.
    /// Record-oriented plugins serve canned row sets this way.
    pub async fn load_response_as_json_array(
        &self,
        plugin_config: &PluginConfig,
        response_file: Option<&str>,
    ) -> Result<Vec<serde_json::Value>, EngineError> {
        let Some(file) = response_file else {
            debug!("Response file blank - returning empty array");
            return Ok(Vec::new());
        };

        let path = resolve_response_file(plugin_config, file)?;
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| EngineError::Render(format!("failed to read {file}: {e}")))?;
        match serde_json::from_str(&contents) {
            Ok(serde_json::Value::Array(items)) => Ok(items),
            Ok(_) => Err(EngineError::Render(format!(
                "response file {file} is not a JSON array"
            ))),
            Err(e) => Err(EngineError::Render(format!(
                "response file {file} is not valid JSON: {e}"
            ))),
        }
    }

    pub fn file_cache(&self) -> &ResponseFileCache {
        &self.file_cache
    }
}

/// A fallback sender that closes the response with no body and succeeds.
pub fn send_empty_response(exchange: &mut HttpExchange, _: &ResponseBehaviour) -> anyhow::Result<bool> {
    exchange.response.end(None);
    Ok(true)
}

/// Compute the simulated latency, if any.
///
/// An exact delay wins. Otherwise a value is drawn uniformly from
/// `[min, max)` — the upper bound is exclusive — with equal bounds yielding
/// exactly `min`.
fn effective_delay(performance: Option<&PerformanceConfig>) -> Option<Duration> {
    let performance = performance?;

    if let Some(exact) = performance.exact_delay_ms.filter(|ms| *ms > 0) {
        return Some(Duration::from_millis(exact));
    }

    let min = performance.min_delay_ms.unwrap_or(0);
    let max = performance.max_delay_ms.unwrap_or(0);
    if min > 0 && max >= min {
        let delay = if max == min {
            min
        } else {
            rand::thread_rng().gen_range(min..max)
        };
        return Some(Duration::from_millis(delay));
    }

    None
}

/// Resolve a response file against the plugin's configuration directory,
/// rejecting anything that would escape it.
fn resolve_response_file(plugin_config: &PluginConfig, file: &str) -> Result<PathBuf, EngineError> {
    let relative = Path::new(file);
    let escapes = relative.is_absolute()
        || relative
            .components()
            .any(|c| matches!(c, Component::ParentDir));
    if escapes {
        return Err(EngineError::Render(format!(
            "response file {file} escapes the configuration directory"
        )));
    }
    Ok(plugin_config.parent_dir.join(relative))
}

fn set_content_type_if_absent(
    exchange: &mut HttpExchange,
    resource_config: Option<&ResourceConfig>,
    plugin_config: &PluginConfig,
    filename_hint: Option<&str>,
) {
    if exchange.response.header(CONTENT_TYPE).is_some() {
        return;
    }

    let explicit = resource_config
        .and_then(|r| r.content_type.as_deref())
        .or(plugin_config.content_type.as_deref());
    if let Some(content_type) = explicit {
        exchange.response.put_header(CONTENT_TYPE, content_type);
        return;
    }

    if let Some(content_type) = filename_hint.and_then(content_type_for_filename) {
        debug!("Inferred {} content type", content_type);
        exchange.response.put_header(CONTENT_TYPE, content_type);
        return;
    }

    trace!("Guessing JSON content type");
    exchange.response.put_header(CONTENT_TYPE, CONTENT_TYPE_JSON);
}

/// Minimal MIME table for response-file extensions.
fn content_type_for_filename(filename: &str) -> Option<&'static str> {
    let extension = filename.rsplit_once('.').map(|(_, ext)| ext)?;
    match extension.to_ascii_lowercase().as_str() {
        "json" => Some("application/json"),
        "xml" => Some("application/xml"),
        "html" | "htm" => Some("text/html"),
        "txt" => Some("text/plain"),
        "csv" => Some("text/csv"),
        "yaml" | "yml" => Some("application/yaml"),
        "js" => Some("text/javascript"),
        "css" => Some("text/css"),
        "pdf" => Some("application/pdf"),
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "svg" => Some("image/svg+xml"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureEngine;
    use crate::exchange::{BodySource, RequestView};
    use crate::script::{RhaiScriptService, ScriptedResponseService};
    use crate::store::StoreFactory;
    use bytes::Bytes;
    use hyper::{HeaderMap, Method};
    use std::collections::HashMap;

    fn service() -> ResponseService {
        service_with_hooks(Arc::new(EngineLifecycleHooks::new()))
    }

    fn service_with_hooks(hooks: Arc<EngineLifecycleHooks>) -> ResponseService {
        let features = EngineFeatures::default();
        let stores = Arc::new(StoreFactory::in_memory());
        let scripted = Arc::new(ScriptedResponseService::new(
            Arc::new(RhaiScriptService::new()),
            Arc::clone(&hooks),
            Arc::clone(&stores),
            features,
        ));
        ResponseService::new(
            hooks,
            scripted,
            Arc::new(CaptureEngine::new(stores)),
            features,
        )
    }

    fn plugin(parent_dir: &Path) -> Arc<PluginConfig> {
        Arc::new(PluginConfig {
            plugin: "rest".to_string(),
            parent_dir: parent_dir.to_path_buf(),
            content_type: None,
            response: None,
            defaults_from_root_response: false,
            resources: Vec::new(),
        })
    }

    fn resource(response: crate::config::ResponseConfig) -> Arc<ResourceConfig> {
        Arc::new(ResourceConfig {
            method: Some("GET".to_string()),
            path: "/test".to_string(),
            query_params: HashMap::new(),
            request_headers: HashMap::new(),
            request_body: None,
            content_type: None,
            response,
            capture: HashMap::new(),
        })
    }

    fn exchange() -> HttpExchange {
        HttpExchange::new(RequestView::new(
            Method::GET,
            "/test".to_string(),
            Vec::new(),
            HeaderMap::new(),
            Bytes::new(),
        ))
    }

    #[test]
    fn test_exact_delay_wins() {
        let performance = PerformanceConfig {
            exact_delay_ms: Some(50),
            min_delay_ms: Some(500),
            max_delay_ms: Some(600),
        };
        assert_eq!(
            effective_delay(Some(&performance)),
            Some(Duration::from_millis(50))
        );
    }

    #[test]
    fn test_delay_range_upper_bound_exclusive() {
        let performance = PerformanceConfig {
            exact_delay_ms: None,
            min_delay_ms: Some(10),
            max_delay_ms: Some(12),
        };
        for _ in 0..100 {
            let delay = effective_delay(Some(&performance)).unwrap();
            assert!(delay >= Duration::from_millis(10));
            assert!(delay < Duration::from_millis(12));
        }
    }

    #[test]
    fn test_equal_bounds_yield_min() {
        let performance = PerformanceConfig {
            exact_delay_ms: None,
            min_delay_ms: Some(75),
            max_delay_ms: Some(75),
        };
        assert_eq!(
            effective_delay(Some(&performance)),
            Some(Duration::from_millis(75))
        );
    }

    #[test]
    fn test_no_delay_when_unconfigured() {
        assert_eq!(effective_delay(None), None);
        assert_eq!(effective_delay(Some(&PerformanceConfig::default())), None);
    }

    #[test]
    fn test_traversal_rejected() {
        let plugin = plugin(Path::new("/configs"));
        assert!(resolve_response_file(&plugin, "../secrets.txt").is_err());
        assert!(resolve_response_file(&plugin, "/etc/passwd").is_err());
        assert!(resolve_response_file(&plugin, "nested/ok.json").is_ok());
    }

    #[tokio::test]
    async fn test_inline_data_with_inferred_json() {
        let service = service();
        let plugin = plugin(Path::new("."));
        let resource = resource(crate::config::ResponseConfig {
            data: Some("pong".to_string()),
            ..Default::default()
        });

        let mut ex = exchange();
        service
            .respond(plugin, Some(resource), &mut ex, &[])
            .await
            .unwrap();

        assert_eq!(ex.response.status_code(), 200);
        assert_eq!(ex.response.header(CONTENT_TYPE), Some(CONTENT_TYPE_JSON));
        assert_eq!(
            *ex.response.body(),
            BodySource::Buffer(Bytes::from_static(b"pong"))
        );
    }

    #[tokio::test]
    async fn test_templated_file_served_through_cache() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("greeting.json"),
            r#"{"path": "${context.request.path}"}"#,
        )
        .unwrap();

        let hooks = Arc::new(EngineLifecycleHooks::new());
        hooks.register(Arc::new(crate::template::PlaceholderTemplateListener::new(
            None,
        )));
        let service = service_with_hooks(hooks);

        let plugin = plugin(dir.path());
        let resource = resource(crate::config::ResponseConfig {
            file: Some("greeting.json".to_string()),
            template: true,
            ..Default::default()
        });

        let mut ex = exchange();
        service
            .respond(plugin, Some(resource), &mut ex, &[])
            .await
            .unwrap();

        assert_eq!(
            *ex.response.body(),
            BodySource::Buffer(Bytes::from(r#"{"path": "/test"}"#))
        );
        assert_eq!(service.file_cache().len(), 1);
        assert_eq!(ex.response.header(CONTENT_TYPE), Some("application/json"));
    }

    #[tokio::test]
    async fn test_plain_file_streams_directly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.xml");
        std::fs::write(&path, "<ok/>").unwrap();

        let service = service();
        let plugin = plugin(dir.path());
        let resource = resource(crate::config::ResponseConfig {
            file: Some("payload.xml".to_string()),
            ..Default::default()
        });

        let mut ex = exchange();
        service
            .respond(plugin, Some(resource), &mut ex, &[])
            .await
            .unwrap();

        assert_eq!(*ex.response.body(), BodySource::File(path));
        assert_eq!(ex.response.header(CONTENT_TYPE), Some("application/xml"));
        assert_eq!(service.file_cache().len(), 0);
    }

    #[tokio::test]
    async fn test_missing_file_is_render_error() {
        let dir = tempfile::tempdir().unwrap();
        let service = service();
        let plugin = plugin(dir.path());
        let resource = resource(crate::config::ResponseConfig {
            file: Some("absent.json".to_string()),
            ..Default::default()
        });

        let result = service.respond(plugin, Some(resource), &mut exchange(), &[]).await;
        assert!(matches!(result, Err(EngineError::Render(_))));
    }

    #[tokio::test]
    async fn test_empty_behaviour_without_senders() {
        let service = service();
        let plugin = plugin(Path::new("."));
        let resource = resource(crate::config::ResponseConfig {
            status_code: Some(204),
            ..Default::default()
        });

        let mut ex = exchange();
        service
            .respond(plugin, Some(resource), &mut ex, &[])
            .await
            .unwrap();

        assert_eq!(ex.response.status_code(), 204);
        assert_eq!(*ex.response.body(), BodySource::Empty);
        assert!(ex.response.is_ended());
    }

    #[tokio::test]
    async fn test_fallback_sender_takes_over() {
        let service = service();
        let plugin = plugin(Path::new("."));
        let resource = resource(Default::default());

        let sender: ResponseSender = Arc::new(|exchange, _| {
            exchange.response.end(Some(Bytes::from_static(b"fallback")));
            Ok(true)
        });

        let mut ex = exchange();
        service
            .respond(plugin, Some(resource), &mut ex, &[sender])
            .await
            .unwrap();

        assert_eq!(
            *ex.response.body(),
            BodySource::Buffer(Bytes::from_static(b"fallback"))
        );
    }

    #[tokio::test]
    async fn test_root_response_fallback() {
        let mut plugin_config = PluginConfig {
            plugin: "rest".to_string(),
            parent_dir: PathBuf::from("."),
            content_type: None,
            response: Some(crate::config::ResponseConfig {
                status_code: Some(503),
                data: Some("maintenance".to_string()),
                ..Default::default()
            }),
            defaults_from_root_response: false,
            resources: Vec::new(),
        };
        plugin_config.content_type = Some("text/plain".to_string());

        let service = service();
        let mut ex = exchange();
        service
            .respond(Arc::new(plugin_config), None, &mut ex, &[])
            .await
            .unwrap();

        assert_eq!(ex.response.status_code(), 503);
        assert_eq!(ex.response.header(CONTENT_TYPE), Some("text/plain"));
    }

    #[tokio::test]
    async fn test_defaults_from_root_response_overlay() {
        let plugin_config = Arc::new(PluginConfig {
            plugin: "rest".to_string(),
            parent_dir: PathBuf::from("."),
            content_type: None,
            response: Some(crate::config::ResponseConfig {
                headers: HashMap::from([("X-Root".to_string(), "inherited".to_string())]),
                ..Default::default()
            }),
            defaults_from_root_response: true,
            resources: Vec::new(),
        });
        let resource = resource(crate::config::ResponseConfig {
            data: Some("body".to_string()),
            ..Default::default()
        });

        let service = service();
        let mut ex = exchange();
        service
            .respond(plugin_config, Some(resource), &mut ex, &[])
            .await
            .unwrap();

        assert_eq!(ex.response.header("X-Root"), Some("inherited"));
    }

    #[tokio::test]
    async fn test_load_response_as_json_array() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("rows.json"), r#"[{"id": 1}, {"id": 2}]"#).unwrap();

        let service = service();
        let plugin = plugin(dir.path());

        let rows = service
            .load_response_as_json_array(&plugin, Some("rows.json"))
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);

        let empty = service
            .load_response_as_json_array(&plugin, None)
            .await
            .unwrap();
        assert!(empty.is_empty());
    }
}
