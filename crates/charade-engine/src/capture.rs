//! Value capture: extracting named values from requests into stores.
//!
//! Each enabled capture on a resolved resource computes a
//! (store, key, value) triple. Key and store name may themselves be derived
//! from the request through nested item captures (one level deep by
//! construction). A failed capture is logged and skipped; it never fails
//! the request.

use crate::config::{CaptureConfig, CapturePhase, ItemCaptureConfig, ResourceConfig};
use crate::exchange::HttpExchange;
use crate::matcher::evaluate_json_path;
use crate::store::{StoreFactory, DEFAULT_CAPTURE_STORE};
use crate::template;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct CaptureEngine {
    stores: Arc<StoreFactory>,
}

impl CaptureEngine {
    pub fn new(stores: Arc<StoreFactory>) -> Self {
        Self { stores }
    }

    /// Run every enabled capture declared for `phase`, in declaration
    /// order. Later captures targeting the same (store, key) overwrite
    /// earlier ones.
    pub fn run_captures(
        &self,
        resource: &ResourceConfig,
        phase: CapturePhase,
        exchange: &HttpExchange,
    ) {
        // HashMap order is arbitrary; captures apply in name order so
        // last-wins is deterministic for a given configuration.
        let mut names: Vec<&String> = resource
            .capture
            .iter()
            .filter(|(_, c)| c.enabled && c.phase == phase)
            .map(|(name, _)| name)
            .collect();
        names.sort();

        for name in names {
            let config = &resource.capture[name];
            if let Err(reason) = self.capture_one(name, config, exchange) {
                warn!(
                    "Capture {} failed for resource {}: {}",
                    name,
                    resource.resource_id(),
                    reason
                );
            }
        }
    }

    fn capture_one(
        &self,
        name: &str,
        config: &CaptureConfig,
        exchange: &HttpExchange,
    ) -> Result<(), String> {
        let Some(value) = self.evaluate(&capture_source(config), exchange)? else {
            debug!("Capture {} yielded no value", name);
            return Ok(());
        };

        let key = match &config.key {
            Some(item) => self
                .evaluate(&item_source(item), exchange)?
                .map(|v| value_to_string(&v))
                .ok_or("store key evaluated to nothing")?,
            None => name.to_string(),
        };

        let store_name = match &config.store {
            Some(item) => self
                .evaluate(&item_source(item), exchange)?
                .map(|v| value_to_string(&v))
                .ok_or("store name evaluated to nothing")?,
            None => DEFAULT_CAPTURE_STORE.to_string(),
        };

        debug!("Capturing {} into {}/{}", name, store_name, key);
        self.stores
            .open_or_create(&store_name)
            .save(&key, value)
            .map_err(|e| e.to_string())
    }

    fn evaluate(
        &self,
        source: &Source<'_>,
        exchange: &HttpExchange,
    ) -> Result<Option<Value>, String> {
        if let Some(name) = source.path_param {
            return Ok(exchange
                .path_params()
                .get(name)
                .map(|v| Value::String(v.clone())));
        }
        if let Some(name) = source.query_param {
            return Ok(exchange
                .request()
                .query_param(name)
                .map(|v| Value::String(v.to_string())));
        }
        if let Some(name) = source.request_header {
            return Ok(exchange
                .request()
                .header(name)
                .map(|v| Value::String(v.to_string())));
        }
        if let Some(path) = source.json_path {
            let body: Value = serde_json::from_str(&exchange.request().body_string())
                .map_err(|e| format!("request body is not JSON: {e}"))?;
            return Ok(evaluate_json_path(&body, path));
        }
        if let Some(expression) = source.expression {
            let rendered = template::substitute(expression, exchange, Some(&self.stores));
            return Ok(Some(Value::String(rendered)));
        }
        if let Some(constant) = source.const_value {
            return Ok(Some(Value::String(constant.to_string())));
        }
        Err("capture declares no source".to_string())
    }
}

/// The six alternative capture sources, borrowed from either config shape.
struct Source<'a> {
    path_param: Option<&'a str>,
    query_param: Option<&'a str>,
    request_header: Option<&'a str>,
    json_path: Option<&'a str>,
    expression: Option<&'a str>,
    const_value: Option<&'a str>,
}

fn capture_source(config: &CaptureConfig) -> Source<'_> {
    Source {
        path_param: config.path_param.as_deref(),
        query_param: config.query_param.as_deref(),
        request_header: config.request_header.as_deref(),
        json_path: config.json_path.as_deref(),
        expression: config.expression.as_deref(),
        const_value: config.const_value.as_deref(),
    }
}

fn item_source(config: &ItemCaptureConfig) -> Source<'_> {
    Source {
        path_param: config.path_param.as_deref(),
        query_param: config.query_param.as_deref(),
        request_header: config.request_header.as_deref(),
        json_path: config.json_path.as_deref(),
        expression: config.expression.as_deref(),
        const_value: config.const_value.as_deref(),
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResponseConfig;
    use crate::exchange::RequestView;
    use bytes::Bytes;
    use hyper::{HeaderMap, Method};
    use serde_json::json;
    use std::collections::HashMap;

    fn resource_with(captures: Vec<(&str, CaptureConfig)>) -> ResourceConfig {
        ResourceConfig {
            method: Some("POST".to_string()),
            path: "/items".to_string(),
            query_params: HashMap::new(),
            request_headers: HashMap::new(),
            request_body: None,
            content_type: None,
            response: ResponseConfig::default(),
            capture: captures
                .into_iter()
                .map(|(name, c)| (name.to_string(), c))
                .collect(),
        }
    }

    fn exchange(body: &str, query: Option<&str>) -> HttpExchange {
        let mut headers = HeaderMap::new();
        headers.insert("x-correlation-id", "corr-1".parse().unwrap());
        let mut exchange = HttpExchange::new(RequestView::new(
            Method::POST,
            "/items".to_string(),
            RequestView::parse_query(query),
            headers,
            Bytes::from(body.to_string()),
        ));
        exchange.set_path_params(HashMap::from([("id".to_string(), "9".to_string())]));
        exchange
    }

    #[test]
    fn test_json_path_capture_to_named_store() {
        let stores = Arc::new(StoreFactory::in_memory());
        let engine = CaptureEngine::new(Arc::clone(&stores));

        let resource = resource_with(vec![(
            "name",
            CaptureConfig {
                json_path: Some("$.name".to_string()),
                key: Some(ItemCaptureConfig {
                    const_value: Some("last".to_string()),
                    ..Default::default()
                }),
                store: Some(ItemCaptureConfig {
                    const_value: Some("items".to_string()),
                    ..Default::default()
                }),
                enabled: true,
                ..Default::default()
            },
        )]);

        engine.run_captures(
            &resource,
            CapturePhase::RequestReceived,
            &exchange(r#"{"name":"widget"}"#, None),
        );

        let store = stores.open_or_create("items");
        assert_eq!(store.load("last").unwrap(), Some(json!("widget")));
    }

    #[test]
    fn test_key_defaults_to_capture_name() {
        let stores = Arc::new(StoreFactory::in_memory());
        let engine = CaptureEngine::new(Arc::clone(&stores));

        let resource = resource_with(vec![(
            "correlation",
            CaptureConfig {
                request_header: Some("X-Correlation-Id".to_string()),
                enabled: true,
                ..Default::default()
            },
        )]);

        engine.run_captures(
            &resource,
            CapturePhase::RequestReceived,
            &exchange("", None),
        );

        let store = stores.open_or_create(DEFAULT_CAPTURE_STORE);
        assert_eq!(store.load("correlation").unwrap(), Some(json!("corr-1")));
    }

    #[test]
    fn test_key_derived_from_request() {
        let stores = Arc::new(StoreFactory::in_memory());
        let engine = CaptureEngine::new(Arc::clone(&stores));

        let resource = resource_with(vec![(
            "payload",
            CaptureConfig {
                json_path: Some("$.value".to_string()),
                key: Some(ItemCaptureConfig {
                    path_param: Some("id".to_string()),
                    ..Default::default()
                }),
                enabled: true,
                ..Default::default()
            },
        )]);

        engine.run_captures(
            &resource,
            CapturePhase::RequestReceived,
            &exchange(r#"{"value": 17}"#, None),
        );

        let store = stores.open_or_create(DEFAULT_CAPTURE_STORE);
        assert_eq!(store.load("9").unwrap(), Some(json!(17)));
    }

    #[test]
    fn test_failed_capture_is_skipped() {
        let stores = Arc::new(StoreFactory::in_memory());
        let engine = CaptureEngine::new(Arc::clone(&stores));

        let resource = resource_with(vec![
            (
                "broken",
                CaptureConfig {
                    json_path: Some("$.x".to_string()),
                    enabled: true,
                    ..Default::default()
                },
            ),
            (
                "works",
                CaptureConfig {
                    const_value: Some("still here".to_string()),
                    enabled: true,
                    ..Default::default()
                },
            ),
        ]);

        // body is not JSON: the jsonPath capture fails, the const capture runs
        engine.run_captures(
            &resource,
            CapturePhase::RequestReceived,
            &exchange("not json", None),
        );

        let store = stores.open_or_create(DEFAULT_CAPTURE_STORE);
        assert!(!store.has_key("broken").unwrap());
        assert_eq!(store.load("works").unwrap(), Some(json!("still here")));
    }

    #[test]
    fn test_disabled_and_phase_filtering() {
        let stores = Arc::new(StoreFactory::in_memory());
        let engine = CaptureEngine::new(Arc::clone(&stores));

        let resource = resource_with(vec![
            (
                "disabled",
                CaptureConfig {
                    const_value: Some("no".to_string()),
                    enabled: false,
                    ..Default::default()
                },
            ),
            (
                "late",
                CaptureConfig {
                    const_value: Some("after".to_string()),
                    phase: CapturePhase::ResponseSent,
                    enabled: true,
                    ..Default::default()
                },
            ),
        ]);

        engine.run_captures(
            &resource,
            CapturePhase::RequestReceived,
            &exchange("", None),
        );
        let store = stores.open_or_create(DEFAULT_CAPTURE_STORE);
        assert_eq!(store.count().unwrap(), 0);

        engine.run_captures(&resource, CapturePhase::ResponseSent, &exchange("", None));
        assert_eq!(store.load("late").unwrap(), Some(json!("after")));
    }

    #[test]
    fn test_last_capture_wins_on_shared_key() {
        let stores = Arc::new(StoreFactory::in_memory());
        let engine = CaptureEngine::new(Arc::clone(&stores));

        let shared_key = |value: &str| CaptureConfig {
            const_value: Some(value.to_string()),
            key: Some(ItemCaptureConfig {
                const_value: Some("slot".to_string()),
                ..Default::default()
            }),
            enabled: true,
            ..Default::default()
        };

        let resource = resource_with(vec![
            ("a_first", shared_key("early")),
            ("b_second", shared_key("late")),
        ]);

        engine.run_captures(
            &resource,
            CapturePhase::RequestReceived,
            &exchange("", None),
        );

        let store = stores.open_or_create(DEFAULT_CAPTURE_STORE);
        assert_eq!(store.load("slot").unwrap(), Some(json!("late")));
    }
}
