//! Response body templating.
//!
//! Templated bodies may reference request data and store contents through
//! `${...}` placeholders:
//!
//! - `${context.request.path}` / `${context.request.method}` / `${context.request.body}`
//! - `${context.request.queryParams.<name>}`
//! - `${context.request.headers.<name>}` (case-insensitive)
//! - `${context.request.pathParams.<name>}`
//! - `${stores.<store>.<key>}`
//!
//! Unresolvable placeholders render as the empty string. Substitution is
//! wired into the transformer chain as an `EngineLifecycleListener`.

use crate::exchange::HttpExchange;
use crate::lifecycle::EngineLifecycleListener;
use crate::matcher::json_value_string;
use crate::store::StoreFactory;
use regex::Regex;
use std::sync::{Arc, OnceLock};

static PLACEHOLDER_REGEX: OnceLock<Regex> = OnceLock::new();

fn placeholder_regex() -> &'static Regex {
    PLACEHOLDER_REGEX.get_or_init(|| Regex::new(r"\$\{([a-zA-Z0-9_.\-]+)\}").unwrap())
}

/// Resolve all placeholders in `input` against the exchange and, when
/// available, the store factory.
pub fn substitute(input: &str, exchange: &HttpExchange, stores: Option<&StoreFactory>) -> String {
    placeholder_regex()
        .replace_all(input, |caps: &regex::Captures<'_>| {
            resolve(&caps[1], exchange, stores).unwrap_or_default()
        })
        .into_owned()
}

fn resolve(path: &str, exchange: &HttpExchange, stores: Option<&StoreFactory>) -> Option<String> {
    let request = exchange.request();

    if let Some(rest) = path.strip_prefix("context.request.") {
        return match rest.split_once('.') {
            None => match rest {
                "path" => Some(request.path().to_string()),
                "method" => Some(request.method().to_string()),
                "body" => Some(request.body_string()),
                "uri" => Some(request.path().to_string()),
                _ => None,
            },
            Some(("queryParams", name)) => request.query_param(name).map(str::to_string),
            Some(("headers", name)) => request.header(name).map(str::to_string),
            Some(("pathParams", name)) => exchange.path_params().get(name).cloned(),
            _ => None,
        };
    }

    if let Some(rest) = path.strip_prefix("stores.") {
        let (store_name, key) = rest.split_once('.')?;
        let store = stores?.open_or_create(store_name);
        return match store.load(key) {
            Ok(Some(value)) => Some(json_value_string(&value)),
            _ => None,
        };
    }

    None
}

/// Transformer-chain listener applying `${...}` substitution to every
/// templated body.
pub struct PlaceholderTemplateListener {
    stores: Option<Arc<StoreFactory>>,
}

impl PlaceholderTemplateListener {
    pub fn new(stores: Option<Arc<StoreFactory>>) -> Self {
        Self { stores }
    }
}

impl EngineLifecycleListener for PlaceholderTemplateListener {
    fn before_transmitting_template(&self, exchange: &mut HttpExchange, body: String) -> String {
        if !body.contains("${") {
            return body;
        }
        substitute(&body, exchange, self.stores.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::RequestView;
    use bytes::Bytes;
    use hyper::{HeaderMap, Method};
    use serde_json::json;
    use std::collections::HashMap;

    fn exchange() -> HttpExchange {
        let mut headers = HeaderMap::new();
        headers.insert("x-tenant", "acme".parse().unwrap());
        let mut exchange = HttpExchange::new(RequestView::new(
            Method::POST,
            "/orders/42".to_string(),
            RequestView::parse_query(Some("expand=items")),
            headers,
            Bytes::from_static(b"payload"),
        ));
        exchange.set_path_params(HashMap::from([("id".to_string(), "42".to_string())]));
        exchange
    }

    #[test]
    fn test_request_placeholders() {
        let body = "${context.request.method} ${context.request.path} \
                    q=${context.request.queryParams.expand} \
                    h=${context.request.headers.X-Tenant} \
                    p=${context.request.pathParams.id}";
        let result = substitute(body, &exchange(), None);
        assert_eq!(result, "POST /orders/42 q=items h=acme p=42");
    }

    #[test]
    fn test_store_placeholder() {
        let stores = StoreFactory::in_memory();
        stores
            .open_or_create("session")
            .save("user", json!("alice"))
            .unwrap();

        let result = substitute("hello ${stores.session.user}", &exchange(), Some(&stores));
        assert_eq!(result, "hello alice");
    }

    #[test]
    fn test_unresolvable_renders_empty() {
        let result = substitute("[${context.request.queryParams.missing}]", &exchange(), None);
        assert_eq!(result, "[]");
    }

    #[test]
    fn test_listener_short_circuits_plain_bodies() {
        let listener = PlaceholderTemplateListener::new(None);
        let mut ex = exchange();
        assert_eq!(
            listener.before_transmitting_template(&mut ex, "plain".to_string()),
            "plain"
        );
    }
}
