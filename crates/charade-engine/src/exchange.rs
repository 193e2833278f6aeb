//! Uniform per-request view over an HTTP request/response pair.
//!
//! The pipeline operates on an `HttpExchange` regardless of the server
//! adapter that produced it. The exchange is single-owner: it is created by
//! the adapter, moved through the pipeline, and read back by the adapter
//! once the handler completes.

use anyhow::Error;
use bytes::Bytes;
use hyper::{HeaderMap, Method};
use std::collections::HashMap;
use std::path::PathBuf;

/// Immutable view of the inbound request.
#[derive(Debug, Clone)]
pub struct RequestView {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
}

impl RequestView {
    pub fn new(
        method: Method,
        path: String,
        query: Vec<(String, String)>,
        headers: HeaderMap,
        body: Bytes,
    ) -> Self {
        Self {
            method,
            path,
            query,
            headers,
            body,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// All query pairs in request order.
    pub fn query(&self) -> &[(String, String)] {
        &self.query
    }

    /// First value of the named query parameter.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Header lookup; names are case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Request body decoded as UTF-8, lossily.
    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Parse a raw query string into decoded pairs.
    pub fn parse_query(raw: Option<&str>) -> Vec<(String, String)> {
        raw.unwrap_or("")
            .split('&')
            .filter(|s| !s.is_empty())
            .filter_map(|pair| {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                let value = urlencoding::decode(value).ok()?.into_owned();
                Some((key.to_string(), value))
            })
            .collect()
    }
}

/// Where the response body comes from.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum BodySource {
    #[default]
    Empty,
    Buffer(Bytes),
    /// Absolute path of a file the adapter streams out verbatim
    File(PathBuf),
}

/// Mutable response under construction.
#[derive(Debug, Default)]
pub struct ResponseSink {
    status_code: u16,
    headers: Vec<(String, String)>,
    body: BodySource,
    ended: bool,
}

impl ResponseSink {
    pub fn status_code(&self) -> u16 {
        if self.status_code == 0 {
            200
        } else {
            self.status_code
        }
    }

    pub fn set_status_code(&mut self, status: u16) {
        self.status_code = status;
    }

    /// Set a header, replacing any existing value with the same
    /// (case-insensitive) name.
    pub fn put_header(&mut self, name: &str, value: &str) {
        self.headers
            .retain(|(existing, _)| !existing.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.to_string()));
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Stream the file at `path` as the response body and close the response.
    pub fn send_file(&mut self, path: PathBuf) {
        self.body = BodySource::File(path);
        self.ended = true;
    }

    /// Close the response, optionally with a body.
    pub fn end(&mut self, body: Option<Bytes>) {
        if let Some(bytes) = body {
            self.body = BodySource::Buffer(bytes);
        }
        self.ended = true;
    }

    pub fn body(&self) -> &BodySource {
        &self.body
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }
}

/// A failure attached to the exchange, routed to the matching status-code
/// error handler.
#[derive(Debug)]
pub struct ExchangeFailure {
    pub status_code: u16,
    pub cause: Option<Error>,
}

/// Per-request state threaded through the pipeline.
#[derive(Debug)]
pub struct HttpExchange {
    request: RequestView,
    pub response: ResponseSink,
    path_params: HashMap<String, String>,
    attributes: HashMap<String, serde_json::Value>,
    failure: Option<ExchangeFailure>,
}

impl HttpExchange {
    pub fn new(request: RequestView) -> Self {
        Self {
            request,
            response: ResponseSink::default(),
            path_params: HashMap::new(),
            attributes: HashMap::new(),
            failure: None,
        }
    }

    pub fn request(&self) -> &RequestView {
        &self.request
    }

    pub fn path_params(&self) -> &HashMap<String, String> {
        &self.path_params
    }

    pub fn set_path_params(&mut self, params: HashMap<String, String>) {
        self.path_params = params;
    }

    /// Attribute bag for passing route-matched context forward.
    pub fn attribute(&self, name: &str) -> Option<&serde_json::Value> {
        self.attributes.get(name)
    }

    pub fn set_attribute(&mut self, name: &str, value: serde_json::Value) {
        self.attributes.insert(name.to_string(), value);
    }

    /// Mark the exchange failed; the router maps this to an error handler.
    pub fn fail(&mut self, status_code: u16, cause: Option<Error>) {
        self.failure = Some(ExchangeFailure { status_code, cause });
    }

    pub fn failure(&self) -> Option<&ExchangeFailure> {
        self.failure.as_ref()
    }

    pub fn take_failure(&mut self) -> Option<ExchangeFailure> {
        self.failure.take()
    }
}
