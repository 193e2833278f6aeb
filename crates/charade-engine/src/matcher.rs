//! Resource matching and selection.
//!
//! Given a request and a plugin's ordered resource list, select the single
//! most specific matching resource. Matching proceeds in stages: method and
//! path template first, then the remaining constraints (query, header,
//! body). Qualifying resources are scored by specificity; ties go to the
//! earlier declaration.

use crate::config::{BodyMatchConfig, ResourceConfig};
use crate::exchange::HttpExchange;
use crate::EngineError;
use hyper::Method;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{trace, warn};

const SCORE_LITERAL_SEGMENT: u32 = 10;
const SCORE_PARAM_SEGMENT: u32 = 5;
const SCORE_QUERY_CONSTRAINT: u32 = 3;
const SCORE_HEADER_CONSTRAINT: u32 = 3;
const SCORE_BODY_MATCHER: u32 = 4;

/// One segment of a compiled path template.
#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Param(String),
}

/// A parsed `{name}`-style path template.
///
/// A parameter segment matches exactly one non-empty URL segment; literal
/// segments must match exactly. Trailing slashes are significant: `/a/` and
/// `/a` are distinct templates matching distinct paths.
#[derive(Debug, Clone)]
pub struct PathTemplate {
    raw: String,
    segments: Vec<Segment>,
}

impl PathTemplate {
    pub fn parse(raw: &str) -> Result<Self, EngineError> {
        if !raw.starts_with('/') {
            return Err(EngineError::Config(format!(
                "path template '{raw}' must start with '/'"
            )));
        }

        let segments = raw
            .split('/')
            .map(|segment| {
                if let Some(name) = segment.strip_prefix('{') {
                    let name = name.strip_suffix('}').ok_or_else(|| {
                        EngineError::Config(format!(
                            "unterminated parameter in path template '{raw}'"
                        ))
                    })?;
                    if name.is_empty() || name.contains(['{', '}']) {
                        return Err(EngineError::Config(format!(
                            "invalid parameter name in path template '{raw}'"
                        )));
                    }
                    Ok(Segment::Param(name.to_string()))
                } else if segment.contains(['{', '}']) {
                    Err(EngineError::Config(format!(
                        "misplaced brace in path template '{raw}'"
                    )))
                } else {
                    Ok(Segment::Literal(segment.to_string()))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Match a request path, yielding captured parameters on success.
    pub fn match_path(&self, path: &str) -> Option<HashMap<String, String>> {
        let parts: Vec<&str> = path.split('/').collect();
        if parts.len() != self.segments.len() {
            return None;
        }

        let mut params = HashMap::new();
        for (segment, part) in self.segments.iter().zip(&parts) {
            match segment {
                Segment::Literal(literal) => {
                    if literal != part {
                        return None;
                    }
                }
                Segment::Param(name) => {
                    if part.is_empty() {
                        return None;
                    }
                    params.insert(name.clone(), (*part).to_string());
                }
            }
        }
        Some(params)
    }

    fn literal_count(&self) -> u32 {
        self.segments
            .iter()
            // the leading empty segment before the first '/' carries no weight
            .filter(|s| matches!(s, Segment::Literal(l) if !l.is_empty()))
            .count() as u32
    }

    fn param_count(&self) -> u32 {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Param(_)))
            .count() as u32
    }
}

/// Body constraint compiled at configuration load time.
///
/// Selector syntax errors surface as `Config` errors at load; evaluation
/// errors at request time skip the owning resource instead of failing the
/// request.
#[derive(Debug, Clone)]
enum CompiledBodyMatcher {
    Literal(String),
    JsonPath {
        path: String,
        expected: Option<String>,
    },
    XPath {
        expression: String,
        expected: Option<String>,
    },
    Regex(Regex),
}

impl CompiledBodyMatcher {
    fn compile(config: &BodyMatchConfig) -> Result<Self, EngineError> {
        if let Some(path) = &config.json_path {
            validate_json_path(path)?;
            return Ok(Self::JsonPath {
                path: path.clone(),
                expected: config.value.clone(),
            });
        }
        if let Some(expression) = &config.x_path {
            validate_x_path(expression)?;
            return Ok(Self::XPath {
                expression: expression.clone(),
                expected: config.value.clone(),
            });
        }
        if let Some(pattern) = &config.regex {
            let regex = Regex::new(pattern).map_err(|e| {
                EngineError::Config(format!("invalid body regex '{pattern}': {e}"))
            })?;
            return Ok(Self::Regex(regex));
        }
        if let Some(value) = &config.value {
            return Ok(Self::Literal(value.clone()));
        }
        Err(EngineError::Config(
            "request body matcher declares no selector".to_string(),
        ))
    }

    fn matches(&self, body: &str) -> Result<bool, String> {
        match self {
            Self::Literal(expected) => Ok(body == expected),
            Self::JsonPath { path, expected } => {
                let json: serde_json::Value =
                    serde_json::from_str(body).map_err(|e| format!("body is not JSON: {e}"))?;
                match evaluate_json_path(&json, path) {
                    Some(value) => Ok(match expected {
                        Some(expected) => json_value_string(&value) == *expected,
                        None => true,
                    }),
                    None => Ok(false),
                }
            }
            Self::XPath {
                expression,
                expected,
            } => {
                let package = sxd_document::parser::parse(body)
                    .map_err(|e| format!("body is not XML: {e}"))?;
                let document = package.as_document();
                match sxd_xpath::evaluate_xpath(&document, expression) {
                    Ok(sxd_xpath::Value::Nodeset(nodes)) => match expected {
                        Some(expected) => Ok(nodes
                            .iter()
                            .next()
                            .is_some_and(|n| n.string_value() == *expected)),
                        None => Ok(nodes.size() > 0),
                    },
                    Ok(sxd_xpath::Value::String(s)) => Ok(match expected {
                        Some(expected) => s == *expected,
                        None => !s.is_empty(),
                    }),
                    Ok(sxd_xpath::Value::Boolean(b)) => Ok(match expected {
                        Some(expected) => b.to_string() == *expected,
                        None => b,
                    }),
                    Ok(sxd_xpath::Value::Number(n)) => Ok(match expected {
                        Some(expected) => n.to_string() == *expected,
                        None => true,
                    }),
                    Err(e) => Err(format!("xpath evaluation failed: {e}")),
                }
            }
            Self::Regex(regex) => Ok(regex.is_match(body)),
        }
    }
}

/// Evaluate the dotted-path subset of JSONPath supported for body matching
/// and captures: `$.field.nested`, `$.array[0].field`.
pub fn evaluate_json_path(json: &serde_json::Value, path: &str) -> Option<serde_json::Value> {
    let path = path.trim_start_matches('$').trim_start_matches('.');

    let mut current = json;
    for part in path.split('.') {
        if part.is_empty() {
            continue;
        }
        if let Some(bracket) = part.find('[') {
            let field = &part[..bracket];
            let index: usize = part[bracket + 1..part.len() - 1].parse().ok()?;
            if !field.is_empty() {
                current = current.get(field)?;
            }
            current = current.get(index)?;
        } else {
            current = current.get(part)?;
        }
    }
    Some(current.clone())
}

/// String form of a JSON leaf, without quoting.
pub fn json_value_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn validate_json_path(path: &str) -> Result<(), EngineError> {
    if !path.starts_with('$') {
        return Err(EngineError::Config(format!(
            "JSONPath '{path}' must start with '$'"
        )));
    }
    Ok(())
}

fn validate_x_path(expression: &str) -> Result<(), EngineError> {
    let factory = sxd_xpath::Factory::new();
    match factory.build(expression) {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(EngineError::Config(format!("empty XPath '{expression}'"))),
        Err(e) => Err(EngineError::Config(format!(
            "invalid XPath '{expression}': {e}"
        ))),
    }
}

/// A resource with its match criteria compiled.
pub struct CompiledResource {
    pub config: Arc<ResourceConfig>,
    index: usize,
    method: Option<Method>,
    template: PathTemplate,
    body_matcher: Option<CompiledBodyMatcher>,
    /// Static part of the specificity score
    score: u32,
}

/// Outcome of a successful resolution.
pub struct ResolvedResource {
    pub config: Arc<ResourceConfig>,
    pub path_params: HashMap<String, String>,
}

/// Compiled matcher over one plugin's resource list.
pub struct ResourceMatcher {
    resources: Vec<CompiledResource>,
    /// Resource ids whose body matcher has already been reported
    reported: Mutex<HashSet<String>>,
}

impl ResourceMatcher {
    /// Compile all resources. Malformed templates and selectors fail here,
    /// at configuration load time.
    pub fn compile(resources: &[ResourceConfig]) -> Result<Self, EngineError> {
        let compiled = resources
            .iter()
            .enumerate()
            .map(|(index, resource)| {
                let method = resource
                    .method
                    .as_deref()
                    .map(|m| {
                        m.to_ascii_uppercase().parse::<Method>().map_err(|_| {
                            EngineError::Config(format!("invalid method '{m}'"))
                        })
                    })
                    .transpose()?;

                let template = PathTemplate::parse(&resource.path)?;
                let body_matcher = resource
                    .request_body
                    .as_ref()
                    .map(CompiledBodyMatcher::compile)
                    .transpose()?;

                let score = template.literal_count() * SCORE_LITERAL_SEGMENT
                    + template.param_count() * SCORE_PARAM_SEGMENT
                    + resource.query_params.len() as u32 * SCORE_QUERY_CONSTRAINT
                    + resource.request_headers.len() as u32 * SCORE_HEADER_CONSTRAINT
                    + if body_matcher.is_some() {
                        SCORE_BODY_MATCHER
                    } else {
                        0
                    };

                Ok(CompiledResource {
                    config: Arc::new(resource.clone()),
                    index,
                    method,
                    template,
                    body_matcher,
                    score,
                })
            })
            .collect::<Result<Vec<_>, EngineError>>()?;

        Ok(Self {
            resources: compiled,
            reported: Mutex::new(HashSet::new()),
        })
    }

    /// Select the most specific resource matching the exchange, or `None`.
    pub fn resolve(&self, exchange: &HttpExchange) -> Option<ResolvedResource> {
        let request = exchange.request();
        let mut best: Option<(&CompiledResource, HashMap<String, String>)> = None;

        for resource in &self.resources {
            if let Some(method) = &resource.method {
                if method != request.method() {
                    continue;
                }
            }
            let Some(params) = resource.template.match_path(request.path()) else {
                continue;
            };
            if !self.qualifies(resource, exchange) {
                continue;
            }

            trace!(
                "Resource {} qualifies with score {}",
                resource.config.resource_id(),
                resource.score
            );

            // strictly-greater keeps the earliest declaration on ties
            match &best {
                Some((current, _)) if resource.score <= current.score => {}
                _ => best = Some((resource, params)),
            }
        }

        best.map(|(resource, path_params)| ResolvedResource {
            config: Arc::clone(&resource.config),
            path_params,
        })
    }

    fn qualifies(&self, resource: &CompiledResource, exchange: &HttpExchange) -> bool {
        let request = exchange.request();

        for (name, expected) in &resource.config.query_params {
            if request.query_param(name) != Some(expected.as_str()) {
                return false;
            }
        }

        for (name, expected) in &resource.config.request_headers {
            if request.header(name) != Some(expected.as_str()) {
                return false;
            }
        }

        if let Some(matcher) = &resource.body_matcher {
            match matcher.matches(&request.body_string()) {
                Ok(matched) => return matched,
                Err(reason) => {
                    let id = resource.config.resource_id();
                    if self.reported.lock().insert(id.clone()) {
                        warn!("Body matcher failed for resource {}: {}", id, reason);
                    }
                    return false;
                }
            }
        }

        true
    }

    /// Resources declared, mostly for diagnostics.
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// `index`th resource's declaration-order position (test support).
    #[cfg(test)]
    fn score_of(&self, index: usize) -> u32 {
        self.resources[index].score
    }
}
