//! Rhai-backed `ScriptService`.
//!
//! Scripts drive the response through a builder obtained from `respond()`:
//!
//! ```text
//! if (context.request.queryParams.teapot == "true") {
//!     respond().withStatusCode(418).skipDefaultBehaviour();
//! } else {
//!     respond().withData(stores.open("greetings").load("latest")).usingDefaultBehaviour();
//! }
//! ```
//!
//! Compiled ASTs are cached per canonical script path and shared between
//! executions; a fresh engine instance is created per execution so requests
//! never share mutable interpreter state.

use super::{RuntimeContext, ScriptLogger, ScriptService};
use crate::behaviour::ReadWriteResponseBehaviour;
use crate::config::{PluginConfig, ResourceConfig};
use crate::store::{Store, StoreFactory};
use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use rhai::{Dynamic, Engine, EvalAltResult, Map, Position, Scope, AST};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::debug;

/// Response-builder handle registered with the script engine. Clones share
/// the same underlying behaviour, so chained calls and reassignment in the
/// script all mutate one per-request state.
#[derive(Clone)]
struct ScriptResponseBuilder {
    state: Arc<Mutex<ReadWriteResponseBehaviour>>,
}

impl ScriptResponseBuilder {
    fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ReadWriteResponseBehaviour::default())),
        }
    }

    fn take(&self) -> ReadWriteResponseBehaviour {
        self.state.lock().clone()
    }
}

fn runtime_error(message: impl Into<String>) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorRuntime(
        Dynamic::from(message.into()),
        Position::NONE,
    ))
}

/// Store namespace exposed to scripts as `stores`.
#[derive(Clone)]
struct ScriptStores {
    factory: Arc<StoreFactory>,
}

/// A single opened store.
#[derive(Clone)]
struct ScriptStore {
    store: Arc<dyn Store>,
}

struct CachedScript {
    ast: Arc<AST>,
    modified: Option<SystemTime>,
}

/// Script engine executing Rhai scripts with the response DSL.
pub struct RhaiScriptService {
    ast_cache: Mutex<HashMap<PathBuf, CachedScript>>,
    /// When set, cached scripts are never revalidated against the file's
    /// modification time.
    pin_cache: bool,
}

impl RhaiScriptService {
    pub fn new() -> Self {
        Self {
            ast_cache: Mutex::new(HashMap::new()),
            pin_cache: false,
        }
    }

    pub fn with_pinned_cache() -> Self {
        Self {
            ast_cache: Mutex::new(HashMap::new()),
            pin_cache: true,
        }
    }

    fn compiled(&self, path: &Path) -> Result<Arc<AST>> {
        let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok();

        let mut cache = self.ast_cache.lock();
        if let Some(cached) = cache.get(path) {
            if self.pin_cache || cached.modified == modified {
                return Ok(Arc::clone(&cached.ast));
            }
            debug!("Script {} changed on disk, recompiling", path.display());
        }

        let source = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read script {}", path.display()))?;
        let ast = Engine::new()
            .compile(&source)
            .map_err(|e| anyhow!("failed to compile script {}: {e}", path.display()))?;

        let ast = Arc::new(ast);
        cache.insert(
            path.to_path_buf(),
            CachedScript {
                ast: Arc::clone(&ast),
                modified,
            },
        );
        Ok(ast)
    }

    fn build_engine(builder: ScriptResponseBuilder, register_stores: bool) -> Engine {
        let mut engine = Engine::new();

        engine
            .register_type_with_name::<ScriptResponseBuilder>("ResponseBehaviour")
            .register_fn("withStatusCode", |b: &mut ScriptResponseBuilder, status: i64| {
                b.state.lock().with_status_code(status as u16);
                b.clone()
            })
            .register_fn("withFile", |b: &mut ScriptResponseBuilder, file: &str| {
                b.state.lock().with_file(file);
                b.clone()
            })
            .register_fn("withData", |b: &mut ScriptResponseBuilder, data: &str| {
                b.state.lock().with_data(data);
                b.clone()
            })
            .register_fn(
                "withHeader",
                |b: &mut ScriptResponseBuilder, name: &str, value: &str| {
                    b.state.lock().with_header(name, value);
                    b.clone()
                },
            )
            .register_fn(
                "withExampleName",
                |b: &mut ScriptResponseBuilder, name: &str| {
                    b.state.lock().with_example_name(name);
                    b.clone()
                },
            )
            .register_fn("withEmpty", |b: &mut ScriptResponseBuilder| {
                b.state.lock().with_empty();
                b.clone()
            })
            .register_fn("withDelay", |b: &mut ScriptResponseBuilder, delay_ms: i64| {
                b.state.lock().with_delay(delay_ms.max(0) as u64);
                b.clone()
            })
            .register_fn(
                "withDelayRange",
                |b: &mut ScriptResponseBuilder, min_ms: i64, max_ms: i64| {
                    b.state
                        .lock()
                        .with_delay_range(min_ms.max(0) as u64, max_ms.max(0) as u64);
                    b.clone()
                },
            )
            .register_fn(
                "usingDefaultBehaviour",
                |b: &mut ScriptResponseBuilder| -> Result<ScriptResponseBuilder, Box<EvalAltResult>> {
                    b.state
                        .lock()
                        .using_default_behaviour()
                        .map_err(|e| runtime_error(e.to_string()))?;
                    Ok(b.clone())
                },
            )
            .register_fn(
                "skipDefaultBehaviour",
                |b: &mut ScriptResponseBuilder| -> Result<ScriptResponseBuilder, Box<EvalAltResult>> {
                    b.state
                        .lock()
                        .skip_default_behaviour()
                        .map_err(|e| runtime_error(e.to_string()))?;
                    Ok(b.clone())
                },
            )
            .register_fn(
                "immediately",
                |b: &mut ScriptResponseBuilder| -> Result<ScriptResponseBuilder, Box<EvalAltResult>> {
                    b.state
                        .lock()
                        .skip_default_behaviour()
                        .map_err(|e| runtime_error(e.to_string()))?;
                    Ok(b.clone())
                },
            )
            .register_fn("and", |b: &mut ScriptResponseBuilder| b.clone());

        // builder methods are also callable as free functions on the handle
        // returned by respond()
        engine.register_fn("respond", move || builder.clone());

        engine
            .register_type_with_name::<ScriptLogger>("Logger")
            .register_fn("debug", |l: &mut ScriptLogger, msg: &str| l.debug(msg))
            .register_fn("info", |l: &mut ScriptLogger, msg: &str| l.info(msg))
            .register_fn("warn", |l: &mut ScriptLogger, msg: &str| l.warn(msg))
            .register_fn("error", |l: &mut ScriptLogger, msg: &str| l.error(msg));

        if register_stores {
            engine
                .register_type_with_name::<ScriptStores>("Stores")
                .register_fn("open", |s: &mut ScriptStores, name: &str| ScriptStore {
                    store: s.factory.open_or_create(name),
                })
                .register_type_with_name::<ScriptStore>("Store")
                .register_fn(
                    "save",
                    |s: &mut ScriptStore,
                     key: &str,
                     value: Dynamic|
                     -> Result<(), Box<EvalAltResult>> {
                        s.store
                            .save(key, dynamic_to_json(value))
                            .map_err(|e| runtime_error(e.to_string()))
                    },
                )
                .register_fn(
                    "load",
                    |s: &mut ScriptStore, key: &str| -> Result<Dynamic, Box<EvalAltResult>> {
                        let value = s
                            .store
                            .load(key)
                            .map_err(|e| runtime_error(e.to_string()))?;
                        Ok(value.map(json_to_dynamic).unwrap_or(Dynamic::UNIT))
                    },
                )
                .register_fn(
                    "hasKey",
                    |s: &mut ScriptStore, key: &str| -> Result<bool, Box<EvalAltResult>> {
                        s.store
                            .has_key(key)
                            .map_err(|e| runtime_error(e.to_string()))
                    },
                )
                .register_fn(
                    "loadAll",
                    |s: &mut ScriptStore| -> Result<Map, Box<EvalAltResult>> {
                        let all = s
                            .store
                            .load_all()
                            .map_err(|e| runtime_error(e.to_string()))?;
                        Ok(all
                            .into_iter()
                            .map(|(k, v)| (k.into(), json_to_dynamic(v)))
                            .collect())
                    },
                )
                .register_fn(
                    "delete",
                    |s: &mut ScriptStore, key: &str| -> Result<(), Box<EvalAltResult>> {
                        s.store
                            .delete(key)
                            .map_err(|e| runtime_error(e.to_string()))
                    },
                );
        }

        engine
    }

    fn context_map(context: &super::ScriptRequestContext) -> Map {
        let mut request = Map::new();
        request.insert("method".into(), Dynamic::from(context.method.clone()));
        request.insert("path".into(), Dynamic::from(context.path.clone()));
        request.insert("uri".into(), Dynamic::from(context.path.clone()));
        request.insert("body".into(), Dynamic::from(context.body.clone()));
        request.insert("headers".into(), string_map(&context.headers));
        request.insert("queryParams".into(), string_map(&context.query));
        request.insert("pathParams".into(), string_map(&context.path_params));

        let mut map = Map::new();
        map.insert("request".into(), Dynamic::from_map(request));
        map
    }
}

impl Default for RhaiScriptService {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptService for RhaiScriptService {
    fn execute_script(
        &self,
        _plugin_config: Arc<PluginConfig>,
        _resource_config: Option<Arc<ResourceConfig>>,
        runtime_context: RuntimeContext,
    ) -> Result<ReadWriteResponseBehaviour> {
        let ast = self.compiled(&runtime_context.script_path)?;

        let builder = ScriptResponseBuilder::new();
        let engine = Self::build_engine(builder.clone(), runtime_context.stores.is_some());

        let mut scope = Scope::new();
        scope.push_constant("context", Self::context_map(&runtime_context.request));
        scope.push_constant("env", string_map_owned(runtime_context.env));
        scope.push("logger", runtime_context.logger);
        if let Some(factory) = runtime_context.stores {
            scope.push("stores", ScriptStores { factory });
        }
        for (name, value) in runtime_context.bindings {
            scope.push_dynamic(name, json_to_dynamic(value));
        }

        engine
            .eval_ast_with_scope::<Dynamic>(&mut scope, ast.as_ref())
            .map_err(|e| {
                anyhow!(
                    "script {} raised: {e}",
                    runtime_context.script_path.display()
                )
            })?;

        Ok(builder.take())
    }
}

fn string_map(values: &HashMap<String, String>) -> Dynamic {
    let map: Map = values
        .iter()
        .map(|(k, v)| (k.clone().into(), Dynamic::from(v.clone())))
        .collect();
    Dynamic::from_map(map)
}

fn string_map_owned(values: HashMap<String, String>) -> Map {
    values
        .into_iter()
        .map(|(k, v)| (k.into(), Dynamic::from(v)))
        .collect()
}

fn json_to_dynamic(value: serde_json::Value) -> Dynamic {
    match value {
        serde_json::Value::Null => Dynamic::UNIT,
        serde_json::Value::Bool(b) => Dynamic::from(b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Dynamic::from(i)
            } else {
                Dynamic::from(n.as_f64().unwrap_or_default())
            }
        }
        serde_json::Value::String(s) => Dynamic::from(s),
        serde_json::Value::Array(items) => {
            let array: rhai::Array = items.into_iter().map(json_to_dynamic).collect();
            Dynamic::from_array(array)
        }
        serde_json::Value::Object(fields) => {
            let map: Map = fields
                .into_iter()
                .map(|(k, v)| (k.into(), json_to_dynamic(v)))
                .collect();
            Dynamic::from_map(map)
        }
    }
}

fn dynamic_to_json(value: Dynamic) -> serde_json::Value {
    if value.is_unit() {
        return serde_json::Value::Null;
    }
    if let Ok(b) = value.as_bool() {
        return serde_json::Value::Bool(b);
    }
    if let Ok(i) = value.as_int() {
        return serde_json::Value::Number(i.into());
    }
    if let Ok(f) = value.as_float() {
        return serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null);
    }
    if let Some(array) = value.read_lock::<rhai::Array>() {
        return serde_json::Value::Array(array.iter().cloned().map(dynamic_to_json).collect());
    }
    if let Some(map) = value.read_lock::<Map>() {
        return serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.to_string(), dynamic_to_json(v.clone())))
                .collect(),
        );
    }
    serde_json::Value::String(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behaviour::BehaviourType;
    use crate::script::ScriptRequestContext;
    use serde_json::json;
    use std::io::Write;

    fn write_script(dir: &tempfile::TempDir, name: &str, source: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(source.as_bytes()).unwrap();
        path
    }

    fn plugin_config() -> Arc<PluginConfig> {
        Arc::new(PluginConfig {
            plugin: "rest".to_string(),
            parent_dir: PathBuf::from("."),
            content_type: None,
            response: None,
            defaults_from_root_response: false,
            resources: Vec::new(),
        })
    }

    fn resource_config() -> Option<Arc<ResourceConfig>> {
        Some(Arc::new(ResourceConfig {
            method: None,
            path: "/scripted".to_string(),
            query_params: HashMap::new(),
            request_headers: HashMap::new(),
            request_body: None,
            content_type: None,
            response: Default::default(),
            capture: HashMap::new(),
        }))
    }

    fn runtime_context(script_path: PathBuf, stores: Option<Arc<StoreFactory>>) -> RuntimeContext {
        RuntimeContext {
            script_path,
            request: ScriptRequestContext {
                method: "GET".to_string(),
                path: "/scripted".to_string(),
                query: HashMap::from([("mode".to_string(), "summary".to_string())]),
                ..Default::default()
            },
            env: HashMap::from([("REGION".to_string(), "eu-west-1".to_string())]),
            bindings: HashMap::new(),
            stores,
            logger: ScriptLogger::new("test"),
        }
    }

    fn execute(script: &str, stores: Option<Arc<StoreFactory>>) -> ReadWriteResponseBehaviour {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(&dir, "behaviour.rhai", script);
        let service = RhaiScriptService::new();
        service
            .execute_script(plugin_config(), resource_config(), runtime_context(path, stores))
            .unwrap()
    }

    #[test]
    fn test_chained_builder() {
        let behaviour = execute(
            r#"respond().withStatusCode(201).withData("made").withHeader("X-Script", "on");"#,
            None,
        );
        let frozen = behaviour.build();
        assert_eq!(frozen.status_code(), 201);
        assert_eq!(frozen.response_data(), Some("made"));
        assert_eq!(frozen.headers()["X-Script"], "on");
    }

    #[test]
    fn test_skip_default_behaviour() {
        let behaviour = execute(
            r#"respond().withStatusCode(418).skipDefaultBehaviour();"#,
            None,
        );
        assert_eq!(behaviour.behaviour_type(), BehaviourType::ShortCircuit);
    }

    #[test]
    fn test_conditional_on_context() {
        let behaviour = execute(
            r#"
if context.request.queryParams.mode == "summary" {
    respond().withData("summary view").and().withStatusCode(200);
} else {
    respond().withStatusCode(400);
}
"#,
            None,
        );
        assert_eq!(behaviour.build().response_data(), Some("summary view"));
    }

    #[test]
    fn test_env_binding() {
        let behaviour = execute(r#"respond().withData(env.REGION);"#, None);
        assert_eq!(behaviour.build().response_data(), Some("eu-west-1"));
    }

    #[test]
    fn test_store_round_trip_from_script() {
        let stores = Arc::new(StoreFactory::in_memory());
        stores
            .open_or_create("items")
            .save("last", json!("widget"))
            .unwrap();

        let behaviour = execute(
            r#"respond().withData(stores.open("items").load("last"));"#,
            Some(Arc::clone(&stores)),
        );
        assert_eq!(behaviour.build().response_data(), Some("widget"));

        let behaviour = execute(
            r#"
let items = stores.open("items");
items.save("count", 3);
if items.hasKey("count") {
    respond().withData("saved");
}
"#,
            Some(Arc::clone(&stores)),
        );
        assert_eq!(behaviour.build().response_data(), Some("saved"));
        assert_eq!(
            stores.open_or_create("items").load("count").unwrap(),
            Some(json!(3))
        );
    }

    #[test]
    fn test_double_handling_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(
            &dir,
            "twice.rhai",
            r#"respond().skipDefaultBehaviour().usingDefaultBehaviour();"#,
        );
        let service = RhaiScriptService::new();
        let result = service.execute_script(
            plugin_config(),
            resource_config(),
            runtime_context(path, None),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_syntax_error_names_script() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(&dir, "broken.rhai", "respond(.withData(");
        let service = RhaiScriptService::new();
        let err = service
            .execute_script(
                plugin_config(),
                resource_config(),
                runtime_context(path, None),
            )
            .unwrap_err();
        assert!(err.to_string().contains("broken.rhai"));
    }

    #[test]
    fn test_ast_cache_invalidates_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(&dir, "mutable.rhai", r#"respond().withData("one");"#);
        let service = RhaiScriptService::new();

        let first = service
            .execute_script(
                plugin_config(),
                resource_config(),
                runtime_context(path.clone(), None),
            )
            .unwrap();
        assert_eq!(first.build().response_data(), Some("one"));

        // rewrite with a different mtime
        std::thread::sleep(std::time::Duration::from_millis(20));
        std::fs::write(&path, r#"respond().withData("two");"#).unwrap();

        let second = service
            .execute_script(
                plugin_config(),
                resource_config(),
                runtime_context(path, None),
            )
            .unwrap();
        assert_eq!(second.build().response_data(), Some("two"));
    }

    #[test]
    fn test_dynamic_json_round_trip() {
        let original = json!({"a": [1, 2.5, "x", null], "b": {"c": true}});
        let converted = dynamic_to_json(json_to_dynamic(original.clone()));
        assert_eq!(converted, original);
    }
}
