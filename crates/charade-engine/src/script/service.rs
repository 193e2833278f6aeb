//! Orchestration around script execution.
//!
//! Builds the runtime context for a request, aggregates lifecycle-listener
//! bindings, offloads the (blocking) script execution to a worker thread,
//! and times it.

use super::{RuntimeContext, ScriptLogger, ScriptRequestContext, ScriptService};
use crate::behaviour::ReadWriteResponseBehaviour;
use crate::config::{PluginConfig, ResourceConfig};
use crate::exchange::HttpExchange;
use crate::features::EngineFeatures;
use crate::lifecycle::EngineLifecycleHooks;
use crate::metrics;
use crate::store::StoreFactory;
use crate::EngineError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

const LOGGER_CACHE_CAPACITY: usize = 20;

struct CachedLogger {
    logger: ScriptLogger,
    last_used: Instant,
}

pub struct ScriptedResponseService {
    script_service: Arc<dyn ScriptService>,
    hooks: Arc<EngineLifecycleHooks>,
    stores: Arc<StoreFactory>,
    features: EngineFeatures,
    /// Process environment snapshot exposed to scripts
    env: HashMap<String, String>,
    loggers: Mutex<HashMap<String, CachedLogger>>,
}

impl ScriptedResponseService {
    pub fn new(
        script_service: Arc<dyn ScriptService>,
        hooks: Arc<EngineLifecycleHooks>,
        stores: Arc<StoreFactory>,
        features: EngineFeatures,
    ) -> Self {
        Self {
            script_service,
            hooks,
            stores,
            features,
            env: std::env::vars().collect(),
            loggers: Mutex::new(HashMap::new()),
        }
    }

    /// Execute the resource's script and return the behaviour it described.
    pub async fn determine_response_from_script(
        &self,
        plugin_config: Arc<PluginConfig>,
        resource_config: Option<Arc<ResourceConfig>>,
        script_file: &str,
        exchange: &HttpExchange,
    ) -> Result<ReadWriteResponseBehaviour, EngineError> {
        let script_path = plugin_config.parent_dir.join(script_file);

        let mut bindings = HashMap::new();
        self.hooks
            .for_each(|listener| listener.before_building_runtime_context(&mut bindings));
        let final_bindings = bindings.clone();

        let runtime_context = RuntimeContext {
            request: ScriptRequestContext::from_exchange(exchange),
            env: self.env.clone(),
            bindings,
            stores: self.features.stores.then(|| Arc::clone(&self.stores)),
            logger: self.logger_for(&script_path),
            script_path,
        };

        let service = Arc::clone(&self.script_service);
        let script_name = script_file.to_string();
        let started = Instant::now();

        let result = tokio::task::spawn_blocking(move || {
            service.execute_script(plugin_config, resource_config, runtime_context)
        })
        .await
        .map_err(|e| EngineError::Script {
            script: script_name.clone(),
            cause: anyhow::anyhow!("script worker panicked: {e}"),
        })?;

        let elapsed = started.elapsed();
        if self.features.metrics {
            metrics::SCRIPT_EXECUTION_DURATION.observe(elapsed.as_secs_f64());
        }

        match result {
            Ok(behaviour) => {
                debug!(
                    "Executed script {} in {:?}",
                    script_name, elapsed
                );
                self.hooks.for_each(|listener| {
                    listener.after_successful_script_execution(&final_bindings, &behaviour)
                });
                Ok(behaviour)
            }
            Err(cause) => Err(EngineError::Script {
                script: script_name,
                cause,
            }),
        }
    }

    /// Loggers are cached by script basename, bounded by an LRU of
    /// `LOGGER_CACHE_CAPACITY` entries.
    fn logger_for(&self, script_path: &Path) -> ScriptLogger {
        let name = script_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("script")
            .to_string();

        let mut loggers = self.loggers.lock();
        if let Some(cached) = loggers.get_mut(&name) {
            cached.last_used = Instant::now();
            return cached.logger.clone();
        }

        if loggers.len() >= LOGGER_CACHE_CAPACITY {
            if let Some(oldest) = loggers
                .iter()
                .min_by_key(|(_, cached)| cached.last_used)
                .map(|(name, _)| name.clone())
            {
                loggers.remove(&oldest);
            }
        }

        let logger = ScriptLogger::new(&name);
        loggers.insert(
            name,
            CachedLogger {
                logger: logger.clone(),
                last_used: Instant::now(),
            },
        );
        logger
    }
}
