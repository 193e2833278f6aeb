//! Engine assembly.
//!
//! Wires the process-wide services together: configuration discovery,
//! store factory, lifecycle hooks, script and response services, plugin
//! registry, router, and the HTTP adapter.

use crate::capture::CaptureEngine;
use crate::config::{self, PluginConfig};
use crate::features::EngineFeatures;
use crate::lifecycle::EngineLifecycleHooks;
use crate::plugin::{PluginDeps, PluginManager, PluginRegistry};
use crate::response::ResponseService;
use crate::router::Router;
use crate::script::{RhaiScriptService, ScriptedResponseService};
use crate::server::HttpServer;
use crate::store::StoreFactory;
use crate::template::PlaceholderTemplateListener;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

pub struct EngineSettings {
    pub bind_addr: SocketAddr,
    pub config_dirs: Vec<PathBuf>,
    pub features: EngineFeatures,
}

pub struct Engine {
    server: HttpServer,
}

impl Engine {
    /// Load configuration, wire the pipeline, and bind the listener.
    pub async fn bind(settings: EngineSettings) -> Result<Self> {
        let features = settings.features;

        // store backend comes from the first directory that configures one
        let store_config = settings
            .config_dirs
            .iter()
            .find_map(|dir| config::load_store_config(dir).transpose())
            .transpose()?;
        let stores = Arc::new(StoreFactory::from_config(store_config.as_ref())?);

        let hooks = Arc::new(EngineLifecycleHooks::new());
        hooks.register(Arc::new(PlaceholderTemplateListener::new(
            features.stores.then(|| Arc::clone(&stores)),
        )));

        let scripted = Arc::new(ScriptedResponseService::new(
            Arc::new(RhaiScriptService::new()),
            Arc::clone(&hooks),
            Arc::clone(&stores),
            features,
        ));
        let captures = Arc::new(CaptureEngine::new(Arc::clone(&stores)));
        let response_service = Arc::new(ResponseService::new(
            hooks,
            scripted,
            Arc::clone(&captures),
            features,
        ));

        let deps = PluginDeps {
            response_service,
            captures,
        };

        let registry = PluginRegistry::with_builtins();
        let mut manager = PluginManager::new();

        let discovered = config::discover_configs(&settings.config_dirs)?;
        for (plugin_name, files) in discovered {
            let configs = files
                .iter()
                .map(|path| {
                    config::load_plugin_config(path)
                        .map(Arc::new)
                        .with_context(|| format!("loading {}", path.display()))
                })
                .collect::<Result<Vec<Arc<PluginConfig>>>>()?;

            info!(
                "Loaded {} configuration file(s) for plugin {}",
                configs.len(),
                plugin_name
            );
            manager.add(registry.create(&plugin_name, configs, deps.clone())?);
        }

        let mut router = Router::new();
        manager.register_routes(&mut router)?;

        let server = HttpServer::bind(settings.bind_addr, Arc::new(router), features).await?;
        Ok(Self { server })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.server.local_addr()
    }

    /// Serve until the surrounding task is dropped.
    pub async fn run(self) {
        self.server.serve().await
    }
}
