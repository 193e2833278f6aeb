//! Plugin surface.
//!
//! A plugin supplies routes and per-request behaviour for one family of
//! endpoints. Plugins are referenced by registered short name only: the
//! registry maps `name -> factory`, populated explicitly at startup and
//! read-only thereafter.

mod rest;

pub use rest::RestPlugin;

use crate::capture::CaptureEngine;
use crate::config::PluginConfig;
use crate::exchange::HttpExchange;
use crate::response::ResponseService;
use crate::router::{HandlerFuture, RouteHandler, Router};
use crate::EngineError;
use hyper::Method;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// A route contributed by a plugin. `path: None` is a catch-all.
pub struct PluginRoute {
    pub method: Option<Method>,
    pub path: Option<String>,
    /// Configuration document the route was derived from
    pub config: Arc<PluginConfig>,
}

/// Strategy supplying routes and behaviour for one family of endpoints.
pub trait MockPlugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// Routes across all configuration documents loaded into this plugin.
    fn routes(&self) -> Vec<PluginRoute>;

    /// Handle a request dispatched to one of this plugin's routes.
    fn on_request<'a>(
        &'a self,
        exchange: &'a mut HttpExchange,
        config: Arc<PluginConfig>,
    ) -> HandlerFuture<'a>;
}

/// Collaborators handed to plugin factories.
#[derive(Clone)]
pub struct PluginDeps {
    pub response_service: Arc<ResponseService>,
    pub captures: Arc<CaptureEngine>,
}

pub type PluginFactory = Arc<
    dyn Fn(Vec<Arc<PluginConfig>>, PluginDeps) -> Result<Arc<dyn MockPlugin>, EngineError>
        + Send
        + Sync,
>;

/// Explicit registration table of available plugins.
#[derive(Default)]
pub struct PluginRegistry {
    factories: HashMap<String, PluginFactory>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in plugin set.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("rest", Arc::new(|configs, deps| RestPlugin::create(configs, deps)));
        registry
    }

    pub fn register(&mut self, name: &str, factory: PluginFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn create(
        &self,
        name: &str,
        configs: Vec<Arc<PluginConfig>>,
        deps: PluginDeps,
    ) -> Result<Arc<dyn MockPlugin>, EngineError> {
        let factory = self.factories.get(name).ok_or_else(|| {
            EngineError::Config(format!("no plugin registered under name '{name}'"))
        })?;
        factory(configs, deps)
    }
}

/// Plugins instantiated for this process, in startup order.
#[derive(Default)]
pub struct PluginManager {
    plugins: Vec<Arc<dyn MockPlugin>>,
}

impl PluginManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, plugin: Arc<dyn MockPlugin>) {
        self.plugins.push(plugin);
    }

    pub fn plugins(&self) -> &[Arc<dyn MockPlugin>] {
        &self.plugins
    }

    /// Register every plugin's routes with the router.
    pub fn register_routes(&self, router: &mut Router) -> Result<(), EngineError> {
        for plugin in &self.plugins {
            let routes = plugin.routes();
            info!("Registering {} route(s) for plugin {}", routes.len(), plugin.name());

            for route in routes {
                let handler = PluginRouteHandler {
                    plugin: Arc::clone(plugin),
                    config: Arc::clone(&route.config),
                };
                router.route(route.method.clone(), route.path.as_deref(), Arc::new(handler))?;
            }
        }
        Ok(())
    }
}

/// Adapts a plugin route to the router's handler contract.
struct PluginRouteHandler {
    plugin: Arc<dyn MockPlugin>,
    config: Arc<PluginConfig>,
}

impl RouteHandler for PluginRouteHandler {
    fn handle<'a>(&'a self, exchange: &'a mut HttpExchange) -> HandlerFuture<'a> {
        self.plugin.on_request(exchange, Arc::clone(&self.config))
    }
}
