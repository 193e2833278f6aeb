//! REST plugin: plain declarative resources.
//!
//! Routes one request through resource resolution, `request_received`
//! captures, and the response pipeline. Unmatched requests fall back to the
//! document's root response when one is declared, else 404.

use super::{MockPlugin, PluginDeps, PluginRoute};
use crate::capture::CaptureEngine;
use crate::config::{CapturePhase, PluginConfig};
use crate::exchange::HttpExchange;
use crate::matcher::ResourceMatcher;
use crate::response::{send_empty_response, ResponseSender, ResponseService};
use crate::router::{send_not_found, HandlerFuture};
use crate::EngineError;
use hyper::Method;
use std::sync::Arc;
use tracing::debug;

struct LoadedConfig {
    config: Arc<PluginConfig>,
    matcher: ResourceMatcher,
}

pub struct RestPlugin {
    configs: Vec<LoadedConfig>,
    response_service: Arc<ResponseService>,
    captures: Arc<CaptureEngine>,
    fallback_senders: Vec<ResponseSender>,
}

impl RestPlugin {
    pub fn create(
        configs: Vec<Arc<PluginConfig>>,
        deps: PluginDeps,
    ) -> Result<Arc<dyn MockPlugin>, EngineError> {
        let configs = configs
            .into_iter()
            .map(|config| {
                let matcher = ResourceMatcher::compile(&config.resources)?;
                Ok(LoadedConfig { config, matcher })
            })
            .collect::<Result<Vec<_>, EngineError>>()?;

        let empty_sender: ResponseSender = Arc::new(send_empty_response);
        Ok(Arc::new(Self {
            configs,
            response_service: deps.response_service,
            captures: deps.captures,
            fallback_senders: vec![empty_sender],
        }))
    }

    fn loaded(&self, config: &Arc<PluginConfig>) -> Option<&LoadedConfig> {
        self.configs
            .iter()
            .find(|loaded| Arc::ptr_eq(&loaded.config, config))
    }
}

impl MockPlugin for RestPlugin {
    fn name(&self) -> &'static str {
        "rest"
    }

    fn routes(&self) -> Vec<PluginRoute> {
        let mut routes = Vec::new();
        for loaded in &self.configs {
            for resource in &loaded.config.resources {
                let method = resource
                    .method
                    .as_deref()
                    .and_then(|m| m.to_ascii_uppercase().parse::<Method>().ok());
                routes.push(PluginRoute {
                    method,
                    path: Some(resource.path.clone()),
                    config: Arc::clone(&loaded.config),
                });
            }
        }

        // root responses answer anything the resources do not; they go last
        // so one document's catch-all cannot shadow another's resources
        for loaded in &self.configs {
            if loaded.config.response.is_some() {
                routes.push(PluginRoute {
                    method: None,
                    path: None,
                    config: Arc::clone(&loaded.config),
                });
            }
        }
        routes
    }

    fn on_request<'a>(
        &'a self,
        exchange: &'a mut HttpExchange,
        config: Arc<PluginConfig>,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            let Some(loaded) = self.loaded(&config) else {
                return Err(EngineError::Config(
                    "request dispatched to an unloaded configuration".to_string(),
                ));
            };

            match loaded.matcher.resolve(exchange) {
                Some(resolved) => {
                    debug!(
                        "Handling {} {} with resource {}",
                        exchange.request().method(),
                        exchange.request().path(),
                        resolved.config.resource_id()
                    );
                    exchange.set_path_params(resolved.path_params);
                    self.captures.run_captures(
                        &resolved.config,
                        CapturePhase::RequestReceived,
                        exchange,
                    );
                    self.response_service
                        .respond(
                            config,
                            Some(resolved.config),
                            exchange,
                            &self.fallback_senders,
                        )
                        .await
                }
                None if config.response.is_some() => {
                    debug!(
                        "No resource matched {} {}; using root response",
                        exchange.request().method(),
                        exchange.request().path()
                    );
                    self.response_service
                        .respond(config, None, exchange, &self.fallback_senders)
                        .await
                }
                None => {
                    send_not_found(exchange);
                    Ok(())
                }
            }
        })
    }
}
