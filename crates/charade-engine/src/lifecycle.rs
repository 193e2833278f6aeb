//! Engine lifecycle hooks.
//!
//! Listeners observe and extend fixed points of the request pipeline. They
//! fire in registration order; registration happens during startup and the
//! list is effectively read-only afterwards.

use crate::behaviour::ReadWriteResponseBehaviour;
use crate::config::ResourceConfig;
use crate::exchange::HttpExchange;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Extension point notified at fixed pipeline stages. All methods have
/// no-op defaults so listeners implement only what they need.
pub trait EngineLifecycleListener: Send + Sync {
    /// Fired after resource resolution, before the behaviour is built.
    fn before_building_response(
        &self,
        _exchange: &mut HttpExchange,
        _resource: Option<&ResourceConfig>,
    ) {
    }

    /// Fired before a script runs; listeners may add bindings.
    fn before_building_runtime_context(&self, _bindings: &mut HashMap<String, Value>) {}

    /// Fired after a script completes without error.
    fn after_successful_script_execution(
        &self,
        _bindings: &HashMap<String, Value>,
        _behaviour: &ReadWriteResponseBehaviour,
    ) {
    }

    /// Rewrite a templated body before transmission. Listeners with nothing
    /// to do must return the input unchanged; there is no null.
    fn before_transmitting_template(&self, _exchange: &mut HttpExchange, body: String) -> String {
        body
    }
}

/// Ordered listener registry.
#[derive(Default)]
pub struct EngineLifecycleHooks {
    listeners: RwLock<Vec<Arc<dyn EngineLifecycleListener>>>,
}

impl EngineLifecycleHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: Arc<dyn EngineLifecycleListener>) {
        self.listeners.write().push(listener);
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    pub fn for_each(&self, mut f: impl FnMut(&Arc<dyn EngineLifecycleListener>)) {
        for listener in self.listeners.read().iter() {
            f(listener);
        }
    }

    /// Run the template transformer chain over `body`.
    pub fn transform_template(&self, exchange: &mut HttpExchange, body: String) -> String {
        let mut body = body;
        for listener in self.listeners.read().iter() {
            body = listener.before_transmitting_template(exchange, body);
        }
        body
    }
}
