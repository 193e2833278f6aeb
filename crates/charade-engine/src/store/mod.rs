//! Named key/value stores with pluggable backends.
//!
//! Stores hold state captured from requests and read back by scripts and
//! templates. Values are JSON documents so every backend can round-trip
//! them. `save` is last-writer-wins; the engine makes no ordering guarantee
//! between concurrent writers to the same key.

mod inmem;
mod redis;

pub use inmem::InMemoryStore;
pub use redis::RedisStoreBackend;

use crate::config::StoreBackendConfig;
use anyhow::Result;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Store written to by captures that do not name one explicitly.
pub const DEFAULT_CAPTURE_STORE: &str = "captures";

/// A named key/value container.
pub trait Store: Send + Sync {
    fn save(&self, key: &str, value: Value) -> Result<()>;
    fn load(&self, key: &str) -> Result<Option<Value>>;
    fn has_key(&self, key: &str) -> Result<bool>;
    fn load_all(&self) -> Result<BTreeMap<String, Value>>;
    fn delete(&self, key: &str) -> Result<()>;
    fn count(&self) -> Result<usize>;
    fn type_description(&self) -> &'static str;
}

enum Backend {
    InMemory,
    Redis(RedisStoreBackend),
}

/// Process-wide factory handing out stores by name.
///
/// Created once at startup; the same name always yields the same store
/// instance for the life of the process.
pub struct StoreFactory {
    backend: Backend,
    stores: RwLock<HashMap<String, Arc<dyn Store>>>,
}

impl StoreFactory {
    pub fn in_memory() -> Self {
        Self {
            backend: Backend::InMemory,
            stores: RwLock::new(HashMap::new()),
        }
    }

    pub fn redis(config: &StoreBackendConfig) -> Result<Self> {
        Ok(Self {
            backend: Backend::Redis(RedisStoreBackend::connect(config)?),
            stores: RwLock::new(HashMap::new()),
        })
    }

    /// Build the factory selected by a directory's store configuration.
    pub fn from_config(config: Option<&StoreBackendConfig>) -> Result<Self> {
        match config.and_then(|c| c.backend.as_deref()) {
            Some("redis") => {
                debug!("Using redis store backend");
                Self::redis(config.unwrap())
            }
            Some("inmem") | None => Ok(Self::in_memory()),
            Some(other) => anyhow::bail!("unknown store backend '{other}'"),
        }
    }

    /// Open the named store, creating it on first use.
    pub fn open_or_create(&self, name: &str) -> Arc<dyn Store> {
        if let Some(store) = self.stores.read().get(name) {
            return Arc::clone(store);
        }

        let mut stores = self.stores.write();
        Arc::clone(stores.entry(name.to_string()).or_insert_with(|| {
            debug!("Creating store {}", name);
            match &self.backend {
                Backend::InMemory => Arc::new(InMemoryStore::new(name)),
                Backend::Redis(backend) => Arc::new(backend.open(name)),
            }
        }))
    }

    /// Drop the named store and its contents.
    pub fn delete_store(&self, name: &str) {
        self.stores.write().remove(name);
    }

    /// Names of stores opened so far.
    pub fn store_names(&self) -> Vec<String> {
        self.stores.read().keys().cloned().collect()
    }
}
