//! In-memory store backend.

use super::Store;
use anyhow::Result;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;

/// Store backed by a locked map. The default backend: fast, process-local,
/// discarded on shutdown.
pub struct InMemoryStore {
    name: String,
    data: RwLock<BTreeMap<String, Value>>,
}

impl InMemoryStore {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            data: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Store for InMemoryStore {
    fn save(&self, key: &str, value: Value) -> Result<()> {
        self.data.write().insert(key.to_string(), value);
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.data.read().get(key).cloned())
    }

    fn has_key(&self, key: &str) -> Result<bool> {
        Ok(self.data.read().contains_key(key))
    }

    fn load_all(&self) -> Result<BTreeMap<String, Value>> {
        Ok(self.data.read().clone())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.data.write().remove(key);
        Ok(())
    }

    fn count(&self) -> Result<usize> {
        Ok(self.data.read().len())
    }

    fn type_description(&self) -> &'static str {
        "inmem"
    }
}
