//! Redis store backend.
//!
//! Uses a blocking Redis client behind an r2d2 pool. Values are stored as
//! JSON strings under `<prefix><store>:<key>`, so captures and scripts see
//! the same shapes regardless of backend.

use super::Store;
use crate::config::StoreBackendConfig;
use anyhow::{Context, Result};
use redis::{Commands, Connection};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Mutex;

const DEFAULT_URL: &str = "redis://127.0.0.1:6379";
const DEFAULT_KEY_PREFIX: &str = "charade:";
const POOL_SIZE: u32 = 4;

struct RedisConnectionManager {
    client: redis::Client,
}

impl r2d2::ManageConnection for RedisConnectionManager {
    type Connection = Mutex<Connection>;
    type Error = redis::RedisError;

    fn connect(&self) -> Result<Self::Connection, Self::Error> {
        Ok(Mutex::new(self.client.get_connection()?))
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        redis::cmd("PING").query(conn.get_mut().unwrap())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

/// Shared connection pool from which per-store handles are derived.
pub struct RedisStoreBackend {
    pool: r2d2::Pool<RedisConnectionManager>,
    key_prefix: String,
}

impl RedisStoreBackend {
    pub fn connect(config: &StoreBackendConfig) -> Result<Self> {
        let url = config.url.as_deref().unwrap_or(DEFAULT_URL);
        let client = redis::Client::open(url)
            .with_context(|| format!("invalid redis url {url}"))?;
        let pool = r2d2::Pool::builder()
            .max_size(POOL_SIZE)
            .build(RedisConnectionManager { client })
            .context("failed to build redis connection pool")?;

        Ok(Self {
            pool,
            key_prefix: config
                .key_prefix
                .clone()
                .unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string()),
        })
    }

    pub fn open(&self, store_name: &str) -> RedisStore {
        RedisStore {
            pool: self.pool.clone(),
            prefix: format!("{}{}:", self.key_prefix, store_name),
        }
    }
}

pub struct RedisStore {
    pool: r2d2::Pool<RedisConnectionManager>,
    prefix: String,
}

impl RedisStore {
    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> redis::RedisResult<T>,
    ) -> Result<T> {
        let conn = self.pool.get().context("redis pool exhausted")?;
        let mut conn = conn.lock().unwrap();
        op(&mut conn).context("redis operation failed")
    }
}

impl Store for RedisStore {
    fn save(&self, key: &str, value: Value) -> Result<()> {
        let serialized = serde_json::to_string(&value)?;
        self.with_connection(|conn| conn.set(self.full_key(key), serialized))
    }

    fn load(&self, key: &str) -> Result<Option<Value>> {
        let raw: Option<String> = self.with_connection(|conn| conn.get(self.full_key(key)))?;
        raw.map(|s| serde_json::from_str(&s).context("stored value is not JSON"))
            .transpose()
    }

    fn has_key(&self, key: &str) -> Result<bool> {
        self.with_connection(|conn| conn.exists(self.full_key(key)))
    }

    fn load_all(&self) -> Result<BTreeMap<String, Value>> {
        let keys: Vec<String> =
            self.with_connection(|conn| conn.keys(format!("{}*", self.prefix)))?;

        let mut all = BTreeMap::new();
        for full_key in keys {
            let raw: Option<String> = self.with_connection(|conn| conn.get(&full_key))?;
            if let Some(raw) = raw {
                let short = full_key
                    .strip_prefix(&self.prefix)
                    .unwrap_or(&full_key)
                    .to_string();
                all.insert(short, serde_json::from_str(&raw)?);
            }
        }
        Ok(all)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.with_connection(|conn| conn.del(self.full_key(key)))
    }

    fn count(&self) -> Result<usize> {
        let keys: Vec<String> =
            self.with_connection(|conn| conn.keys(format!("{}*", self.prefix)))?;
        Ok(keys.len())
    }

    fn type_description(&self) -> &'static str {
        "redis"
    }
}
