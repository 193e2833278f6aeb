//! Response-file content cache.
//!
//! Holds decoded response-file bodies for templated responses. Capacity is
//! bounded (least-recently-used entry evicted) and misses for the same path
//! coalesce: at most one disk read is in flight per key at any time.

use crate::features::EngineFeatures;
use crate::metrics;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::OnceCell;
use tracing::debug;

struct CacheEntry {
    cell: Arc<OnceCell<String>>,
    last_used: Instant,
}

pub struct ResponseFileCache {
    capacity: usize,
    entries: Mutex<HashMap<PathBuf, CacheEntry>>,
    features: EngineFeatures,
}

impl ResponseFileCache {
    pub fn new(capacity: usize, features: EngineFeatures) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(HashMap::new()),
            features,
        }
    }

    /// Fetch the decoded contents of `path`, reading it from disk at most
    /// once while cached. Concurrent callers for a missing entry share a
    /// single read.
    pub async fn get_or_load(&self, path: &Path) -> io::Result<String> {
        let cell = self.slot(path);

        let result = cell
            .get_or_try_init(|| async {
                debug!("Reading response file {}", path.display());
                tokio::fs::read_to_string(path).await
            })
            .await;

        match result {
            Ok(contents) => Ok(contents.clone()),
            Err(e) => {
                // drop the slot so a later request can retry the read
                self.remove(path);
                Err(e)
            }
        }
    }

    fn slot(&self, path: &Path) -> Arc<OnceCell<String>> {
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.get_mut(path) {
            entry.last_used = Instant::now();
            return Arc::clone(&entry.cell);
        }

        if entries.len() >= self.capacity {
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(path, _)| path.clone())
            {
                debug!("Evicting cached response file {}", oldest.display());
                entries.remove(&oldest);
            }
        }

        let cell = Arc::new(OnceCell::new());
        entries.insert(
            path.to_path_buf(),
            CacheEntry {
                cell: Arc::clone(&cell),
                last_used: Instant::now(),
            },
        );
        self.record_size(entries.len());
        cell
    }

    fn remove(&self, path: &Path) {
        let mut entries = self.entries.lock();
        entries.remove(path);
        self.record_size(entries.len());
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn record_size(&self, size: usize) {
        if self.features.metrics {
            metrics::RESPONSE_FILE_CACHE_ENTRIES.set(size as i64);
        }
    }
}
