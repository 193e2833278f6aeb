//! Engine feature toggles.
//!
//! Features are carried as an explicit struct passed at startup. For
//! backward compatibility the struct can be populated from the
//! `IMPOSTER_FEATURES` environment variable, a comma-separated list of
//! `name=bool` pairs (e.g. `metrics=true,stores=false`).

use std::collections::HashMap;

pub const ENV_FEATURES: &str = "IMPOSTER_FEATURES";
pub const ENV_RESPONSE_FILE_CACHE_ENTRIES: &str = "IMPOSTER_RESPONSE_FILE_CACHE_ENTRIES";

pub const DEFAULT_RESPONSE_FILE_CACHE_ENTRIES: usize = 20;

#[derive(Debug, Clone, Copy)]
pub struct EngineFeatures {
    /// Record gauges and timers for cache occupancy and script execution.
    pub metrics: bool,
    /// Expose named stores to captures and scripts.
    pub stores: bool,
}

impl Default for EngineFeatures {
    fn default() -> Self {
        Self {
            metrics: true,
            stores: true,
        }
    }
}

impl EngineFeatures {
    /// Populate the feature set from `IMPOSTER_FEATURES`, falling back to
    /// defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        match std::env::var(ENV_FEATURES) {
            Ok(raw) => Self::parse(&raw),
            Err(_) => Self::default(),
        }
    }

    pub fn parse(raw: &str) -> Self {
        let flags: HashMap<&str, bool> = raw
            .split(',')
            .filter_map(|pair| {
                let (name, value) = pair.split_once('=')?;
                Some((name.trim(), value.trim().parse::<bool>().ok()?))
            })
            .collect();

        let defaults = Self::default();
        Self {
            metrics: flags.get("metrics").copied().unwrap_or(defaults.metrics),
            stores: flags.get("stores").copied().unwrap_or(defaults.stores),
        }
    }
}

/// Response-file cache capacity from the environment, or the default.
pub fn response_file_cache_entries() -> usize {
    std::env::var(ENV_RESPONSE_FILE_CACHE_ENTRIES)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_RESPONSE_FILE_CACHE_ENTRIES)
}
