//! Configuration discovery and parsing.
//!
//! Each configured directory is scanned (non-recursively) for mock
//! configuration documents named `*-config.yaml`, `*-config.yml` or
//! `*-config.json`. Documents are grouped by the plugin short name they
//! declare. A directory may additionally hold a `store-config.yaml`
//! selecting the store backend.

use super::PluginConfig;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const CONFIG_SUFFIXES: [&str; 3] = ["-config.yaml", "-config.yml", "-config.json"];
const STORE_CONFIG_NAMES: [&str; 2] = ["store-config.yaml", "store-config.yml"];

/// Store backend selection for a configuration directory.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreBackendConfig {
    /// Backend name: `inmem` (default) or `redis`
    #[serde(default)]
    pub backend: Option<String>,
    /// Connection URL for external backends
    #[serde(default)]
    pub url: Option<String>,
    /// Key prefix for external backends
    #[serde(default)]
    pub key_prefix: Option<String>,
}

/// Scan the given directories and group discovered configuration files by
/// the plugin name each document declares.
pub fn discover_configs(dirs: &[PathBuf]) -> Result<HashMap<String, Vec<PathBuf>>> {
    let mut by_plugin: HashMap<String, Vec<PathBuf>> = HashMap::new();

    for dir in dirs {
        if !dir.is_dir() {
            bail!("configuration path {} is not a directory", dir.display());
        }

        let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)
            .with_context(|| format!("failed to read configuration directory {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| is_config_file(path))
            .collect();
        entries.sort();

        for path in entries {
            // peek at the plugin name only; full validation happens on load
            match peek_plugin_name(&path) {
                Ok(plugin) => {
                    debug!("Discovered {} config {}", plugin, path.display());
                    by_plugin.entry(plugin).or_default().push(path);
                }
                Err(e) => warn!("Skipping unreadable config {}: {}", path.display(), e),
            }
        }
    }

    Ok(by_plugin)
}

fn is_config_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    path.is_file() && CONFIG_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
}

fn peek_plugin_name(path: &Path) -> Result<String> {
    #[derive(Deserialize)]
    struct PluginNameOnly {
        plugin: String,
    }
    let contents = std::fs::read_to_string(path)?;
    let parsed: PluginNameOnly = parse_document(path, &contents)?;
    Ok(parsed.plugin)
}

/// Parse one plugin configuration document and attach its parent directory.
pub fn load_plugin_config(path: &Path) -> Result<PluginConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;

    let mut config: PluginConfig = parse_document(path, &contents)
        .with_context(|| format!("failed to parse config {}", path.display()))?;

    config.parent_dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    Ok(config)
}

/// Load the store backend selection for a directory, if present.
pub fn load_store_config(dir: &Path) -> Result<Option<StoreBackendConfig>> {
    for name in STORE_CONFIG_NAMES {
        let path = dir.join(name);
        if path.is_file() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read store config {}", path.display()))?;
            let config = serde_yaml::from_str(&contents)
                .with_context(|| format!("failed to parse store config {}", path.display()))?;
            return Ok(Some(config));
        }
    }
    Ok(None)
}

fn parse_document<T: serde::de::DeserializeOwned>(path: &Path, contents: &str) -> Result<T> {
    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));

    if is_json {
        Ok(serde_json::from_str(contents)?)
    } else {
        Ok(serde_yaml::from_str(contents)?)
    }
}
