//! Per-plugin persistent storage.
//!
//! Backs the `$storage` binding: an isolated key/value namespace per plugin,
//! stored as a JSON file in the plugin's data directory. Values are opaque
//! JSON-serializable blobs; the runtime never inspects them.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use serde_json::Value;

use super::error::PluginResult;

/// Key/value storage for a single plugin.
///
/// Data is cached in memory and written back on modification.
pub struct PluginStorage {
    plugin_id: String,
    storage_path: PathBuf,
    cache: HashMap<String, Value>,
    dirty: bool,
}

impl PluginStorage {
    /// Open (or initialize) storage under the plugin's data directory.
    pub fn new(plugin_id: &str, data_dir: PathBuf) -> Self {
        let storage_path = data_dir.join("storage.json");

        let cache = if storage_path.exists() {
            fs::read_to_string(&storage_path)
                .ok()
                .and_then(|contents| serde_json::from_str(&contents).ok())
                .unwrap_or_default()
        } else {
            HashMap::new()
        };

        Self {
            plugin_id: plugin_id.to_string(),
            storage_path,
            cache,
            dirty: false,
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.cache.get(key).cloned()
    }

    pub fn set(&mut self, key: &str, value: Value) -> PluginResult<()> {
        self.cache.insert(key.to_string(), value);
        self.dirty = true;
        self.flush()
    }

    pub fn remove(&mut self, key: &str) -> PluginResult<()> {
        if self.cache.remove(key).is_some() {
            self.dirty = true;
            self.flush()?;
        }
        Ok(())
    }

    pub fn keys(&self) -> Vec<String> {
        self.cache.keys().cloned().collect()
    }

    pub fn has(&self, key: &str) -> bool {
        self.cache.contains_key(key)
    }

    pub fn clear(&mut self) -> PluginResult<()> {
        self.cache.clear();
        self.dirty = true;
        self.flush()
    }

    fn flush(&mut self) -> PluginResult<()> {
        if !self.dirty {
            return Ok(());
        }

        if let Some(parent) = self.storage_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = serde_json::to_string_pretty(&self.cache)?;
        fs::write(&self.storage_path, contents)?;

        self.dirty = false;
        Ok(())
    }
}

impl Drop for PluginStorage {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            tracing::warn!(plugin = %self.plugin_id, error = %e, "failed to flush plugin storage");
        }
    }
}
