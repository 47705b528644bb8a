//! Runtime overlay — hot-reloaded per-request overrides.
//!
//! The overlay is a YAML file with a `runtime:` block. It is re-read
//! whenever its modification time changes, so edits (by hand or through
//! the config API) apply to the very next request without a restart.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::SystemTime;

use serde_json::{Map, Value};
use tracing::{debug, error};

use crate::error::{BeigeBoxError, Result};

/// Generation-parameter keys in the overlay and the body keys they map to.
pub const GEN_PARAM_KEYS: &[(&str, &str)] = &[
    ("gen_temperature", "temperature"),
    ("gen_top_p", "top_p"),
    ("gen_top_k", "top_k"),
    ("gen_num_ctx", "num_ctx"),
    ("gen_repeat_penalty", "repeat_penalty"),
    ("gen_max_tokens", "max_tokens"),
    ("gen_seed", "seed"),
    ("gen_stop", "stop"),
];

struct OverlayState {
    mtime: Option<SystemTime>,
    values: Map<String, Value>,
}

/// Mtime-cached view of the runtime overlay file.
///
/// `get()` is called at the start of every request; the common case (file
/// unchanged) is a stat plus a map clone.
pub struct RuntimeOverlay {
    path: PathBuf,
    state: Mutex<OverlayState>,
}

impl RuntimeOverlay {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(OverlayState { mtime: None, values: Map::new() }),
        }
    }

    /// Current overlay values, reloading if the file changed on disk.
    /// Missing file means an empty overlay, never an error.
    pub fn get(&self) -> Map<String, Value> {
        let mut state = self.state.lock().expect("overlay state poisoned");

        let mtime = match std::fs::metadata(&self.path).and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(_) => {
                // File absent or unreadable — keep the last good overlay empty
                state.values.clear();
                state.mtime = None;
                return Map::new();
            }
        };

        if state.mtime == Some(mtime) {
            return state.values.clone();
        }

        match self.read_file() {
            Ok(values) => {
                debug!(path = %self.path.display(), keys = values.len(), "runtime overlay reloaded");
                state.values = values;
                state.mtime = Some(mtime);
            }
            // Parse error: keep the last good overlay
            Err(e) => debug!(path = %self.path.display(), err = %e, "runtime overlay reload skipped"),
        }

        state.values.clone()
    }

    /// Fetch a single overlay key.
    pub fn get_key(&self, key: &str) -> Option<Value> {
        self.get().get(key).cloned()
    }

    /// Write a single key into the `runtime:` block (read-modify-write).
    /// Busts the mtime cache so the next `get()` picks it up.
    pub fn set_key(&self, key: &str, value: Value) -> Result<()> {
        let mut doc: Map<String, Value> = if self.path.exists() {
            let text = std::fs::read_to_string(&self.path)?;
            serde_yaml::from_str::<Option<Value>>(&text)
                .map_err(|e| BeigeBoxError::RuntimeOverlay(e.to_string()))?
                .and_then(|v| v.as_object().cloned())
                .unwrap_or_default()
        } else {
            Map::new()
        };

        let runtime = doc
            .entry("runtime".to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !runtime.is_object() {
            *runtime = Value::Object(Map::new());
        }
        runtime
            .as_object_mut()
            .expect("runtime block coerced to object above")
            .insert(key.to_string(), value);

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let yaml = serde_yaml::to_string(&doc)
            .map_err(|e| BeigeBoxError::RuntimeOverlay(e.to_string()))?;
        if let Err(e) = std::fs::write(&self.path, yaml) {
            error!(path = %self.path.display(), err = %e, "runtime overlay write failed");
            return Err(e.into());
        }

        self.state.lock().expect("overlay state poisoned").mtime = None;
        Ok(())
    }

    /// Flip a boolean overlay key and return the new value.
    pub fn toggle_key(&self, key: &str) -> Result<bool> {
        let current = self
            .get_key(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        self.set_key(key, Value::Bool(!current))?;
        Ok(!current)
    }

    fn read_file(&self) -> Result<Map<String, Value>> {
        let text = std::fs::read_to_string(&self.path)?;
        let doc: Option<Value> = serde_yaml::from_str(&text)
            .map_err(|e| BeigeBoxError::RuntimeOverlay(e.to_string()))?;
        Ok(doc
            .and_then(|v| v.get("runtime").cloned())
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_empty_overlay() {
        let dir = tempfile::tempdir().unwrap();
        let overlay = RuntimeOverlay::new(dir.path().join("runtime_config.yaml"));
        assert!(overlay.get().is_empty());
    }

    #[test]
    fn set_key_round_trips_through_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let overlay = RuntimeOverlay::new(dir.path().join("runtime_config.yaml"));

        overlay.set_key("gen_temperature", serde_json::json!(0.7)).unwrap();
        overlay.set_key("system_context_enabled", serde_json::json!(true)).unwrap();

        let values = overlay.get();
        assert_eq!(values.get("gen_temperature"), Some(&serde_json::json!(0.7)));
        assert_eq!(values.get("system_context_enabled"), Some(&serde_json::json!(true)));
    }

    #[test]
    fn toggle_flips_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let overlay = RuntimeOverlay::new(dir.path().join("runtime_config.yaml"));

        assert!(overlay.toggle_key("vi_mode").unwrap());
        assert!(!overlay.toggle_key("vi_mode").unwrap());
        assert_eq!(overlay.get_key("vi_mode"), Some(serde_json::json!(false)));
    }

    #[test]
    fn reload_happens_on_mtime_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime_config.yaml");
        std::fs::write(&path, "runtime:\n  gen_seed: 1\n").unwrap();

        let overlay = RuntimeOverlay::new(&path);
        assert_eq!(overlay.get_key("gen_seed"), Some(serde_json::json!(1)));

        // Rewrite through set_key — busts the cache regardless of mtime granularity
        overlay.set_key("gen_seed", serde_json::json!(2)).unwrap();
        assert_eq!(overlay.get_key("gen_seed"), Some(serde_json::json!(2)));
    }
}
