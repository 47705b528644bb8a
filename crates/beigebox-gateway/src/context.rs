//! Global system context — a markdown file prepended to every request.
//!
//! Hot-reloaded on an mtime check per request; enable/disable comes from
//! static config with a runtime-overlay override.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::SystemTime;

use beigebox_core::config::BeigeBoxConfig;
use beigebox_core::runtime::RuntimeOverlay;
use serde_json::{json, Value};
use tracing::{info, warn};

struct ContextState {
    mtime: Option<SystemTime>,
    text: String,
}

pub struct SystemContext {
    path: PathBuf,
    enabled_default: bool,
    state: Mutex<ContextState>,
}

impl SystemContext {
    pub fn new(cfg: &BeigeBoxConfig) -> Self {
        Self {
            path: PathBuf::from(&cfg.system_context.path),
            enabled_default: cfg.system_context.enabled,
            state: Mutex::new(ContextState { mtime: None, text: String::new() }),
        }
    }

    /// Current context text, hot-reloading on mtime change. Empty when
    /// disabled, missing, or empty.
    pub fn get(&self, overlay: &RuntimeOverlay) -> String {
        let enabled = overlay
            .get_key("system_context_enabled")
            .and_then(|v| v.as_bool())
            .unwrap_or(self.enabled_default);
        if !enabled {
            return String::new();
        }

        let mut state = self.state.lock().expect("system context poisoned");
        let mtime = match std::fs::metadata(&self.path).and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(_) => {
                state.text.clear();
                state.mtime = None;
                return String::new();
            }
        };
        if state.mtime == Some(mtime) {
            return state.text.clone();
        }

        match std::fs::read_to_string(&self.path) {
            Ok(text) => {
                let text = text.trim().to_string();
                if text != state.text {
                    info!(chars = text.len(), "system context reloaded");
                }
                state.text = text;
                state.mtime = Some(mtime);
            }
            Err(e) => warn!(path = %self.path.display(), err = %e, "system context reload failed"),
        }
        state.text.clone()
    }

    /// Prepend the context to the position-0 system message, or insert a
    /// new one at the front.
    pub fn inject(&self, mut body: Value, overlay: &RuntimeOverlay) -> Value {
        let context = self.get(overlay);
        if context.is_empty() {
            return body;
        }
        let Some(messages) = body.get_mut("messages").and_then(|m| m.as_array_mut()) else {
            return body;
        };
        if messages.is_empty() {
            return body;
        }

        match messages.first_mut() {
            Some(first) if first.get("role").and_then(|r| r.as_str()) == Some("system") => {
                let existing = first.get("content").and_then(|c| c.as_str()).unwrap_or("");
                let merged = if existing.is_empty() {
                    context
                } else {
                    format!("{context}\n\n{existing}")
                };
                first["content"] = Value::String(merged);
            }
            _ => messages.insert(0, json!({"role": "system", "content": context})),
        }
        body
    }

    /// Raw file contents for the config API.
    pub fn read_file(&self) -> String {
        std::fs::read_to_string(&self.path).unwrap_or_default()
    }

    /// Write new contents and bust the mtime cache.
    pub fn write_file(&self, content: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, content)?;
        self.state.lock().expect("system context poisoned").mtime = None;
        info!(chars = content.len(), "system context written");
        Ok(())
    }
}
