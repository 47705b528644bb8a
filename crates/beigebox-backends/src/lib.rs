//! Backend dispatcher — priority-ordered LLM backends with retry and
//! fallback.
//!
//! Three concrete providers (local, OpenAI-compatible, metered), each
//! wrapped with retry logic, dispatched in priority order. Streaming
//! follows a commit rule: once event lines flow, mid-stream failures are
//! never retried — a partial response is worse than a clear failure.

pub mod dispatcher;
pub mod local;
pub mod metered;
pub mod openai_compat;
pub mod retry;
pub mod sse;

use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

/// Out-of-band cost line emitted by metered backends inside event streams.
/// The proxy consumes these; clients never see them.
pub const COST_SENTINEL_PREFIX: &str = "__bb_cost__:";

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("timeout after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("no API key configured")]
    NoApiKey,
}

impl BackendError {
    /// Status code for retry classification; connection-level failures
    /// count as transient (0).
    pub fn status_code(&self) -> u16 {
        match self {
            BackendError::Status { status, .. } => *status,
            _ => 0,
        }
    }
}

/// Standardized non-streaming response from any backend.
#[derive(Debug, Clone, Default)]
pub struct BackendResponse {
    pub ok: bool,
    pub status_code: u16,
    pub data: Value,
    pub backend_name: String,
    pub latency_ms: f64,
    /// Only metered backends populate this.
    pub cost_usd: Option<f64>,
    pub error: String,
}

impl BackendResponse {
    pub fn failure(backend_name: &str, latency_ms: f64, error: String) -> Self {
        Self {
            ok: false,
            status_code: 0,
            backend_name: backend_name.to_string(),
            latency_ms,
            error,
            ..Default::default()
        }
    }

    /// Assistant content extracted from the response body.
    pub fn content(&self) -> String {
        self.data
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .unwrap_or("")
            .to_string()
    }
}

/// Event lines from a committed stream. Receiving this handle at all
/// means the HTTP response was accepted; everything after is committed.
pub type StreamLines = mpsc::Receiver<String>;

/// Common interface for all LLM backends.
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;
    fn priority(&self) -> u32;

    /// Forward a non-streaming chat completion. Never panics; failures
    /// come back inside the response.
    async fn forward(&self, body: &Value) -> BackendResponse;

    /// Open a streaming chat completion. Connection and status failures
    /// are `Err` (retryable / fall-through-able). Once `Ok`, lines flow
    /// through the receiver and a mid-stream failure surfaces as a
    /// synthesized error chunk plus `data: [DONE]` inside the stream.
    async fn open_stream(&self, body: &Value) -> Result<StreamLines, BackendError>;

    async fn health_check(&self) -> bool;

    /// Fetch and cache the model list. Empty on failure.
    async fn list_models(&self) -> Vec<String>;

    /// Before the first successful model-list fetch every backend is a
    /// candidate; afterwards unknown names are rejected.
    fn supports_model(&self, model: &str) -> bool;

    /// Pin a model into backend memory. Default: no-op (only local
    /// backends expose a preload endpoint).
    async fn preload_model(&self, _model: &str) {}
}

/// Shared cache for fetched model lists.
#[derive(Default)]
pub struct ModelCache {
    models: Mutex<Vec<String>>,
}

impl ModelCache {
    pub fn update(&self, models: Vec<String>) {
        *self.models.lock().expect("model cache poisoned") = models;
    }

    pub fn supports(&self, model: &str) -> bool {
        let models = self.models.lock().expect("model cache poisoned");
        models.is_empty() || models.iter().any(|m| m == model)
    }
}

/// Resolve a single `${ENV_VAR}` reference in a config value. Called at
/// backend construction so keys never live in the config file.
pub fn resolve_env(value: &str) -> String {
    if let Some(name) = value.strip_prefix("${").and_then(|v| v.strip_suffix('}')) {
        return std::env::var(name).unwrap_or_default();
    }
    value.to_string()
}

/// Synthesized SSE error chunk shown to clients when a stream fails.
pub fn error_chunk(text: &str) -> String {
    let chunk = serde_json::json!({
        "choices": [{"delta": {"content": format!("\n\n[BeigeBox: {text}]")}, "index": 0}],
        "model": "beigebox-error",
    });
    format!("data: {chunk}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_resolution_only_touches_reference_syntax() {
        std::env::set_var("BB_BACKEND_TEST_KEY", "secret");
        assert_eq!(resolve_env("${BB_BACKEND_TEST_KEY}"), "secret");
        assert_eq!(resolve_env("literal-key"), "literal-key");
        assert_eq!(resolve_env("${BB_UNSET_KEY_XYZ}"), "");
    }

    #[test]
    fn model_cache_open_until_first_fetch() {
        let cache = ModelCache::default();
        assert!(cache.supports("anything"));
        cache.update(vec!["llama3.2:3b".to_string()]);
        assert!(cache.supports("llama3.2:3b"));
        assert!(!cache.supports("anything"));
    }

    #[test]
    fn content_extraction_from_openai_shape() {
        let resp = BackendResponse {
            ok: true,
            data: serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "hi"}}]
            }),
            ..Default::default()
        };
        assert_eq!(resp.content(), "hi");
        assert_eq!(BackendResponse::default().content(), "");
    }
}
