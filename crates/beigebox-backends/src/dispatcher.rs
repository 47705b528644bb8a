use std::collections::BTreeMap;
use std::sync::Arc;

use beigebox_core::config::BackendEntry;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::local::LocalBackend;
use crate::metered::MeteredBackend;
use crate::openai_compat::OpenAiCompatBackend;
use crate::retry::RetryBackend;
use crate::sse::STREAM_CHANNEL_DEPTH;
use crate::{error_chunk, Backend, BackendResponse, StreamLines};

/// Priority-ordered multi-backend dispatcher with fallback.
///
/// Lower priority number = tried first. Transparent to clients: same
/// OpenAI-compatible request in, same response out.
pub struct Dispatcher {
    backends: Vec<Arc<dyn Backend>>,
}

impl Dispatcher {
    pub fn new(mut backends: Vec<Arc<dyn Backend>>) -> Self {
        backends.sort_by_key(|b| b.priority());
        let order: Vec<String> =
            backends.iter().map(|b| format!("{}(p{})", b.name(), b.priority())).collect();
        info!(order = order.join(" → "), "dispatcher initialised");
        Self { backends }
    }

    /// Build from config entries. Unknown providers are skipped with a
    /// warning; every backend gets a retry wrapper.
    pub fn from_config(entries: &[BackendEntry]) -> Self {
        let mut backends: Vec<Arc<dyn Backend>> = Vec::new();
        for entry in entries {
            if entry.url.is_empty() {
                warn!(name = %entry.name, "backend has no url, skipping");
                continue;
            }
            let name = if entry.name.is_empty() { &entry.provider } else { &entry.name };
            let backend: Arc<dyn Backend> = match entry.provider.as_str() {
                "local" => Arc::new(RetryBackend::new(
                    LocalBackend::new(name, &entry.url, entry.timeout, entry.priority),
                    entry.max_retries,
                    entry.backoff_base,
                    entry.backoff_max,
                )),
                "openai_compat" => Arc::new(RetryBackend::new(
                    OpenAiCompatBackend::new(
                        name,
                        &entry.url,
                        &entry.api_key,
                        entry.timeout,
                        entry.priority,
                    ),
                    entry.max_retries,
                    entry.backoff_base,
                    entry.backoff_max,
                )),
                "metered" => Arc::new(RetryBackend::new(
                    MeteredBackend::new(
                        name,
                        &entry.url,
                        &entry.api_key,
                        entry.timeout,
                        entry.priority,
                    ),
                    entry.max_retries,
                    entry.backoff_base,
                    entry.backoff_max,
                )),
                other => {
                    warn!(provider = other, "unknown backend provider, skipping");
                    continue;
                }
            };
            backends.push(backend);
        }
        Self::new(backends)
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn backend_names(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.name().to_string()).collect()
    }

    /// Non-streaming forward: first backend that supports the model and
    /// succeeds wins. On total exhaustion, a synthesized 503 whose error
    /// concatenates every per-backend failure.
    pub async fn forward(&self, body: &Value) -> BackendResponse {
        let model = body.get("model").and_then(|m| m.as_str()).unwrap_or("");
        let mut errors: Vec<String> = Vec::new();

        for backend in &self.backends {
            if !backend.supports_model(model) {
                continue;
            }
            debug!(backend = backend.name(), model, "trying backend");
            let response = backend.forward(body).await;
            if response.ok {
                info!(
                    backend = backend.name(),
                    model,
                    latency_ms = response.latency_ms as u64,
                    "request served"
                );
                return response;
            }
            warn!(backend = backend.name(), model, err = %response.error, "backend failed");
            errors.push(format!("{}: {}", backend.name(), response.error));
        }

        let summary = if errors.is_empty() {
            "No backends available".to_string()
        } else {
            errors.join("; ")
        };
        error!(model, %summary, "all backends exhausted");
        BackendResponse {
            ok: false,
            status_code: 503,
            backend_name: "dispatcher".to_string(),
            error: format!("All backends failed: {summary}"),
            ..Default::default()
        }
    }

    /// Streaming forward. Backends are tried in priority order until one
    /// commits (its first event line); mid-stream failures after commit
    /// are never retried. On total pre-commit exhaustion the returned
    /// stream carries a synthesized error chunk and a terminator.
    pub async fn forward_stream(&self, body: &Value) -> StreamLines {
        let (out_tx, out_rx) = mpsc::channel(STREAM_CHANNEL_DEPTH);
        let backends = self.backends.clone();
        let body = body.clone();

        tokio::spawn(async move {
            let model = body.get("model").and_then(|m| m.as_str()).unwrap_or("").to_string();
            let mut errors: Vec<String> = Vec::new();

            for backend in &backends {
                if !backend.supports_model(&model) {
                    continue;
                }
                debug!(backend = backend.name(), model, "trying stream");
                match backend.open_stream(&body).await {
                    Ok(mut rx) => {
                        while let Some(line) = rx.recv().await {
                            if out_tx.send(line).await.is_err() {
                                return; // client went away
                            }
                        }
                        return; // stream completed (or ended in-band)
                    }
                    Err(e) => {
                        warn!(backend = backend.name(), model, err = %e, "stream connect failed");
                        errors.push(format!("{}: {e}", backend.name()));
                    }
                }
            }

            let summary = if errors.is_empty() {
                "No backends available".to_string()
            } else {
                errors.join("; ")
            };
            error!(model, %summary, "all stream backends exhausted");
            let _ = out_tx.send(error_chunk(&format!("All backends failed: {summary}"))).await;
            let _ = out_tx.send("data: [DONE]".to_string()).await;
        });

        out_rx
    }

    /// Union of every backend's model list, deduplicated by id.
    pub async fn list_all_models(&self) -> Value {
        let mut seen = std::collections::HashSet::new();
        let mut all = Vec::new();
        for backend in &self.backends {
            for model_id in backend.list_models().await {
                if seen.insert(model_id.clone()) {
                    all.push(serde_json::json!({
                        "id": model_id,
                        "object": "model",
                        "owned_by": backend.name(),
                    }));
                }
            }
        }
        serde_json::json!({ "object": "list", "data": all })
    }

    /// Health-check every backend.
    pub async fn health(&self) -> BTreeMap<String, Value> {
        let mut out = BTreeMap::new();
        for backend in &self.backends {
            let healthy = backend.health_check().await;
            out.insert(
                backend.name().to_string(),
                serde_json::json!({ "healthy": healthy, "priority": backend.priority() }),
            );
        }
        out
    }

    /// Preload a model on every backend that exposes a preload endpoint.
    pub async fn preload(&self, model: &str) {
        for backend in &self.backends {
            backend.preload_model(model).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BackendError, StreamLines};
    use async_trait::async_trait;

    struct Fixed {
        name: &'static str,
        priority: u32,
        ok: bool,
        supports: bool,
        lines: Vec<&'static str>,
    }

    impl Fixed {
        fn ok(name: &'static str, priority: u32) -> Self {
            Self { name, priority, ok: true, supports: true, lines: vec!["data: {}", "data: [DONE]"] }
        }

        fn failing(name: &'static str, priority: u32) -> Self {
            Self { name, priority, ok: false, supports: true, lines: Vec::new() }
        }

        fn unsupported(name: &'static str, priority: u32) -> Self {
            Self { name, priority, ok: true, supports: false, lines: Vec::new() }
        }
    }

    #[async_trait]
    impl Backend for Fixed {
        fn name(&self) -> &str {
            self.name
        }
        fn priority(&self) -> u32 {
            self.priority
        }

        async fn forward(&self, _body: &Value) -> BackendResponse {
            if self.ok {
                BackendResponse {
                    ok: true,
                    status_code: 200,
                    backend_name: self.name.to_string(),
                    data: serde_json::json!({
                        "choices": [{"message": {"role": "assistant", "content": self.name}}]
                    }),
                    ..Default::default()
                }
            } else {
                BackendResponse {
                    ok: false,
                    status_code: 500,
                    backend_name: self.name.to_string(),
                    error: "HTTP 500: boom".to_string(),
                    ..Default::default()
                }
            }
        }

        async fn open_stream(&self, _body: &Value) -> Result<StreamLines, BackendError> {
            if !self.ok {
                return Err(BackendError::Status { status: 500, body: "boom".to_string() });
            }
            let (tx, rx) = mpsc::channel(8);
            let lines: Vec<String> = self.lines.iter().map(|s| s.to_string()).collect();
            tokio::spawn(async move {
                for line in lines {
                    let _ = tx.send(line).await;
                }
            });
            Ok(rx)
        }

        async fn health_check(&self) -> bool {
            self.ok
        }

        async fn list_models(&self) -> Vec<String> {
            vec![format!("{}-model", self.name)]
        }

        fn supports_model(&self, _model: &str) -> bool {
            self.supports
        }
    }

    #[tokio::test]
    async fn falls_back_in_priority_order() {
        let d = Dispatcher::new(vec![
            Arc::new(Fixed::ok("second", 2)),
            Arc::new(Fixed::failing("first", 1)),
        ]);
        let resp = d.forward(&serde_json::json!({"model": "m"})).await;
        assert!(resp.ok);
        assert_eq!(resp.backend_name, "second");
    }

    #[tokio::test]
    async fn unsupported_models_are_skipped() {
        let d = Dispatcher::new(vec![
            Arc::new(Fixed::unsupported("first", 1)),
            Arc::new(Fixed::ok("second", 2)),
        ]);
        let resp = d.forward(&serde_json::json!({"model": "m"})).await;
        assert_eq!(resp.backend_name, "second");
    }

    #[tokio::test]
    async fn exhaustion_synthesizes_a_503_with_all_errors() {
        let d = Dispatcher::new(vec![
            Arc::new(Fixed::failing("a", 1)),
            Arc::new(Fixed::failing("b", 2)),
        ]);
        let resp = d.forward(&serde_json::json!({"model": "m"})).await;
        assert!(!resp.ok);
        assert_eq!(resp.status_code, 503);
        assert!(resp.error.contains("a: HTTP 500"));
        assert!(resp.error.contains("b: HTTP 500"));
    }

    #[tokio::test]
    async fn stream_falls_through_on_connect_failure() {
        let d = Dispatcher::new(vec![
            Arc::new(Fixed::failing("a", 1)),
            Arc::new(Fixed::ok("b", 2)),
        ]);
        let mut rx = d.forward_stream(&serde_json::json!({"model": "m"})).await;
        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line);
        }
        assert_eq!(lines, vec!["data: {}", "data: [DONE]"]);
    }

    #[tokio::test]
    async fn stream_exhaustion_yields_error_chunk_and_done() {
        let d = Dispatcher::new(vec![Arc::new(Fixed::failing("a", 1))]);
        let mut rx = d.forward_stream(&serde_json::json!({"model": "m"})).await;
        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line);
        }
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("All backends failed"));
        assert_eq!(lines[1], "data: [DONE]");
    }

    #[tokio::test]
    async fn model_list_aggregates_and_dedups() {
        let d = Dispatcher::new(vec![
            Arc::new(Fixed::ok("a", 1)),
            Arc::new(Fixed::ok("a", 2)), // same name → same model id, deduped
        ]);
        let models = d.list_all_models().await;
        assert_eq!(models["data"].as_array().unwrap().len(), 1);
    }
}
