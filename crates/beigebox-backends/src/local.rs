use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::sse::{spawn_line_relay, STREAM_CHANNEL_DEPTH};
use crate::{Backend, BackendError, BackendResponse, ModelCache, StreamLines};

/// Local OpenAI-compatible backend (e.g. an Ollama instance on the LAN).
/// No auth, cost always null.
pub struct LocalBackend {
    client: reqwest::Client,
    name: String,
    url: String,
    timeout: u64,
    priority: u32,
    models: ModelCache,
}

impl LocalBackend {
    pub fn new(name: &str, url: &str, timeout: u64, priority: u32) -> Self {
        Self {
            client: reqwest::Client::new(),
            name: name.to_string(),
            url: url.trim_end_matches('/').to_string(),
            timeout,
            priority,
            models: ModelCache::default(),
        }
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    async fn forward(&self, body: &Value) -> BackendResponse {
        let t0 = Instant::now();
        let result = self
            .client
            .post(format!("{}/v1/chat/completions", self.url))
            .timeout(std::time::Duration::from_secs(self.timeout))
            .json(body)
            .send()
            .await;
        let latency = t0.elapsed().as_secs_f64() * 1000.0;

        let resp = match result {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                warn!(backend = %self.name, "timed out after {:.0}ms", latency);
                return BackendResponse::failure(
                    &self.name,
                    latency,
                    format!("Timeout after {}s", self.timeout),
                );
            }
            Err(e) => {
                warn!(backend = %self.name, err = %e, "request failed");
                return BackendResponse::failure(&self.name, latency, e.to_string());
            }
        };

        let status = resp.status().as_u16();
        if status >= 400 {
            let text = resp.text().await.unwrap_or_default();
            return BackendResponse {
                ok: false,
                status_code: status,
                backend_name: self.name.clone(),
                latency_ms: latency,
                error: format!("HTTP {status}: {}", preview(&text)),
                ..Default::default()
            };
        }

        match resp.json::<Value>().await {
            Ok(data) => BackendResponse {
                ok: true,
                status_code: status,
                data,
                backend_name: self.name.clone(),
                latency_ms: latency,
                cost_usd: None, // local compute is free
                error: String::new(),
            },
            Err(e) => BackendResponse::failure(&self.name, latency, format!("bad JSON: {e}")),
        }
    }

    async fn open_stream(&self, body: &Value) -> Result<StreamLines, BackendError> {
        let resp = self
            .client
            .post(format!("{}/v1/chat/completions", self.url))
            .json(body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status >= 400 {
            let body = resp.text().await.unwrap_or_default();
            return Err(BackendError::Status { status, body: preview(&body) });
        }

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_DEPTH);
        spawn_line_relay(resp, tx, self.name.clone(), false);
        Ok(rx)
    }

    async fn health_check(&self) -> bool {
        self.client
            .get(format!("{}/api/tags", self.url))
            .timeout(std::time::Duration::from_secs(5))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    async fn list_models(&self) -> Vec<String> {
        let resp = self
            .client
            .get(format!("{}/v1/models", self.url))
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await;
        let data: Value = match resp {
            Ok(r) if r.status().is_success() => r.json().await.unwrap_or(Value::Null),
            Ok(r) => {
                warn!(backend = %self.name, status = r.status().as_u16(), "model list fetch failed");
                return Vec::new();
            }
            Err(e) => {
                warn!(backend = %self.name, err = %e, "model list fetch failed");
                return Vec::new();
            }
        };
        let models = parse_model_ids(&data);
        if !models.is_empty() {
            self.models.update(models.clone());
        }
        models
    }

    fn supports_model(&self, model: &str) -> bool {
        self.models.supports(model)
    }

    /// Pin a model with a never-expiring keep-alive so the first request
    /// doesn't pay load latency.
    async fn preload_model(&self, model: &str) {
        let result = self
            .client
            .post(format!("{}/api/generate", self.url))
            .timeout(std::time::Duration::from_secs(30))
            .json(&serde_json::json!({"model": model, "prompt": "", "keep_alive": -1}))
            .send()
            .await;
        match result {
            Ok(r) if r.status().is_success() => {
                info!(backend = %self.name, model, "model preloaded and pinned")
            }
            Ok(r) => warn!(backend = %self.name, model, status = r.status().as_u16(), "preload failed"),
            Err(e) => warn!(backend = %self.name, model, err = %e, "preload failed"),
        }
    }
}

pub(crate) fn parse_model_ids(data: &Value) -> Vec<String> {
    data.get("data")
        .and_then(|d| d.as_array())
        .map(|models| {
            models
                .iter()
                .filter_map(|m| {
                    m.get("id")
                        .or_else(|| m.get("name"))
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                })
                .filter(|m| !m.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn preview(text: &str) -> String {
    text.chars().take(200).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_ids_parse_from_either_field() {
        let data = serde_json::json!({
            "data": [
                {"id": "llama3.2:3b"},
                {"name": "qwen2.5-coder:14b"},
                {"other": "ignored"},
            ]
        });
        assert_eq!(parse_model_ids(&data), vec!["llama3.2:3b", "qwen2.5-coder:14b"]);
        assert!(parse_model_ids(&serde_json::json!({})).is_empty());
    }
}
