use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use crate::local::{parse_model_ids, preview};
use crate::sse::{extract_cost, spawn_line_relay, STREAM_CHANNEL_DEPTH};
use crate::{resolve_env, Backend, BackendError, BackendResponse, ModelCache, StreamLines};

/// Metered OpenAI-compatible backend (hosted API with per-token pricing).
///
/// Bearer key required. Cost is extracted from the response body on
/// non-streaming calls; streams carry it as the `__bb_cost__:` sentinel
/// line emitted by the relay.
pub struct MeteredBackend {
    client: reqwest::Client,
    name: String,
    url: String,
    api_key: String,
    timeout: u64,
    priority: u32,
    models: ModelCache,
}

impl MeteredBackend {
    pub fn new(name: &str, url: &str, api_key: &str, timeout: u64, priority: u32) -> Self {
        Self {
            client: reqwest::Client::new(),
            name: name.to_string(),
            url: url.trim_end_matches('/').to_string(),
            api_key: resolve_env(api_key),
            timeout,
            priority,
            models: ModelCache::default(),
        }
    }
}

#[async_trait]
impl Backend for MeteredBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    async fn forward(&self, body: &Value) -> BackendResponse {
        if self.api_key.is_empty() {
            return BackendResponse::failure(&self.name, 0.0, "No API key configured".to_string());
        }

        let t0 = Instant::now();
        let result = self
            .client
            .post(format!("{}/chat/completions", self.url))
            .bearer_auth(&self.api_key)
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
            Ok(data) => {
                let cost = extract_cost(&data);
                BackendResponse {
                    ok: true,
                    status_code: status,
                    backend_name: self.name.clone(),
                    latency_ms: latency,
                    cost_usd: cost,
                    data,
                    error: String::new(),
                }
            }
            Err(e) => BackendResponse::failure(&self.name, latency, format!("bad JSON: {e}")),
        }
    }

    async fn open_stream(&self, body: &Value) -> Result<StreamLines, BackendError> {
        if self.api_key.is_empty() {
            return Err(BackendError::NoApiKey);
        }

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.url))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status >= 400 {
            let body = resp.text().await.unwrap_or_default();
            return Err(BackendError::Status { status, body: preview(&body) });
        }

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_DEPTH);
        // scan_cost: emit the sentinel when a chunk carries cost
        spawn_line_relay(resp, tx, self.name.clone(), true);
        Ok(rx)
    }

    async fn health_check(&self) -> bool {
        if self.api_key.is_empty() {
            return false;
        }
        self.client
            .get(format!("{}/models", self.url))
            .bearer_auth(&self.api_key)
            .timeout(std::time::Duration::from_secs(5))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    async fn list_models(&self) -> Vec<String> {
        if self.api_key.is_empty() {
            return Vec::new();
        }
        let resp = self
            .client
            .get(format!("{}/models", self.url))
            .bearer_auth(&self.api_key)
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await;
        let data: Value = match resp {
            Ok(r) if r.status().is_success() => r.json().await.unwrap_or(Value::Null),
            _ => return Vec::new(),
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
}
