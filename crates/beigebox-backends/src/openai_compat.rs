use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use crate::local::{parse_model_ids, preview};
use crate::sse::{spawn_line_relay, STREAM_CHANNEL_DEPTH};
use crate::{resolve_env, Backend, BackendError, BackendResponse, ModelCache, StreamLines};

/// Generic OpenAI-compatible backend with an optional bearer key.
/// Cost is always null — only metered providers report cost.
pub struct OpenAiCompatBackend {
    client: reqwest::Client,
    name: String,
    url: String,
    api_key: String,
    timeout: u64,
    priority: u32,
    models: ModelCache,
}

impl OpenAiCompatBackend {
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

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.api_key.is_empty() {
            builder
        } else {
            builder.bearer_auth(&self.api_key)
        }
    }
}

#[async_trait]
impl Backend for OpenAiCompatBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    async fn forward(&self, body: &Value) -> BackendResponse {
        let t0 = Instant::now();
        let result = self
            .request(self.client.post(format!("{}/v1/chat/completions", self.url)))
            .timeout(std::time::Duration::from_secs(self.timeout))
            .json(body)
            .send()
            .await;
        let latency = t0.elapsed().as_secs_f64() * 1000.0;

        let resp = match result {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return BackendResponse::failure(
                    &self.name,
                    latency,
                    format!("Timeout after {}s", self.timeout),
                )
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
                cost_usd: None,
                error: String::new(),
            },
            Err(e) => BackendResponse::failure(&self.name, latency, format!("bad JSON: {e}")),
        }
    }

    async fn open_stream(&self, body: &Value) -> Result<StreamLines, BackendError> {
        let resp = self
            .request(self.client.post(format!("{}/v1/chat/completions", self.url)))
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
        self.request(self.client.get(format!("{}/v1/models", self.url)))
            .timeout(std::time::Duration::from_secs(5))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    async fn list_models(&self) -> Vec<String> {
        let resp = self
            .request(self.client.get(format!("{}/v1/models", self.url)))
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
