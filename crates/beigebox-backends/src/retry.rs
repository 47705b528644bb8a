use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::{Backend, BackendError, BackendResponse, StreamLines};

/// Wraps any backend with exponential-backoff retry for transient errors.
///
/// Retryable: 404 (model loading), 429, 5xx, and connection-level
/// failures. Permanent: 400, 401, 403. Streams retry connection errors
/// only — once lines flow, the stream is committed and a mid-stream
/// failure is surfaced in-band, never retried.
pub struct RetryBackend<B> {
    inner: B,
    max_retries: u32,
    backoff_base: f64,
    backoff_max: f64,
}

impl<B: Backend> RetryBackend<B> {
    pub fn new(inner: B, max_retries: u32, backoff_base: f64, backoff_max: f64) -> Self {
        Self { inner, max_retries, backoff_base, backoff_max }
    }

    fn is_retryable(status_code: u16) -> bool {
        matches!(status_code, 0 | 404 | 429 | 500 | 501 | 502 | 503 | 504)
    }

    fn backoff_seconds(&self, attempt: u32) -> f64 {
        self.backoff_base.powi(attempt as i32).min(self.backoff_max)
    }
}

#[async_trait]
impl<B: Backend> Backend for RetryBackend<B> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn priority(&self) -> u32 {
        self.inner.priority()
    }

    async fn forward(&self, body: &Value) -> BackendResponse {
        let model = body.get("model").and_then(|m| m.as_str()).unwrap_or("");

        let mut response = self.inner.forward(body).await;
        for attempt in 0..self.max_retries {
            if response.ok {
                return response;
            }
            if !Self::is_retryable(response.status_code) {
                debug!(
                    backend = self.name(),
                    status = response.status_code,
                    model,
                    "non-retryable error"
                );
                return response;
            }

            let backoff = self.backoff_seconds(attempt + 1);
            warn!(
                backend = self.name(),
                status = response.status_code,
                model,
                attempt = attempt + 1,
                max = self.max_retries,
                "transient error, retrying in {backoff:.1}s"
            );
            tokio::time::sleep(std::time::Duration::from_secs_f64(backoff)).await;
            response = self.inner.forward(body).await;
        }

        if !response.ok {
            error!(backend = self.name(), model, last = %response.error, "retries exhausted");
        }
        response
    }

    async fn open_stream(&self, body: &Value) -> Result<StreamLines, BackendError> {
        let model = body.get("model").and_then(|m| m.as_str()).unwrap_or("");

        let mut last = self.inner.open_stream(body).await;
        for attempt in 0..self.max_retries {
            match last {
                Ok(rx) => return Ok(rx),
                Err(ref e) if Self::is_retryable(e.status_code()) => {
                    let backoff = self.backoff_seconds(attempt + 1);
                    warn!(
                        backend = self.name(),
                        model,
                        err = %e,
                        attempt = attempt + 1,
                        "stream connect failed, retrying in {backoff:.1}s"
                    );
                    tokio::time::sleep(std::time::Duration::from_secs_f64(backoff)).await;
                    last = self.inner.open_stream(body).await;
                }
                Err(_) => break,
            }
        }

        if let Err(ref e) = last {
            error!(backend = self.name(), model, err = %e, "stream retries exhausted");
        }
        last
    }

    async fn health_check(&self) -> bool {
        self.inner.health_check().await
    }

    async fn list_models(&self) -> Vec<String> {
        self.inner.list_models().await
    }

    fn supports_model(&self, model: &str) -> bool {
        self.inner.supports_model(model)
    }

    async fn preload_model(&self, model: &str) {
        self.inner.preload_model(model).await
    }
}
