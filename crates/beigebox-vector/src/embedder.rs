use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::{Result, VectorError};

/// Produces fixed-size float vectors from text.
///
/// The facade and the centroid classifier share one implementation so the
/// embedding model only has to be pinned once.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed one text into an L2-normalized vector.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch, one vector per input in order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn dimension(&self) -> usize;
}

/// Embedder backed by the local model's `/api/embed` endpoint.
pub struct HttpEmbedder {
    client: reqwest::Client,
    model: String,
    base_url: String,
    dimension: usize,
}

impl HttpEmbedder {
    pub fn new(model: impl Into<String>, base_url: &str, dimension: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            model: model.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            dimension,
        }
    }

    async fn call(&self, input: serde_json::Value, timeout_secs: u64) -> Result<Vec<Vec<f32>>> {
        let resp = self
            .client
            .post(format!("{}/api/embed", self.base_url))
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .json(&serde_json::json!({ "model": self.model, "input": input }))
            .send()
            .await?;

        if resp.status().as_u16() == 404 {
            return Err(VectorError::Embedding(format!(
                "embedding model '{}' not found on {}",
                self.model, self.base_url
            )));
        }
        if !resp.status().is_success() {
            return Err(VectorError::Embedding(format!(
                "embedding endpoint returned HTTP {}",
                resp.status().as_u16()
            )));
        }

        let body: EmbedResponse = resp
            .json()
            .await
            .map_err(|e| VectorError::Embedding(format!("non-JSON embedding response: {e}")))?;
        if body.embeddings.is_empty() || body.embeddings.iter().any(|v| v.is_empty()) {
            return Err(VectorError::Embedding(
                "embedding model returned an empty embeddings array".to_string(),
            ));
        }
        Ok(body.embeddings.into_iter().map(|v| l2_normalize(v)).collect())
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.call(serde_json::json!(text), 30).await?;
        let vec = vectors.remove(0);
        debug!(dim = vec.len(), "text embedded");
        Ok(vec)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.call(serde_json::json!(texts), 60).await
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[derive(Deserialize)]
struct EmbedResponse {
    #[serde(default)]
    embeddings: Vec<Vec<f32>>,
}

/// Scale a vector to unit length. Zero vectors pass through unchanged.
pub fn l2_normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_yields_unit_length() {
        let v = l2_normalize(vec![3.0, 4.0]);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn zero_vector_is_left_alone() {
        assert_eq!(l2_normalize(vec![0.0, 0.0]), vec![0.0, 0.0]);
    }
}
