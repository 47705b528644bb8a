use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use crate::Tool;

/// Thin wrapper over a configured search endpoint (e.g. a SearXNG or
/// similar JSON API on the LAN).
pub struct WebSearchTool {
    client: reqwest::Client,
    endpoint: String,
    max_results: usize,
}

impl WebSearchTool {
    pub fn new(endpoint: &str, max_results: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            max_results,
        }
    }
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchResult>,
}

#[derive(Deserialize)]
struct SearchResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    content: String,
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web for current information"
    }

    async fn run(&self, input: &str) -> String {
        if self.endpoint.is_empty() {
            return "Error: web search endpoint not configured".to_string();
        }
        let resp = self
            .client
            .get(format!("{}/search", self.endpoint))
            .query(&[("q", input), ("format", "json")])
            .timeout(std::time::Duration::from_secs(15))
            .send()
            .await;

        let resp = match resp {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                warn!(status = r.status().as_u16(), "web search returned an error status");
                return format!("Error: search endpoint returned HTTP {}", r.status().as_u16());
            }
            Err(e) => return format!("Error: search request failed: {e}"),
        };

        let body: SearchResponse = match resp.json().await {
            Ok(b) => b,
            Err(e) => return format!("Error: search response was not JSON: {e}"),
        };

        if body.results.is_empty() {
            return "No search results found.".to_string();
        }
        body.results
            .iter()
            .take(self.max_results)
            .map(|r| format!("{}\n{}\n{}", r.title, r.url, r.content))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}
