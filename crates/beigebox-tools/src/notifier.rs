use tracing::debug;

/// Best-effort webhook notifier for tool invocations.
///
/// Fires a POST per invocation on a detached task — never blocks the tool
/// caller, never surfaces failures.
pub struct ToolNotifier {
    client: reqwest::Client,
    webhook_url: String,
}

const PREVIEW_LEN: usize = 200;

impl ToolNotifier {
    pub fn new(webhook_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            webhook_url: webhook_url.to_string(),
        }
    }

    pub fn notify(&self, tool: &str, input: &str, result: &str, elapsed_ms: f64) {
        if self.webhook_url.is_empty() {
            return;
        }
        let payload = serde_json::json!({
            "tool": tool,
            "input": preview(input),
            "result": preview(result),
            "elapsed_ms": elapsed_ms,
            "ts": chrono::Utc::now().to_rfc3339(),
        });
        let client = self.client.clone();
        let url = self.webhook_url.clone();
        tokio::spawn(async move {
            if let Err(e) = client
                .post(&url)
                .timeout(std::time::Duration::from_secs(5))
                .json(&payload)
                .send()
                .await
            {
                debug!(err = %e, "tool webhook notification failed");
            }
        });
    }
}

fn preview(s: &str) -> String {
    s.chars().take(PREVIEW_LEN).collect()
}
