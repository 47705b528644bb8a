//! Auto-summarizer — collapse old turns when a conversation outgrows its
//! token budget.
//!
//! System messages stay at the front, the last K non-system turns stay
//! verbatim, and everything older becomes one summary system message.
//! Fails silently: any error returns the original messages untouched.

use beigebox_core::config::AutoSummarizationConfig;
use serde_json::{json, Value};
use tracing::{info, warn};

fn estimate_tokens(messages: &[Value]) -> i64 {
    let total_chars: usize = messages
        .iter()
        .map(|m| m.get("content").and_then(|c| c.as_str()).map(str::len).unwrap_or(0))
        .sum();
    (total_chars / 4) as i64
}

pub async fn maybe_summarize(
    messages: Vec<Value>,
    cfg: &AutoSummarizationConfig,
    default_model: &str,
    backend_url: &str,
    client: &reqwest::Client,
) -> Vec<Value> {
    if !cfg.enabled {
        return messages;
    }
    let model = if cfg.summary_model.is_empty() { default_model } else { &cfg.summary_model };
    if model.is_empty() {
        warn!("auto-summarizer: no model configured, skipping");
        return messages;
    }

    let estimated = estimate_tokens(&messages);
    if estimated <= cfg.token_budget {
        return messages;
    }

    let is_system =
        |m: &Value| m.get("role").and_then(|r| r.as_str()) == Some("system");
    let system_msgs: Vec<Value> = messages.iter().filter(|m| is_system(m)).cloned().collect();
    let non_system: Vec<Value> = messages.iter().filter(|m| !is_system(m)).cloned().collect();

    if non_system.len() <= cfg.keep_last {
        return messages; // not enough history to summarize
    }

    let split = non_system.len() - cfg.keep_last;
    let to_summarize = &non_system[..split];
    let to_keep = &non_system[split..];

    let history_text: String = to_summarize
        .iter()
        .map(|m| {
            let role = m.get("role").and_then(|r| r.as_str()).unwrap_or("?").to_uppercase();
            let content: String = m
                .get("content")
                .and_then(|c| c.as_str())
                .unwrap_or("")
                .chars()
                .take(500)
                .collect();
            format!("{role}: {content}")
        })
        .collect::<Vec<_>>()
        .join("\n");

    let prompt = format!(
        "Summarise the following conversation history concisely. \
         Preserve key facts, decisions, and context. \
         Write in third person. Be brief — 3-6 sentences maximum.\n\n{history_text}"
    );

    let summary = call_summarizer(client, backend_url, model, &prompt).await;
    let summary = match summary {
        Some(s) if !s.is_empty() => s,
        _ => {
            warn!("auto-summarizer: empty summary returned, keeping original messages");
            return messages;
        }
    };

    info!(
        compressed = to_summarize.len(),
        kept = cfg.keep_last,
        was_tokens = estimated,
        "auto-summarizer collapsed old turns"
    );

    let mut result = system_msgs;
    result.push(json!({
        "role": "system",
        "content": format!("{}{}", cfg.summary_prefix, summary),
    }));
    result.extend_from_slice(to_keep);
    result
}

async fn call_summarizer(
    client: &reqwest::Client,
    backend_url: &str,
    model: &str,
    prompt: &str,
) -> Option<String> {
    let result = client
        .post(format!("{}/v1/chat/completions", backend_url.trim_end_matches('/')))
        .timeout(std::time::Duration::from_secs(60))
        .json(&json!({
            "model": model,
            "messages": [{"role": "user", "content": prompt}],
            "stream": false,
            "temperature": 0,
            "max_tokens": 512,
        }))
        .send()
        .await;

    let resp = match result {
        Ok(r) if r.status().is_success() => r,
        Ok(r) => {
            warn!(status = r.status().as_u16(), "auto-summarizer LLM call failed");
            return None;
        }
        Err(e) => {
            warn!(err = %e, "auto-summarizer LLM call failed");
            return None;
        }
    };

    let data: Value = resp.json().await.ok()?;
    data.get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(|s| s.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(enabled: bool, budget: i64) -> AutoSummarizationConfig {
        AutoSummarizationConfig {
            enabled,
            token_budget: budget,
            summary_model: String::new(),
            keep_last: 2,
            summary_prefix: "Summary: ".to_string(),
        }
    }

    #[tokio::test]
    async fn disabled_summarizer_passes_through() {
        let client = reqwest::Client::new();
        let messages = vec![json!({"role": "user", "content": "x".repeat(100_000)})];
        let out = maybe_summarize(messages.clone(), &cfg(false, 10), "m", "http://x", &client).await;
        assert_eq!(out, messages);
    }

    #[tokio::test]
    async fn under_budget_conversations_pass_through() {
        let client = reqwest::Client::new();
        let messages = vec![json!({"role": "user", "content": "short"})];
        let out =
            maybe_summarize(messages.clone(), &cfg(true, 3000), "m", "http://x", &client).await;
        assert_eq!(out, messages);
    }

    #[tokio::test]
    async fn too_few_turns_pass_through() {
        let client = reqwest::Client::new();
        // Over budget but only keep_last turns exist — nothing to collapse
        let messages = vec![
            json!({"role": "user", "content": "y".repeat(20_000)}),
            json!({"role": "assistant", "content": "z"}),
        ];
        let out =
            maybe_summarize(messages.clone(), &cfg(true, 100), "m", "http://x", &client).await;
        assert_eq!(out, messages);
    }

    #[test]
    fn token_estimation_counts_content_chars() {
        let messages = vec![
            json!({"role": "user", "content": "abcd"}),
            json!({"role": "assistant", "content": "efgh"}),
        ];
        assert_eq!(estimate_tokens(&messages), 2);
    }
}
