//! Decision agent — the small fast model consulted for borderline routing.
//!
//! Sends the user's latest message (not the full history) with a terse
//! system prompt listing routes and tools; parses a constrained JSON
//! reply into a [`Decision`]. Any failure — timeout, HTTP error, bad
//! JSON — falls back to a default Decision that leaves the request
//! unchanged. Every decision is logged.

use serde_json::Value;
use tracing::{info, warn};

use crate::types::{Decision, RouteTable};

const SYSTEM_PROMPT_TEMPLATE: &str = "You are a routing assistant inside an LLM proxy called BeigeBox. Your ONLY job is to analyze the user's message and decide how to handle it. You must respond with ONLY a JSON object, no other text.

Available routes (models):
{routes_block}

Available tools:
{tools_block}

Analyze the user's message and return a JSON object with these fields:
- \"model\": the route name to use (from the routes above)
- \"needs_search\": true if the question requires current/recent information from the web
- \"needs_rag\": true if the question references past conversations or would benefit from conversation history context
- \"tools\": array of tool names to invoke before sending to the model (empty array if none needed)
- \"reasoning\": one sentence explaining your decision

Rules:
- Default to the \"default\" route unless there's a clear reason to use another
- Only set needs_search=true for questions about current events, recent data, or things that change over time
- Only set needs_rag=true if the user references \"we discussed\", \"earlier\", \"last time\", \"remember\", or similar
- Only include tools that are clearly needed — when in doubt, use none
- RESPOND ONLY WITH THE JSON OBJECT. No markdown, no explanation, no code fences.";

pub struct DecisionAgent {
    client: reqwest::Client,
    pub model: String,
    backend_url: String,
    timeout: u64,
    routes: RouteTable,
    available_tools: Vec<String>,
    pub enabled: bool,
    system_prompt: String,
}

impl DecisionAgent {
    pub fn new(
        model: &str,
        backend_url: &str,
        timeout: u64,
        routes: RouteTable,
        available_tools: Vec<String>,
    ) -> Self {
        let enabled = !model.is_empty() && !backend_url.is_empty();
        let system_prompt = SYSTEM_PROMPT_TEMPLATE
            .replace("{routes_block}", &routes_block(&routes))
            .replace("{tools_block}", &tools_block(&available_tools));

        if enabled {
            info!(model, routes = ?routes.route_names(), tools = ?available_tools, "decision agent enabled");
        } else {
            info!("decision agent disabled (no model configured)");
        }

        Self {
            client: reqwest::Client::new(),
            model: model.to_string(),
            backend_url: backend_url.trim_end_matches('/').to_string(),
            timeout,
            routes,
            available_tools,
            enabled,
            system_prompt,
        }
    }

    /// Analyze a user message and return a routing Decision. Never fails:
    /// any error path returns the fallback.
    pub async fn decide(&self, user_message: &str) -> Decision {
        if !self.enabled {
            return Decision::fallback(self.routes.default_model());
        }

        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": self.system_prompt},
                {"role": "user", "content": user_message},
            ],
            // Low temperature for consistent routing; decisions are tiny
            "temperature": 0.1,
            "max_tokens": 256,
            "stream": false,
        });

        let result = self
            .client
            .post(format!("{}/v1/chat/completions", self.backend_url))
            .timeout(std::time::Duration::from_secs(self.timeout))
            .json(&body)
            .send()
            .await;

        let resp = match result {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                warn!(status = r.status().as_u16(), "decision agent HTTP error, using default");
                return Decision::fallback(self.routes.default_model());
            }
            Err(e) if e.is_timeout() => {
                warn!(timeout = self.timeout, "decision agent timed out, using default");
                return Decision::fallback(self.routes.default_model());
            }
            Err(e) => {
                warn!(err = %e, "decision agent failed, using default");
                return Decision::fallback(self.routes.default_model());
            }
        };

        let data: Value = match resp.json().await {
            Ok(d) => d,
            Err(e) => {
                warn!(err = %e, "decision agent returned non-JSON body");
                return Decision::fallback(self.routes.default_model());
            }
        };
        let content = data
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .unwrap_or("");

        match self.parse_response(content) {
            Some(decision) => {
                info!(
                    model = %decision.model,
                    search = decision.needs_search,
                    rag = decision.needs_rag,
                    tools = ?decision.tools,
                    reasoning = %decision.reasoning,
                    "decision"
                );
                decision
            }
            None => {
                warn!("decision agent returned invalid JSON, using default");
                Decision::fallback(self.routes.default_model())
            }
        }
    }

    /// Parse the model's JSON reply, stripping markdown fences first.
    fn parse_response(&self, text: &str) -> Option<Decision> {
        let cleaned = strip_fences(text);
        let data: Value = serde_json::from_str(&cleaned).ok()?;

        let route_name = data.get("model").and_then(|m| m.as_str()).unwrap_or("default");
        let resolved_model = self.routes.resolve(route_name);

        // Only tools that are actually registered survive
        let tools: Vec<String> = data
            .get("tools")
            .and_then(|t| t.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|t| t.as_str())
                    .filter(|t| self.available_tools.iter().any(|a| a == t))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Some(Decision {
            model: resolved_model,
            needs_search: data.get("needs_search").and_then(|v| v.as_bool()).unwrap_or(false),
            needs_rag: data.get("needs_rag").and_then(|v| v.as_bool()).unwrap_or(false),
            tools,
            reasoning: data
                .get("reasoning")
                .and_then(|r| r.as_str())
                .unwrap_or_default()
                .to_string(),
            confidence: data.get("confidence").and_then(|c| c.as_f64()).unwrap_or(0.8) as f32,
            fallback: false,
        })
    }

    /// Pin the decision model into backend memory so the first borderline
    /// request doesn't pay load latency.
    pub async fn preload(&self) {
        if !self.enabled {
            return;
        }
        let result = self
            .client
            .post(format!("{}/api/generate", self.backend_url))
            .timeout(std::time::Duration::from_secs(30))
            .json(&serde_json::json!({"model": self.model, "prompt": "", "keep_alive": -1}))
            .send()
            .await;
        match result {
            Ok(r) if r.status().is_success() => {
                info!(model = %self.model, "decision model preloaded and pinned")
            }
            Ok(r) => warn!(status = r.status().as_u16(), "failed to preload decision model"),
            Err(e) => warn!(err = %e, "failed to preload decision model"),
        }
    }
}

fn routes_block(routes: &RouteTable) -> String {
    let descriptions = routes.descriptions();
    if descriptions.is_empty() {
        return "- No custom routes configured. Use the default model.".to_string();
    }
    descriptions
        .iter()
        .map(|(name, model, desc)| format!("- \"{name}\": model={model} — {desc}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn tools_block(tools: &[String]) -> String {
    if tools.is_empty() {
        return "- No tools available.".to_string();
    }
    tools.iter().map(|t| format!("- \"{t}\"")).collect::<Vec<_>>().join("\n")
}

fn strip_fences(text: &str) -> String {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    trimmed
        .lines()
        .filter(|l| !l.trim().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}
