//! Operator agent — a JSON tool-calling loop independent of the router.
//!
//! Each turn the model must respond with ONE of:
//!
//! ```text
//! {"thought": "...", "tool": "tool_name", "input": "..."}   ← call a tool
//! {"thought": "...", "answer": "..."}                        ← done
//! ```
//!
//! Structured JSON parses far more reliably on small models than
//! free-form action/observation text, which is why this loop exists
//! instead of a ReAct parser.

use std::sync::Arc;
use std::time::Duration;

use beigebox_tools::ToolRegistry;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::harness::extract_content;
use crate::jsonfix::try_recover_json;

const SYSTEM_TEMPLATE: &str = "You are BeigeBox Operator, an admin assistant for a local LLM proxy.
You answer questions about conversations, system state, and anything the user needs.

You have access to tools. To use a tool, respond with ONLY this JSON (no markdown, no extra text):
{\"thought\": \"why I'm calling this tool\", \"tool\": \"TOOL_NAME\", \"input\": \"what to pass\"}

When you have enough information to answer, respond with ONLY this JSON:
{\"thought\": \"I have the answer\", \"answer\": \"your full answer here\"}

RULES:
- Respond with ONLY the JSON object. No markdown fences. No explanation outside the JSON.
- Use one tool at a time.
- If no tool is needed, go straight to the answer JSON.
- If a tool returns an error, try a different approach or explain the limitation in your answer.
- Never make up tool results.

AVAILABLE TOOLS:
{tools_block}";

const NO_TOOLS_SYSTEM: &str = "You are BeigeBox Operator, an admin assistant for a local LLM proxy.
Answer the user's question directly and helpfully.
No tools are currently available.";

const CORRECTION_PROMPT: &str = "Your response was not valid JSON. \
You must respond with ONLY a JSON object. \
Either {\"thought\": \"...\", \"tool\": \"...\", \"input\": \"...\"} \
or {\"thought\": \"...\", \"answer\": \"...\"}. \
No markdown, no extra text.";

pub struct Operator {
    client: reqwest::Client,
    backend_url: String,
    pub model: String,
    max_iterations: usize,
    timeout: Duration,
    registry: Arc<ToolRegistry>,
    system_prompt: String,
}

impl Operator {
    pub fn new(
        backend_url: &str,
        model: &str,
        max_iterations: usize,
        timeout_seconds: u64,
        registry: Arc<ToolRegistry>,
    ) -> Self {
        let tools = registry.descriptions();
        let system_prompt = if tools.is_empty() {
            NO_TOOLS_SYSTEM.to_string()
        } else {
            let block: String =
                tools.iter().map(|(name, desc)| format!("  {name}: {desc}\n")).collect();
            SYSTEM_TEMPLATE.replace("{tools_block}", block.trim_end())
        };

        info!(model, tools = ?registry.list(), "operator ready");
        Self {
            client: reqwest::Client::new(),
            backend_url: backend_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            max_iterations,
            timeout: Duration::from_secs(timeout_seconds),
            registry,
            system_prompt,
        }
    }

    /// Answer a single question through the tool loop.
    pub async fn run(&self, question: &str) -> String {
        if question.trim().is_empty() {
            return "No question provided.".to_string();
        }

        let mut messages = vec![
            json!({"role": "system", "content": self.system_prompt}),
            json!({"role": "user", "content": question}),
        ];

        for iteration in 0..self.max_iterations {
            let raw = match self.chat(&messages).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(err = %e, "operator LLM call failed");
                    return format!(
                        "Operator unavailable: {e}. Make sure the backend is running with model '{}'.",
                        self.model
                    );
                }
            };
            debug!(iteration, raw = %raw.chars().take(200).collect::<String>(), "operator turn");

            let parsed = match try_recover_json(&raw) {
                Some(v) => v,
                // Parse failed — nudge the model once, then return raw
                None if iteration == 0 => {
                    messages.push(json!({"role": "assistant", "content": raw}));
                    messages.push(json!({"role": "user", "content": CORRECTION_PROMPT}));
                    continue;
                }
                None => {
                    warn!("operator could not parse JSON after nudge, returning raw text");
                    return raw.trim().to_string();
                }
            };

            if let Some(answer) = parsed.get("answer") {
                return answer.as_str().map(str::to_string).unwrap_or_else(|| answer.to_string());
            }

            if let Some(tool_name) = parsed.get("tool").and_then(|t| t.as_str()) {
                let tool_input = parsed
                    .get("input")
                    .map(|i| i.as_str().map(str::to_string).unwrap_or_else(|| i.to_string()))
                    .unwrap_or_default();
                let thought = parsed.get("thought").and_then(|t| t.as_str()).unwrap_or("");
                info!(tool = tool_name, input = %tool_input, thought, "operator tool call");

                let observation = match self.registry.run_tool(tool_name, &tool_input).await {
                    Some(result) => result,
                    None => format!(
                        "Error: unknown tool '{tool_name}'. Available: {}",
                        available_list(&self.registry)
                    ),
                };

                messages.push(json!({"role": "assistant", "content": raw}));
                messages.push(json!({
                    "role": "user",
                    "content": format!("Tool result for {tool_name}:\n{observation}"),
                }));
                continue;
            }

            // JSON present but neither 'answer' nor 'tool'
            let thought = parsed.get("thought").and_then(|t| t.as_str()).unwrap_or("");
            if !thought.is_empty() {
                return thought.to_string();
            }
            return parsed.to_string();
        }

        "Operator reached max iterations without a final answer. Try rephrasing your question."
            .to_string()
    }

    async fn chat(&self, messages: &[Value]) -> Result<String, String> {
        let resp = self
            .client
            .post(format!("{}/v1/chat/completions", self.backend_url))
            .timeout(self.timeout)
            .json(&json!({
                "model": self.model,
                "messages": messages,
                "temperature": 0,
                "stream": false,
            }))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("HTTP {}", resp.status().as_u16()));
        }
        let data: Value = resp.json().await.map_err(|e| e.to_string())?;
        Ok(extract_content(&data))
    }
}

fn available_list(registry: &ToolRegistry) -> String {
    let names = registry.list();
    if names.is_empty() {
        "none".to_string()
    } else {
        names.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use beigebox_tools::Tool;

    struct Upper;

    #[async_trait]
    impl Tool for Upper {
        fn name(&self) -> &str {
            "upper"
        }
        fn description(&self) -> &str {
            "Uppercase the input"
        }
        async fn run(&self, input: &str) -> String {
            input.to_uppercase()
        }
    }

    fn operator_with_tools() -> Operator {
        let mut registry = ToolRegistry::empty();
        registry.register(Arc::new(Upper));
        Operator::new("http://localhost:11434", "op-model", 8, 60, Arc::new(registry))
    }

    #[test]
    fn system_prompt_lists_registered_tools() {
        let op = operator_with_tools();
        assert!(op.system_prompt.contains("upper: Uppercase the input"));
    }

    #[test]
    fn empty_registry_uses_the_no_tools_prompt() {
        let op =
            Operator::new("http://localhost:11434", "op-model", 8, 60, Arc::new(ToolRegistry::empty()));
        assert!(op.system_prompt.contains("No tools are currently available"));
    }

    #[tokio::test]
    async fn blank_question_short_circuits() {
        let op = operator_with_tools();
        assert_eq!(op.run("   ").await, "No question provided.");
    }

    #[tokio::test]
    async fn tool_loop_runs_the_tool_then_answers() {
        use crate::testutil::spawn_chat_server;

        // First turn: call the tool. Once a tool result is in the
        // history, answer with it.
        let addr = spawn_chat_server(|body| {
            let has_tool_result = body
                .get("messages")
                .and_then(|m| m.as_array())
                .map(|m| {
                    m.iter().any(|msg| {
                        msg.get("content")
                            .and_then(|c| c.as_str())
                            .map(|c| c.contains("Tool result for upper"))
                            .unwrap_or(false)
                    })
                })
                .unwrap_or(false);
            if has_tool_result {
                r#"{"thought": "done", "answer": "the tool said HELLO"}"#.to_string()
            } else {
                r#"{"thought": "need the tool", "tool": "upper", "input": "hello"}"#.to_string()
            }
        })
        .await;

        let mut registry = ToolRegistry::empty();
        registry.register(Arc::new(Upper));
        let op = Operator::new(&format!("http://{addr}"), "op-model", 8, 30, Arc::new(registry));

        assert_eq!(op.run("shout hello").await, "the tool said HELLO");
    }

    #[tokio::test]
    async fn unknown_tool_feeds_an_error_back_and_recovers() {
        use crate::testutil::spawn_chat_server;

        let addr = spawn_chat_server(|body| {
            let saw_unknown = body
                .get("messages")
                .and_then(|m| m.as_array())
                .map(|m| {
                    m.iter().any(|msg| {
                        msg.get("content")
                            .and_then(|c| c.as_str())
                            .map(|c| c.contains("unknown tool 'nonexistent'"))
                            .unwrap_or(false)
                    })
                })
                .unwrap_or(false);
            if saw_unknown {
                r#"{"thought": "ok", "answer": "recovered"}"#.to_string()
            } else {
                r#"{"thought": "try", "tool": "nonexistent", "input": "x"}"#.to_string()
            }
        })
        .await;

        let op = Operator::new(
            &format!("http://{addr}"),
            "op-model",
            8,
            30,
            Arc::new(ToolRegistry::empty()),
        );
        assert_eq!(op.run("anything").await, "recovered");
    }
}
