//! Harness orchestrator — goal-directed plan → dispatch → evaluate loop.
//!
//! The planner model breaks a goal into parallel sub-tasks assigned to
//! models or to the operator self-endpoint; an evaluator decides after
//! each round whether the results suffice. Task launches are staggered —
//! firing everything at once races when several tasks land on the same
//! operator endpoint.

use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::warn;

use crate::jsonfix::recover_json;

/// Collected outcome of a harness run, ready for persistence.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub final_answer: String,
    pub total_rounds: usize,
    pub was_capped: bool,
    pub error_count: usize,
    pub total_latency_ms: u64,
    pub events: Vec<Value>,
}

impl RunOutcome {
    pub fn events_jsonl(&self) -> String {
        self.events.iter().map(|e| format!("{e}\n")).collect()
    }
}

pub struct HarnessOrchestrator {
    client: reqwest::Client,
    backend_url: String,
    pub model: String,
    pub available_targets: Vec<String>,
    max_rounds: usize,
    max_tasks_per_round: usize,
    task_stagger: Duration,
    task_timeout: Duration,
    total_timeout: Duration,
    /// Gateway port for the operator self-endpoint (always loopback).
    operator_port: u16,
}

impl HarnessOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backend_url: &str,
        model: &str,
        available_targets: Vec<String>,
        max_rounds: usize,
        max_tasks_per_round: usize,
        task_stagger_ms: u64,
        task_timeout_seconds: u64,
        total_timeout_seconds: u64,
        operator_port: u16,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            backend_url: backend_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            available_targets: if available_targets.is_empty() {
                vec!["operator".to_string()]
            } else {
                available_targets
            },
            max_rounds,
            max_tasks_per_round,
            task_stagger: Duration::from_millis(task_stagger_ms),
            task_timeout: Duration::from_secs(task_timeout_seconds),
            total_timeout: Duration::from_secs(total_timeout_seconds),
            operator_port,
        }
    }

    /// Run the loop for `goal`. Events are pushed to `events_tx` as they
    /// happen (receiver may be dropped; sends are best-effort) and
    /// collected into the returned outcome.
    pub async fn run(&self, goal: &str, events_tx: Option<mpsc::Sender<Value>>) -> RunOutcome {
        let started = Instant::now();
        let mut events: Vec<Value> = Vec::new();
        let mut history: Vec<Value> = Vec::new();
        let mut error_count = 0usize;
        let mut round = 0usize;

        let emit = |ev: Value, events: &mut Vec<Value>| {
            if let Some(tx) = &events_tx {
                let _ = tx.try_send(ev.clone());
            }
            events.push(ev);
        };

        emit(
            self.event("start", json!({"goal": goal, "model": self.model, "targets": self.available_targets}), started),
            &mut events,
        );

        while round < self.max_rounds {
            round += 1;

            // 1. Plan
            let plan = match self.plan(goal, &history, round).await {
                Ok(p) => p,
                Err(e) => {
                    error_count += 1;
                    emit(self.event("error", json!({"message": format!("Planning failed: {e}")}), started), &mut events);
                    return self.outcome(String::new(), round, false, error_count, started, events);
                }
            };

            if plan.get("action").and_then(|a| a.as_str()) == Some("finish") {
                let answer = plan.get("answer").and_then(|a| a.as_str()).unwrap_or("").to_string();
                emit(self.event("finish", json!({"answer": answer, "rounds": round - 1}), started), &mut events);
                return self.outcome(answer, round - 1, false, error_count, started, events);
            }

            let tasks: Vec<Value> = plan
                .get("tasks")
                .and_then(|t| t.as_array())
                .cloned()
                .unwrap_or_default();
            let reasoning = plan.get("reasoning").and_then(|r| r.as_str()).unwrap_or("");
            emit(
                self.event("plan", json!({"round": round, "reasoning": reasoning, "tasks": tasks}), started),
                &mut events,
            );

            if tasks.is_empty() {
                let answer = "No tasks generated — goal may be too vague.".to_string();
                emit(self.event("finish", json!({"answer": answer, "rounds": round}), started), &mut events);
                return self.outcome(answer, round, false, error_count, started, events);
            }

            // 2. Dispatch (capped, staggered, per-task + total timeouts)
            let capped: Vec<Value> = tasks.into_iter().take(self.max_tasks_per_round).collect();
            emit(self.event("dispatch", json!({"round": round, "task_count": capped.len()}), started), &mut events);

            let results = self.dispatch(&capped).await;
            for result in results {
                if result.get("status").and_then(|s| s.as_str()) == Some("error") {
                    error_count += 1;
                }
                let mut ev_body = result.clone();
                ev_body["round"] = json!(round);
                emit(self.event("result", ev_body.clone(), started), &mut events);
                history.push(ev_body);
            }

            // 3. Evaluate
            let eval = match self.evaluate(goal, &history, round).await {
                Ok(e) => e,
                Err(e) => {
                    error_count += 1;
                    emit(self.event("error", json!({"message": format!("Evaluation failed: {e}")}), started), &mut events);
                    return self.outcome(String::new(), round, false, error_count, started, events);
                }
            };

            let action = eval.get("action").and_then(|a| a.as_str()).unwrap_or("continue");
            let assessment = eval.get("assessment").and_then(|a| a.as_str()).unwrap_or("");
            emit(
                self.event("evaluate", json!({"round": round, "assessment": assessment, "action": action}), started),
                &mut events,
            );

            if action == "finish" {
                let answer = eval.get("answer").and_then(|a| a.as_str()).unwrap_or("").to_string();
                emit(self.event("finish", json!({"answer": answer, "rounds": round}), started), &mut events);
                return self.outcome(answer, round, false, error_count, started, events);
            }
        }

        // Round cap hit — synthesize a best-effort answer
        let answer = self
            .synthesize(goal, &history)
            .await
            .unwrap_or_else(|_| "Round limit reached. See intermediate results above.".to_string());
        emit(
            self.event("finish", json!({"answer": answer, "rounds": round, "capped": true}), started),
            &mut events,
        );
        self.outcome(answer, round, true, error_count, started, events)
    }

    fn event(&self, type_: &str, mut body: Value, started: Instant) -> Value {
        body["type"] = json!(type_);
        body["ts"] = json!(started.elapsed().as_millis() as u64);
        body
    }

    fn outcome(
        &self,
        final_answer: String,
        total_rounds: usize,
        was_capped: bool,
        error_count: usize,
        started: Instant,
        events: Vec<Value>,
    ) -> RunOutcome {
        RunOutcome {
            final_answer,
            total_rounds,
            was_capped,
            error_count,
            total_latency_ms: started.elapsed().as_millis() as u64,
            events,
        }
    }

    // ── LLM calls ───────────────────────────────────────────────────────

    async fn plan(&self, goal: &str, history: &[Value], round: usize) -> Result<Value, String> {
        let target_list: String =
            self.available_targets.iter().map(|t| format!("  - {t}\n")).collect();
        let system = format!(
            "You are a harness orchestrator. Your job is to break a goal into parallel subtasks \
             and assign each to the best available agent or model. \
             You will be called repeatedly until the goal is fully addressed.\n\n\
             Available targets:\n{target_list}\n\
             Respond ONLY with valid JSON matching one of these schemas:\n\n\
             If you have enough information to answer the goal:\n\
             {{\"action\":\"finish\",\"answer\":\"<complete answer>\",\"reasoning\":\"<why done>\"}}\n\n\
             If more work is needed:\n\
             {{\"action\":\"dispatch\",\"reasoning\":\"<why these tasks>\",\"tasks\":[\
             {{\"target\":\"<target from list>\",\"prompt\":\"<specific task prompt>\",\"rationale\":\"<why this target>\"}}]}}\n\n\
             Rules:\n\
             - Max {} tasks per round\n\
             - Be specific in prompts — each target only sees its own task\n\
             - Use 'operator' for tasks needing tools, memory, or web search\n\
             - Use model targets for generation, analysis, critique, or parallel perspectives\n\
             - Respond with ONLY the JSON object, no markdown, no explanation outside JSON",
            self.max_tasks_per_round
        );
        let user = format!(
            "Goal: {goal}\n\nRound: {round}\n\nResults so far:\n{}",
            format_history(history)
        );

        let raw = self.llm_call(&system, &user).await?;
        let fallback = json!({"action": "dispatch", "tasks": [], "reasoning": raw.clone()});
        Ok(recover_json(&raw, fallback))
    }

    async fn evaluate(&self, goal: &str, history: &[Value], round: usize) -> Result<Value, String> {
        let system = "You are evaluating whether a set of parallel agent results fully addresses a goal.\n\
             Respond ONLY with valid JSON:\n\n\
             If the goal is fully addressed:\n\
             {\"action\":\"finish\",\"answer\":\"<synthesized complete answer>\",\"assessment\":\"<why sufficient>\"}\n\n\
             If more work is needed:\n\
             {\"action\":\"continue\",\"assessment\":\"<what is missing or needs refinement>\"}\n\n\
             Respond with ONLY the JSON object.";
        let user = format!(
            "Goal: {goal}\n\nRound {round} results:\n{}",
            format_history(history)
        );

        let raw = self.llm_call(system, &user).await?;
        let fallback = json!({"action": "continue", "assessment": raw.clone()});
        Ok(recover_json(&raw, fallback))
    }

    async fn synthesize(&self, goal: &str, history: &[Value]) -> Result<String, String> {
        let system = "Synthesize the following parallel agent results into a single coherent answer \
                      that best addresses the original goal. Be concise and direct.";
        let user = format!("Goal: {goal}\n\nAll results:\n{}", format_history(history));
        self.llm_call(system, &user).await
    }

    async fn llm_call(&self, system: &str, user: &str) -> Result<String, String> {
        let resp = self
            .client
            .post(format!("{}/v1/chat/completions", self.backend_url))
            .timeout(Duration::from_secs(60))
            .json(&json!({
                "model": self.model,
                "messages": [
                    {"role": "system", "content": system},
                    {"role": "user", "content": user},
                ],
                "stream": false,
                "temperature": 0.2,
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

    // ── Dispatch ────────────────────────────────────────────────────────

    /// Run all tasks with a small stagger between launches and both
    /// per-task and total timeouts. Task errors never crash the loop —
    /// they come back as `status: "error"` results.
    async fn dispatch(&self, tasks: &[Value]) -> Vec<Value> {
        let jobs = tasks.iter().enumerate().map(|(i, task)| {
            let task = task.clone();
            async move {
                if i > 0 {
                    tokio::time::sleep(self.task_stagger * i as u32).await;
                }
                match tokio::time::timeout(self.task_timeout, self.run_task(&task)).await {
                    Ok(result) => result,
                    Err(_) => task_result(
                        &task,
                        format!("Error: task timeout ({}s)", self.task_timeout.as_secs()),
                        self.task_timeout.as_millis() as u64,
                        "error",
                    ),
                }
            }
        });

        match tokio::time::timeout(self.total_timeout, join_all(jobs)).await {
            Ok(results) => results,
            Err(_) => {
                warn!(timeout_s = self.total_timeout.as_secs(), "harness round hit total timeout");
                tasks
                    .iter()
                    .map(|t| {
                        task_result(
                            t,
                            format!("Error: total timeout ({}s) exceeded", self.total_timeout.as_secs()),
                            self.total_timeout.as_millis() as u64,
                            "error",
                        )
                    })
                    .collect()
            }
        }
    }

    async fn run_task(&self, task: &Value) -> Value {
        let target = task.get("target").and_then(|t| t.as_str()).unwrap_or("");
        let prompt = task.get("prompt").and_then(|p| p.as_str()).unwrap_or("");
        let t0 = Instant::now();

        let result = if target == "operator" {
            self.run_operator(prompt).await
        } else if let Some(model_id) = target.strip_prefix("model:") {
            self.run_model(model_id, prompt).await
        } else {
            self.run_model(target, prompt).await
        };

        let latency_ms = t0.elapsed().as_millis() as u64;
        match result {
            Ok(content) => task_result(task, content, latency_ms, "done"),
            Err(e) => task_result(task, format!("Error: {e}"), latency_ms, "error"),
        }
    }

    /// Route a task to the operator via its own endpoint, always on the
    /// loopback address (no hostname resolution path).
    async fn run_operator(&self, query: &str) -> Result<String, String> {
        let resp = self
            .client
            .post(format!("http://127.0.0.1:{}/api/v1/operator", self.operator_port))
            .timeout(self.task_timeout)
            .json(&json!({"query": query}))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("operator HTTP {}", resp.status().as_u16()));
        }
        let data: Value = resp.json().await.map_err(|e| e.to_string())?;
        Ok(data
            .get("answer")
            .or_else(|| data.get("error"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| data.to_string()))
    }

    async fn run_model(&self, model_id: &str, prompt: &str) -> Result<String, String> {
        let resp = self
            .client
            .post(format!("{}/v1/chat/completions", self.backend_url))
            .timeout(self.task_timeout)
            .json(&json!({
                "model": model_id,
                "messages": [{"role": "user", "content": prompt}],
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

fn task_result(task: &Value, content: String, latency_ms: u64, status: &str) -> Value {
    json!({
        "target": task.get("target").cloned().unwrap_or(json!("")),
        "prompt": task.get("prompt").cloned().unwrap_or(json!("")),
        "rationale": task.get("rationale").cloned().unwrap_or(json!("")),
        "content": content,
        "latency_ms": latency_ms,
        "status": status,
    })
}

fn format_history(history: &[Value]) -> String {
    if history.is_empty() {
        return "No results yet.".to_string();
    }
    history
        .iter()
        .enumerate()
        .map(|(i, r)| {
            let prompt = r.get("prompt").and_then(|p| p.as_str()).unwrap_or("");
            let content = r.get("content").and_then(|c| c.as_str()).unwrap_or("");
            format!(
                "[{}] Round {} · {} ({}ms)\nTask: {}\nResult: {}",
                i + 1,
                r.get("round").and_then(|v| v.as_u64()).unwrap_or(0),
                r.get("target").and_then(|t| t.as_str()).unwrap_or(""),
                r.get("latency_ms").and_then(|l| l.as_u64()).unwrap_or(0),
                truncate(prompt, 200),
                truncate(content, 600),
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn truncate(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}

pub(crate) fn extract_content(data: &Value) -> String {
    data.get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .unwrap_or("")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{spawn_chat_server, system_prompt};

    #[tokio::test]
    async fn round_cap_emits_capped_finish() {
        // Planner always dispatches one task; evaluator always continues
        let addr = spawn_chat_server(|body| {
            let system = system_prompt(body);
            if system.contains("harness orchestrator") {
                r#"{"action":"dispatch","reasoning":"more work","tasks":[{"target":"model:stub","prompt":"do it","rationale":"only option"}]}"#
                    .to_string()
            } else if system.contains("evaluating whether") {
                r#"{"action":"continue","assessment":"not enough"}"#.to_string()
            } else if system.contains("Synthesize the following") {
                "best effort answer".to_string()
            } else {
                "task result".to_string()
            }
        })
        .await;

        let orchestrator = HarnessOrchestrator::new(
            &format!("http://{addr}"),
            "planner-model",
            vec!["model:stub".to_string()],
            3,   // round cap
            6,
            0,   // no stagger in tests
            30,
            60,
            0,
        );
        let outcome = orchestrator.run("test", None).await;

        assert!(outcome.was_capped);
        assert_eq!(outcome.total_rounds, 3);
        assert_eq!(outcome.final_answer, "best effort answer");

        let count = |t: &str| {
            outcome
                .events
                .iter()
                .filter(|e| e.get("type").and_then(|v| v.as_str()) == Some(t))
                .count()
        };
        assert_eq!(count("plan"), 3);
        assert_eq!(count("dispatch"), 3);
        assert!(count("result") >= 3);
        assert_eq!(count("evaluate"), 3);
        assert_eq!(count("finish"), 1);
        let finish = outcome
            .events
            .iter()
            .find(|e| e.get("type").and_then(|v| v.as_str()) == Some("finish"))
            .unwrap();
        assert_eq!(finish["capped"], true);
        assert_eq!(finish["rounds"], 3);
        assert_eq!(outcome.error_count, 0);
    }

    #[tokio::test]
    async fn planner_finish_ends_the_run_immediately() {
        let addr = spawn_chat_server(|body| {
            let system = system_prompt(body);
            if system.contains("harness orchestrator") {
                r#"{"action":"finish","answer":"already done","reasoning":"trivial"}"#.to_string()
            } else {
                "unused".to_string()
            }
        })
        .await;

        let orchestrator = HarnessOrchestrator::new(
            &format!("http://{addr}"),
            "planner-model",
            vec!["operator".to_string()],
            8,
            6,
            0,
            30,
            60,
            0,
        );
        let outcome = orchestrator.run("easy goal", None).await;
        assert!(!outcome.was_capped);
        assert_eq!(outcome.total_rounds, 0);
        assert_eq!(outcome.final_answer, "already done");
    }

    #[tokio::test]
    async fn unreachable_planner_yields_an_error_event() {
        let orchestrator = HarnessOrchestrator::new(
            "http://127.0.0.1:1", // nothing listens here
            "planner-model",
            vec!["operator".to_string()],
            2,
            6,
            0,
            2,
            10,
            0,
        );
        let outcome = orchestrator.run("goal", None).await;
        assert_eq!(outcome.error_count, 1);
        assert!(outcome
            .events
            .iter()
            .any(|e| e.get("type").and_then(|v| v.as_str()) == Some("error")));
    }

    #[test]
    fn history_formatting_handles_empty_and_truncates() {
        assert_eq!(format_history(&[]), "No results yet.");
        let history = vec![json!({
            "round": 1,
            "target": "operator",
            "latency_ms": 42,
            "prompt": "p".repeat(500),
            "content": "c".repeat(1000),
        })];
        let text = format_history(&history);
        assert!(text.contains("[1] Round 1 · operator (42ms)"));
        assert!(text.len() < 900);
    }

    #[test]
    fn task_results_carry_status() {
        let task = json!({"target": "model:m", "prompt": "p", "rationale": "r"});
        let r = task_result(&task, "Error: boom".to_string(), 5, "error");
        assert_eq!(r["status"], "error");
        assert_eq!(r["target"], "model:m");
    }

    #[test]
    fn outcome_serializes_events_as_jsonl() {
        let outcome = RunOutcome {
            final_answer: "a".to_string(),
            total_rounds: 1,
            was_capped: false,
            error_count: 0,
            total_latency_ms: 10,
            events: vec![json!({"type": "start"}), json!({"type": "finish"})],
        };
        let jsonl = outcome.events_jsonl();
        assert_eq!(jsonl.lines().count(), 2);
        assert!(jsonl.lines().all(|l| serde_json::from_str::<Value>(l).is_ok()));
    }
}
