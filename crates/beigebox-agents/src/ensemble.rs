//! Ensemble voter — the same prompt to N models in parallel, then a
//! judge model picks the winner.

use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::harness::extract_content;
use crate::jsonfix::recover_json;

/// Final outcome of a vote.
#[derive(Debug, Clone)]
pub struct VoteOutcome {
    pub winner: String,
    pub best_response: String,
    pub verdict: String,
    /// (model, response, latency_ms) per contestant.
    pub responses: Vec<(String, String, u64)>,
}

pub struct EnsembleVoter {
    client: reqwest::Client,
    backend_url: String,
    pub models: Vec<String>,
    pub judge_model: String,
    temperature: f64,
}

const QUERY_TIMEOUT: Duration = Duration::from_secs(120);
const JUDGE_TIMEOUT: Duration = Duration::from_secs(60);

impl EnsembleVoter {
    pub fn new(backend_url: &str, models: Vec<String>, judge_model: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            backend_url: backend_url.trim_end_matches('/').to_string(),
            models,
            judge_model: judge_model.to_string(),
            temperature: 0.2,
        }
    }

    /// Dispatch `prompt` to every model in parallel, judge the responses,
    /// emit the harness event vocabulary along the way.
    pub async fn vote(&self, prompt: &str, events_tx: Option<mpsc::Sender<Value>>) -> VoteOutcome {
        let started = Instant::now();
        let emit = |ev: Value| {
            if let Some(tx) = &events_tx {
                let _ = tx.try_send(ev);
            }
        };
        let event = |type_: &str, mut body: Value| {
            body["type"] = json!(type_);
            body["ts"] = json!(started.elapsed().as_millis() as u64);
            body
        };

        emit(event(
            "start",
            json!({"prompt": prompt, "models": self.models, "judge": self.judge_model}),
        ));
        emit(event("dispatch", json!({"model_count": self.models.len()})));

        let responses = self.query_all(prompt).await;
        for (model, response, latency) in &responses {
            emit(event(
                "result",
                json!({"model": model, "response": response, "latency_ms": latency}),
            ));
        }

        if responses.is_empty() {
            emit(event("error", json!({"message": "No responses from any model"})));
            return VoteOutcome {
                winner: String::new(),
                best_response: String::new(),
                verdict: "No responses from any model".to_string(),
                responses,
            };
        }

        let verdict = self.judge(prompt, &responses).await;
        let mut winner = verdict.get("winner").and_then(|w| w.as_str()).unwrap_or("").to_string();
        let mut reasoning =
            verdict.get("reasoning").and_then(|r| r.as_str()).unwrap_or("").to_string();

        // A winner that names no contestant counts as a failed verdict
        if !responses.iter().any(|(m, _, _)| *m == winner) {
            reasoning = format!(
                "Judge verdict did not match any model ('{winner}'). Defaulting to first response."
            );
            winner = responses[0].0.clone();
        }
        let best_response = responses
            .iter()
            .find(|(m, _, _)| *m == winner)
            .map(|(_, r, _)| r.clone())
            .unwrap_or_default();

        emit(event(
            "evaluate",
            json!({
                "winner": winner,
                "reasoning": reasoning,
                "all_responses": responses
                    .iter()
                    .map(|(m, r, _)| json!({"model": m, "response": r}))
                    .collect::<Vec<_>>(),
            }),
        ));
        emit(event(
            "finish",
            json!({"winner": winner, "best_response": best_response, "verdict": reasoning}),
        ));

        info!(winner = %winner, contestants = self.models.len(), "ensemble vote complete");
        VoteOutcome { winner, best_response, verdict: reasoning, responses }
    }

    async fn query_all(&self, prompt: &str) -> Vec<(String, String, u64)> {
        let jobs = self.models.iter().map(|model| self.query_model(model.clone(), prompt));
        join_all(jobs).await
    }

    async fn query_model(&self, model: String, prompt: &str) -> (String, String, u64) {
        let t0 = Instant::now();
        let result = self
            .client
            .post(format!("{}/v1/chat/completions", self.backend_url))
            .timeout(QUERY_TIMEOUT)
            .json(&json!({
                "model": model,
                "messages": [{"role": "user", "content": prompt}],
                "temperature": 0.7,
                "stream": false,
            }))
            .send()
            .await;

        let latency = t0.elapsed().as_millis() as u64;
        match result {
            Ok(resp) if resp.status().is_success() => match resp.json::<Value>().await {
                Ok(data) => (model, extract_content(&data), latency),
                Err(e) => (model, format!("Error: {e}"), latency),
            },
            Ok(resp) => (model, format!("Error: HTTP {}", resp.status().as_u16()), latency),
            Err(e) => {
                warn!(model = %model, err = %e, "ensemble query failed");
                (model, format!("Error: {e}"), latency)
            }
        }
    }

    /// Ask the judge model to pick the best response. Failures fall back
    /// to the first response with the failure recorded in the reasoning.
    async fn judge(&self, prompt: &str, responses: &[(String, String, u64)]) -> Value {
        let models_list: Vec<&str> = responses.iter().map(|(m, _, _)| m.as_str()).collect();
        let responses_text: String = responses
            .iter()
            .map(|(m, r, _)| format!("[{m}]:\n{r}"))
            .collect::<Vec<_>>()
            .join("\n\n");

        let system = "You are an expert evaluator. Compare responses on quality, accuracy, \
                      completeness, and helpfulness. Respond ONLY with valid JSON:\n\
                      {\"winner\":\"<model_name>\",\"reasoning\":\"<brief explanation>\"}";
        let user = format!(
            "Original prompt: {prompt}\n\nResponses to evaluate:\n{responses_text}\n\n\
             Which model provided the best response? Choose from: {}",
            models_list.join(", ")
        );

        let result = self
            .client
            .post(format!("{}/v1/chat/completions", self.backend_url))
            .timeout(JUDGE_TIMEOUT)
            .json(&json!({
                "model": self.judge_model,
                "messages": [
                    {"role": "system", "content": system},
                    {"role": "user", "content": user},
                ],
                "temperature": self.temperature,
                "stream": false,
            }))
            .send()
            .await;

        let content = match result {
            Ok(resp) if resp.status().is_success() => match resp.json::<Value>().await {
                Ok(data) => extract_content(&data),
                Err(e) => {
                    warn!(err = %e, "judge returned non-JSON body");
                    String::new()
                }
            },
            Ok(resp) => {
                warn!(status = resp.status().as_u16(), "judge call failed");
                String::new()
            }
            Err(e) => {
                warn!(err = %e, "judge call failed");
                String::new()
            }
        };

        recover_json(
            &content,
            json!({
                "winner": responses[0].0,
                "reasoning": "Judge evaluation failed. Defaulting to first response.",
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::spawn_chat_server;

    #[tokio::test]
    async fn judge_picks_the_named_winner() {
        let addr = spawn_chat_server(|body| {
            let model = body.get("model").and_then(|m| m.as_str()).unwrap_or("");
            match model {
                "alpha" => "answer from alpha".to_string(),
                "bravo" => "answer from bravo".to_string(),
                // judge
                _ => r#"{"winner": "bravo", "reasoning": "more complete"}"#.to_string(),
            }
        })
        .await;

        let voter = EnsembleVoter::new(
            &format!("http://{addr}"),
            vec!["alpha".to_string(), "bravo".to_string()],
            "judge-model",
        );
        let outcome = voter.vote("pick one", None).await;
        assert_eq!(outcome.winner, "bravo");
        assert_eq!(outcome.best_response, "answer from bravo");
        assert_eq!(outcome.responses.len(), 2);
    }

    #[tokio::test]
    async fn mismatched_verdict_falls_back_to_first_response() {
        let addr = spawn_chat_server(|body| {
            let model = body.get("model").and_then(|m| m.as_str()).unwrap_or("");
            match model {
                "alpha" => "first answer".to_string(),
                "bravo" => "second answer".to_string(),
                // judge names a model that wasn't in the race
                _ => r#"{"winner": "charlie", "reasoning": "confused"}"#.to_string(),
            }
        })
        .await;

        let voter = EnsembleVoter::new(
            &format!("http://{addr}"),
            vec!["alpha".to_string(), "bravo".to_string()],
            "judge-model",
        );
        let outcome = voter.vote("pick one", None).await;
        assert_eq!(outcome.winner, "alpha");
        assert_eq!(outcome.best_response, "first answer");
        assert!(outcome.verdict.contains("did not match"));
    }
}
