//! Agent endpoints: operator, harness, ensemble. Harness and ensemble
//! stream their event objects as newline-delimited JSON.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use beigebox_agents::{EnsembleVoter, HarnessOrchestrator};
use beigebox_store::HarnessRun;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};
use uuid::Uuid;

use crate::app::AppState;

#[derive(Deserialize)]
pub struct OperatorRequest {
    query: String,
}

/// POST /api/v1/operator — one question through the JSON tool loop.
pub async fn operator(
    State(state): State<Arc<AppState>>,
    Json(req): Json<OperatorRequest>,
) -> Json<Value> {
    let answer = state.operator.run(&req.query).await;
    Json(json!({"answer": answer}))
}

#[derive(Deserialize)]
pub struct HarnessRequest {
    goal: String,
    #[serde(default)]
    targets: Vec<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    max_rounds: Option<usize>,
}

/// POST /api/v1/harness — run the plan→dispatch→evaluate loop, streaming
/// events as NDJSON. The finished run is persisted to the message log.
pub async fn harness(
    State(state): State<Arc<AppState>>,
    Json(req): Json<HarnessRequest>,
) -> Response {
    let cfg = &state.config.harness;
    let model = req
        .model
        .clone()
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| {
            if cfg.model.is_empty() {
                state.config.backend.default_model.clone()
            } else {
                cfg.model.clone()
            }
        });
    let targets = if req.targets.is_empty() { vec!["operator".to_string()] } else { req.targets };
    let max_rounds = req.max_rounds.unwrap_or(cfg.max_rounds);

    let orchestrator = HarnessOrchestrator::new(
        &state.config.backend.url,
        &model,
        targets.clone(),
        max_rounds,
        cfg.max_tasks_per_round,
        cfg.task_stagger_ms,
        cfg.task_timeout_seconds,
        cfg.total_timeout_seconds,
        state.config.server.port,
    );

    let (tx, rx) = mpsc::channel::<Value>(64);
    let store = Arc::clone(&state.store);
    let goal = req.goal.clone();
    tokio::spawn(async move {
        let outcome = orchestrator.run(&goal, Some(tx)).await;
        info!(
            rounds = outcome.total_rounds,
            capped = outcome.was_capped,
            errors = outcome.error_count,
            "harness run complete"
        );
        let run = HarnessRun {
            id: Uuid::new_v4().simple().to_string(),
            created_at: beigebox_core::types::now_rfc3339(),
            goal,
            targets,
            model,
            max_rounds: max_rounds as i64,
            final_answer: outcome.final_answer.clone(),
            total_rounds: outcome.total_rounds as i64,
            was_capped: outcome.was_capped,
            total_latency_ms: outcome.total_latency_ms as i64,
            error_count: outcome.error_count as i64,
            events_jsonl: outcome.events_jsonl(),
        };
        if let Err(e) = store.store_harness_run(&run) {
            warn!(err = %e, "failed to persist harness run");
        }
    });

    ndjson_response(rx)
}

#[derive(Deserialize)]
pub struct EnsembleRequest {
    prompt: String,
    models: Vec<String>,
    #[serde(default)]
    judge: Option<String>,
}

/// POST /api/v1/ensemble — the same prompt to N models, judged; events
/// streamed as NDJSON.
pub async fn ensemble(
    State(state): State<Arc<AppState>>,
    Json(req): Json<EnsembleRequest>,
) -> Response {
    if req.models.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "at least one model is required"})),
        )
            .into_response();
    }
    let judge = req
        .judge
        .clone()
        .filter(|j| !j.is_empty())
        .unwrap_or_else(|| {
            if state.config.operator.model.is_empty() {
                state.config.backend.default_model.clone()
            } else {
                state.config.operator.model.clone()
            }
        });

    let voter = EnsembleVoter::new(&state.config.backend.url, req.models, &judge);
    let (tx, rx) = mpsc::channel::<Value>(64);
    tokio::spawn(async move {
        let _ = voter.vote(&req.prompt, Some(tx)).await;
    });

    ndjson_response(rx)
}

/// GET /api/v1/harness/runs — recent harness runs.
pub async fn list_runs(State(state): State<Arc<AppState>>) -> Result<Json<Value>, StatusCode> {
    let runs = state
        .store
        .list_harness_runs(10)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(json!({"runs": runs})))
}

/// GET /api/v1/harness/runs/{id} — one run with its parsed event stream.
pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let run = state.store.get_harness_run(&id).map_err(|_| StatusCode::NOT_FOUND)?;
    let events = run.events();
    let mut value = serde_json::to_value(&run).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    value["events"] = json!(events);
    Ok(Json(value))
}

fn ndjson_response(rx: mpsc::Receiver<Value>) -> Response {
    let stream = ReceiverStream::new(rx).map(|event| Ok::<_, Infallible>(format!("{event}\n")));
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
