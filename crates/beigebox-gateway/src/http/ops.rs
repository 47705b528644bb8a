//! Operational surface: health, stats, semantic search.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::app::AppState;

pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let backends = state.dispatcher.health().await;
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "decision_llm": state.decision_agent.enabled,
        "backends": backends,
    }))
}

pub async fn stats(State(state): State<Arc<AppState>>) -> Result<Json<Value>, StatusCode> {
    let store_stats =
        state.store.stats().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(json!({
        "store": store_stats,
        "vector": { "total_embeddings": state.vector.stats() },
        "tools": state.tools.list(),
        "hooks": state.hooks.names(),
        "flights": state.flights.count(),
        "decision_llm": {
            "enabled": state.decision_agent.enabled,
            "model": state.decision_agent.model,
        },
    })))
}

#[derive(Deserialize)]
pub struct SearchParams {
    q: String,
    #[serde(default = "default_n")]
    n: usize,
    role: Option<String>,
}

fn default_n() -> usize {
    5
}

pub async fn search(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
) -> Json<Value> {
    let results = state.vector.search(&params.q, params.n, params.role.as_deref()).await;
    Json(json!({ "query": params.q, "results": results }))
}
