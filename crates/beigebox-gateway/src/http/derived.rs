//! Read-only derivations: replay, semantic map, flight records, and
//! per-model performance.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::app::AppState;

pub async fn replay(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    match state.replayer.replay(&id) {
        Some(replay) => {
            serde_json::to_value(replay).map(Json).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
        }
        None => Err(StatusCode::NOT_FOUND),
    }
}

pub async fn semantic_map(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    match state.semantic_map.build(&id).await {
        Some(map) => {
            serde_json::to_value(map).map(Json).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
        }
        None => Err(StatusCode::NOT_FOUND),
    }
}

#[derive(Deserialize)]
pub struct FlightParams {
    #[serde(default = "default_flight_n")]
    n: usize,
}

fn default_flight_n() -> usize {
    10
}

pub async fn list_flights(
    State(state): State<Arc<AppState>>,
    Query(params): Query<FlightParams>,
) -> Json<Value> {
    state.flights.evict_stale();
    Json(json!({"flights": state.flights.recent(params.n)}))
}

pub async fn get_flight(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    state.flights.get(&id).map(Json).ok_or(StatusCode::NOT_FOUND)
}

#[derive(Deserialize)]
pub struct PerformanceParams {
    #[serde(default = "default_days")]
    days: u32,
}

fn default_days() -> u32 {
    30
}

pub async fn model_performance(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PerformanceParams>,
) -> Result<Json<Value>, StatusCode> {
    let by_model = state
        .store
        .model_performance(params.days)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(json!({"by_model": by_model, "days_queried": params.days})))
}
