//! GET /v1/models — union of all backend model lists, optionally
//! prefixed in advertise mode.

use std::sync::Arc;

use axum::{extract::State, Json};
use serde_json::Value;

use crate::app::AppState;

pub async fn list_models(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(state.proxy.list_models().await)
}
