//! Runtime-overlay read/write API.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};
use tracing::info;

use crate::app::AppState;

/// GET /api/v1/config — the current runtime overlay.
pub async fn get_config(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(Value::Object(state.overlay.get()))
}

/// POST /api/v1/config — merge keys into the runtime overlay.
pub async fn set_config(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let Some(map) = body.as_object() else {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "body must be a JSON object"})),
        ));
    };
    for (key, value) in map {
        if let Err(e) = state.overlay.set_key(key, value.clone()) {
            return Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            ));
        }
    }
    info!(keys = map.len(), "runtime overlay updated via API");
    Ok(Json(Value::Object(state.overlay.get())))
}

/// POST /api/v1/web-ui/toggle-vi-mode — flip one boolean overlay key.
pub async fn toggle_vi_mode(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, StatusCode> {
    match state.overlay.toggle_key("vi_mode") {
        Ok(value) => Ok(Json(json!({"vi_mode": value}))),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// GET /api/v1/system-context — raw context file contents.
pub async fn get_system_context(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({"content": state.proxy.system_context.read_file()}))
}

/// POST /api/v1/system-context — overwrite the context file.
pub async fn set_system_context(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    let content = body.get("content").and_then(|c| c.as_str()).unwrap_or("");
    state
        .proxy
        .system_context
        .write_file(content)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(json!({"ok": true, "chars": content.len()})))
}
