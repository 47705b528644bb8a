//! POST /v1/chat/completions — the main proxy endpoint.
//!
//! Non-streaming requests return the backend's JSON; `stream: true`
//! relays the backend's SSE lines verbatim (cost sentinels excepted).

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures_util::StreamExt;
use serde_json::Value;
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;

use crate::app::AppState;

pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Response {
    let stream = body.get("stream").and_then(|s| s.as_bool()).unwrap_or(false);
    info!(
        model = body.get("model").and_then(|m| m.as_str()).unwrap_or(""),
        stream,
        "chat completion request"
    );

    if stream {
        let rx = Arc::clone(&state.proxy).forward_chat_completion_stream(body).await;
        let line_stream = ReceiverStream::new(rx)
            .map(|line| Ok::<_, Infallible>(format!("{line}\n\n")));

        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .header(header::CONNECTION, "keep-alive")
            .header("x-accel-buffering", "no")
            .body(Body::from_stream(line_stream))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    } else {
        let data = state.proxy.forward_chat_completion(body).await;
        Json(data).into_response()
    }
}
