use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use beigebox_agents::Operator;
use beigebox_backends::dispatcher::Dispatcher;
use beigebox_core::config::BeigeBoxConfig;
use beigebox_core::runtime::RuntimeOverlay;
use beigebox_hooks::HookPipeline;
use beigebox_replay::{Replayer, SemanticMap};
use beigebox_router::DecisionAgent;
use beigebox_store::MessageStore;
use beigebox_tools::ToolRegistry;
use beigebox_vector::VectorIndex;

use crate::flight::FlightStore;
use crate::proxy::Proxy;

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: Arc<BeigeBoxConfig>,
    pub overlay: Arc<RuntimeOverlay>,
    pub proxy: Arc<Proxy>,
    pub store: Arc<MessageStore>,
    pub vector: Arc<VectorIndex>,
    pub tools: Arc<ToolRegistry>,
    pub hooks: Arc<HookPipeline>,
    pub dispatcher: Arc<Dispatcher>,
    pub decision_agent: Arc<DecisionAgent>,
    pub flights: Arc<FlightStore>,
    pub operator: Arc<Operator>,
    pub replayer: Arc<Replayer>,
    pub semantic_map: Arc<SemanticMap>,
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // OpenAI-compatible surface
        .route("/v1/chat/completions", post(crate::http::chat::chat_completions))
        .route("/v1/models", get(crate::http::models::list_models))
        // Operational surface
        .route("/health", get(crate::http::ops::health))
        .route("/stats", get(crate::http::ops::stats))
        .route("/search", get(crate::http::ops::search))
        // Runtime config API
        .route(
            "/api/v1/config",
            get(crate::http::config_api::get_config).post(crate::http::config_api::set_config),
        )
        .route("/api/v1/web-ui/toggle-vi-mode", post(crate::http::config_api::toggle_vi_mode))
        .route(
            "/api/v1/system-context",
            get(crate::http::config_api::get_system_context)
                .post(crate::http::config_api::set_system_context),
        )
        // Agents
        .route("/api/v1/operator", post(crate::http::agents::operator))
        .route("/api/v1/harness", post(crate::http::agents::harness))
        .route("/api/v1/ensemble", post(crate::http::agents::ensemble))
        .route("/api/v1/harness/runs", get(crate::http::agents::list_runs))
        .route("/api/v1/harness/runs/{id}", get(crate::http::agents::get_run))
        // Derivations
        .route("/api/v1/replay/{id}", get(crate::http::derived::replay))
        .route("/api/v1/semantic-map/{id}", get(crate::http::derived::semantic_map))
        .route("/api/v1/flights", get(crate::http::derived::list_flights))
        .route("/api/v1/flights/{id}", get(crate::http::derived::get_flight))
        .route("/api/v1/models/performance", get(crate::http::derived::model_performance))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
