//! Hook pipeline — ordered pre-request / post-response transform stages.
//!
//! A hook is anything implementing [`Hook`]; both methods default to a
//! pass-through, so a hook only overrides the side it cares about. Hooks
//! run serially in registered order, and a failing hook is logged and
//! skipped — the pipeline never aborts on hook error.

pub mod builtin;
pub mod engine;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use beigebox_core::config::BeigeBoxConfig;
use beigebox_vector::VectorIndex;

/// Body key a hook sets to short-circuit the pipeline with a refusal.
pub const BLOCK_KEY: &str = "_beigebox_block";
/// Body key a hook sets to mark a framework-internal request.
pub const SYNTHETIC_KEY: &str = "_beigebox_synthetic";

#[derive(Debug, Error)]
pub enum HookError {
    #[error("hook failed: {0}")]
    Failed(String),
}

/// Context passed to every hook invocation.
#[derive(Clone)]
pub struct HookContext {
    pub conversation_id: String,
    pub model: String,
    pub user_message: String,
    /// The current routing decision as untyped JSON, when one exists.
    /// Untyped so the hook crate stays decoupled from the router's structs.
    pub decision: Option<Value>,
    pub config: Arc<BeigeBoxConfig>,
    pub vector: Option<Arc<VectorIndex>>,
}

/// A single pipeline stage. Both methods default to "unchanged".
///
/// Returning `Ok(Some(body))` replaces the body; `Ok(None)` leaves it
/// alone; `Err` is caught by the engine, logged, and the hook skipped.
#[async_trait]
pub trait Hook: Send + Sync {
    fn name(&self) -> &str;

    async fn pre_request(&self, _body: &Value, _ctx: &HookContext) -> Result<Option<Value>, HookError> {
        Ok(None)
    }

    async fn post_response(
        &self,
        _body: &Value,
        _response: &Value,
        _ctx: &HookContext,
    ) -> Result<Option<Value>, HookError> {
        Ok(None)
    }
}

pub use engine::HookPipeline;
