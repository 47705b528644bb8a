use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::{Hook, HookContext};

/// Ordered hook pipeline. Hooks run serially in registered order; a hook
/// error is logged and that hook skipped, never aborting the pipeline.
pub struct HookPipeline {
    hooks: Vec<Arc<dyn Hook>>,
}

impl HookPipeline {
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    /// Build a pipeline from the configured list of built-in hook names.
    /// Unknown names are skipped with a warning — the load-time type check.
    pub fn from_names(names: &[String]) -> Self {
        let mut pipeline = Self::new();
        for name in names {
            match crate::builtin::by_name(name) {
                Some(hook) => pipeline.register(hook),
                None => warn!(name, "unknown hook name in config, skipped"),
            }
        }
        pipeline
    }

    pub fn register(&mut self, hook: Arc<dyn Hook>) {
        info!(name = hook.name(), "hook registered");
        self.hooks.push(hook);
    }

    pub fn names(&self) -> Vec<String> {
        self.hooks.iter().map(|h| h.name().to_string()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Run all pre-request hooks in order; each receives the body produced
    /// by the previous hook.
    pub async fn run_pre_request(&self, mut body: Value, ctx: &HookContext) -> Value {
        for hook in &self.hooks {
            match hook.pre_request(&body, ctx).await {
                Ok(Some(updated)) if updated.is_object() => {
                    debug!(name = hook.name(), "pre_request applied");
                    body = updated;
                }
                // Non-object result is ignored, body unchanged
                Ok(_) => {}
                Err(e) => error!(name = hook.name(), err = %e, "pre_request hook failed"),
            }
        }
        body
    }

    /// Run all post-response hooks in order over the response.
    pub async fn run_post_response(&self, body: &Value, mut response: Value, ctx: &HookContext) -> Value {
        for hook in &self.hooks {
            match hook.post_response(body, &response, ctx).await {
                Ok(Some(updated)) if updated.is_object() => {
                    debug!(name = hook.name(), "post_response applied");
                    response = updated;
                }
                Ok(_) => {}
                Err(e) => error!(name = hook.name(), err = %e, "post_response hook failed"),
            }
        }
        response
    }
}

impl Default for HookPipeline {
    fn default() -> Self {
        Self::new()
    }
}
