//! Tool system — a flat namespace of named tools behind one contract.
//!
//! A tool is anything implementing [`Tool`]: take a string, return a
//! string. Failures come back as strings beginning `Error: …` so the
//! model sees them and can decide how to proceed. Built-ins and
//! auto-discovered script plugins share the same registry.

pub mod calculator;
pub mod datetime;
pub mod memory;
pub mod notifier;
pub mod registry;
pub mod script;
pub mod web_search;

use async_trait::async_trait;

/// Uniform tool contract: `run(input) → string`.
///
/// Invocation is awaited by the caller (synchronous from its point of
/// view). Implementations must never panic; they return `Error: …`
/// strings instead.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Registry key (e.g. "web_search").
    fn name(&self) -> &str;
    /// Shown to the arbitrator and the operator's system prompt.
    fn description(&self) -> &str;
    async fn run(&self, input: &str) -> String;
}

pub use registry::ToolRegistry;
