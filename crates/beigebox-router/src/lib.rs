//! Routing core — the five-stage hybrid classifier.
//!
//! Stages, cheapest first: session stickiness cache, user directive,
//! keyword agentic pre-filter (annotate-only), centroid classifier,
//! arbitrator LLM. The proxy evaluates them in order; the first terminal
//! stage wins.

pub mod centroid;
pub mod decision;
pub mod directive;
pub mod prefilter;
pub mod session;
pub mod types;

pub use centroid::{CentroidClassifier, CentroidDecision};
pub use decision::DecisionAgent;
pub use directive::{parse_directive, ZCommand, HELP_TEXT};
pub use prefilter::{score_agentic_intent, AgenticScore};
pub use session::SessionCache;
pub use types::{Decision, RouteTable};
