//! Read-only derivations over the message log, wire log, and vector
//! index: conversation replay with routing context, and the semantic
//! topic map.
//!
//! Both are value types carrying independent handles — no back-references
//! from stored messages to wire events.

pub mod replay;
pub mod semantic_map;

pub use replay::Replayer;
pub use semantic_map::SemanticMap;
