//! Durable message log — the source of truth.
//!
//! Every message, every timestamp, every model, in one portable SQLite
//! file. Query with SQL, export to portable shapes, fork conversations.

pub mod db;
pub mod error;
pub mod store;
pub mod types;

pub use error::StoreError;
pub use store::MessageStore;
pub use types::{HarnessRun, Message, ModelPerformance, StoreStats};
