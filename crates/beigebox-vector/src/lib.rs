//! Vector index — embedding facade over a pluggable nearest-neighbour
//! backend.
//!
//! The facade owns all embedding logic (an HTTP call to the local
//! embedding model, L2-normalized). Backends only move vectors around.
//! All callers go through [`index::VectorIndex`]; the backend handle is
//! never passed around outside it.

pub mod backend;
pub mod embedder;
pub mod error;
pub mod index;
pub mod sqlite_vec;

pub use backend::{QueryHit, VectorBackend, VectorMetadata};
pub use embedder::{Embedder, HttpEmbedder};
pub use error::VectorError;
pub use index::{GroupedHit, SearchHit, VectorIndex};
pub use sqlite_vec::SqliteVecBackend;
