use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Metadata carried alongside each stored vector.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VectorMetadata {
    pub conversation_id: String,
    pub role: String,
    pub model: String,
    pub timestamp: String,
}

/// One nearest-neighbour hit.
#[derive(Debug, Clone, Serialize)]
pub struct QueryHit {
    pub id: String,
    pub document: String,
    pub metadata: VectorMetadata,
    /// Cosine distance (0 = identical, 2 = opposite) on normalized vectors.
    pub distance: f32,
}

/// Abstract vector storage backend.
///
/// Backends are intentionally dumb: upsert, query, count. Embedding logic
/// stays in the facade. Implementations must be thread-safe — callers may
/// invoke them from concurrent tasks.
pub trait VectorBackend: Send + Sync {
    /// Insert or update vectors with their documents and metadata.
    /// The four slices are parallel and must have equal lengths.
    fn upsert(
        &self,
        ids: &[String],
        vectors: &[Vec<f32>],
        documents: &[String],
        metadatas: &[VectorMetadata],
    ) -> Result<()>;

    /// Nearest-neighbour search, optionally filtered to one role.
    fn query(&self, vector: &[f32], k: usize, role_filter: Option<&str>) -> Result<Vec<QueryHit>>;

    /// Total stored vectors.
    fn count(&self) -> Result<u64>;
}
