use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info};

use crate::backend::{VectorBackend, VectorMetadata};
use crate::embedder::Embedder;
use crate::error::Result;

/// One flat semantic-search result.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub content: String,
    pub metadata: VectorMetadata,
    pub distance: f32,
}

/// One conversation-grouped search result: the best hit per conversation.
#[derive(Debug, Clone, Serialize)]
pub struct GroupedHit {
    pub conversation_id: String,
    pub score: f32,
    pub excerpt: String,
    pub role: String,
    pub model: String,
    pub timestamp: String,
    pub match_count: usize,
}

const EXCERPT_LEN: usize = 300;

/// Embedding + semantic-search facade over a pluggable [`VectorBackend`].
///
/// Indexing is best-effort: failures are logged, never propagated to the
/// request pipeline. A message is *indexed* once its upsert completes;
/// until then semantic search cannot find it.
pub struct VectorIndex {
    embedder: Arc<dyn Embedder>,
    backend: Arc<dyn VectorBackend>,
}

impl VectorIndex {
    pub fn new(embedder: Arc<dyn Embedder>, backend: Arc<dyn VectorBackend>) -> Self {
        info!("vector index initialised");
        Self { embedder, backend }
    }

    /// Shared embedder handle (the centroid classifier reuses it).
    pub fn embedder(&self) -> Arc<dyn Embedder> {
        Arc::clone(&self.embedder)
    }

    /// Embed and store one message. Blank content is skipped; errors are
    /// swallowed after logging so callers can fire-and-forget.
    pub async fn store_message(
        &self,
        message_id: &str,
        conversation_id: &str,
        role: &str,
        content: &str,
        model: &str,
        timestamp: &str,
    ) {
        if content.trim().is_empty() {
            return;
        }
        let vector = match self.embedder.embed(content).await {
            Ok(v) => v,
            Err(e) => {
                error!(id = %message_id, err = %e, "failed to embed message");
                return;
            }
        };
        let result = self.backend.upsert(
            &[message_id.to_string()],
            &[vector],
            &[content.to_string()],
            &[VectorMetadata {
                conversation_id: conversation_id.to_string(),
                role: role.to_string(),
                model: model.to_string(),
                timestamp: timestamp.to_string(),
            }],
        );
        match result {
            Ok(()) => debug!(id = %message_id, "message indexed"),
            Err(e) => error!(id = %message_id, err = %e, "failed to index message"),
        }
    }

    /// Flat semantic search. Embedding failures return an empty result.
    pub async fn search(
        &self,
        query: &str,
        n_results: usize,
        role_filter: Option<&str>,
    ) -> Vec<SearchHit> {
        let vector = match self.embedder.embed(query).await {
            Ok(v) => v,
            Err(e) => {
                error!(err = %e, "search: failed to embed query");
                return Vec::new();
            }
        };
        match self.backend.query(&vector, n_results, role_filter) {
            Ok(hits) => hits
                .into_iter()
                .map(|h| SearchHit {
                    id: h.id,
                    content: h.document,
                    metadata: h.metadata,
                    distance: h.distance,
                })
                .collect(),
            Err(e) => {
                error!(err = %e, "search: backend query failed");
                Vec::new()
            }
        }
    }

    /// Semantic search grouped by conversation.
    ///
    /// Two-pass: retrieve `candidates` message-level hits, then keep the
    /// best (lowest-distance) hit per conversation, ranked by score.
    pub async fn search_grouped(
        &self,
        query: &str,
        n_conversations: usize,
        candidates: usize,
        role_filter: Option<&str>,
    ) -> Vec<GroupedHit> {
        let fetch_n = candidates.max(n_conversations * 8).min(200);
        let hits = self.search(query, fetch_n, role_filter).await;

        let mut groups: std::collections::HashMap<String, GroupedHit> = std::collections::HashMap::new();
        for hit in hits {
            let conv_id = hit.metadata.conversation_id.clone();
            if conv_id.is_empty() {
                continue;
            }
            let score = score_from_distance(hit.distance);
            match groups.get_mut(&conv_id) {
                Some(group) => {
                    group.match_count += 1;
                    if score > group.score {
                        group.score = score;
                        group.excerpt = excerpt(&hit.content);
                        group.role = hit.metadata.role;
                        group.model = hit.metadata.model;
                        group.timestamp = hit.metadata.timestamp;
                    }
                }
                None => {
                    groups.insert(
                        conv_id.clone(),
                        GroupedHit {
                            conversation_id: conv_id,
                            score,
                            excerpt: excerpt(&hit.content),
                            role: hit.metadata.role,
                            model: hit.metadata.model,
                            timestamp: hit.metadata.timestamp,
                            match_count: 1,
                        },
                    );
                }
            }
        }

        let mut ranked: Vec<GroupedHit> = groups.into_values().collect();
        ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(n_conversations);
        ranked
    }

    /// Total indexed vectors.
    pub fn stats(&self) -> u64 {
        self.backend.count().unwrap_or(0)
    }

    /// Retrieve stored embeddings for a set of message ids by querying the
    /// backend around each document. Used by the semantic map, which needs
    /// raw similarity rather than ranked search.
    pub async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        self.embedder.embed(text).await
    }
}

fn score_from_distance(distance: f32) -> f32 {
    let score = 1.0 - distance;
    let clamped = score.max(0.0);
    (clamped * 10_000.0).round() / 10_000.0
}

fn excerpt(content: &str) -> String {
    let mut end = EXCERPT_LEN.min(content.len());
    while !content.is_char_boundary(end) {
        end -= 1;
    }
    content[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::QueryHit;
    use crate::embedder::l2_normalize;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Deterministic 3-dim embedder: axis by first byte.
    struct StubEmbedder;

    #[async_trait]
    impl Embedder for StubEmbedder {
        async fn embed(&self, text: &str) -> crate::error::Result<Vec<f32>> {
            let axis = (text.bytes().next().unwrap_or(0) % 3) as usize;
            let mut v = vec![0.01f32; 3];
            v[axis] = 1.0;
            Ok(l2_normalize(v))
        }

        async fn embed_batch(&self, texts: &[String]) -> crate::error::Result<Vec<Vec<f32>>> {
            let mut out = Vec::new();
            for t in texts {
                out.push(self.embed(t).await?);
            }
            Ok(out)
        }

        fn dimension(&self) -> usize {
            3
        }
    }

    /// In-memory backend for facade tests.
    #[derive(Default)]
    struct StubBackend {
        rows: Mutex<Vec<(String, Vec<f32>, String, VectorMetadata)>>,
    }

    impl VectorBackend for StubBackend {
        fn upsert(
            &self,
            ids: &[String],
            vectors: &[Vec<f32>],
            documents: &[String],
            metadatas: &[VectorMetadata],
        ) -> crate::error::Result<()> {
            let mut rows = self.rows.lock().unwrap();
            for (((id, v), d), m) in ids.iter().zip(vectors).zip(documents).zip(metadatas) {
                rows.retain(|(rid, ..)| rid != id);
                rows.push((id.clone(), v.clone(), d.clone(), m.clone()));
            }
            Ok(())
        }

        fn query(
            &self,
            vector: &[f32],
            k: usize,
            role_filter: Option<&str>,
        ) -> crate::error::Result<Vec<QueryHit>> {
            let rows = self.rows.lock().unwrap();
            let mut hits: Vec<QueryHit> = rows
                .iter()
                .filter(|(_, _, _, m)| role_filter.map_or(true, |r| m.role == r))
                .map(|(id, v, d, m)| {
                    let dot: f32 = v.iter().zip(vector).map(|(a, b)| a * b).sum();
                    QueryHit {
                        id: id.clone(),
                        document: d.clone(),
                        metadata: m.clone(),
                        distance: 1.0 - dot,
                    }
                })
                .collect();
            hits.sort_by(|a, b| a.distance.partial_cmp(&b.distance).unwrap());
            hits.truncate(k);
            Ok(hits)
        }

        fn count(&self) -> crate::error::Result<u64> {
            Ok(self.rows.lock().unwrap().len() as u64)
        }
    }

    fn index() -> VectorIndex {
        VectorIndex::new(Arc::new(StubEmbedder), Arc::new(StubBackend::default()))
    }

    #[tokio::test]
    async fn store_then_search_finds_the_message() {
        let idx = index();
        idx.store_message("m1", "c1", "user", "alpha question", "", "t1").await;
        idx.store_message("m2", "c2", "user", "beta question", "", "t2").await;

        let hits = idx.search("alpha query", 1, None).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "m1");
        assert_eq!(idx.stats(), 2);
    }

    #[tokio::test]
    async fn blank_content_is_not_indexed() {
        let idx = index();
        idx.store_message("m1", "c1", "user", "   ", "", "t1").await;
        assert_eq!(idx.stats(), 0);
    }

    #[tokio::test]
    async fn grouped_search_keeps_best_hit_per_conversation() {
        let idx = index();
        // Two hits in c1 (one close, one far), one in c2
        idx.store_message("m1", "c1", "user", "alpha one", "", "t1").await;
        idx.store_message("m2", "c1", "assistant", "beta far", "", "t2").await;
        idx.store_message("m3", "c2", "user", "alpha two", "", "t3").await;

        let groups = idx.search_grouped("alpha query", 5, 40, None).await;
        assert_eq!(groups.len(), 2);
        let c1 = groups.iter().find(|g| g.conversation_id == "c1").unwrap();
        assert_eq!(c1.match_count, 2);
        assert!(c1.excerpt.starts_with("alpha one"));
    }
}
