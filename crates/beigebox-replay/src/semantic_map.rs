//! Semantic conversation map — topic clustering over user messages.
//!
//! Embeds the user turns of a conversation, computes pairwise cosine
//! similarity, keeps edges above a threshold, and reports connected
//! components as topic clusters with a small ASCII rendering.

use std::sync::Arc;

use beigebox_core::types::Role;
use beigebox_store::MessageStore;
use beigebox_vector::VectorIndex;
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, Serialize)]
pub struct Topic {
    pub index: usize,
    pub label: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopicEdge {
    pub a: usize,
    pub b: usize,
    pub similarity: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopicCluster {
    pub id: usize,
    pub topics: Vec<usize>,
    pub size: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopicMap {
    pub conversation_id: String,
    pub topics: Vec<Topic>,
    pub edges: Vec<TopicEdge>,
    pub clusters: Vec<TopicCluster>,
    pub visualization: String,
}

/// Joins the message log and the vector index read-only.
pub struct SemanticMap {
    store: Arc<MessageStore>,
    vector: Arc<VectorIndex>,
    similarity_threshold: f32,
    max_topics: usize,
}

const LABEL_LEN: usize = 60;

impl SemanticMap {
    pub fn new(store: Arc<MessageStore>, vector: Arc<VectorIndex>) -> Self {
        Self { store, vector, similarity_threshold: 0.5, max_topics: 50 }
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.similarity_threshold = threshold;
        self
    }

    /// Build the topic map for one conversation. `None` when the
    /// conversation doesn't exist.
    pub async fn build(&self, conversation_id: &str) -> Option<TopicMap> {
        let messages = match self.store.get_conversation(conversation_id) {
            Ok(m) => m,
            Err(e) => {
                warn!(err = %e, "semantic map: store read failed");
                return None;
            }
        };
        if messages.is_empty() {
            return None;
        }

        // Topics are driven by user queries
        let user_msgs: Vec<_> = messages
            .into_iter()
            .filter(|m| m.role == Role::User && !m.content.trim().is_empty())
            .take(self.max_topics)
            .collect();

        let topics: Vec<Topic> = user_msgs
            .iter()
            .enumerate()
            .map(|(i, m)| Topic {
                index: i,
                label: label(&m.content),
                timestamp: m.timestamp.clone(),
            })
            .collect();

        if topics.len() < 2 {
            let clusters = if topics.is_empty() {
                Vec::new()
            } else {
                vec![TopicCluster { id: 0, topics: vec![0], size: 1 }]
            };
            let visualization = render(&topics, &clusters);
            return Some(TopicMap {
                conversation_id: conversation_id.to_string(),
                topics,
                edges: Vec::new(),
                clusters,
                visualization,
            });
        }

        // Embed each topic; failures drop the topic's edges, not the map
        let mut embeddings: Vec<Option<Vec<f32>>> = Vec::with_capacity(user_msgs.len());
        for msg in &user_msgs {
            embeddings.push(self.vector.embed_text(&msg.content).await.ok());
        }

        let edges = compute_edges(&embeddings, self.similarity_threshold);
        let clusters = connected_components(topics.len(), &edges);
        let visualization = render(&topics, &clusters);

        Some(TopicMap {
            conversation_id: conversation_id.to_string(),
            topics,
            edges,
            clusters,
            visualization,
        })
    }
}

/// Pairwise cosine similarity on pre-normalized embeddings; keep edges
/// at or above the threshold.
fn compute_edges(embeddings: &[Option<Vec<f32>>], threshold: f32) -> Vec<TopicEdge> {
    let mut edges = Vec::new();
    for i in 0..embeddings.len() {
        for j in (i + 1)..embeddings.len() {
            let (Some(a), Some(b)) = (&embeddings[i], &embeddings[j]) else {
                continue;
            };
            let similarity: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
            if similarity >= threshold {
                edges.push(TopicEdge { a: i, b: j, similarity });
            }
        }
    }
    edges
}

/// Union-find over topic indices; each component becomes a cluster.
fn connected_components(n: usize, edges: &[TopicEdge]) -> Vec<TopicCluster> {
    let mut parent: Vec<usize> = (0..n).collect();

    fn find(parent: &mut Vec<usize>, x: usize) -> usize {
        if parent[x] != x {
            let root = find(parent, parent[x]);
            parent[x] = root;
        }
        parent[x]
    }

    for edge in edges {
        let ra = find(&mut parent, edge.a);
        let rb = find(&mut parent, edge.b);
        if ra != rb {
            parent[rb] = ra;
        }
    }

    let mut groups: std::collections::BTreeMap<usize, Vec<usize>> = Default::default();
    for i in 0..n {
        let root = find(&mut parent, i);
        groups.entry(root).or_default().push(i);
    }

    groups
        .into_values()
        .enumerate()
        .map(|(id, topics)| TopicCluster { id, size: topics.len(), topics })
        .collect()
}

fn render(topics: &[Topic], clusters: &[TopicCluster]) -> String {
    if topics.is_empty() {
        return "(no user messages)".to_string();
    }
    let mut lines = vec![format!("SEMANTIC MAP — {} topics, {} clusters", topics.len(), clusters.len())];
    for cluster in clusters {
        lines.push(format!("  cluster {} ({} topics)", cluster.id, cluster.size));
        for &idx in &cluster.topics {
            lines.push(format!("    [{}] {}", idx, topics[idx].label));
        }
    }
    lines.join("\n")
}

fn label(content: &str) -> String {
    let flat: String = content.chars().map(|c| if c == '\n' { ' ' } else { c }).collect();
    flat.chars().take(LABEL_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edges_respect_the_threshold() {
        let embeddings = vec![
            Some(vec![1.0, 0.0]),
            Some(vec![1.0, 0.0]),
            Some(vec![0.0, 1.0]),
            None,
        ];
        let edges = compute_edges(&embeddings, 0.5);
        assert_eq!(edges.len(), 1);
        assert_eq!((edges[0].a, edges[0].b), (0, 1));
    }

    #[test]
    fn components_group_linked_topics() {
        let edges = vec![
            TopicEdge { a: 0, b: 1, similarity: 0.9 },
            TopicEdge { a: 1, b: 2, similarity: 0.8 },
        ];
        let clusters = connected_components(4, &edges);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].topics, vec![0, 1, 2]);
        assert_eq!(clusters[1].topics, vec![3]);
    }

    #[test]
    fn labels_are_flattened_and_capped() {
        let l = label("line one\nline two that is quite long and will be truncated at sixty chars");
        assert!(!l.contains('\n'));
        assert!(l.chars().count() <= 60);
    }
}
