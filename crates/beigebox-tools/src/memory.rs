use std::sync::Arc;

use async_trait::async_trait;
use beigebox_vector::VectorIndex;

use crate::Tool;

/// Conversation recall — semantic search over the message log's vector
/// index, grouped by conversation.
pub struct MemoryTool {
    vector: Arc<VectorIndex>,
    max_results: usize,
    min_score: f32,
}

impl MemoryTool {
    pub fn new(vector: Arc<VectorIndex>, max_results: usize, min_score: f32) -> Self {
        Self { vector, max_results, min_score }
    }
}

#[async_trait]
impl Tool for MemoryTool {
    fn name(&self) -> &str {
        "memory"
    }

    fn description(&self) -> &str {
        "Search past conversations for relevant context"
    }

    async fn run(&self, input: &str) -> String {
        if input.trim().is_empty() {
            return "Error: empty memory query".to_string();
        }
        let hits = self.vector.search_grouped(input, self.max_results, 40, None).await;
        let relevant: Vec<String> = hits
            .into_iter()
            .filter(|h| h.score >= self.min_score)
            .map(|h| format!("({:.2}) [{}] {}", h.score, h.role, h.excerpt))
            .collect();
        if relevant.is_empty() {
            return "No relevant past conversations found.".to_string();
        }
        relevant.join("\n")
    }
}
