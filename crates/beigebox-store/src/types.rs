use beigebox_core::types::{estimate_tokens, now_rfc3339, Role};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One stored message. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub model: String,
    pub timestamp: String,
    pub token_count: i64,
    pub cost_usd: Option<f64>,
    pub latency_ms: Option<f64>,
}

impl Message {
    /// Build a message with a fresh id, the current UTC timestamp, and an
    /// estimated token count.
    pub fn new(conversation_id: &str, role: Role, content: &str, model: &str) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            conversation_id: conversation_id.to_string(),
            role,
            content: content.to_string(),
            model: model.to_string(),
            timestamp: now_rfc3339(),
            token_count: estimate_tokens(content),
            cost_usd: None,
            latency_ms: None,
        }
    }
}

/// Summary row for the recent-conversations listing.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    pub id: String,
    pub created_at: String,
    pub last_message: Option<String>,
    pub message_count: i64,
}

/// Per-model latency / throughput / cost over a day window.
#[derive(Debug, Clone, Serialize)]
pub struct ModelPerformance {
    pub model: String,
    pub requests: i64,
    pub avg_latency_ms: f64,
    pub p50_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub avg_tokens: f64,
    pub total_cost_usd: f64,
}

/// Aggregate counters for the stats endpoint.
#[derive(Debug, Clone, Serialize, Default)]
pub struct StoreStats {
    pub conversations: i64,
    pub messages: i64,
    pub user_messages: i64,
    pub assistant_messages: i64,
    pub total_tokens: i64,
    pub user_tokens: i64,
    pub assistant_tokens: i64,
    pub cost_usd: f64,
    pub models: std::collections::BTreeMap<String, ModelUsage>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct ModelUsage {
    pub messages: i64,
    pub tokens: i64,
    pub cost_usd: f64,
}

/// A persisted harness orchestration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessRun {
    pub id: String,
    pub created_at: String,
    pub goal: String,
    pub targets: Vec<String>,
    pub model: String,
    pub max_rounds: i64,
    pub final_answer: String,
    pub total_rounds: i64,
    pub was_capped: bool,
    pub total_latency_ms: i64,
    pub error_count: i64,
    /// Full event stream, one JSON object per line.
    pub events_jsonl: String,
}

impl HarnessRun {
    /// Parse the event stream back into JSON values, skipping blank lines.
    pub fn events(&self) -> Vec<serde_json::Value> {
        self.events_jsonl
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect()
    }
}

/// Summary row for the harness-run listing.
#[derive(Debug, Clone, Serialize)]
pub struct HarnessRunSummary {
    pub id: String,
    pub created_at: String,
    pub goal: String,
    pub total_rounds: i64,
    pub total_latency_ms: i64,
    pub error_count: i64,
    pub was_capped: bool,
}

// ── Export record shapes ────────────────────────────────────────────────

/// OpenAI conversation-list export: one record per conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationExport {
    pub conversation_id: String,
    pub messages: Vec<ExportMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportMessage {
    pub role: String,
    pub content: String,
    pub model: String,
    pub timestamp: String,
}

/// Line-delimited training-pair export: `{"messages": [{role, content}]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingPair {
    pub messages: Vec<RoleContent>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoleContent {
    pub role: String,
    pub content: String,
}

/// Instruction-triple export (one user→assistant pair per record).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstructionRecord {
    pub instruction: String,
    pub input: String,
    pub output: String,
}

/// Human/assistant dialogue export: one record per conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogueRecord {
    pub id: String,
    pub conversations: Vec<DialogueTurn>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogueTurn {
    pub from: String,
    pub value: String,
}
