//! Conversation replay — reconstruct a conversation with full routing
//! context by correlating stored messages with wire log entries.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use beigebox_core::types::Role;
use beigebox_store::{Message, MessageStore};
use beigebox_wire::{read_events, WireEvent};
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, Serialize)]
pub struct TimelineEntry {
    pub role: String,
    pub content: String,
    pub content_length: usize,
    pub model: String,
    pub token_count: i64,
    pub cost_usd: Option<f64>,
    pub timestamp: String,
    pub routing: Option<RoutingContext>,
    pub tools: Vec<String>,
    pub backend: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoutingContext {
    /// Which stage routed the message: session_cache, z_command,
    /// embedding_classifier, decision_llm, agentic_scorer.
    pub method: String,
    pub confidence: Option<f64>,
    pub raw: String,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct ReplayStats {
    pub message_count: usize,
    pub total_tokens: i64,
    pub total_cost_usd: Option<f64>,
    pub duration: String,
    pub models: BTreeMap<String, usize>,
    pub routing_methods: BTreeMap<String, usize>,
    pub tools_used: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Replay {
    pub conversation_id: String,
    pub timeline: Vec<TimelineEntry>,
    pub stats: ReplayStats,
    pub text: String,
}

/// Joins the message log and the wire log read-only.
pub struct Replayer {
    store: Arc<MessageStore>,
    wire_path: PathBuf,
}

const CONTENT_PREVIEW: usize = 500;

impl Replayer {
    pub fn new(store: Arc<MessageStore>, wire_path: impl Into<PathBuf>) -> Self {
        Self { store, wire_path: wire_path.into() }
    }

    /// Reconstruct a conversation with routing decisions and tool usage.
    pub fn replay(&self, conversation_id: &str) -> Option<Replay> {
        let messages = match self.store.get_conversation(conversation_id) {
            Ok(m) => m,
            Err(e) => {
                warn!(err = %e, "replay: store read failed");
                return None;
            }
        };
        if messages.is_empty() {
            return None;
        }

        let wire_events = self.load_wire_events(conversation_id);

        let timeline: Vec<TimelineEntry> = messages
            .iter()
            .map(|msg| TimelineEntry {
                role: msg.role.as_str().to_string(),
                content: preview(&msg.content),
                content_length: msg.content.len(),
                model: msg.model.clone(),
                token_count: msg.token_count,
                cost_usd: msg.cost_usd,
                timestamp: msg.timestamp.clone(),
                routing: find_routing(msg, &wire_events),
                tools: find_tools(msg, &wire_events),
                backend: find_backend(msg, &wire_events),
            })
            .collect();

        let stats = compute_stats(&timeline);
        let text = render_text(conversation_id, &timeline, &stats);
        Some(Replay { conversation_id: conversation_id.to_string(), timeline, stats, text })
    }

    /// Wire events for this conversation, plus internal routing/tool
    /// entries (best-effort — they carry no conversation id).
    fn load_wire_events(&self, conversation_id: &str) -> Vec<WireEvent> {
        let conv_prefix: String = conversation_id.chars().take(16).collect();
        read_events(&self.wire_path)
            .into_iter()
            .filter(|e| {
                e.conv == conv_prefix
                    || (e.dir == beigebox_wire::Direction::Internal
                        && matches!(e.role.as_str(), "decision" | "tool" | "system"))
            })
            .collect()
    }
}

fn find_routing(msg: &Message, wire_events: &[WireEvent]) -> Option<RoutingContext> {
    if msg.role != Role::Assistant {
        return None;
    }
    // The most recent decision event at or before the message timestamp
    let best = wire_events
        .iter()
        .filter(|e| e.role == "decision" && e.ts.as_str() <= msg.timestamp.as_str())
        .next_back()?;

    let content = &best.content;
    let mut confidence = None;
    let method = if content.contains("session cache hit") {
        confidence = Some(1.0);
        "session_cache"
    } else if content.contains("z-command") {
        confidence = Some(1.0);
        "z_command"
    } else if content.contains("embedding:") {
        confidence = content
            .split_whitespace()
            .find_map(|p| p.strip_prefix("confidence="))
            .and_then(|v| v.parse::<f64>().ok());
        "embedding_classifier"
    } else if content.contains("route=") {
        "decision_llm"
    } else if content.contains("agentic_scorer") {
        "agentic_scorer"
    } else {
        "unknown"
    };

    Some(RoutingContext {
        method: method.to_string(),
        confidence,
        raw: content.chars().take(200).collect(),
    })
}

fn find_tools(msg: &Message, wire_events: &[WireEvent]) -> Vec<String> {
    let mut tools: Vec<String> = wire_events
        .iter()
        .filter(|e| e.role == "tool" && e.ts.as_str() <= msg.timestamp.as_str())
        .filter_map(|e| {
            e.tool.clone().or_else(|| {
                if e.content.contains("web_search") {
                    Some("web_search".to_string())
                } else if e.content.contains("memory") || e.content.contains("RAG") {
                    Some("memory".to_string())
                } else {
                    None
                }
            })
        })
        .collect();
    tools.sort();
    tools.dedup();
    tools
}

fn find_backend(msg: &Message, wire_events: &[WireEvent]) -> Option<String> {
    if msg.role != Role::Assistant {
        return None;
    }
    wire_events
        .iter()
        .rev()
        .filter(|e| e.role == "system" && e.ts.as_str() <= msg.timestamp.as_str())
        .find_map(|e| {
            let content = &e.content;
            let marker = content.find("via '")?;
            let rest = &content[marker + 5..];
            let end = rest.find('\'')?;
            Some(rest[..end].to_string())
        })
}

fn compute_stats(timeline: &[TimelineEntry]) -> ReplayStats {
    let mut stats = ReplayStats { message_count: timeline.len(), ..Default::default() };
    let mut total_cost = 0.0;
    let mut any_cost = false;

    for entry in timeline {
        if !entry.model.is_empty() {
            *stats.models.entry(entry.model.clone()).or_default() += 1;
        }
        stats.total_tokens += entry.token_count;
        if let Some(cost) = entry.cost_usd {
            total_cost += cost;
            any_cost = true;
        }
        if let Some(routing) = &entry.routing {
            *stats.routing_methods.entry(routing.method.clone()).or_default() += 1;
        }
        for tool in &entry.tools {
            *stats.tools_used.entry(tool.clone()).or_default() += 1;
        }
    }
    if any_cost {
        stats.total_cost_usd = Some((total_cost * 1e6).round() / 1e6);
    }

    // Duration from first to last timestamp
    let timestamps: Vec<&str> = timeline.iter().map(|e| e.timestamp.as_str()).collect();
    if timestamps.len() >= 2 {
        if let (Ok(first), Ok(last)) = (
            chrono::DateTime::parse_from_rfc3339(timestamps[0]),
            chrono::DateTime::parse_from_rfc3339(timestamps[timestamps.len() - 1]),
        ) {
            let minutes = (last - first).num_seconds() as f64 / 60.0;
            stats.duration = format!("{minutes:.1} minutes");
        }
    }
    stats
}

fn render_text(conversation_id: &str, timeline: &[TimelineEntry], stats: &ReplayStats) -> String {
    let conv_short: String = conversation_id.chars().take(16).collect();
    let mut lines = vec![
        format!("CONVERSATION REPLAY: {conv_short}"),
        format!(
            "Messages: {} | Tokens: {} | Duration: {}",
            stats.message_count,
            stats.total_tokens,
            if stats.duration.is_empty() { "N/A" } else { &stats.duration },
        ),
    ];
    if let Some(cost) = stats.total_cost_usd {
        lines.push(format!("Total Cost: ${cost:.6}"));
    }
    lines.push("─".repeat(60));
    lines.push(String::new());

    for (i, entry) in timeline.iter().enumerate() {
        let content_line: String =
            entry.content.chars().take(80).map(|c| if c == '\n' { ' ' } else { c }).collect();
        lines.push(format!("  [{}] {}: \"{}\"", i + 1, entry.role.to_uppercase(), content_line));
        if !entry.model.is_empty() {
            lines.push(format!("       Model: {}", entry.model));
        }
        if let Some(routing) = &entry.routing {
            let conf = routing.confidence.map(|c| format!(" ({c:.2})")).unwrap_or_default();
            lines.push(format!("       Routing: {}{conf}", routing.method));
        }
        if let Some(backend) = &entry.backend {
            lines.push(format!("       Backend: {backend}"));
        }
        if !entry.tools.is_empty() {
            lines.push(format!("       Tools: {}", entry.tools.join(", ")));
        }
        if let Some(cost) = entry.cost_usd {
            lines.push(format!("       Cost: ${cost:.6}"));
        }
        lines.push(String::new());
    }

    lines.push("─".repeat(60));
    lines.push("STATS:".to_string());
    lines.push(format!("  Models: {:?}", stats.models));
    lines.push(format!("  Routing: {:?}", stats.routing_methods));
    if !stats.tools_used.is_empty() {
        lines.push(format!("  Tools: {:?}", stats.tools_used));
    }
    lines.join("\n")
}

fn preview(content: &str) -> String {
    content.chars().take(CONTENT_PREVIEW).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use beigebox_wire::{Direction, WireEntry, WireLog};

    fn store_with_conversation() -> Arc<MessageStore> {
        // Timestamps default to "now" — later than any wire event the
        // tests wrote beforehand, so routing correlation finds them.
        let store = MessageStore::open_in_memory().unwrap();
        let user = Message::new("conv-replay", Role::User, "what's new?", "");
        let mut asst = Message::new("conv-replay", Role::Assistant, "not much", "llama3.2:3b");
        asst.cost_usd = Some(0.0001);
        store.store_message(&user).unwrap();
        store.store_message(&asst).unwrap();
        Arc::new(store)
    }

    #[test]
    fn replay_joins_messages_with_wire_context() {
        let dir = tempfile::tempdir().unwrap();
        let wire_path = dir.path().join("wire.jsonl");
        let wire = WireLog::new(&wire_path);
        wire.log(
            Direction::Internal,
            WireEntry {
                role: "decision",
                content: "embedding: tier=simple confidence=0.2100 borderline=false (48ms)",
                model: "embedding-classifier",
                ..Default::default()
            },
        );
        wire.log(
            Direction::Internal,
            WireEntry {
                role: "system",
                content: "completed via 'local' · 850ms total",
                conversation_id: "conv-replay",
                ..Default::default()
            },
        );

        // Messages stored after the wire events, so their timestamps sort later
        let replayer = Replayer::new(store_with_conversation(), &wire_path);
        let replay = replayer.replay("conv-replay").unwrap();

        assert_eq!(replay.timeline.len(), 2);
        let assistant = &replay.timeline[1];
        let routing = assistant.routing.as_ref().unwrap();
        assert_eq!(routing.method, "embedding_classifier");
        assert_eq!(routing.confidence, Some(0.21));
        assert_eq!(assistant.backend.as_deref(), Some("local"));
        assert_eq!(replay.stats.total_cost_usd, Some(0.0001));
        assert!(replay.text.contains("CONVERSATION REPLAY"));
    }

    #[test]
    fn unknown_conversation_replays_to_none() {
        let dir = tempfile::tempdir().unwrap();
        let replayer = Replayer::new(store_with_conversation(), dir.path().join("wire.jsonl"));
        assert!(replayer.replay("missing").is_none());
    }
}
