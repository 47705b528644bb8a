use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use beigebox_core::types::Role;
use rusqlite::Connection;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::init_db;
use crate::error::{Result, StoreError};
use crate::types::*;

/// Thread-safe conversation store over a single SQLite connection.
///
/// All writes serialize through the connection mutex; no lock is held
/// across an await point (every method here is synchronous).
pub struct MessageStore {
    db: Mutex<Connection>,
}

impl MessageStore {
    /// Open (or create) the store at `path` and run schema init/migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        init_db(&conn)?;
        info!(path = %path.display(), "message store initialised");
        Ok(Self { db: Mutex::new(conn) })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_db(&conn)?;
        Ok(Self { db: Mutex::new(conn) })
    }

    /// Create the conversation row if it doesn't exist yet.
    pub fn ensure_conversation(&self, conversation_id: &str, created_at: &str) -> Result<()> {
        let db = self.db.lock().expect("store poisoned");
        db.execute(
            "INSERT OR IGNORE INTO conversations (id, created_at) VALUES (?1, ?2)",
            rusqlite::params![conversation_id, created_at],
        )?;
        Ok(())
    }

    /// Store a single message, creating its conversation if needed.
    ///
    /// Cost is only meaningful on assistant messages; a cost supplied on any
    /// other role is dropped with a warning so the stored invariant holds.
    pub fn store_message(&self, msg: &Message) -> Result<()> {
        let cost = match (msg.cost_usd, msg.role) {
            (Some(c), Role::Assistant) => Some(c),
            (Some(_), role) => {
                warn!(%role, id = %msg.id, "dropping cost on non-assistant message");
                None
            }
            (None, _) => None,
        };

        self.ensure_conversation(&msg.conversation_id, &msg.timestamp)?;
        let db = self.db.lock().expect("store poisoned");
        db.execute(
            "INSERT OR REPLACE INTO messages
             (id, conversation_id, role, content, model, timestamp, token_count, cost_usd, latency_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                msg.id,
                msg.conversation_id,
                msg.role.as_str(),
                msg.content,
                msg.model,
                msg.timestamp,
                msg.token_count,
                cost,
                msg.latency_ms,
            ],
        )?;
        debug!(id = %msg.id, role = %msg.role, conv = %msg.conversation_id, "message stored");
        Ok(())
    }

    /// All messages of a conversation, timestamp ascending; ties break on
    /// insertion order (rowid).
    pub fn get_conversation(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let db = self.db.lock().expect("store poisoned");
        let mut stmt = db.prepare(
            "SELECT id, conversation_id, role, content, model, timestamp,
                    token_count, cost_usd, latency_ms
             FROM messages
             WHERE conversation_id = ?1
             ORDER BY timestamp, rowid",
        )?;
        let rows = stmt.query_map(rusqlite::params![conversation_id], row_to_message)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Most recent conversations with their last message and counts.
    pub fn recent_conversations(&self, limit: usize) -> Result<Vec<ConversationSummary>> {
        let db = self.db.lock().expect("store poisoned");
        let mut stmt = db.prepare(
            "SELECT c.id, c.created_at,
                    (SELECT content FROM messages m
                     WHERE m.conversation_id = c.id
                     ORDER BY m.timestamp DESC, m.rowid DESC LIMIT 1) AS last_message,
                    (SELECT COUNT(*) FROM messages m
                     WHERE m.conversation_id = c.id) AS message_count
             FROM conversations c
             ORDER BY c.created_at DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(rusqlite::params![limit as i64], |row| {
            Ok(ConversationSummary {
                id: row.get(0)?,
                created_at: row.get(1)?,
                last_message: row.get(2)?,
                message_count: row.get(3)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Fork a conversation: copy a prefix of the source into a new
    /// conversation with fresh message ids. The source is untouched;
    /// cost and latency are preserved on the copies.
    ///
    /// `branch_at = Some(k)` copies messages `0..=k`; `None` copies all.
    /// Returns the number of messages copied.
    pub fn fork(
        &self,
        source_conv_id: &str,
        new_conv_id: &str,
        branch_at: Option<usize>,
    ) -> Result<usize> {
        let mut messages = self.get_conversation(source_conv_id)?;
        if let Some(k) = branch_at {
            messages.truncate(k + 1);
        }
        if messages.is_empty() {
            return Ok(0);
        }

        let now = beigebox_core::types::now_rfc3339();
        self.ensure_conversation(new_conv_id, &now)?;

        let db = self.db.lock().expect("store poisoned");
        for msg in &messages {
            db.execute(
                "INSERT INTO messages
                 (id, conversation_id, role, content, model, timestamp, token_count, cost_usd, latency_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    Uuid::new_v4().simple().to_string(),
                    new_conv_id,
                    msg.role.as_str(),
                    msg.content,
                    msg.model,
                    msg.timestamp,
                    msg.token_count,
                    msg.cost_usd,
                    msg.latency_ms,
                ],
            )?;
        }
        info!(
            copied = messages.len(),
            source = %source_conv_id,
            new = %new_conv_id,
            "conversation forked"
        );
        Ok(messages.len())
    }

    /// Per-model latency and throughput over the last `days` days.
    /// Only assistant messages with a recorded latency count as requests.
    pub fn model_performance(&self, days: u32) -> Result<Vec<ModelPerformance>> {
        let cutoff = format!("-{days} days");
        let db = self.db.lock().expect("store poisoned");

        let mut stmt = db.prepare(
            "SELECT model,
                    COUNT(*) AS requests,
                    AVG(latency_ms) AS avg_lat,
                    AVG(token_count) AS avg_tok,
                    COALESCE(SUM(cost_usd), 0) AS total_cost
             FROM messages
             WHERE role = 'assistant'
               AND latency_ms IS NOT NULL
               AND timestamp > datetime('now', ?1)
             GROUP BY model
             ORDER BY requests DESC",
        )?;
        let summary: Vec<(String, i64, f64, f64, f64)> = stmt
            .query_map(rusqlite::params![cutoff], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get::<_, Option<f64>>(2)?.unwrap_or(0.0),
                    row.get::<_, Option<f64>>(3)?.unwrap_or(0.0),
                    row.get(4)?,
                ))
            })?
            .filter_map(|r| r.ok())
            .collect();

        let mut lat_stmt = db.prepare(
            "SELECT latency_ms FROM messages
             WHERE role = 'assistant'
               AND model = ?1
               AND latency_ms IS NOT NULL
               AND timestamp > datetime('now', ?2)
             ORDER BY latency_ms",
        )?;

        let mut out = Vec::with_capacity(summary.len());
        for (model, requests, avg_lat, avg_tok, total_cost) in summary {
            let latencies: Vec<f64> = lat_stmt
                .query_map(rusqlite::params![model, cutoff], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            out.push(ModelPerformance {
                model,
                requests,
                avg_latency_ms: round1(avg_lat),
                p50_latency_ms: percentile(&latencies, 50.0),
                p95_latency_ms: percentile(&latencies, 95.0),
                avg_tokens: round1(avg_tok),
                total_cost_usd: round6(total_cost),
            });
        }
        Ok(out)
    }

    /// Aggregate counters for the stats surface.
    pub fn stats(&self) -> Result<StoreStats> {
        let db = self.db.lock().expect("store poisoned");
        let one = |sql: &str| -> Result<i64> {
            Ok(db.query_row(sql, [], |row| row.get(0))?)
        };

        let mut stats = StoreStats {
            conversations: one("SELECT COUNT(*) FROM conversations")?,
            messages: one("SELECT COUNT(*) FROM messages")?,
            user_messages: one("SELECT COUNT(*) FROM messages WHERE role='user'")?,
            assistant_messages: one("SELECT COUNT(*) FROM messages WHERE role='assistant'")?,
            total_tokens: one("SELECT COALESCE(SUM(token_count), 0) FROM messages")?,
            user_tokens: one("SELECT COALESCE(SUM(token_count), 0) FROM messages WHERE role='user'")?,
            assistant_tokens: one(
                "SELECT COALESCE(SUM(token_count), 0) FROM messages WHERE role='assistant'",
            )?,
            cost_usd: db.query_row("SELECT COALESCE(SUM(cost_usd), 0) FROM messages", [], |r| {
                r.get(0)
            })?,
            models: BTreeMap::new(),
        };

        let mut stmt = db.prepare(
            "SELECT model,
                    COUNT(*) AS messages,
                    COALESCE(SUM(token_count), 0) AS tokens,
                    COALESCE(SUM(cost_usd), 0) AS cost
             FROM messages
             WHERE model != ''
             GROUP BY model
             ORDER BY messages DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                ModelUsage {
                    messages: row.get(1)?,
                    tokens: row.get(2)?,
                    cost_usd: row.get(3)?,
                },
            ))
        })?;
        for row in rows.filter_map(|r| r.ok()) {
            stats.models.insert(row.0, row.1);
        }
        Ok(stats)
    }

    // ── Exports ─────────────────────────────────────────────────────────

    /// Every conversation in OpenAI conversation-list shape.
    pub fn export_openai(&self) -> Result<Vec<ConversationExport>> {
        let conv_ids: Vec<String> = {
            let db = self.db.lock().expect("store poisoned");
            let mut stmt = db.prepare("SELECT id FROM conversations ORDER BY created_at, rowid")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.filter_map(|r| r.ok()).collect()
        };

        let mut out = Vec::with_capacity(conv_ids.len());
        for id in conv_ids {
            let messages = self.get_conversation(&id)?;
            out.push(ConversationExport {
                conversation_id: id,
                messages: messages
                    .into_iter()
                    .map(|m| ExportMessage {
                        role: m.role.as_str().to_string(),
                        content: m.content,
                        model: m.model,
                        timestamp: m.timestamp,
                    })
                    .collect(),
            });
        }
        Ok(out)
    }

    /// Line-delimited training pairs: user/assistant turns per conversation,
    /// kept only when both roles are present.
    pub fn export_training_pairs(&self, model_filter: Option<&str>) -> Result<Vec<TrainingPair>> {
        let mut out = Vec::new();
        for conv in self.export_openai()? {
            let msgs: Vec<RoleContent> = conv
                .messages
                .iter()
                .filter(|m| m.role == "user" || m.role == "assistant")
                .filter(|m| model_filter.map_or(true, |f| m.model == f))
                .map(|m| RoleContent { role: m.role.clone(), content: m.content.clone() })
                .collect();
            let has_user = msgs.iter().any(|m| m.role == "user");
            let has_assistant = msgs.iter().any(|m| m.role == "assistant");
            if has_user && has_assistant {
                out.push(TrainingPair { messages: msgs });
            }
        }
        Ok(out)
    }

    /// Instruction triples: each user message followed by an assistant
    /// message becomes one `{instruction, input, output}` record.
    pub fn export_instruction(&self, model_filter: Option<&str>) -> Result<Vec<InstructionRecord>> {
        let mut out = Vec::new();
        for conv in self.export_openai()? {
            let msgs: Vec<&ExportMessage> = conv
                .messages
                .iter()
                .filter(|m| m.role == "user" || m.role == "assistant")
                .filter(|m| model_filter.map_or(true, |f| m.model == f))
                .collect();
            let mut i = 0;
            while i + 1 < msgs.len() {
                if msgs[i].role == "user" && msgs[i + 1].role == "assistant" {
                    out.push(InstructionRecord {
                        instruction: msgs[i].content.clone(),
                        input: String::new(),
                        output: msgs[i + 1].content.clone(),
                    });
                    i += 2;
                } else {
                    i += 1;
                }
            }
        }
        Ok(out)
    }

    /// Human/assistant dialogue records, one per conversation with at least
    /// one human and one assistant turn.
    pub fn export_dialogue(&self, model_filter: Option<&str>) -> Result<Vec<DialogueRecord>> {
        let mut out = Vec::new();
        for conv in self.export_openai()? {
            let turns: Vec<DialogueTurn> = conv
                .messages
                .iter()
                .filter(|m| matches!(m.role.as_str(), "user" | "assistant" | "system"))
                .filter(|m| model_filter.map_or(true, |f| m.model == f))
                .map(|m| DialogueTurn {
                    from: match m.role.as_str() {
                        "user" => "human".to_string(),
                        "assistant" => "gpt".to_string(),
                        other => other.to_string(),
                    },
                    value: m.content.clone(),
                })
                .collect();
            let has_human = turns.iter().any(|t| t.from == "human");
            let has_gpt = turns.iter().any(|t| t.from == "gpt");
            if has_human && has_gpt {
                out.push(DialogueRecord { id: conv.conversation_id, conversations: turns });
            }
        }
        Ok(out)
    }

    // ── Harness runs ────────────────────────────────────────────────────

    pub fn store_harness_run(&self, run: &HarnessRun) -> Result<()> {
        let targets = serde_json::to_string(&run.targets)?;
        let db = self.db.lock().expect("store poisoned");
        db.execute(
            "INSERT OR REPLACE INTO harness_runs
             (id, created_at, goal, targets, model, max_rounds, final_answer,
              total_rounds, was_capped, total_latency_ms, error_count, events_jsonl)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            rusqlite::params![
                run.id,
                run.created_at,
                run.goal,
                targets,
                run.model,
                run.max_rounds,
                run.final_answer,
                run.total_rounds,
                run.was_capped,
                run.total_latency_ms,
                run.error_count,
                run.events_jsonl,
            ],
        )?;
        debug!(id = %run.id, "harness run stored");
        Ok(())
    }

    pub fn get_harness_run(&self, run_id: &str) -> Result<HarnessRun> {
        let db = self.db.lock().expect("store poisoned");
        db.query_row(
            "SELECT id, created_at, goal, targets, model, max_rounds, final_answer,
                    total_rounds, was_capped, total_latency_ms, error_count, events_jsonl
             FROM harness_runs WHERE id = ?1",
            rusqlite::params![run_id],
            row_to_harness_run,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                StoreError::RunNotFound { id: run_id.to_string() }
            }
            other => StoreError::Database(other),
        })
    }

    pub fn list_harness_runs(&self, limit: usize) -> Result<Vec<HarnessRunSummary>> {
        let db = self.db.lock().expect("store poisoned");
        let mut stmt = db.prepare(
            "SELECT id, created_at, goal, total_rounds, total_latency_ms, error_count, was_capped
             FROM harness_runs
             ORDER BY created_at DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(rusqlite::params![limit as i64], |row| {
            Ok(HarnessRunSummary {
                id: row.get(0)?,
                created_at: row.get(1)?,
                goal: row.get(2)?,
                total_rounds: row.get(3)?,
                total_latency_ms: row.get(4)?,
                error_count: row.get(5)?,
                was_capped: row.get(6)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let role_str: String = row.get(2)?;
    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        role: Role::parse(&role_str).unwrap_or(Role::User),
        content: row.get(3)?,
        model: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
        timestamp: row.get(5)?,
        token_count: row.get::<_, Option<i64>>(6)?.unwrap_or(0),
        cost_usd: row.get(7)?,
        latency_ms: row.get(8)?,
    })
}

fn row_to_harness_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<HarnessRun> {
    let targets_json: String = row.get(3)?;
    Ok(HarnessRun {
        id: row.get(0)?,
        created_at: row.get(1)?,
        goal: row.get(2)?,
        targets: serde_json::from_str(&targets_json).unwrap_or_default(),
        model: row.get(4)?,
        max_rounds: row.get(5)?,
        final_answer: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
        total_rounds: row.get(7)?,
        was_capped: row.get(8)?,
        total_latency_ms: row.get(9)?,
        error_count: row.get(10)?,
        events_jsonl: row.get::<_, Option<String>>(11)?.unwrap_or_default(),
    })
}

/// Nearest-rank percentile over a pre-sorted slice.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64 * p / 100.0) as usize).min(sorted.len() - 1);
    round1(sorted[idx])
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

fn round6(v: f64) -> f64 {
    (v * 1_000_000.0).round() / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MessageStore {
        MessageStore::open_in_memory().unwrap()
    }

    fn msg(conv: &str, role: Role, content: &str, model: &str) -> Message {
        Message::new(conv, role, content, model)
    }

    #[test]
    fn store_then_get_preserves_fields() {
        let s = store();
        let m = msg("conv-1", Role::User, "hello world", "llama3.2:3b");
        s.store_message(&m).unwrap();

        let got = s.get_conversation("conv-1").unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].content, "hello world");
        assert_eq!(got[0].role, Role::User);
        assert_eq!(got[0].model, "llama3.2:3b");
        assert_eq!(got[0].token_count, m.token_count);
    }

    #[test]
    fn conversation_ordering_is_timestamp_then_insertion() {
        let s = store();
        let mut a = msg("conv-1", Role::User, "first", "");
        let mut b = msg("conv-1", Role::Assistant, "second", "m");
        // Force equal timestamps — insertion order must break the tie
        a.timestamp = "2026-01-01T00:00:00+00:00".to_string();
        b.timestamp = "2026-01-01T00:00:00+00:00".to_string();
        s.store_message(&a).unwrap();
        s.store_message(&b).unwrap();

        let got = s.get_conversation("conv-1").unwrap();
        assert_eq!(got[0].content, "first");
        assert_eq!(got[1].content, "second");
    }

    #[test]
    fn cost_on_non_assistant_is_dropped() {
        let s = store();
        let mut m = msg("conv-1", Role::User, "hi", "");
        m.cost_usd = Some(0.5);
        s.store_message(&m).unwrap();

        let got = s.get_conversation("conv-1").unwrap();
        assert_eq!(got[0].cost_usd, None);
    }

    #[test]
    fn fork_copies_prefix_with_fresh_ids() {
        let s = store();
        for i in 0..4 {
            let mut m = msg("src", Role::User, &format!("msg {i}"), "m");
            m.cost_usd = None;
            m.latency_ms = Some(10.0 + i as f64);
            // strictly increasing timestamps
            m.timestamp = format!("2026-01-01T00:00:0{i}+00:00");
            s.store_message(&m).unwrap();
        }

        let before = s.get_conversation("src").unwrap();
        let copied = s.fork("src", "dst", Some(1)).unwrap();
        assert_eq!(copied, 2);

        // Source untouched
        let after = s.get_conversation("src").unwrap();
        assert_eq!(before.len(), after.len());
        for (b, a) in before.iter().zip(&after) {
            assert_eq!(b.id, a.id);
            assert_eq!(b.content, a.content);
        }

        // Fork: equal-length prefix, fresh disjoint ids, latency preserved
        let forked = s.get_conversation("dst").unwrap();
        assert_eq!(forked.len(), 2);
        let src_ids: std::collections::HashSet<_> = before.iter().map(|m| m.id.clone()).collect();
        for (i, f) in forked.iter().enumerate() {
            assert!(!src_ids.contains(&f.id));
            assert_eq!(f.content, before[i].content);
            assert_eq!(f.latency_ms, before[i].latency_ms);
        }
    }

    #[test]
    fn fork_branch_at_zero_yields_one_message() {
        let s = store();
        for i in 0..3 {
            let mut m = msg("src", Role::User, &format!("msg {i}"), "");
            m.timestamp = format!("2026-01-01T00:00:0{i}+00:00");
            s.store_message(&m).unwrap();
        }
        assert_eq!(s.fork("src", "dst", Some(0)).unwrap(), 1);
        assert_eq!(s.get_conversation("dst").unwrap().len(), 1);
    }

    #[test]
    fn fork_branch_beyond_length_copies_all() {
        let s = store();
        for i in 0..3 {
            let mut m = msg("src", Role::User, &format!("msg {i}"), "");
            m.timestamp = format!("2026-01-01T00:00:0{i}+00:00");
            s.store_message(&m).unwrap();
        }
        assert_eq!(s.fork("src", "dst", Some(10)).unwrap(), 3);
    }

    #[test]
    fn cost_increments_model_stats_exactly() {
        let s = store();
        let mut m = msg("conv-1", Role::Assistant, "answer", "gpt-4o");
        m.cost_usd = Some(0.000123);
        m.latency_ms = Some(250.0);
        s.store_message(&m).unwrap();

        let stats = s.stats().unwrap();
        assert!((stats.cost_usd - 0.000123).abs() < 1e-9);
        assert!((stats.models["gpt-4o"].cost_usd - 0.000123).abs() < 1e-9);

        let perf = s.model_performance(1).unwrap();
        let row = perf.iter().find(|p| p.model == "gpt-4o").unwrap();
        assert_eq!(row.requests, 1);
        assert!((row.total_cost_usd - 0.000123).abs() < 1e-9);
        assert!((row.p50_latency_ms - 250.0).abs() < 1e-9);
    }

    #[test]
    fn exports_preserve_role_content_pairs() {
        let s = store();
        let mut u = msg("conv-1", Role::User, "question", "");
        u.timestamp = "2026-01-01T00:00:00+00:00".to_string();
        let mut a = msg("conv-1", Role::Assistant, "answer", "m1");
        a.timestamp = "2026-01-01T00:00:01+00:00".to_string();
        s.store_message(&u).unwrap();
        s.store_message(&a).unwrap();

        let openai = s.export_openai().unwrap();
        assert_eq!(openai.len(), 1);
        let pairs: Vec<(String, String)> = openai[0]
            .messages
            .iter()
            .map(|m| (m.role.clone(), m.content.clone()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("user".to_string(), "question".to_string()),
                ("assistant".to_string(), "answer".to_string()),
            ]
        );

        let training = s.export_training_pairs(None).unwrap();
        assert_eq!(training.len(), 1);
        assert_eq!(training[0].messages.len(), 2);

        let triples = s.export_instruction(None).unwrap();
        assert_eq!(triples.len(), 1);
        assert_eq!(triples[0].instruction, "question");
        assert_eq!(triples[0].output, "answer");

        let dialogue = s.export_dialogue(None).unwrap();
        assert_eq!(dialogue.len(), 1);
        assert_eq!(dialogue[0].conversations[0].from, "human");
        assert_eq!(dialogue[0].conversations[1].from, "gpt");
    }

    #[test]
    fn training_export_drops_one_sided_conversations() {
        let s = store();
        s.store_message(&msg("only-user", Role::User, "hello?", "")).unwrap();
        assert!(s.export_training_pairs(None).unwrap().is_empty());
        assert!(s.export_dialogue(None).unwrap().is_empty());
    }

    #[test]
    fn harness_run_round_trips() {
        let s = store();
        let run = HarnessRun {
            id: "run-1".to_string(),
            created_at: beigebox_core::types::now_rfc3339(),
            goal: "test goal".to_string(),
            targets: vec!["operator".to_string(), "model:llama3.2:3b".to_string()],
            model: "llama3.2:3b".to_string(),
            max_rounds: 8,
            final_answer: "done".to_string(),
            total_rounds: 2,
            was_capped: false,
            total_latency_ms: 1234,
            error_count: 0,
            events_jsonl: "{\"type\":\"start\"}\n{\"type\":\"finish\"}\n".to_string(),
        };
        s.store_harness_run(&run).unwrap();

        let got = s.get_harness_run("run-1").unwrap();
        assert_eq!(got.goal, "test goal");
        assert_eq!(got.targets.len(), 2);
        assert_eq!(got.events().len(), 2);

        let listed = s.list_harness_runs(10).unwrap();
        assert_eq!(listed.len(), 1);
        assert!(!listed[0].was_capped);

        assert!(matches!(
            s.get_harness_run("missing"),
            Err(StoreError::RunNotFound { .. })
        ));
    }
}
