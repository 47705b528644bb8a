use rusqlite::Connection;
use tracing::warn;

use crate::error::Result;

const CREATE_TABLES: &str = "
CREATE TABLE IF NOT EXISTS conversations (
    id          TEXT PRIMARY KEY,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    id              TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    role            TEXT NOT NULL,
    content         TEXT NOT NULL,
    model           TEXT DEFAULT '',
    timestamp       TEXT NOT NULL,
    token_count     INTEGER DEFAULT 0,
    cost_usd        REAL DEFAULT NULL,
    latency_ms      REAL DEFAULT NULL,
    FOREIGN KEY (conversation_id) REFERENCES conversations(id)
);

CREATE TABLE IF NOT EXISTS harness_runs (
    id               TEXT PRIMARY KEY,
    created_at       TEXT NOT NULL,
    goal             TEXT NOT NULL,
    targets          TEXT NOT NULL,
    model            TEXT NOT NULL,
    max_rounds       INTEGER DEFAULT 8,
    final_answer     TEXT,
    total_rounds     INTEGER DEFAULT 0,
    was_capped       INTEGER DEFAULT 0,
    total_latency_ms INTEGER DEFAULT 0,
    error_count      INTEGER DEFAULT 0,
    events_jsonl     TEXT
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation
    ON messages(conversation_id);
CREATE INDEX IF NOT EXISTS idx_messages_timestamp
    ON messages(timestamp);
CREATE INDEX IF NOT EXISTS idx_messages_role
    ON messages(role);
CREATE INDEX IF NOT EXISTS idx_harness_runs_created
    ON harness_runs(created_at);
";

/// Additive migrations for databases created by earlier versions.
/// Safe to re-run: "duplicate column" failures are expected and ignored.
const MIGRATIONS: &[&str] = &[
    "ALTER TABLE messages ADD COLUMN cost_usd REAL DEFAULT NULL",
    "ALTER TABLE messages ADD COLUMN latency_ms REAL DEFAULT NULL",
];

/// Initialise the message log schema. Idempotent — called on every startup.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(CREATE_TABLES)?;
    for migration in MIGRATIONS {
        if let Err(e) = conn.execute(migration, []) {
            let msg = e.to_string().to_lowercase();
            if !msg.contains("duplicate column") {
                warn!(migration, err = %e, "migration skipped");
            }
        }
    }
    Ok(())
}
