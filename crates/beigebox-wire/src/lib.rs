//! Wire log — a structured record of everything on the line.
//!
//! One JSONL line per event: inbound messages, outbound responses, and
//! internal routing/tool/system events. Separate from the debug log; this
//! is the clean record replay correlates against.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Content longer than this is stored as prefix + elision marker + suffix.
const CONTENT_CAP: usize = 2000;
const CONTENT_KEEP: usize = 1000;
/// Conversation ids are stored as a short prefix, enough to correlate.
const CONV_PREFIX_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Direction of a wire event relative to the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
    Internal,
}

/// One event on the wire. Append-only; never mutated after writing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEvent {
    pub ts: String,
    pub dir: Direction,
    pub role: String,
    pub model: String,
    /// 16-char conversation id prefix ("" when not tied to a conversation).
    pub conv: String,
    pub len: usize,
    pub tokens: i64,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    /// Per-stage timing breakdown for request-summary events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timing: Option<BTreeMap<String, f64>>,
}

/// Builder-style parameters for one wire entry.
#[derive(Debug, Default)]
pub struct WireEntry<'a> {
    pub role: &'a str,
    pub content: &'a str,
    pub model: &'a str,
    pub conversation_id: &'a str,
    pub token_count: i64,
    pub tool: Option<&'a str>,
    pub latency_ms: Option<f64>,
    pub timing: Option<BTreeMap<String, f64>>,
}

/// Append-only JSONL writer, line-buffered behind a mutex.
pub struct WireLog {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl WireLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), file: Mutex::new(None) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one event. Failures are logged and swallowed — the wire log
    /// must never take a request down with it.
    pub fn log(&self, dir: Direction, entry: WireEntry<'_>) {
        let event = WireEvent {
            ts: chrono::Utc::now().to_rfc3339(),
            dir,
            role: entry.role.to_string(),
            model: entry.model.to_string(),
            conv: entry.conversation_id.chars().take(CONV_PREFIX_LEN).collect(),
            len: entry.content.len(),
            tokens: entry.token_count,
            content: truncate_content(entry.content),
            tool: entry.tool.map(str::to_string),
            latency_ms: entry.latency_ms,
            timing: entry.timing,
        };

        if let Err(e) = self.append(&event) {
            warn!(path = %self.path.display(), err = %e, "wire log write failed");
        }
    }

    fn append(&self, event: &WireEvent) -> Result<(), WireError> {
        let mut guard = self.file.lock().expect("wire log poisoned");
        if guard.is_none() {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            *guard = Some(OpenOptions::new().create(true).append(true).open(&self.path)?);
        }
        let file = guard.as_mut().expect("opened above");
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Read every event back, in append order. Malformed lines are skipped.
    pub fn read_events(&self) -> Vec<WireEvent> {
        read_events(&self.path)
    }
}

/// Read a wire log file, skipping malformed lines.
pub fn read_events(path: &Path) -> Vec<WireEvent> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(_) => return Vec::new(),
    };
    BufReader::new(file)
        .lines()
        .map_while(Result::ok)
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(&l).ok())
        .collect()
}

/// Cap stored content: keep full text up to the cap, otherwise keep a
/// prefix and suffix with an elision marker in the middle.
fn truncate_content(content: &str) -> String {
    if content.len() <= CONTENT_CAP {
        return content.to_string();
    }
    let head: String = take_bytes(content, CONTENT_KEEP);
    let tail: String = take_bytes_rev(content, CONTENT_KEEP);
    format!(
        "{head}\n\n[... {} chars truncated ...]\n\n{tail}",
        content.len() - CONTENT_CAP
    )
}

fn take_bytes(s: &str, n: usize) -> String {
    let mut end = n.min(s.len());
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

fn take_bytes_rev(s: &str, n: usize) -> String {
    let mut start = s.len().saturating_sub(n);
    while !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_content_stored_verbatim() {
        assert_eq!(truncate_content("hello"), "hello");
        let exactly = "x".repeat(CONTENT_CAP);
        assert_eq!(truncate_content(&exactly), exactly);
    }

    #[test]
    fn long_content_keeps_prefix_and_suffix() {
        let content = format!("{}{}{}", "a".repeat(1500), "b".repeat(1500), "c".repeat(1500));
        let stored = truncate_content(&content);
        assert!(stored.starts_with(&"a".repeat(1000)));
        assert!(stored.ends_with(&"c".repeat(1000)));
        assert!(stored.contains("[... 2500 chars truncated ...]"));
    }

    #[test]
    fn events_round_trip_through_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let log = WireLog::new(dir.path().join("wire.jsonl"));

        log.log(
            Direction::Inbound,
            WireEntry {
                role: "user",
                content: "hello there",
                model: "llama3.2:3b",
                conversation_id: "0123456789abcdef0123",
                token_count: 3,
                ..Default::default()
            },
        );
        log.log(
            Direction::Internal,
            WireEntry {
                role: "tool",
                content: "web_search injected (120 chars)",
                tool: Some("web_search"),
                ..Default::default()
            },
        );

        let events = log.read_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].conv, "0123456789abcdef");
        assert_eq!(events[0].dir, Direction::Inbound);
        assert_eq!(events[1].tool.as_deref(), Some("web_search"));
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wire.jsonl");
        std::fs::write(&path, "not json\n{\"broken\n").unwrap();
        assert!(read_events(&path).is_empty());
    }
}
