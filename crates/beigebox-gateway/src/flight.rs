//! Flight recorder — per-request lifecycle timelines.
//!
//! Milestones for each request through the proxy: directive → hooks →
//! routing → backend → storage. In-memory only; this is for live
//! debugging, not historical analysis.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Instant;

use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct FlightEvent {
    pub timestamp: String,
    pub elapsed_ms: f64,
    pub stage: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, String>,
}

/// Timeline for a single request through the proxy.
#[derive(Debug)]
pub struct FlightRecord {
    pub id: String,
    pub conversation_id: String,
    pub model: String,
    started: Instant,
    events: Vec<FlightEvent>,
    closed: bool,
}

impl FlightRecord {
    pub fn new(conversation_id: &str, model: &str) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string()[..12].to_string(),
            conversation_id: conversation_id.to_string(),
            model: model.to_string(),
            started: Instant::now(),
            events: Vec::new(),
            closed: false,
        }
    }

    /// Record a milestone. No-op after close.
    pub fn log(&mut self, stage: &str) {
        self.log_with(stage, BTreeMap::new());
    }

    pub fn log_with(&mut self, stage: &str, details: BTreeMap<String, String>) {
        if self.closed {
            return;
        }
        self.events.push(FlightEvent {
            timestamp: chrono::Utc::now().to_rfc3339(),
            elapsed_ms: self.started.elapsed().as_secs_f64() * 1000.0,
            stage: stage.to_string(),
            details,
        });
    }

    pub fn close(&mut self) {
        if !self.closed {
            self.log("Complete");
            self.closed = true;
        }
    }

    pub fn total_ms(&self) -> f64 {
        self.events.last().map(|e| e.elapsed_ms).unwrap_or(0.0)
    }

    /// Per-stage breakdown: the delta each stage contributed.
    pub fn summary(&self) -> serde_json::Value {
        if self.events.len() < 2 {
            return serde_json::json!({"total_ms": self.total_ms()});
        }
        let mut stages: BTreeMap<String, f64> = BTreeMap::new();
        for pair in self.events.windows(2) {
            let delta = pair[1].elapsed_ms - pair[0].elapsed_ms;
            *stages.entry(pair[1].stage.clone()).or_default() += delta;
        }
        let total = if self.total_ms() > 0.0 { self.total_ms() } else { 1.0 };
        let breakdown: BTreeMap<String, serde_json::Value> = stages
            .into_iter()
            .map(|(stage, ms)| {
                (
                    stage,
                    serde_json::json!({
                        "ms": (ms * 100.0).round() / 100.0,
                        "pct": (ms / total * 1000.0).round() / 10.0,
                    }),
                )
            })
            .collect();
        serde_json::json!({
            "total_ms": (self.total_ms() * 100.0).round() / 100.0,
            "breakdown": breakdown,
        })
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "conversation_id": self.conversation_id,
            "model": self.model,
            "events": self.events,
            "summary": self.summary(),
        })
    }
}

/// Bounded in-memory store for completed flight records.
///
/// Insertion-ordered; oldest records are evicted at capacity and on a
/// retention sweep. Lookups hand out rendered JSON, never references.
pub struct FlightStore {
    max_records: usize,
    retention_secs: u64,
    records: Mutex<Vec<(String, Instant, serde_json::Value)>>,
}

impl FlightStore {
    pub fn new(max_records: usize, retention_hours: u64) -> Self {
        Self {
            max_records,
            retention_secs: retention_hours * 3600,
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn store(&self, record: &FlightRecord) {
        let mut records = self.records.lock().expect("flight store poisoned");
        while records.len() >= self.max_records {
            records.remove(0);
        }
        records.push((record.id.clone(), record.started, record.to_json()));
    }

    pub fn get(&self, record_id: &str) -> Option<serde_json::Value> {
        let records = self.records.lock().expect("flight store poisoned");
        records.iter().find(|(id, _, _)| id == record_id).map(|(_, _, json)| json.clone())
    }

    pub fn recent(&self, n: usize) -> Vec<serde_json::Value> {
        let records = self.records.lock().expect("flight store poisoned");
        records.iter().rev().take(n).map(|(_, _, json)| json.clone()).collect()
    }

    pub fn evict_stale(&self) {
        let mut records = self.records.lock().expect("flight store poisoned");
        let retention = self.retention_secs;
        let before = records.len();
        records.retain(|(_, started, _)| started.elapsed().as_secs() < retention);
        let evicted = before - records.len();
        if evicted > 0 {
            debug!(evicted, "flight store evicted stale records");
        }
    }

    pub fn count(&self) -> usize {
        self.records.lock().expect("flight store poisoned").len()
    }
}
