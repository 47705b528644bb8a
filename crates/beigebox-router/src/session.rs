//! Session stickiness cache — holds every turn of a conversation to the
//! first-chosen model for a bounded window.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

/// Sweep stale entries every N writes.
const SWEEP_INTERVAL: u64 = 100;
/// Hard cap; exceeded caches trim oldest-first down to the low mark.
const HARD_CAP: usize = 1000;
const TRIM_TO: usize = 800;

struct CacheState {
    entries: HashMap<String, (String, Instant)>,
    writes: u64,
}

/// Bounded conversation→model map with TTL eviction.
///
/// Lookups and writes hand out owned values only — no references into
/// the map escape the lock.
pub struct SessionCache {
    ttl: Duration,
    state: Mutex<CacheState>,
}

impl SessionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: Mutex::new(CacheState { entries: HashMap::new(), writes: 0 }),
        }
    }

    /// Cached model for this conversation if the entry is still fresh.
    /// Stale entries are removed on lookup.
    pub fn get(&self, conversation_id: &str) -> Option<String> {
        if conversation_id.is_empty() {
            return None;
        }
        let mut state = self.state.lock().expect("session cache poisoned");
        match state.entries.get(conversation_id) {
            Some((model, at)) if at.elapsed() < self.ttl => Some(model.clone()),
            Some(_) => {
                state.entries.remove(conversation_id);
                None
            }
            None => None,
        }
    }

    /// Cache the routing decision for this conversation.
    pub fn set(&self, conversation_id: &str, model: &str) {
        if conversation_id.is_empty() || model.is_empty() {
            return;
        }
        let mut state = self.state.lock().expect("session cache poisoned");
        state.entries.insert(conversation_id.to_string(), (model.to_string(), Instant::now()));
        state.writes += 1;

        // Proactive eviction: sweep stale entries every ~N writes
        if state.writes % SWEEP_INTERVAL == 0 {
            let ttl = self.ttl;
            let before = state.entries.len();
            state.entries.retain(|_, (_, at)| at.elapsed() < ttl);
            let evicted = before - state.entries.len();
            if evicted > 0 {
                debug!(evicted, "session cache swept stale entries");
            }
        }

        // Hard cap: drop oldest-by-timestamp entries down to the low mark
        if state.entries.len() > HARD_CAP {
            let mut by_age: Vec<(String, Instant)> =
                state.entries.iter().map(|(k, (_, at))| (k.clone(), *at)).collect();
            by_age.sort_by_key(|(_, at)| *at);
            let excess = state.entries.len() - TRIM_TO;
            for (key, _) in by_age.into_iter().take(excess) {
                state.entries.remove(&key);
            }
            debug!(len = state.entries.len(), "session cache hard-capped");
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("session cache poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_entries_are_returned() {
        let cache = SessionCache::new(Duration::from_secs(1800));
        cache.set("conv-1", "llama3.2:3b");
        assert_eq!(cache.get("conv-1").as_deref(), Some("llama3.2:3b"));
        assert_eq!(cache.get("conv-2"), None);
    }

    #[test]
    fn expired_entries_are_absent() {
        let cache = SessionCache::new(Duration::ZERO);
        cache.set("conv-1", "llama3.2:3b");
        assert_eq!(cache.get("conv-1"), None);
        // Removed on lookup, not just hidden
        assert!(cache.is_empty());
    }

    #[test]
    fn empty_keys_and_models_are_ignored() {
        let cache = SessionCache::new(Duration::from_secs(1800));
        cache.set("", "model");
        cache.set("conv", "");
        assert!(cache.is_empty());
        assert_eq!(cache.get(""), None);
    }

    #[test]
    fn hard_cap_trims_to_low_mark() {
        let cache = SessionCache::new(Duration::from_secs(1800));
        for i in 0..(HARD_CAP + 1) {
            cache.set(&format!("conv-{i}"), "m");
        }
        assert_eq!(cache.len(), TRIM_TO);
    }
}
