//! Session → worker stickiness.
//!
//! Keys are stable per conversation: an explicit session id when the
//! client sends one, otherwise the source plus a 32-bit fingerprint of the
//! system-prompt prefix, otherwise the source alone. Entries expire after
//! an idle TTL; health is the router's concern, not ours.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Length of the system-prompt prefix that participates in the fingerprint.
const PROMPT_PREFIX: usize = 256;

/// Derive the session key for a request.
pub fn derive_key(source: &str, explicit: Option<&str>, system_prompt: Option<&str>) -> String {
    if let Some(id) = explicit {
        return id.to_string();
    }
    if let Some(prompt) = system_prompt.filter(|p| !p.is_empty()) {
        let prefix: String = prompt.chars().take(PROMPT_PREFIX).collect();
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        prefix.hash(&mut hasher);
        let fingerprint = hasher.finish() as u32;
        return format!("{source}:{fingerprint:08x}");
    }
    source.to_string()
}

struct AffinityEntry {
    worker: String,
    last_used: Instant,
    requests: u64,
}

pub struct SessionAffinity {
    ttl: Duration,
    entries: Mutex<HashMap<String, AffinityEntry>>,
}

impl SessionAffinity {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// The worker this session last used, if the binding is still fresh.
    pub fn lookup(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock().unwrap();
        entries
            .get(key)
            .filter(|e| e.last_used.elapsed() < self.ttl)
            .map(|e| e.worker.clone())
    }

    /// (Re-)bind the session to `worker` and refresh its TTL.
    pub fn assign(&self, key: &str, worker: &str) {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(key.to_string()).or_insert(AffinityEntry {
            worker: worker.to_string(),
            last_used: Instant::now(),
            requests: 0,
        });
        entry.worker = worker.to_string();
        entry.last_used = Instant::now();
        entry.requests += 1;
    }

    /// Drop bindings idle past the TTL.
    pub fn sweep(&self) {
        let ttl = self.ttl;
        self.entries
            .lock()
            .unwrap()
            .retain(|_, e| e.last_used.elapsed() < ttl);
    }

    pub fn stats(&self) -> AffinityStats {
        let entries = self.entries.lock().unwrap();
        AffinityStats {
            sessions: entries.len(),
            requests: entries.values().map(|e| e.requests).sum(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct AffinityStats {
    pub sessions: usize,
    pub requests: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_id_wins() {
        assert_eq!(derive_key("src", Some("sess-1"), Some("system")), "sess-1");
    }

    #[test]
    fn prompt_fingerprint_is_stable_and_prefix_bound() {
        let a = derive_key("src", None, Some("You are a helpful assistant."));
        let b = derive_key("src", None, Some("You are a helpful assistant."));
        assert_eq!(a, b);
        assert!(a.starts_with("src:"));

        // Divergence beyond the prefix does not change the key.
        let long_a = format!("{}{}", "x".repeat(PROMPT_PREFIX), "tail one");
        let long_b = format!("{}{}", "x".repeat(PROMPT_PREFIX), "other tail");
        assert_eq!(
            derive_key("src", None, Some(&long_a)),
            derive_key("src", None, Some(&long_b))
        );
    }

    #[test]
    fn bare_source_fallback() {
        assert_eq!(derive_key("src", None, None), "src");
        assert_eq!(derive_key("src", None, Some("")), "src");
    }

    #[test]
    fn assign_and_lookup() {
        let affinity = SessionAffinity::new(Duration::from_secs(300));
        assert!(affinity.lookup("k").is_none());
        affinity.assign("k", "w1");
        assert_eq!(affinity.lookup("k").as_deref(), Some("w1"));
        affinity.assign("k", "w2");
        assert_eq!(affinity.lookup("k").as_deref(), Some("w2"));
        assert_eq!(affinity.stats().requests, 2);
    }

    #[test]
    fn expired_entries_are_invisible_and_swept() {
        let affinity = SessionAffinity::new(Duration::ZERO);
        affinity.assign("k", "w1");
        assert!(affinity.lookup("k").is_none());
        affinity.sweep();
        assert_eq!(affinity.stats().sessions, 0);
    }
}
