//! Durable store interface.
//!
//! The engine persists counters and observability data through this trait.
//! All writes are fire-and-forget from the hot path (`tokio::spawn`); the
//! in-memory state of each component stays authoritative and nothing may
//! order itself against a store write. A Redis-backed implementation lives
//! with the deployment, not here; [`MemoryStore`] backs tests and
//! single-process runs.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

/// HASH / LIST / ZSET subset the engine relies on.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn hash_set(&self, key: &str, field: &str, value: String);
    async fn hash_del(&self, key: &str, field: &str);
    async fn hash_incr(&self, key: &str, field: &str, by: i64);
    async fn hash_get_all(&self, key: &str) -> HashMap<String, String>;

    /// Push to the head of a list and trim it to `cap` entries.
    async fn list_push(&self, key: &str, value: String, cap: usize);
    async fn list_range(&self, key: &str, limit: usize) -> Vec<String>;

    async fn zset_add(&self, key: &str, score: f64, member: String);
    async fn zset_remove_below(&self, key: &str, min_score: f64);

    async fn counter_incr(&self, key: &str) -> u64;
}

/// In-process implementation with the same semantics.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    hashes: HashMap<String, HashMap<String, String>>,
    lists: HashMap<String, Vec<String>>,
    zsets: HashMap<String, Vec<(f64, String)>>,
    counters: HashMap<String, u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn hash_set(&self, key: &str, field: &str, value: String) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value);
    }

    async fn hash_del(&self, key: &str, field: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(hash) = inner.hashes.get_mut(key) {
            hash.remove(field);
        }
    }

    async fn hash_incr(&self, key: &str, field: &str, by: i64) {
        let mut inner = self.inner.lock().unwrap();
        let hash = inner.hashes.entry(key.to_string()).or_default();
        let current: i64 = hash.get(field).and_then(|v| v.parse().ok()).unwrap_or(0);
        hash.insert(field.to_string(), (current + by).to_string());
    }

    async fn hash_get_all(&self, key: &str) -> HashMap<String, String> {
        let inner = self.inner.lock().unwrap();
        inner.hashes.get(key).cloned().unwrap_or_default()
    }

    async fn list_push(&self, key: &str, value: String, cap: usize) {
        let mut inner = self.inner.lock().unwrap();
        let list = inner.lists.entry(key.to_string()).or_default();
        list.insert(0, value);
        list.truncate(cap);
    }

    async fn list_range(&self, key: &str, limit: usize) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .lists
            .get(key)
            .map(|l| l.iter().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    async fn zset_add(&self, key: &str, score: f64, member: String) {
        let mut inner = self.inner.lock().unwrap();
        let set = inner.zsets.entry(key.to_string()).or_default();
        set.push((score, member));
        set.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    }

    async fn zset_remove_below(&self, key: &str, min_score: f64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(set) = inner.zsets.get_mut(key) {
            set.retain(|(score, _)| *score >= min_score);
        }
    }

    async fn counter_incr(&self, key: &str) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let counter = inner.counters.entry(key.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_roundtrip() {
        let store = MemoryStore::new();
        store.hash_set("procs:entries", "123", "{}".to_string()).await;
        store.hash_incr("procs:metrics", "reaped", 2).await;
        store.hash_incr("procs:metrics", "reaped", 1).await;

        let all = store.hash_get_all("procs:metrics").await;
        assert_eq!(all.get("reaped").map(String::as_str), Some("3"));

        store.hash_del("procs:entries", "123").await;
        assert!(store.hash_get_all("procs:entries").await.is_empty());
    }

    #[tokio::test]
    async fn list_push_caps_length() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store.list_push("events", format!("e{i}"), 3).await;
        }
        let range = store.list_range("events", 10).await;
        assert_eq!(range, ["e4", "e3", "e2"]);
    }

    #[tokio::test]
    async fn zset_trims_by_score() {
        let store = MemoryStore::new();
        store.zset_add("rate:opus", 1.0, "1:100".to_string()).await;
        store.zset_add("rate:opus", 2.0, "2:100".to_string()).await;
        store.zset_add("rate:opus", 3.0, "3:100".to_string()).await;
        store.zset_remove_below("rate:opus", 2.5).await;
        // Only the newest member survives the trim.
        let inner = store.inner.lock().unwrap();
        assert_eq!(inner.zsets.get("rate:opus").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn counter_is_monotonic() {
        let store = MemoryStore::new();
        assert_eq!(store.counter_incr("events:nextId").await, 1);
        assert_eq!(store.counter_incr("events:nextId").await, 2);
    }
}
