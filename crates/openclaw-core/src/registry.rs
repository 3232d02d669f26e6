//! Process registry: ground truth for every spawned worker child.
//!
//! Entries are keyed by OS pid and carry spawn/activity timestamps plus
//! request attribution. A periodic reaper terminates zombies (too old, or
//! idle past the threshold) and reports them through `on_reap`. The
//! in-memory table is authoritative; the durable store only carries
//! counters across restarts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::model::ModelFamily;
use crate::store::DurableStore;

const ENTRIES_KEY: &str = "procs:entries";
const METRICS_KEY: &str = "procs:metrics";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerMode {
    Sync,
    Stream,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub pid: u32,
    pub request_id: String,
    pub model: ModelFamily,
    pub mode: WorkerMode,
    pub source: String,
    pub worker: String,
    pub spawned_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl RegistryEntry {
    pub fn new(
        pid: u32,
        request_id: impl Into<String>,
        model: ModelFamily,
        mode: WorkerMode,
        source: impl Into<String>,
        worker: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            pid,
            request_id: request_id.into(),
            model,
            mode,
            source: source.into(),
            worker: worker.into(),
            spawned_at: now,
            last_activity_at: now,
            input_tokens: 0,
            output_tokens: 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReaperConfig {
    pub max_age: Duration,
    pub max_idle: Duration,
    pub interval: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(3_600),
            max_idle: Duration::from_secs(900),
            interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RegistryMetrics {
    pub registered: u64,
    pub reaped: u64,
    pub killed: u64,
}

pub type ReapCallback = Arc<dyn Fn(&RegistryEntry) + Send + Sync>;

struct RegistryState {
    entries: HashMap<u32, RegistryEntry>,
    metrics: RegistryMetrics,
}

pub struct ProcessRegistry {
    cfg: ReaperConfig,
    state: Mutex<RegistryState>,
    on_reap: Option<ReapCallback>,
    store: Option<Arc<dyn DurableStore>>,
}

impl ProcessRegistry {
    pub fn new(cfg: ReaperConfig) -> Self {
        Self {
            cfg,
            state: Mutex::new(RegistryState {
                entries: HashMap::new(),
                metrics: RegistryMetrics::default(),
            }),
            on_reap: None,
            store: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn on_reap(mut self, callback: ReapCallback) -> Self {
        self.on_reap = Some(callback);
        self
    }

    /// Load persisted counters and drop entries whose pid the OS no longer
    /// knows. Called once at startup, before any registration.
    pub async fn restore(&self) {
        let Some(store) = &self.store else { return };

        let metrics = store.hash_get_all(METRICS_KEY).await;
        {
            let mut st = self.state.lock().unwrap();
            let get = |field: &str| {
                metrics
                    .get(field)
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0u64)
            };
            st.metrics.registered = get("registered");
            st.metrics.reaped = get("reaped");
            st.metrics.killed = get("killed");
        }

        let entries = store.hash_get_all(ENTRIES_KEY).await;
        for (field, _) in entries {
            let Ok(pid) = field.parse::<u32>() else {
                store.hash_del(ENTRIES_KEY, &field).await;
                continue;
            };
            if !pid_alive(pid) {
                tracing::info!(pid, "dropping stale registry entry from previous run");
                store.hash_del(ENTRIES_KEY, &field).await;
            }
        }
    }

    pub fn register(&self, entry: RegistryEntry) {
        let pid = entry.pid;
        {
            let mut st = self.state.lock().unwrap();
            st.metrics.registered += 1;
            st.entries.insert(pid, entry.clone());
        }
        tracing::debug!(pid, worker = %entry.worker, request = %entry.request_id, "registered worker");
        self.persist_entry(entry);
        self.persist_metric("registered");
    }

    pub fn unregister(&self, pid: u32) -> Option<RegistryEntry> {
        let removed = self.state.lock().unwrap().entries.remove(&pid);
        if removed.is_some() {
            if let Some(store) = &self.store {
                let store = Arc::clone(store);
                tokio::spawn(async move {
                    store.hash_del(ENTRIES_KEY, &pid.to_string()).await;
                });
            }
        }
        removed
    }

    /// Refresh activity on output; optionally fold in live token counts.
    pub fn touch(&self, pid: u32, input_tokens: u64, output_tokens: u64) {
        let mut st = self.state.lock().unwrap();
        if let Some(entry) = st.entries.get_mut(&pid) {
            entry.last_activity_at = Utc::now();
            entry.input_tokens += input_tokens;
            entry.output_tokens += output_tokens;
        }
    }

    pub fn get(&self, pid: u32) -> Option<RegistryEntry> {
        self.state.lock().unwrap().entries.get(&pid).cloned()
    }

    pub fn get_all(&self) -> Vec<RegistryEntry> {
        let st = self.state.lock().unwrap();
        let mut all: Vec<_> = st.entries.values().cloned().collect();
        all.sort_by_key(|e| e.spawned_at);
        all
    }

    pub fn stats(&self) -> RegistryStats {
        let st = self.state.lock().unwrap();
        RegistryStats {
            live: st.entries.len(),
            metrics: st.metrics,
        }
    }

    /// TERM the pid and drop the entry. A dead pid is not an error: the
    /// entry is removed either way.
    pub fn kill(&self, pid: u32) -> Option<RegistryEntry> {
        if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            tracing::debug!(pid, %err, "SIGTERM failed (process already gone)");
        }
        {
            let mut st = self.state.lock().unwrap();
            st.metrics.killed += 1;
        }
        self.persist_metric("killed");
        self.unregister(pid)
    }

    /// Entries past the age or idle threshold.
    pub fn zombies(&self) -> Vec<RegistryEntry> {
        let now = Utc::now();
        let max_age = chrono::Duration::from_std(self.cfg.max_age).unwrap_or(chrono::Duration::MAX);
        let max_idle =
            chrono::Duration::from_std(self.cfg.max_idle).unwrap_or(chrono::Duration::MAX);
        let st = self.state.lock().unwrap();
        st.entries
            .values()
            .filter(|e| {
                now.signed_duration_since(e.spawned_at) > max_age
                    || now.signed_duration_since(e.last_activity_at) > max_idle
            })
            .cloned()
            .collect()
    }

    /// One reaper pass: TERM and unregister every zombie, reporting each
    /// through `on_reap`.
    pub fn reap(&self) -> usize {
        let zombies = self.zombies();
        let count = zombies.len();
        for entry in zombies {
            tracing::warn!(
                pid = entry.pid,
                worker = %entry.worker,
                request = %entry.request_id,
                "reaping zombie worker"
            );
            if let Err(err) = kill(Pid::from_raw(entry.pid as i32), Signal::SIGTERM) {
                tracing::debug!(pid = entry.pid, %err, "SIGTERM failed during reap");
            }
            self.unregister(entry.pid);
            {
                let mut st = self.state.lock().unwrap();
                st.metrics.reaped += 1;
            }
            self.persist_metric("reaped");
            if let Some(cb) = &self.on_reap {
                cb(&entry);
            }
        }
        count
    }

    pub fn start_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let interval = self.cfg.interval;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                registry.reap();
            }
        })
    }

    /// TERM everything still registered. Shutdown path.
    pub fn kill_all(&self) {
        let pids: Vec<u32> = {
            let st = self.state.lock().unwrap();
            st.entries.keys().copied().collect()
        };
        for pid in pids {
            self.kill(pid);
        }
    }

    fn persist_entry(&self, entry: RegistryEntry) {
        let Some(store) = &self.store else { return };
        let store = Arc::clone(store);
        tokio::spawn(async move {
            if let Ok(json) = serde_json::to_string(&entry) {
                store.hash_set(ENTRIES_KEY, &entry.pid.to_string(), json).await;
            }
        });
    }

    fn persist_metric(&self, field: &'static str) {
        let Some(store) = &self.store else { return };
        let store = Arc::clone(store);
        tokio::spawn(async move {
            store.hash_incr(METRICS_KEY, field, 1).await;
        });
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub live: usize,
    pub metrics: RegistryMetrics,
}

fn pid_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn entry(pid: u32) -> RegistryEntry {
        RegistryEntry::new(
            pid,
            format!("req-{pid}"),
            ModelFamily::Sonnet,
            WorkerMode::Stream,
            "test",
            "w1",
        )
    }

    #[tokio::test]
    async fn register_touch_unregister() {
        let registry = ProcessRegistry::new(ReaperConfig::default());
        registry.register(entry(4242));
        assert_eq!(registry.stats().live, 1);

        let before = registry.get(4242).unwrap().last_activity_at;
        registry.touch(4242, 100, 25);
        let after = registry.get(4242).unwrap();
        assert!(after.last_activity_at >= before);
        assert_eq!(after.input_tokens, 100);
        assert_eq!(after.output_tokens, 25);

        let removed = registry.unregister(4242).unwrap();
        assert_eq!(removed.request_id, "req-4242");
        assert_eq!(registry.stats().live, 0);
    }

    #[tokio::test]
    async fn idle_entry_is_a_zombie() {
        let cfg = ReaperConfig {
            max_age: Duration::from_secs(3_600),
            max_idle: Duration::from_millis(10),
            ..ReaperConfig::default()
        };
        let registry = ProcessRegistry::new(cfg);
        let mut stale = entry(91_001);
        stale.last_activity_at = Utc::now() - chrono::Duration::seconds(5);
        registry.register(stale);

        let zombies = registry.zombies();
        assert_eq!(zombies.len(), 1);
        assert_eq!(zombies[0].pid, 91_001);
    }

    #[tokio::test]
    async fn over_age_entry_is_a_zombie() {
        let cfg = ReaperConfig {
            max_age: Duration::from_millis(10),
            max_idle: Duration::from_secs(3_600),
            ..ReaperConfig::default()
        };
        let registry = ProcessRegistry::new(cfg);
        let mut old = entry(91_002);
        old.spawned_at = Utc::now() - chrono::Duration::seconds(5);
        // Activity is fresh; age alone qualifies it.
        old.last_activity_at = Utc::now();
        registry.register(old);
        assert_eq!(registry.zombies().len(), 1);
    }

    #[tokio::test]
    async fn reap_removes_and_reports() {
        let cfg = ReaperConfig {
            max_age: Duration::from_secs(3_600),
            max_idle: Duration::from_millis(0),
            ..ReaperConfig::default()
        };
        let reported = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&reported);
        let registry = ProcessRegistry::new(cfg).on_reap(Arc::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        let mut stale = entry(91_003);
        stale.last_activity_at = Utc::now() - chrono::Duration::seconds(1);
        registry.register(stale);

        assert_eq!(registry.reap(), 1);
        assert_eq!(reported.load(Ordering::SeqCst), 1);
        assert_eq!(registry.stats().live, 0);
        assert_eq!(registry.stats().metrics.reaped, 1);
    }

    #[tokio::test]
    async fn kill_of_dead_pid_still_unregisters() {
        let registry = ProcessRegistry::new(ReaperConfig::default());
        // A pid beyond any kernel pid_max.
        registry.register(entry(2_147_483_647));
        assert!(registry.kill(2_147_483_647).is_some());
        assert_eq!(registry.stats().live, 0);
        assert_eq!(registry.stats().metrics.killed, 1);
    }

    #[tokio::test]
    async fn restore_prunes_dead_pids_and_loads_metrics() {
        let store: Arc<dyn DurableStore> = Arc::new(crate::store::MemoryStore::new());
        store.hash_incr(METRICS_KEY, "reaped", 7).await;
        store
            .hash_set(ENTRIES_KEY, "2147483646", "{}".to_string())
            .await;

        let registry = ProcessRegistry::new(ReaperConfig::default()).with_store(Arc::clone(&store));
        registry.restore().await;

        assert_eq!(registry.stats().metrics.reaped, 7);
        assert!(store.hash_get_all(ENTRIES_KEY).await.is_empty());
    }
}
