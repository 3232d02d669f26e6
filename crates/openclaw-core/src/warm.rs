//! Warm pool: pre-spawned workers blocked on stdin, keyed by
//! `(model, stream, worker)`.
//!
//! Acquire pops until it finds a live, fresh entry and transfers full
//! ownership of the child (reader channel included) to the caller. Every
//! acquire (hit or miss) schedules one asynchronous replenish for the
//! key, so the pool converges back to `max_per_key` under steady demand.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;

use crate::model::ModelFamily;
use crate::spawn::{WorkerProcess, WorkerSpec};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WarmKey {
    pub model: ModelFamily,
    pub stream: bool,
    pub worker: String,
}

impl std::fmt::Display for WarmKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.model,
            if self.stream { "stream" } else { "sync" },
            self.worker
        )
    }
}

#[derive(Debug, Clone)]
pub struct WarmPoolConfig {
    pub enabled: bool,
    pub max_per_key: usize,
    pub max_age: Duration,
    pub sweep_interval: Duration,
}

impl Default for WarmPoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_per_key: 1,
            max_age: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

struct WarmEntry {
    proc: WorkerProcess,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct WarmMetrics {
    pub spawned: u64,
    pub hits: u64,
    pub misses: u64,
    pub evicted_stale: u64,
    pub evicted_dead: u64,
    pub spawn_errors: u64,
}

struct WarmState {
    entries: HashMap<WarmKey, Vec<WarmEntry>>,
    metrics: WarmMetrics,
}

pub struct WarmPool {
    cfg: WarmPoolConfig,
    specs: HashMap<String, WorkerSpec>,
    state: Mutex<WarmState>,
}

impl WarmPool {
    pub fn new(cfg: WarmPoolConfig, workers: &[WorkerSpec]) -> Arc<Self> {
        let specs = workers
            .iter()
            .map(|spec| (spec.name.clone(), spec.clone()))
            .collect();
        Arc::new(Self {
            cfg,
            specs,
            state: Mutex::new(WarmState {
                entries: HashMap::new(),
                metrics: WarmMetrics::default(),
            }),
        })
    }

    /// Spawn one warm worker for `key` unless the key is already at cap.
    pub fn warm_up(&self, key: &WarmKey) {
        if !self.cfg.enabled {
            return;
        }
        let Some(spec) = self.specs.get(&key.worker) else {
            return;
        };
        {
            let st = self.state.lock().unwrap();
            if st.entries.get(key).map_or(0, |v| v.len()) >= self.cfg.max_per_key {
                return;
            }
        }
        match WorkerProcess::spawn(spec, key.model, key.stream) {
            Ok(proc) => {
                tracing::debug!(key = %key, pid = proc.pid, "warm worker spawned");
                let mut st = self.state.lock().unwrap();
                st.metrics.spawned += 1;
                let entries = st.entries.entry(key.clone()).or_default();
                if entries.len() < self.cfg.max_per_key {
                    entries.push(WarmEntry { proc });
                }
                // A concurrent warm_up may have filled the key; the local
                // `proc` is then dropped and kill_on_drop reclaims it.
            }
            Err(err) => {
                tracing::warn!(key = %key, %err, "warm spawn failed");
                self.state.lock().unwrap().metrics.spawn_errors += 1;
            }
        }
    }

    /// Take a live, fresh worker for `key`, if any. Always schedules one
    /// background replenish for the key.
    pub fn acquire(self: &Arc<Self>, key: &WarmKey) -> Option<WorkerProcess> {
        if !self.cfg.enabled {
            return None;
        }
        let taken = {
            let mut guard = self.state.lock().unwrap();
            let st = &mut *guard;
            let mut taken = None;
            if let Some(entries) = st.entries.get_mut(key) {
                while let Some(mut entry) = entries.pop() {
                    if entry.proc.try_exit().is_some() {
                        st.metrics.evicted_dead += 1;
                        continue;
                    }
                    if entry.proc.spawned_at.elapsed() > self.cfg.max_age {
                        entry.proc.terminate();
                        st.metrics.evicted_stale += 1;
                        continue;
                    }
                    taken = Some(entry.proc);
                    break;
                }
            }
            match &taken {
                Some(_) => st.metrics.hits += 1,
                None => st.metrics.misses += 1,
            }
            taken
        };

        self.schedule_warm_up(key.clone());
        taken
    }

    fn schedule_warm_up(self: &Arc<Self>, key: WarmKey) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            pool.warm_up(&key);
        });
    }

    /// Evict dead entries and terminate stale ones.
    pub fn sweep(&self) {
        let mut st = self.state.lock().unwrap();
        let max_age = self.cfg.max_age;
        let mut stale = 0;
        let mut dead = 0;
        for entries in st.entries.values_mut() {
            entries.retain_mut(|entry| {
                if entry.proc.try_exit().is_some() {
                    dead += 1;
                    return false;
                }
                if entry.proc.spawned_at.elapsed() > max_age {
                    entry.proc.terminate();
                    stale += 1;
                    return false;
                }
                true
            });
        }
        st.entries.retain(|_, v| !v.is_empty());
        st.metrics.evicted_dead += dead;
        st.metrics.evicted_stale += stale;
    }

    pub fn start_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        let interval = self.cfg.sweep_interval;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                pool.sweep();
            }
        })
    }

    /// Terminate every pooled worker. Shutdown path.
    pub fn drain(&self) {
        let mut st = self.state.lock().unwrap();
        for (_, entries) in st.entries.drain() {
            for mut entry in entries {
                entry.proc.terminate();
            }
        }
    }

    pub fn stats(&self) -> WarmStats {
        let st = self.state.lock().unwrap();
        WarmStats {
            pooled: st.entries.values().map(Vec::len).sum(),
            per_key: st
                .entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.len()))
                .collect(),
            metrics: st.metrics,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WarmStats {
    pub pooled: usize,
    pub per_key: HashMap<String, usize>,
    pub metrics: WarmMetrics,
}
