//! Worker routing: health tracking, least-active-connections selection
//! with session-affinity tiebreak, and degraded-mode concentration.
//!
//! A worker whose failure output classifies as rate-limited is marked
//! `limited` and the pool drops to degraded mode, concentrating traffic on
//! the primary. Limited workers recover after a cooldown via the periodic
//! health sweep; two or more healthy workers flip the pool back to
//! load-balance mode.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinHandle;

use crate::affinity::SessionAffinity;
use crate::spawn::WorkerSpec;

/// Failure output that means "the upstream throttled this worker".
const RATE_LIMIT_MARKERS: &[&str] = &[
    "rate limit",
    "429",
    "too many requests",
    "overloaded",
    "you've hit your limit",
];

pub fn is_rate_limit_error(text: &str) -> bool {
    let lower = text.to_lowercase();
    RATE_LIMIT_MARKERS.iter().any(|m| lower.contains(m))
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Worker preferred while degraded. Defaults to the first spec.
    pub primary: Option<String>,
    /// Cooldown before a limited worker is considered healthy again.
    pub health_check: Duration,
    pub sweep_interval: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            primary: None,
            health_check: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolMode {
    LoadBalance,
    Degraded,
}

struct WorkerState {
    limited: bool,
    limited_at: Option<Instant>,
    conns: usize,
    total: u64,
}

struct RouterState {
    workers: HashMap<String, WorkerState>,
    mode: PoolMode,
}

pub struct WorkerPool {
    /// Boot-time order; selection tie-breaks and degraded fallback scan it.
    order: Vec<String>,
    primary: String,
    cfg: RouterConfig,
    state: Mutex<RouterState>,
    affinity: SessionAffinity,
}

impl WorkerPool {
    pub fn new(specs: &[WorkerSpec], cfg: RouterConfig, affinity: SessionAffinity) -> Arc<Self> {
        let order: Vec<String> = specs.iter().map(|s| s.name.clone()).collect();
        let primary = cfg
            .primary
            .clone()
            .filter(|p| order.iter().any(|w| w == p))
            .or_else(|| order.first().cloned())
            .unwrap_or_default();
        let workers = order
            .iter()
            .map(|name| {
                (
                    name.clone(),
                    WorkerState {
                        limited: false,
                        limited_at: None,
                        conns: 0,
                        total: 0,
                    },
                )
            })
            .collect();
        Arc::new(Self {
            order,
            primary,
            cfg,
            state: Mutex::new(RouterState {
                workers,
                mode: PoolMode::LoadBalance,
            }),
            affinity,
        })
    }

    pub fn affinity(&self) -> &SessionAffinity {
        &self.affinity
    }

    pub fn mode(&self) -> PoolMode {
        self.state.lock().unwrap().mode
    }

    /// Pick the next worker and count the connection against it.
    /// Re-asserts affinity for `session_key` on the chosen worker.
    pub fn select(&self, session_key: Option<&str>) -> Option<String> {
        let sticky = session_key.and_then(|k| self.affinity.lookup(k));
        let chosen = {
            let mut st = self.state.lock().unwrap();
            let chosen = match st.mode {
                PoolMode::LoadBalance => self.select_least_loaded(&st, sticky.as_deref()),
                PoolMode::Degraded => self.select_degraded(&st),
            }?;
            let ws = st.workers.get_mut(&chosen).expect("chosen from pool");
            ws.conns += 1;
            ws.total += 1;
            chosen
        };
        if let Some(key) = session_key {
            self.affinity.assign(key, &chosen);
        }
        Some(chosen)
    }

    fn select_least_loaded(&self, st: &RouterState, sticky: Option<&str>) -> Option<String> {
        let least = self
            .order
            .iter()
            .filter_map(|name| {
                let ws = st.workers.get(name)?;
                (!ws.limited).then_some((name, ws.conns, ws.total))
            })
            .min_by_key(|(_, conns, total)| (*conns, *total))?;

        if let Some(sticky) = sticky {
            if let Some(ws) = st.workers.get(sticky) {
                // Affinity only wins when it is strictly less loaded than
                // the least-loaded candidate.
                if !ws.limited && ws.conns < least.1 {
                    return Some(sticky.to_string());
                }
            }
        }
        Some(least.0.clone())
    }

    fn select_degraded(&self, st: &RouterState) -> Option<String> {
        let healthy = |name: &String| st.workers.get(name).map_or(false, |w| !w.limited);
        if healthy(&self.primary) {
            return Some(self.primary.clone());
        }
        if let Some(first) = self.order.iter().find(|w| healthy(w)) {
            return Some(first.clone());
        }
        // Everyone is limited: revive whichever has cooled the longest.
        self.order
            .iter()
            .min_by_key(|name| {
                st.workers
                    .get(*name)
                    .and_then(|w| w.limited_at)
                    .unwrap_or_else(Instant::now)
            })
            .cloned()
    }

    /// Pick a retry worker: prefer healthy workers not yet tried, then any
    /// healthy worker outside the tried set is exhausted.
    pub fn select_retry(&self, tried: &[String]) -> Option<String> {
        let chosen = {
            let mut st = self.state.lock().unwrap();
            let untried = self
                .order
                .iter()
                .find(|name| {
                    !tried.contains(name)
                        && st.workers.get(*name).map_or(false, |w| !w.limited)
                })
                .cloned();
            let fallback = || {
                self.order
                    .iter()
                    .find(|name| st.workers.get(*name).map_or(false, |w| !w.limited))
                    .cloned()
            };
            let chosen = untried.or_else(fallback)?;
            let ws = st.workers.get_mut(&chosen).expect("chosen from pool");
            ws.conns += 1;
            ws.total += 1;
            chosen
        };
        Some(chosen)
    }

    /// Release the connection counted by `select`/`select_retry`.
    pub fn on_complete(&self, worker: &str) {
        let mut st = self.state.lock().unwrap();
        if let Some(ws) = st.workers.get_mut(worker) {
            ws.conns = ws.conns.saturating_sub(1);
        }
    }

    /// Mark a worker rate-limited and drop the pool into degraded mode.
    pub fn mark_limited(&self, worker: &str) {
        let mut st = self.state.lock().unwrap();
        if let Some(ws) = st.workers.get_mut(worker) {
            ws.limited = true;
            ws.limited_at = Some(Instant::now());
        }
        st.mode = PoolMode::Degraded;
        tracing::warn!(worker, "worker rate-limited, pool degraded");
    }

    /// One health pass: recover cooled-down workers, restore load-balance
    /// mode when at least two are healthy. Also expires idle affinity.
    pub fn sweep(&self) {
        {
            let mut st = self.state.lock().unwrap();
            let cooldown = self.cfg.health_check;
            for (name, ws) in st.workers.iter_mut() {
                if ws.limited
                    && ws
                        .limited_at
                        .map_or(false, |at| at.elapsed() >= cooldown)
                {
                    ws.limited = false;
                    ws.limited_at = None;
                    tracing::info!(worker = %name, "worker recovered from rate limit");
                }
            }
            let healthy = st.workers.values().filter(|w| !w.limited).count();
            if st.mode == PoolMode::Degraded && healthy >= 2 {
                st.mode = PoolMode::LoadBalance;
                tracing::info!("pool back in load-balance mode");
            }
        }
        self.affinity.sweep();
    }

    pub fn start_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        // The health tick never stretches past a minute.
        let interval = self.cfg.sweep_interval.min(Duration::from_secs(60));
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                pool.sweep();
            }
        })
    }

    pub fn worker_names(&self) -> &[String] {
        &self.order
    }

    pub fn pool_size(&self) -> usize {
        self.order.len()
    }

    pub fn stats(&self) -> RouterStats {
        let st = self.state.lock().unwrap();
        RouterStats {
            mode: st.mode,
            workers: self
                .order
                .iter()
                .map(|name| {
                    let ws = &st.workers[name];
                    WorkerStats {
                        name: name.clone(),
                        limited: ws.limited,
                        limited_for_ms: ws
                            .limited_at
                            .map(|at| at.elapsed().as_millis() as u64),
                        conns: ws.conns,
                        total: ws.total,
                    }
                })
                .collect(),
            affinity: self.affinity.stats(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RouterStats {
    pub mode: PoolMode,
    pub workers: Vec<WorkerStats>,
    pub affinity: crate::affinity::AffinityStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub name: String,
    pub limited: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limited_for_ms: Option<u64>,
    pub conns: usize,
    pub total: u64,
}
