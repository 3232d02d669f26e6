//! Fair queue: per-source FIFO queues with priority bands, round-robin
//! dispatch across sources, global and per-source concurrency caps, and
//! leak-swept leases.
//!
//! `acquire` resolves to a [`Lease`] representing one global concurrency
//! slot. Release is idempotent: explicit `release()`, `Drop`, and the leak
//! sweep all funnel into the same removal, and only the first one counts.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::QueueError;
use crate::model::Priority;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_concurrent: usize,
    pub max_queue_total: usize,
    pub max_queue_per_source: usize,
    /// Per-source active cap when the source has no explicit entry.
    /// Zero means uncapped.
    pub default_source_concurrency: usize,
    pub source_concurrency: HashMap<String, usize>,
    pub queue_timeout: Duration,
    pub max_lease: Duration,
    pub sweep_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            max_queue_total: 64,
            max_queue_per_source: 16,
            default_source_concurrency: 2,
            source_concurrency: HashMap::new(),
            queue_timeout: Duration::from_secs(120),
            max_lease: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(5),
        }
    }
}

impl QueueConfig {
    fn source_cap(&self, source: &str) -> usize {
        let cap = self
            .source_concurrency
            .get(source)
            .copied()
            .unwrap_or(self.default_source_concurrency);
        if cap == 0 {
            usize::MAX
        } else {
            cap
        }
    }
}

struct Waiter {
    id: u64,
    priority: Priority,
    enqueued_at: Instant,
    tx: oneshot::Sender<Result<Lease, QueueError>>,
}

struct LeaseRecord {
    source: String,
    acquired_at: Instant,
}

#[derive(Default)]
struct SourceCounters {
    processed: u64,
    throttled: u64,
}

struct QueueState {
    queues: HashMap<String, VecDeque<Waiter>>,
    /// Sources that currently have a non-empty queue, in rotation order.
    rotation: Vec<String>,
    cursor: usize,
    total_queued: usize,
    active_total: usize,
    active_by_source: HashMap<String, usize>,
    leases: HashMap<u64, LeaseRecord>,
    next_lease_id: u64,
    next_waiter_id: u64,
    processed: u64,
    timed_out: u64,
    rejected: u64,
    leaked: u64,
    per_source: HashMap<String, SourceCounters>,
    closed: bool,
}

struct Shared {
    cfg: QueueConfig,
    state: Mutex<QueueState>,
}

/// A granted global concurrency slot. Dropping the lease releases it; the
/// leak sweep force-releases leases held past `max_lease`.
pub struct Lease {
    shared: Arc<Shared>,
    id: u64,
    source: String,
    released: AtomicBool,
}

impl Lease {
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Idempotent: second and later calls are no-ops, as is a call after
    /// the leak sweep already force-released this lease.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut st = self.shared.state.lock().unwrap();
        if st.leases.remove(&self.id).is_some() {
            release_counts(&mut st, &self.source);
            dispatch(&self.shared, &mut st);
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.id)
            .field("source", &self.source)
            .finish()
    }
}

fn release_counts(st: &mut QueueState, source: &str) {
    st.active_total = st.active_total.saturating_sub(1);
    if let Some(n) = st.active_by_source.get_mut(source) {
        *n = n.saturating_sub(1);
        if *n == 0 {
            st.active_by_source.remove(source);
        }
    }
}

fn grant(shared: &Arc<Shared>, st: &mut QueueState, source: &str) -> Lease {
    st.active_total += 1;
    *st.active_by_source.entry(source.to_string()).or_insert(0) += 1;
    st.processed += 1;
    st.per_source.entry(source.to_string()).or_default().processed += 1;

    let id = st.next_lease_id;
    st.next_lease_id += 1;
    st.leases.insert(
        id,
        LeaseRecord {
            source: source.to_string(),
            acquired_at: Instant::now(),
        },
    );
    Lease {
        shared: Arc::clone(shared),
        id,
        source: source.to_string(),
        released: AtomicBool::new(false),
    }
}

/// Roll a grant back when the waiter vanished before the lease reached it.
fn ungrant(st: &mut QueueState, lease: Lease) {
    lease.released.store(true, Ordering::SeqCst);
    st.leases.remove(&lease.id);
    release_counts(st, &lease.source);
    st.processed = st.processed.saturating_sub(1);
    if let Some(c) = st.per_source.get_mut(&lease.source) {
        c.processed = c.processed.saturating_sub(1);
    }
}

/// Grant as many queued waiters as caps allow, rotating round-robin across
/// sources. Sources at their per-source cap are skipped but stay in
/// rotation; the cursor moves past whichever source is chosen.
fn dispatch(shared: &Arc<Shared>, st: &mut QueueState) {
    loop {
        if st.active_total >= shared.cfg.max_concurrent || st.rotation.is_empty() {
            return;
        }
        let n = st.rotation.len();
        let mut chosen = None;
        for i in 0..n {
            let idx = (st.cursor + i) % n;
            let source = &st.rotation[idx];
            let active = st.active_by_source.get(source).copied().unwrap_or(0);
            if active < shared.cfg.source_cap(source) {
                chosen = Some(idx);
                break;
            }
        }
        let Some(idx) = chosen else { return };
        let source = st.rotation[idx].clone();

        let waiter = st
            .queues
            .get_mut(&source)
            .and_then(|q| q.pop_front())
            .expect("rotation entry implies a non-empty queue");
        st.total_queued -= 1;
        st.cursor = (idx + 1) % n;

        if st.queues.get(&source).map_or(true, |q| q.is_empty()) {
            st.queues.remove(&source);
            st.rotation.remove(idx);
            if st.rotation.is_empty() {
                st.cursor = 0;
            } else {
                if st.cursor > idx {
                    st.cursor -= 1;
                }
                st.cursor %= st.rotation.len();
            }
        }

        let lease = grant(shared, st, &source);
        if let Err(result) = waiter.tx.send(Ok(lease)) {
            if let Ok(lease) = result {
                ungrant(st, lease);
            }
        }
    }
}

/// The fair queue. Cheap to clone (shared interior).
#[derive(Clone)]
pub struct FairQueue {
    shared: Arc<Shared>,
}

impl FairQueue {
    pub fn new(cfg: QueueConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                cfg,
                state: Mutex::new(QueueState {
                    queues: HashMap::new(),
                    rotation: Vec::new(),
                    cursor: 0,
                    total_queued: 0,
                    active_total: 0,
                    active_by_source: HashMap::new(),
                    leases: HashMap::new(),
                    next_lease_id: 1,
                    next_waiter_id: 1,
                    processed: 0,
                    timed_out: 0,
                    rejected: 0,
                    leaked: 0,
                    per_source: HashMap::new(),
                    closed: false,
                }),
            }),
        }
    }

    /// Wait for a global concurrency slot for `source`.
    pub async fn acquire(&self, source: &str, priority: Priority) -> Result<Lease, QueueError> {
        let (waiter_id, mut rx) = {
            let mut st = self.shared.state.lock().unwrap();
            if st.closed {
                return Err(QueueError::Closed);
            }

            let under_caps = st.active_total < self.shared.cfg.max_concurrent
                && st.active_by_source.get(source).copied().unwrap_or(0)
                    < self.shared.cfg.source_cap(source);
            if under_caps && st.total_queued == 0 {
                return Ok(grant(&self.shared, &mut st, source));
            }

            if st.total_queued >= self.shared.cfg.max_queue_total
                || st
                    .queues
                    .get(source)
                    .map_or(false, |q| q.len() >= self.shared.cfg.max_queue_per_source)
            {
                st.rejected += 1;
                return Err(QueueError::Full {
                    retry_after_ms: self.retry_after_ms(),
                });
            }

            let (tx, rx) = oneshot::channel();
            let waiter_id = st.next_waiter_id;
            st.next_waiter_id += 1;
            let waiter = Waiter {
                id: waiter_id,
                priority,
                enqueued_at: Instant::now(),
                tx,
            };
            let queue = st.queues.entry(source.to_string()).or_default();
            // Priority bands, FIFO within a band.
            let pos = queue
                .iter()
                .position(|w| w.priority > priority)
                .unwrap_or(queue.len());
            queue.insert(pos, waiter);
            st.total_queued += 1;
            st.per_source.entry(source.to_string()).or_default().throttled += 1;
            if !st.rotation.iter().any(|s| s == source) {
                st.rotation.push(source.to_string());
            }

            dispatch(&self.shared, &mut st);
            (waiter_id, rx)
        };

        tokio::select! {
            granted = &mut rx => match granted {
                Ok(result) => result,
                Err(_) => Err(QueueError::Closed),
            },
            _ = tokio::time::sleep(self.shared.cfg.queue_timeout) => {
                let mut st = self.shared.state.lock().unwrap();
                if self.remove_waiter(&mut st, source, waiter_id) {
                    st.timed_out += 1;
                    Err(QueueError::Timeout)
                } else {
                    // Lost the race: a grant (or the sweep) got there first.
                    drop(st);
                    match rx.try_recv() {
                        Ok(result) => result,
                        Err(_) => Err(QueueError::Timeout),
                    }
                }
            }
        }
    }

    fn remove_waiter(&self, st: &mut QueueState, source: &str, waiter_id: u64) -> bool {
        let Some(queue) = st.queues.get_mut(source) else {
            return false;
        };
        let Some(pos) = queue.iter().position(|w| w.id == waiter_id) else {
            return false;
        };
        queue.remove(pos);
        st.total_queued -= 1;
        if queue.is_empty() {
            st.queues.remove(source);
            if let Some(idx) = st.rotation.iter().position(|s| s == source) {
                st.rotation.remove(idx);
                if st.rotation.is_empty() {
                    st.cursor = 0;
                } else {
                    if st.cursor > idx {
                        st.cursor -= 1;
                    }
                    st.cursor %= st.rotation.len();
                }
            }
        }
        true
    }

    fn retry_after_ms(&self) -> u64 {
        (self.shared.cfg.queue_timeout.as_millis() as u64 / 4).max(1_000)
    }

    /// One pass of the periodic sweep: evict over-age waiters, force-release
    /// leaked leases, then restart dispatch.
    pub fn sweep(&self) {
        let mut st = self.shared.state.lock().unwrap();
        let cfg = &self.shared.cfg;

        let mut evicted: Vec<Waiter> = Vec::new();
        let sources: Vec<String> = st.queues.keys().cloned().collect();
        for source in sources {
            let queue = st.queues.get_mut(&source).unwrap();
            let mut kept = VecDeque::with_capacity(queue.len());
            while let Some(w) = queue.pop_front() {
                if w.enqueued_at.elapsed() > cfg.queue_timeout {
                    evicted.push(w);
                } else {
                    kept.push_back(w);
                }
            }
            *queue = kept;
            if st.queues.get(&source).map_or(false, |q| q.is_empty()) {
                st.queues.remove(&source);
                if let Some(idx) = st.rotation.iter().position(|s| s == &source) {
                    st.rotation.remove(idx);
                    if st.rotation.is_empty() {
                        st.cursor = 0;
                    } else {
                        if st.cursor > idx {
                            st.cursor -= 1;
                        }
                        st.cursor %= st.rotation.len();
                    }
                }
            }
        }
        st.total_queued -= evicted.len();
        st.timed_out += evicted.len() as u64;

        let leaked: Vec<u64> = st
            .leases
            .iter()
            .filter(|(_, r)| r.acquired_at.elapsed() > cfg.max_lease)
            .map(|(id, _)| *id)
            .collect();
        for id in leaked {
            if let Some(record) = st.leases.remove(&id) {
                release_counts(&mut st, &record.source);
                st.leaked += 1;
                tracing::warn!(source = %record.source, lease = id, "force-released leaked queue lease");
            }
        }

        dispatch(&self.shared, &mut st);
        drop(st);

        for w in evicted {
            let _ = w.tx.send(Err(QueueError::Timeout));
        }
    }

    /// Spawn the periodic sweeper. The handle aborts the loop when dropped
    /// by the caller at shutdown.
    pub fn start_sweeper(&self) -> JoinHandle<()> {
        let queue = self.clone();
        let interval = self.shared.cfg.sweep_interval;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                queue.sweep();
            }
        })
    }

    /// Reject all waiters and refuse new acquires.
    pub fn close(&self) {
        let mut st = self.shared.state.lock().unwrap();
        st.closed = true;
        let mut waiters = Vec::new();
        for (_, mut q) in st.queues.drain() {
            waiters.extend(q.drain(..));
        }
        st.rotation.clear();
        st.cursor = 0;
        st.total_queued = 0;
        drop(st);
        for w in waiters {
            let _ = w.tx.send(Err(QueueError::Closed));
        }
    }

    pub fn stats(&self) -> QueueStats {
        let st = self.shared.state.lock().unwrap();
        QueueStats {
            active: st.active_total,
            queued: st.total_queued,
            processed: st.processed,
            timed_out: st.timed_out,
            rejected: st.rejected,
            leaked: st.leaked,
            per_source: st
                .per_source
                .iter()
                .map(|(source, c)| {
                    (
                        source.clone(),
                        SourceStats {
                            active: st.active_by_source.get(source).copied().unwrap_or(0),
                            queued: st.queues.get(source).map_or(0, |q| q.len()),
                            processed: c.processed,
                            throttled: c.throttled,
                        },
                    )
                })
                .collect(),
        }
    }
}

/// Owned snapshot of queue counters.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub active: usize,
    pub queued: usize,
    pub processed: u64,
    pub timed_out: u64,
    pub rejected: u64,
    pub leaked: u64,
    pub per_source: HashMap<String, SourceStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceStats {
    pub active: usize,
    pub queued: usize,
    pub processed: u64,
    pub throttled: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn config(max_concurrent: usize) -> QueueConfig {
        QueueConfig {
            max_concurrent,
            default_source_concurrency: 0,
            ..QueueConfig::default()
        }
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn fast_path_grants_immediately() {
        let queue = FairQueue::new(config(2));
        let lease = queue.acquire("a", Priority::Normal).await.unwrap();
        assert_eq!(queue.stats().active, 1);
        lease.release();
        assert_eq!(queue.stats().active, 0);
        assert_eq!(queue.stats().processed, 1);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let queue = FairQueue::new(config(1));
        let lease = queue.acquire("a", Priority::Normal).await.unwrap();
        lease.release();
        lease.release();
        lease.release();
        assert_eq!(queue.stats().active, 0);
        // A fresh acquire still succeeds with consistent counters.
        let again = queue.acquire("a", Priority::Normal).await.unwrap();
        assert_eq!(queue.stats().active, 1);
        drop(again);
        assert_eq!(queue.stats().active, 0);
    }

    #[tokio::test]
    async fn drop_releases_the_slot() {
        let queue = FairQueue::new(config(1));
        {
            let _lease = queue.acquire("a", Priority::Normal).await.unwrap();
            assert_eq!(queue.stats().active, 1);
        }
        assert_eq!(queue.stats().active, 0);
    }

    #[tokio::test]
    async fn round_robin_across_sources() {
        // Two sources, four requests each, one slot: dispatch must alternate
        // a, b, a, b, ...
        let queue = FairQueue::new(config(1));
        let gate = queue.acquire("warmup", Priority::Normal).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel::<(String, Lease)>();
        for i in 0..4 {
            for source in ["a", "b"] {
                let queue = queue.clone();
                let tx = tx.clone();
                let source = source.to_string();
                tokio::spawn(async move {
                    let lease = queue.acquire(&source, Priority::Normal).await.unwrap();
                    let _ = tx.send((format!("{source}{}", i + 1), lease));
                });
                settle().await;
            }
        }
        assert_eq!(queue.stats().queued, 8);

        gate.release();
        let mut order = Vec::new();
        for _ in 0..8 {
            let (label, lease) = rx.recv().await.unwrap();
            order.push(label);
            settle().await;
            lease.release();
        }
        assert_eq!(order, ["a1", "b1", "a2", "b2", "a3", "b3", "a4", "b4"]);
    }

    #[tokio::test]
    async fn priority_within_source() {
        // One source, priorities [low, low, high, normal, high, low]:
        // dispatch order is high, high, normal, low, low, low with
        // submission order preserved within a band.
        let queue = FairQueue::new(config(1));
        let gate = queue.acquire("warmup", Priority::Normal).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel::<(usize, Lease)>();
        let priorities = [
            Priority::Low,
            Priority::Low,
            Priority::High,
            Priority::Normal,
            Priority::High,
            Priority::Low,
        ];
        for (i, priority) in priorities.into_iter().enumerate() {
            let queue = queue.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let lease = queue.acquire("s", priority).await.unwrap();
                let _ = tx.send((i, lease));
            });
            settle().await;
        }
        assert_eq!(queue.stats().queued, 6);

        gate.release();
        let mut order = Vec::new();
        for _ in 0..6 {
            let (i, lease) = rx.recv().await.unwrap();
            order.push(i);
            settle().await;
            lease.release();
        }
        assert_eq!(order, [2, 4, 3, 0, 1, 5]);
    }

    #[tokio::test]
    async fn queue_full_rejects() {
        let cfg = QueueConfig {
            max_concurrent: 1,
            max_queue_total: 2,
            max_queue_per_source: 2,
            default_source_concurrency: 0,
            ..QueueConfig::default()
        };
        let queue = FairQueue::new(cfg);
        let _held = queue.acquire("a", Priority::Normal).await.unwrap();
        for _ in 0..2 {
            let q = queue.clone();
            tokio::spawn(async move {
                let _ = q.acquire("a", Priority::Normal).await;
            });
            settle().await;
        }
        let err = queue.acquire("a", Priority::Normal).await.unwrap_err();
        assert!(matches!(err, QueueError::Full { .. }));
        assert_eq!(queue.stats().rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_timeout_rejects_waiter() {
        let cfg = QueueConfig {
            max_concurrent: 1,
            queue_timeout: Duration::from_millis(50),
            default_source_concurrency: 0,
            ..QueueConfig::default()
        };
        let queue = FairQueue::new(cfg);
        let _held = queue.acquire("a", Priority::Normal).await.unwrap();

        let err = queue.acquire("b", Priority::Normal).await.unwrap_err();
        assert_eq!(err, QueueError::Timeout);
        let stats = queue.stats();
        assert_eq!(stats.timed_out, 1);
        assert_eq!(stats.queued, 0);
        // Only the held fast-path grant counts as processed.
        assert_eq!(stats.processed, 1);
    }

    #[tokio::test]
    async fn per_source_cap_skips_but_keeps_rotating() {
        // Source a capped at 1 active; b uncapped. With a holding its one
        // slot, queued a-waiters must not block b.
        let mut source_concurrency = HashMap::new();
        source_concurrency.insert("a".to_string(), 1);
        let cfg = QueueConfig {
            max_concurrent: 2,
            source_concurrency,
            default_source_concurrency: 0,
            ..QueueConfig::default()
        };
        let queue = FairQueue::new(cfg);

        let a_held = queue.acquire("a", Priority::Normal).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel::<(&'static str, Lease)>();
        for source in ["a", "b"] {
            let queue = queue.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let lease = queue.acquire(source, Priority::Normal).await.unwrap();
                let _ = tx.send((source, lease));
            });
            settle().await;
        }

        // b gets the remaining global slot even though a was queued first.
        let (granted, b_lease) = rx.recv().await.unwrap();
        assert_eq!(granted, "b");
        assert_eq!(queue.stats().queued, 1);

        a_held.release();
        let (granted, a_lease) = rx.recv().await.unwrap();
        assert_eq!(granted, "a");
        a_lease.release();
        b_lease.release();
    }

    #[tokio::test]
    async fn leak_sweep_force_releases() {
        let cfg = QueueConfig {
            max_concurrent: 1,
            max_lease: Duration::from_millis(0),
            default_source_concurrency: 0,
            ..QueueConfig::default()
        };
        let queue = FairQueue::new(cfg);
        let leaked = queue.acquire("a", Priority::Normal).await.unwrap();
        assert_eq!(queue.stats().active, 1);

        queue.sweep();
        let stats = queue.stats();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.leaked, 1);

        // A new acquire succeeds and the stale lease's release is a no-op.
        let fresh = queue.acquire("a", Priority::Normal).await.unwrap();
        leaked.release();
        assert_eq!(queue.stats().active, 1);
        fresh.release();
        assert_eq!(queue.stats().active, 0);
    }

    #[tokio::test]
    async fn close_rejects_waiters_and_new_acquires() {
        let queue = FairQueue::new(config(1));
        let _held = queue.acquire("a", Priority::Normal).await.unwrap();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.acquire("b", Priority::Normal).await })
        };
        settle().await;
        queue.close();
        assert_eq!(waiter.await.unwrap().unwrap_err(), QueueError::Closed);
        assert_eq!(
            queue.acquire("c", Priority::Normal).await.unwrap_err(),
            QueueError::Closed
        );
    }
}
