//! The dispatcher: owns the queue, limiter, router, registry, warm pool,
//! token ledger and event log, and runs the admission sequence every
//! request goes through before any worker is touched.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use openclaw_core::affinity::{derive_key, SessionAffinity};
use openclaw_core::queue::Lease;
use openclaw_core::registry::{ProcessRegistry, RegistryEntry, WorkerMode};
use openclaw_core::router::WorkerPool;
use openclaw_core::spawn::{WorkerProcess, WorkerSpec};
use openclaw_core::store::DurableStore;
use openclaw_core::tokens::{estimate_tokens, TokenLedger};
use openclaw_core::warm::{WarmKey, WarmPool};
use openclaw_core::{FairQueue, ModelFamily, Priority, QueueError, RateLimiter};
use openclaw_events::{Event, EventLog};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::config::ProxyConfig;
use crate::prompt;
use crate::stream::WorkerOutput;
use crate::types::{completion_body, ChatRequest};

/// Hard ceiling on time spent sleeping against the rate limiter.
const RATE_WAIT_CAP: Duration = Duration::from_secs(300);
/// Rate-limit sleeps come in slices so shutdown and caps stay responsive.
const RATE_WAIT_SLICE: Duration = Duration::from_secs(5);
/// Backoff delays never stretch past this.
const RETRY_MAX_DELAY: Duration = Duration::from_secs(30);
const RETRY_JITTER: f64 = 0.3;

#[derive(Debug, Error)]
pub enum AdmitError {
    #[error("queue full")]
    QueueFull { retry_after_ms: u64 },
    #[error("timed out waiting for a queue slot")]
    QueueTimeout,
    #[error("timed out waiting for rate-limit clearance")]
    RateWaitTimeout,
    #[error("shutting down")]
    Closed,
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("all retries exhausted: {0}")]
    RetriesExhausted(String),
    #[error("worker timed out")]
    Timeout,
}

/// Everything derived from a request at ingress.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub source: String,
    pub raw_model: String,
    pub model: ModelFamily,
    pub priority: Priority,
    pub stream: bool,
    pub est_tokens: u64,
    pub session_key: String,
    pub created: i64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct EngineCounters {
    pub stream_retries: u64,
    pub fallbacks: u64,
    pub safety_refusals: u64,
    pub rate_wait_timeouts: u64,
    pub context_overflows: u64,
    pub sync_retries: u64,
}

pub struct Engine {
    pub cfg: ProxyConfig,
    pub queue: FairQueue,
    pub limiter: RateLimiter,
    pub router: Arc<WorkerPool>,
    pub registry: Arc<ProcessRegistry>,
    pub warm: Arc<WarmPool>,
    pub ledger: TokenLedger,
    pub events: Arc<EventLog>,
    pub http: reqwest::Client,
    workers: Vec<WorkerSpec>,
    store: Option<Arc<dyn DurableStore>>,
    counters: Mutex<EngineCounters>,
    next_request: AtomicU64,
    direct_cursor: AtomicU64,
    sweepers: Mutex<Vec<JoinHandle<()>>>,
    started_at: Instant,
}

impl Engine {
    pub fn new(cfg: ProxyConfig, store: Option<Arc<dyn DurableStore>>) -> Arc<Self> {
        let mut event_log = EventLog::new(cfg.max_events);
        if let Some(store) = &store {
            let store = Arc::clone(store);
            let max_events = cfg.max_events;
            event_log = event_log.with_sink(Box::new(move |record| {
                let Ok(json) = serde_json::to_string(record) else {
                    return;
                };
                let name = record.event.event_name();
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    store.list_push("events", json, max_events).await;
                    store.counter_incr("events:nextId").await;
                    store.hash_incr("events:counts", name, 1).await;
                });
            }));
        }
        let events = Arc::new(event_log);
        let workers = cfg.worker_specs();

        let queue = FairQueue::new(cfg.queue_config());

        let mut limiter = RateLimiter::new(cfg.rate_limits());
        if let Some(store) = &store {
            limiter = limiter.with_store(Arc::clone(store));
        }

        let reap_events = Arc::clone(&events);
        let mut registry = ProcessRegistry::new(cfg.reaper_config()).on_reap(Arc::new(
            move |entry: &RegistryEntry| {
                reap_events.publish(Event::WorkerReaped {
                    pid: entry.pid,
                    worker: entry.worker.clone(),
                    request_id: entry.request_id.clone(),
                });
            },
        ));
        let mut ledger = TokenLedger::new();
        if let Some(store) = &store {
            registry = registry.with_store(Arc::clone(store));
            ledger = ledger.with_store(Arc::clone(store));
        }

        let router = WorkerPool::new(
            &workers,
            cfg.router_config(),
            SessionAffinity::new(cfg.affinity_ttl()),
        );
        let warm = WarmPool::new(cfg.warm_config(), &workers);

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Arc::new(Self {
            cfg,
            queue,
            limiter,
            router,
            registry: Arc::new(registry),
            warm,
            ledger,
            events,
            http,
            workers,
            store,
            counters: Mutex::new(EngineCounters::default()),
            next_request: AtomicU64::new(1),
            direct_cursor: AtomicU64::new(0),
            sweepers: Mutex::new(Vec::new()),
            started_at: Instant::now(),
        })
    }

    /// Restore persisted state and start the periodic sweepers.
    pub async fn start(self: &Arc<Self>) {
        for spec in &self.workers {
            let bin = std::path::Path::new(&spec.bin);
            if !bin.exists() && which::which(&spec.bin).is_err() {
                tracing::warn!(
                    worker = %spec.name,
                    bin = %spec.bin,
                    "worker binary not found on PATH; spawns will fail"
                );
            }
        }

        self.registry.restore().await;

        let mut sweepers = self.sweepers.lock().unwrap();
        sweepers.push(self.queue.start_sweeper());
        sweepers.push(self.registry.start_reaper());
        sweepers.push(self.warm.start_sweeper());
        sweepers.push(self.router.start_sweeper());
        if self.store.is_some() {
            sweepers.push(self.start_metrics_snapshots());
        }

        // Hide the first cold start on the primary path.
        if let Some(spec) = self.workers.first() {
            let warm = Arc::clone(&self.warm);
            let key = WarmKey {
                model: ModelFamily::Sonnet,
                stream: true,
                worker: spec.name.clone(),
            };
            tokio::spawn(async move {
                warm.warm_up(&key);
            });
        }
    }

    /// Periodic time-series snapshot into the `metrics:ts` zset. Entries
    /// older than a day are trimmed on each write.
    fn start_metrics_snapshots(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let Some(store) = engine.store.clone() else { break };
                let snapshot = serde_json::json!({
                    "queue": engine.queue.stats(),
                    "workers": engine.router.stats(),
                    "processes": engine.registry.stats(),
                    "tokens": engine.ledger.stats(),
                    "engine": engine.counters(),
                });
                let now = chrono::Utc::now().timestamp() as f64;
                store
                    .zset_add("metrics:ts", now, snapshot.to_string())
                    .await;
                store
                    .zset_remove_below("metrics:ts", now - 86_400.0)
                    .await;
            }
        })
    }

    /// Stop sweepers, reject waiters, terminate every child.
    pub fn shutdown(&self) {
        for sweeper in self.sweepers.lock().unwrap().drain(..) {
            sweeper.abort();
        }
        self.queue.close();
        self.warm.drain();
        self.registry.kill_all();
    }

    /// Derive the per-request context from the parsed body and identity.
    pub fn context(
        &self,
        req: &ChatRequest,
        source: String,
        explicit_session: Option<String>,
    ) -> RequestContext {
        let model = ModelFamily::resolve(&req.model);
        let prompt_chars: usize = req
            .messages
            .iter()
            .filter_map(|m| m.content.as_ref())
            .map(|c| c.to_plaintext().len())
            .sum();
        let session_key = derive_key(
            &source,
            explicit_session.as_deref(),
            req.system_prompt().as_deref(),
        );
        let seq = self.next_request.fetch_add(1, Ordering::Relaxed);
        RequestContext {
            request_id: format!("chatcmpl-oc{}-{}", chrono::Utc::now().timestamp(), seq),
            source,
            raw_model: req.model.clone(),
            model,
            priority: model.priority(),
            stream: req.wants_stream(),
            est_tokens: estimate_tokens(prompt_chars),
            session_key,
            created: chrono::Utc::now().timestamp(),
        }
    }

    /// Admission: one queue slot, then rate-limit clearance, then record.
    pub async fn admit(&self, ctx: &RequestContext) -> Result<Lease, AdmitError> {
        self.events.publish(Event::RequestQueued {
            request_id: ctx.request_id.clone(),
            source: ctx.source.clone(),
            model: ctx.model.as_str().to_string(),
            priority: ctx.priority.as_str().to_string(),
        });

        let lease = match self.queue.acquire(&ctx.source, ctx.priority).await {
            Ok(lease) => lease,
            Err(QueueError::Full { retry_after_ms }) => {
                self.events.publish(Event::QueueRejected {
                    source: ctx.source.clone(),
                });
                return Err(AdmitError::QueueFull { retry_after_ms });
            }
            Err(QueueError::Timeout) => {
                self.events.publish(Event::QueueTimeout {
                    request_id: ctx.request_id.clone(),
                    source: ctx.source.clone(),
                });
                return Err(AdmitError::QueueTimeout);
            }
            Err(QueueError::Closed) => return Err(AdmitError::Closed),
        };

        let deadline = Instant::now() + RATE_WAIT_CAP;
        loop {
            let check = self.limiter.check(ctx.model, ctx.est_tokens);
            if check.ok {
                break;
            }
            if Instant::now() >= deadline {
                self.counters.lock().unwrap().rate_wait_timeouts += 1;
                lease.release();
                return Err(AdmitError::RateWaitTimeout);
            }
            tokio::time::sleep(check.wait.min(RATE_WAIT_SLICE)).await;
        }
        self.limiter.record(ctx.model, ctx.est_tokens);
        Ok(lease)
    }

    /// True when tool-carrying requests can bypass the workers.
    pub fn direct_api_available(&self) -> bool {
        !self.cfg.token_pool.is_empty()
    }

    /// Round-robin over the direct-API credential pool.
    pub fn next_credential(&self) -> Option<&crate::config::PoolCredential> {
        if self.cfg.token_pool.is_empty() {
            return None;
        }
        let idx = self.direct_cursor.fetch_add(1, Ordering::Relaxed) as usize;
        Some(&self.cfg.token_pool[idx % self.cfg.token_pool.len()])
    }

    pub fn spec_for(&self, worker: &str) -> Option<&WorkerSpec> {
        self.workers.iter().find(|s| s.name == worker)
    }

    /// Warm acquire falling back to a cold spawn.
    pub fn obtain_worker(
        self: &Arc<Self>,
        worker: &str,
        model: ModelFamily,
        stream: bool,
    ) -> Result<(WorkerProcess, bool), openclaw_core::SpawnError> {
        let key = WarmKey {
            model,
            stream,
            worker: worker.to_string(),
        };
        if let Some(proc) = self.warm.acquire(&key) {
            self.events.publish(Event::WarmConsumed {
                key: key.to_string(),
            });
            return Ok((proc, true));
        }
        let spec = self.spec_for(worker).expect("worker came from the router");
        let proc = WorkerProcess::spawn(spec, model, stream)?;
        Ok((proc, false))
    }

    pub fn track(&self, ctx: &RequestContext, proc: &WorkerProcess, mode: WorkerMode) {
        self.registry.register(RegistryEntry::new(
            proc.pid,
            ctx.request_id.clone(),
            ctx.model,
            mode,
            ctx.source.clone(),
            proc.worker.clone(),
        ));
        self.events.publish(Event::WorkerSpawned {
            pid: proc.pid,
            worker: proc.worker.clone(),
            request_id: ctx.request_id.clone(),
        });
    }

    pub fn bump(&self, f: impl FnOnce(&mut EngineCounters)) {
        f(&mut self.counters.lock().unwrap());
    }

    pub fn counters(&self) -> EngineCounters {
        *self.counters.lock().unwrap()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Jittered exponential backoff for the sync path.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = Duration::from_millis(self.cfg.retry_base_ms);
        let exp = base.saturating_mul(2u32.saturating_pow(attempt));
        let capped = exp.min(RETRY_MAX_DELAY);
        let jitter = 1.0 + rand::random::<f64>() * RETRY_JITTER;
        capped.mul_f64(jitter)
    }

    /// Non-streaming CLI path: run a worker to completion with retries.
    pub async fn run_sync(
        self: &Arc<Self>,
        ctx: &RequestContext,
        system: Option<&str>,
        prompt_text: &str,
    ) -> Result<Value, WorkerError> {
        let payload = prompt::build_payload(system, prompt_text);
        let mut last_error = String::new();

        for attempt in 0..=self.cfg.max_retries {
            if attempt > 0 {
                self.bump(|c| c.sync_retries += 1);
                tokio::time::sleep(self.backoff_delay(attempt - 1)).await;
            }

            let Some(worker) = self.router.select(Some(ctx.session_key.as_str())) else {
                last_error = "no healthy worker".to_string();
                continue;
            };

            match self.sync_attempt(ctx, &worker, &payload).await {
                SyncAttempt::Done {
                    text,
                    input_tokens,
                    output_tokens,
                } => {
                    self.ledger
                        .record(&ctx.request_id, ctx.model, input_tokens, output_tokens);
                    self.events.publish(Event::RequestCompleted {
                        request_id: ctx.request_id.clone(),
                        source: ctx.source.clone(),
                        input_tokens,
                        output_tokens,
                        duration_ms: 0,
                    });
                    let message = serde_json::json!({"role": "assistant", "content": text});
                    return Ok(completion_body(
                        &ctx.request_id,
                        ctx.created,
                        &ctx.raw_model,
                        message,
                        "stop",
                        input_tokens,
                        output_tokens,
                    ));
                }
                SyncAttempt::Transient { error, rate_limited } => {
                    if rate_limited {
                        self.router.mark_limited(&worker);
                        self.events.publish(Event::WorkerLimited {
                            worker: worker.clone(),
                        });
                    }
                    tracing::warn!(
                        request = %ctx.request_id,
                        worker = %worker,
                        attempt,
                        error = %error,
                        "sync attempt failed"
                    );
                    last_error = error;
                }
                SyncAttempt::Timeout => {
                    return Err(WorkerError::Timeout);
                }
            }
        }

        self.events.publish(Event::RequestFailed {
            request_id: ctx.request_id.clone(),
            source: ctx.source.clone(),
            reason: last_error.clone(),
        });
        Err(WorkerError::RetriesExhausted(last_error))
    }

    async fn sync_attempt(
        self: &Arc<Self>,
        ctx: &RequestContext,
        worker: &str,
        payload: &str,
    ) -> SyncAttempt {
        let mut proc = match self.obtain_worker(worker, ctx.model, false) {
            Ok((proc, _warm)) => proc,
            Err(err) => {
                self.router.on_complete(worker);
                return SyncAttempt::Transient {
                    error: err.to_string(),
                    rate_limited: false,
                };
            }
        };
        self.track(ctx, &proc, WorkerMode::Sync);

        if let Err(err) = proc.send_payload(payload).await {
            // The exit status below tells the real story.
            tracing::debug!(pid = proc.pid, %err, "payload write failed");
        }

        let pid = proc.pid;
        let collected = tokio::time::timeout(self.cfg.sync_timeout(), async {
            let mut output = WorkerOutput::new();
            let mut stderr_tail = String::new();
            while let Some(line) = proc.next_line().await {
                match line {
                    openclaw_core::WorkerLine::Out(text) => {
                        self.registry.touch(pid, 0, 0);
                        output.ingest(&text);
                    }
                    openclaw_core::WorkerLine::Err(text) => {
                        stderr_tail.push_str(&text);
                        stderr_tail.push('\n');
                    }
                }
            }
            let status = proc.wait().await;
            (output, stderr_tail, status)
        })
        .await;

        self.router.on_complete(worker);
        self.registry.unregister(pid);

        let (output, stderr_tail, status) = match collected {
            Ok(v) => v,
            Err(_) => {
                proc.terminate();
                return SyncAttempt::Timeout;
            }
        };

        let exit_code = status.ok().and_then(|s| s.code());
        self.events.publish(Event::WorkerExited {
            pid,
            worker: worker.to_string(),
            exit_code,
        });

        match exit_code {
            Some(0) => {
                let text = output.collected_text();
                let input = output
                    .input_tokens
                    .unwrap_or_else(|| estimate_tokens(payload.len()));
                let out_tokens = output
                    .output_tokens
                    .unwrap_or_else(|| estimate_tokens(text.len()));
                SyncAttempt::Done {
                    text,
                    input_tokens: input,
                    output_tokens: out_tokens,
                }
            }
            code => {
                let rate_limited =
                    openclaw_core::router::is_rate_limit_error(&stderr_tail)
                        || openclaw_core::router::is_rate_limit_error(&output.collected_text());
                SyncAttempt::Transient {
                    error: format!(
                        "worker exited with {:?}: {}",
                        code,
                        stderr_tail.trim().chars().take(200).collect::<String>()
                    ),
                    rate_limited,
                }
            }
        }
    }
}

enum SyncAttempt {
    Done {
        text: String,
        input_tokens: u64,
        output_tokens: u64,
    },
    Transient {
        error: String,
        rate_limited: bool,
    },
    Timeout,
}
