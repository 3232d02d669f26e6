//! Per-model sliding-window rate limiter.
//!
//! A 60-second window of `(timestamp, estimated tokens)` events per model.
//! Trimming is lazy: events age out by becoming invisible at read time, so
//! no background sweeper is needed. Counters here are authoritative; the
//! optional store mirror exists for cross-restart observability only.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::time::Instant;

use crate::model::ModelFamily;
use crate::store::DurableStore;

const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ModelLimit {
    pub requests_per_min: u32,
    pub tokens_per_min: u64,
}

/// Per-family ceilings.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimits {
    pub opus: ModelLimit,
    pub sonnet: ModelLimit,
    pub haiku: ModelLimit,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            opus: ModelLimit {
                requests_per_min: 4,
                tokens_per_min: 80_000,
            },
            sonnet: ModelLimit {
                requests_per_min: 10,
                tokens_per_min: 160_000,
            },
            haiku: ModelLimit {
                requests_per_min: 20,
                tokens_per_min: 200_000,
            },
        }
    }
}

impl RateLimits {
    fn limit(&self, model: ModelFamily) -> ModelLimit {
        match model {
            ModelFamily::Opus => self.opus,
            ModelFamily::Sonnet => self.sonnet,
            ModelFamily::Haiku => self.haiku,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitReason {
    Requests,
    Tokens,
}

/// Outcome of a pre-flight check.
#[derive(Debug, Clone, Copy)]
pub struct RateCheck {
    pub ok: bool,
    pub wait: Duration,
    pub reason: Option<RateLimitReason>,
}

impl RateCheck {
    fn ok() -> Self {
        Self {
            ok: true,
            wait: Duration::ZERO,
            reason: None,
        }
    }
}

pub struct RateLimiter {
    limits: RateLimits,
    windows: Mutex<HashMap<ModelFamily, Vec<(Instant, u64)>>>,
    store: Option<Arc<dyn DurableStore>>,
}

impl RateLimiter {
    pub fn new(limits: RateLimits) -> Self {
        Self {
            limits,
            windows: Mutex::new(HashMap::new()),
            store: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// May this request proceed now, and if not, for how long should the
    /// caller sleep before asking again.
    pub fn check(&self, model: ModelFamily, est_tokens: u64) -> RateCheck {
        let limit = self.limits.limit(model);
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap();
        let window = windows.entry(model).or_default();
        window.retain(|(ts, _)| now.duration_since(*ts) < WINDOW);

        let oldest_wait = |window: &Vec<(Instant, u64)>| {
            let age = window
                .first()
                .map(|(ts, _)| now.duration_since(*ts))
                .unwrap_or(Duration::ZERO);
            (WINDOW.saturating_sub(age)).max(Duration::from_secs(1))
        };

        if window.len() as u32 >= limit.requests_per_min {
            return RateCheck {
                ok: false,
                wait: oldest_wait(window),
                reason: Some(RateLimitReason::Requests),
            };
        }

        let live_tokens: u64 = window.iter().map(|(_, t)| t).sum();
        if live_tokens + est_tokens > limit.tokens_per_min {
            // A single request larger than the ceiling can never be split;
            // with an empty window it is admitted and the upstream enforces.
            if window.is_empty() {
                return RateCheck::ok();
            }
            return RateCheck {
                ok: false,
                wait: oldest_wait(window),
                reason: Some(RateLimitReason::Tokens),
            };
        }

        RateCheck::ok()
    }

    /// Account a request that is about to run.
    pub fn record(&self, model: ModelFamily, est_tokens: u64) {
        let now = Instant::now();
        {
            let mut windows = self.windows.lock().unwrap();
            windows.entry(model).or_default().push((now, est_tokens));
        }

        if let Some(store) = &self.store {
            let store = Arc::clone(store);
            let unix_ms = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as f64;
            tokio::spawn(async move {
                let key = format!("rate:{model}");
                store
                    .zset_add(&key, unix_ms, format!("{unix_ms}:{est_tokens}"))
                    .await;
                store
                    .zset_remove_below(&key, unix_ms - WINDOW.as_millis() as f64)
                    .await;
            });
        }
    }

    pub fn stats(&self) -> RateStats {
        let now = Instant::now();
        let windows = self.windows.lock().unwrap();
        let per_model = ModelFamily::all()
            .into_iter()
            .map(|model| {
                let (requests, tokens) = windows
                    .get(&model)
                    .map(|w| {
                        let live: Vec<_> = w
                            .iter()
                            .filter(|(ts, _)| now.duration_since(*ts) < WINDOW)
                            .collect();
                        (live.len() as u32, live.iter().map(|(_, t)| t).sum())
                    })
                    .unwrap_or((0, 0));
                (
                    model.as_str().to_string(),
                    ModelRateStats {
                        live_requests: requests,
                        live_tokens: tokens,
                        limit: self.limits.limit(model),
                    },
                )
            })
            .collect();
        RateStats { per_model }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RateStats {
    pub per_model: HashMap<String, ModelRateStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelRateStats {
    pub live_requests: u32,
    pub live_tokens: u64,
    pub limit: ModelLimit,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(rpm: u32, tpm: u64) -> RateLimits {
        let limit = ModelLimit {
            requests_per_min: rpm,
            tokens_per_min: tpm,
        };
        RateLimits {
            opus: limit,
            sonnet: limit,
            haiku: limit,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn requests_ceiling_produces_wait_hint() {
        let limiter = RateLimiter::new(limits(1, 1_000_000));
        limiter.record(ModelFamily::Sonnet, 100);

        tokio::time::advance(Duration::from_secs(30)).await;
        let check = limiter.check(ModelFamily::Sonnet, 100);
        assert!(!check.ok);
        assert_eq!(check.reason, Some(RateLimitReason::Requests));
        // Oldest event is 30s old: wait out the remaining half window.
        assert_eq!(check.wait, Duration::from_secs(30));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(limiter.check(ModelFamily::Sonnet, 100).ok);
    }

    #[tokio::test(start_paused = true)]
    async fn token_ceiling_blocks_when_window_nonempty() {
        let limiter = RateLimiter::new(limits(100, 1_000));
        limiter.record(ModelFamily::Opus, 900);
        let check = limiter.check(ModelFamily::Opus, 200);
        assert!(!check.ok);
        assert_eq!(check.reason, Some(RateLimitReason::Tokens));
        assert!(check.wait >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn oversized_request_admitted_on_empty_window() {
        let limiter = RateLimiter::new(limits(10, 1_000));
        // First request over the token ceiling: cannot be split, admit it.
        assert!(limiter.check(ModelFamily::Haiku, 50_000).ok);
        limiter.record(ModelFamily::Haiku, 50_000);
        // Second one must wait.
        assert!(!limiter.check(ModelFamily::Haiku, 10).ok);
    }

    #[tokio::test(start_paused = true)]
    async fn window_expiry_is_lazy() {
        let limiter = RateLimiter::new(limits(2, 1_000_000));
        limiter.record(ModelFamily::Sonnet, 10);
        limiter.record(ModelFamily::Sonnet, 10);
        assert!(!limiter.check(ModelFamily::Sonnet, 10).ok);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(limiter.check(ModelFamily::Sonnet, 10).ok);
        let stats = limiter.stats();
        assert_eq!(stats.per_model.get("sonnet").unwrap().live_requests, 0);
    }

    #[tokio::test]
    async fn wait_floor_is_one_second() {
        let limiter = RateLimiter::new(limits(1, 1_000_000));
        limiter.record(ModelFamily::Sonnet, 1);
        let check = limiter.check(ModelFamily::Sonnet, 1);
        assert!(check.wait >= Duration::from_secs(1));
    }
}
