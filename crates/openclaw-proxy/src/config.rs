//! Configuration from `openclaw.yml` plus environment overrides.
//!
//! Every knob has a default so a bare `openclaw-proxy` run works against a
//! single `claude` binary found on PATH. `OPENCLAW_CONFIG` points at an
//! alternative YAML file; `OPENCLAW_PORT` and `OPENCLAW_AUTH_TOKEN`
//! override the scalar essentials without touching the file.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use openclaw_core::queue::QueueConfig;
use openclaw_core::rate_limit::{ModelLimit, RateLimits};
use openclaw_core::registry::ReaperConfig;
use openclaw_core::router::RouterConfig;
use openclaw_core::spawn::{TokenKind, WorkerSpec};
use openclaw_core::warm::WarmPoolConfig;
use openclaw_core::ModelFamily;
use serde::Deserialize;

/// Auth token value that opens the proxy to unauthenticated traffic.
pub const OPEN_AUTH_SENTINEL: &str = "open";

fn default_port() -> u16 {
    8484
}
fn default_max_concurrent() -> usize {
    4
}
fn default_max_queue_total() -> usize {
    64
}
fn default_max_queue_per_source() -> usize {
    16
}
fn default_source_concurrency() -> usize {
    2
}
fn default_queue_timeout_ms() -> u64 {
    120_000
}
fn default_max_lease_ms() -> u64 {
    600_000
}
fn default_sync_timeout_ms() -> u64 {
    300_000
}
fn default_stream_timeout_ms() -> u64 {
    1_800_000
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_ms() -> u64 {
    1_000
}
fn default_max_process_age_ms() -> u64 {
    3_600_000
}
fn default_max_idle_ms() -> u64 {
    900_000
}
fn default_reaper_interval_ms() -> u64 {
    60_000
}
fn default_health_check_ms() -> u64 {
    300_000
}
fn default_max_prompt_chars() -> usize {
    160_000
}
fn default_affinity_ttl_ms() -> u64 {
    300_000
}
fn default_max_events() -> usize {
    2_000
}
fn default_worker_bin() -> String {
    "claude".to_string()
}
fn default_true() -> bool {
    true
}
fn default_warm_size() -> usize {
    1
}
fn default_warm_max_age_ms() -> u64 {
    600_000
}
fn default_anthropic_base_url() -> String {
    "https://api.anthropic.com".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    /// Static bearer token. `None` or the sentinel `"open"` disables auth.
    #[serde(default)]
    pub auth_token: Option<String>,

    #[serde(default)]
    pub workers: Vec<WorkerEntry>,
    #[serde(default)]
    pub primary_worker: Option<String>,
    #[serde(default = "default_health_check_ms")]
    pub health_check_ms: u64,

    /// Direct-API credentials for tool-capable requests.
    #[serde(default)]
    pub token_pool: Vec<PoolCredential>,
    #[serde(default = "default_anthropic_base_url")]
    pub direct_api_base_url: String,

    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_max_queue_total")]
    pub max_queue_total: usize,
    #[serde(default = "default_max_queue_per_source")]
    pub max_queue_per_source: usize,
    #[serde(default)]
    pub source_concurrency_limits: HashMap<String, usize>,
    #[serde(default = "default_source_concurrency")]
    pub default_source_concurrency: usize,
    #[serde(default = "default_queue_timeout_ms")]
    pub queue_timeout_ms: u64,
    #[serde(default = "default_max_lease_ms")]
    pub max_lease_ms: u64,

    #[serde(default = "default_sync_timeout_ms")]
    pub sync_timeout_ms: u64,
    #[serde(default = "default_stream_timeout_ms")]
    pub stream_timeout_ms: u64,
    #[serde(default)]
    pub heartbeat_by_model: HeartbeatByModel,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    #[serde(default = "default_max_process_age_ms")]
    pub max_process_age_ms: u64,
    #[serde(default = "default_max_idle_ms")]
    pub max_idle_ms: u64,
    #[serde(default = "default_reaper_interval_ms")]
    pub reaper_interval_ms: u64,

    #[serde(default)]
    pub warm_pool: WarmPoolEntry,

    #[serde(default)]
    pub rate_limits: RateLimitsEntry,

    #[serde(default = "default_max_prompt_chars")]
    pub max_prompt_chars: usize,
    #[serde(default = "default_affinity_ttl_ms")]
    pub affinity_ttl_ms: u64,
    #[serde(default = "default_max_events")]
    pub max_events: usize,

    #[serde(default)]
    pub fallback_api: Option<FallbackApi>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty config deserializes via defaults")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerEntry {
    pub name: String,
    #[serde(default = "default_worker_bin")]
    pub bin: String,
    #[serde(default)]
    pub args: Option<Vec<String>>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub token_kind: Option<TokenKind>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolCredential {
    pub name: String,
    pub token: String,
    #[serde(default)]
    pub kind: TokenKind,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FallbackApi {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct HeartbeatByModel {
    #[serde(default = "HeartbeatByModel::default_opus")]
    pub opus: u64,
    #[serde(default = "HeartbeatByModel::default_sonnet")]
    pub sonnet: u64,
    #[serde(default = "HeartbeatByModel::default_haiku")]
    pub haiku: u64,
}

impl HeartbeatByModel {
    fn default_opus() -> u64 {
        ModelFamily::Opus.default_heartbeat().as_millis() as u64
    }
    fn default_sonnet() -> u64 {
        ModelFamily::Sonnet.default_heartbeat().as_millis() as u64
    }
    fn default_haiku() -> u64 {
        ModelFamily::Haiku.default_heartbeat().as_millis() as u64
    }

    pub fn for_model(&self, model: ModelFamily) -> Duration {
        Duration::from_millis(match model {
            ModelFamily::Opus => self.opus,
            ModelFamily::Sonnet => self.sonnet,
            ModelFamily::Haiku => self.haiku,
        })
    }
}

impl Default for HeartbeatByModel {
    fn default() -> Self {
        Self {
            opus: Self::default_opus(),
            sonnet: Self::default_sonnet(),
            haiku: Self::default_haiku(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WarmPoolEntry {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_warm_size")]
    pub size: usize,
    #[serde(default = "default_warm_max_age_ms")]
    pub max_age_ms: u64,
}

impl Default for WarmPoolEntry {
    fn default() -> Self {
        Self {
            enabled: true,
            size: default_warm_size(),
            max_age_ms: default_warm_max_age_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct RateLimitsEntry {
    #[serde(default)]
    pub opus: Option<ModelLimitEntry>,
    #[serde(default)]
    pub sonnet: Option<ModelLimitEntry>,
    #[serde(default)]
    pub haiku: Option<ModelLimitEntry>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ModelLimitEntry {
    pub requests_per_min: u32,
    pub tokens_per_min: u64,
}

impl ProxyConfig {
    /// Load from `OPENCLAW_CONFIG` (or `./openclaw.yml` when present),
    /// then apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = std::env::var("OPENCLAW_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("openclaw.yml"));

        let mut config = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read config from {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            Self::default()
        };

        if let Ok(port) = std::env::var("OPENCLAW_PORT") {
            config.port = port.parse().context("OPENCLAW_PORT is not a port")?;
        }
        if let Ok(token) = std::env::var("OPENCLAW_AUTH_TOKEN") {
            config.auth_token = Some(token);
        }
        Ok(config)
    }

    pub fn auth_enabled(&self) -> bool {
        match &self.auth_token {
            None => false,
            Some(token) => token != OPEN_AUTH_SENTINEL,
        }
    }

    /// Worker specs, defaulting to a single `claude` binary when the file
    /// names none.
    pub fn worker_specs(&self) -> Vec<WorkerSpec> {
        let entries: Vec<WorkerSpec> = self
            .workers
            .iter()
            .map(|w| WorkerSpec {
                name: w.name.clone(),
                bin: w.bin.clone(),
                args: w.args.clone(),
                token: w.token.clone(),
                token_kind: w.token_kind.unwrap_or_default(),
            })
            .collect();
        if entries.is_empty() {
            vec![WorkerSpec {
                name: "default".to_string(),
                bin: default_worker_bin(),
                args: None,
                token: None,
                token_kind: TokenKind::Flat,
            }]
        } else {
            entries
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_concurrent: self.max_concurrent,
            max_queue_total: self.max_queue_total,
            max_queue_per_source: self.max_queue_per_source,
            default_source_concurrency: self.default_source_concurrency,
            source_concurrency: self.source_concurrency_limits.clone(),
            queue_timeout: Duration::from_millis(self.queue_timeout_ms),
            max_lease: Duration::from_millis(self.max_lease_ms),
            sweep_interval: Duration::from_secs(5),
        }
    }

    pub fn reaper_config(&self) -> ReaperConfig {
        ReaperConfig {
            max_age: Duration::from_millis(self.max_process_age_ms),
            max_idle: Duration::from_millis(self.max_idle_ms),
            interval: Duration::from_millis(self.reaper_interval_ms),
        }
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            primary: self.primary_worker.clone(),
            health_check: Duration::from_millis(self.health_check_ms),
            sweep_interval: Duration::from_secs(60),
        }
    }

    pub fn warm_config(&self) -> WarmPoolConfig {
        WarmPoolConfig {
            enabled: self.warm_pool.enabled,
            max_per_key: self.warm_pool.size,
            max_age: Duration::from_millis(self.warm_pool.max_age_ms),
            sweep_interval: Duration::from_secs(30),
        }
    }

    pub fn rate_limits(&self) -> RateLimits {
        let defaults = RateLimits::default();
        let pick = |entry: Option<ModelLimitEntry>, fallback: ModelLimit| {
            entry
                .map(|e| ModelLimit {
                    requests_per_min: e.requests_per_min,
                    tokens_per_min: e.tokens_per_min,
                })
                .unwrap_or(fallback)
        };
        RateLimits {
            opus: pick(self.rate_limits.opus, defaults.opus),
            sonnet: pick(self.rate_limits.sonnet, defaults.sonnet),
            haiku: pick(self.rate_limits.haiku, defaults.haiku),
        }
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_timeout_ms)
    }

    pub fn affinity_ttl(&self) -> Duration {
        Duration::from_millis(self.affinity_ttl_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_complete() {
        let config = ProxyConfig::default();
        assert_eq!(config.port, 8484);
        assert!(!config.auth_enabled());
        assert_eq!(config.worker_specs().len(), 1);
        assert_eq!(config.worker_specs()[0].bin, "claude");
        assert!(config.warm_pool.enabled);
        assert!(config.fallback_api.is_none());
    }

    #[test]
    fn yaml_overrides_defaults() {
        let yaml = r#"
port: 9000
auth_token: secret
workers:
  - name: primary
    bin: /usr/local/bin/claude
    token: tok-1
    token_kind: metered
  - name: backup
primary_worker: primary
max_concurrent: 8
source_concurrency_limits:
  cli: 4
rate_limits:
  opus:
    requests_per_min: 2
    tokens_per_min: 40000
heartbeat_by_model:
  haiku: 30000
fallback_api:
  base_url: https://fallback.example/v1
  api_key: fk-1
  model: gpt-4o-mini
"#;
        let config: ProxyConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.port, 9000);
        assert!(config.auth_enabled());
        let specs = config.worker_specs();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].token_kind, TokenKind::Metered);
        assert_eq!(specs[1].bin, "claude");
        assert_eq!(config.queue_config().max_concurrent, 8);
        assert_eq!(
            config.queue_config().source_concurrency.get("cli"),
            Some(&4)
        );
        assert_eq!(config.rate_limits().opus.requests_per_min, 2);
        // Unset families keep defaults.
        assert_eq!(
            config.rate_limits().sonnet.requests_per_min,
            RateLimits::default().sonnet.requests_per_min
        );
        assert_eq!(
            config
                .heartbeat_by_model
                .for_model(ModelFamily::Haiku),
            Duration::from_secs(30)
        );
        assert!(config.fallback_api.is_some());
    }

    #[test]
    fn open_sentinel_disables_auth() {
        let config: ProxyConfig = serde_yaml::from_str("auth_token: open").unwrap();
        assert!(!config.auth_enabled());
    }
}
