//! `openclaw-proxy` binary entrypoint.

use std::sync::Arc;

use openclaw_core::store::{DurableStore, MemoryStore};
use openclaw_proxy::{serve, Engine, ProxyConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Respect `RUST_LOG` if set; otherwise default to proxy-friendly info.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = ProxyConfig::load()?;

    // In-process store; a networked implementation slots in behind the
    // same trait for cross-restart continuity.
    let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
    let engine = Engine::new(config, Some(store));

    serve(engine).await
}
