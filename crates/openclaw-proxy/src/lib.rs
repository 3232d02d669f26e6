//! OpenAI-compatible multi-tenant proxy over a pool of CLI agent workers.
//!
//! Clients speak `/v1/chat/completions`; the proxy queues their requests
//! fairly per source, throttles per model, routes to the least-loaded
//! healthy worker (warm-started when possible), streams the worker's
//! line-JSON output back as SSE chunks, retries quick failures on other
//! workers, and falls back to an HTTP API when the pool is exhausted.
//! Tool-carrying requests bypass the workers and go to the native HTTP API
//! directly.

pub mod config;
pub mod direct;
pub mod engine;
pub mod fallback;
pub mod prompt;
pub mod server;
pub mod source;
pub mod stream;
pub mod translation;
pub mod types;

pub use config::ProxyConfig;
pub use engine::Engine;
pub use server::serve;
