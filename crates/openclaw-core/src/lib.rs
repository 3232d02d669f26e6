//! Request dispatch and worker lifecycle engine.
//!
//! The proxy front-end (`openclaw-proxy`) composes these pieces per request:
//!
//! ```text
//! source -> FairQueue -> RateLimiter -> WorkerPool (+ WarmPool) -> worker process
//! ```
//!
//! Every component owns its own state behind a lock and exposes owned
//! snapshot types for observability; nothing here hands out live references
//! to internal maps.

pub mod affinity;
pub mod error;
pub mod model;
pub mod queue;
pub mod rate_limit;
pub mod registry;
pub mod router;
pub mod spawn;
pub mod store;
pub mod tokens;
pub mod warm;

pub use error::{QueueError, SpawnError};
pub use model::{ModelFamily, Priority};
pub use queue::{FairQueue, Lease, QueueConfig};
pub use rate_limit::{RateCheck, RateLimiter, RateLimits};
pub use registry::{ProcessRegistry, ReaperConfig, RegistryEntry, WorkerMode};
pub use router::{PoolMode, RouterConfig, WorkerPool};
pub use spawn::{TokenKind, WorkerLine, WorkerProcess, WorkerSpec};
pub use store::{DurableStore, MemoryStore};
pub use tokens::TokenLedger;
pub use warm::{WarmKey, WarmPool, WarmPoolConfig};
