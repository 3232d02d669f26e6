use thiserror::Error;

/// Why a queue slot could not be granted.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// Total or per-source queue cap reached.
    #[error("queue full, retry after {retry_after_ms}ms")]
    Full { retry_after_ms: u64 },

    /// Waited longer than the configured queue timeout.
    #[error("timed out waiting for a queue slot")]
    Timeout,

    /// The queue was shut down while the caller was waiting.
    #[error("queue closed")]
    Closed,
}

/// Worker process spawn failures.
#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("failed to spawn worker '{worker}': {source}")]
    Spawn {
        worker: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worker '{worker}' spawned without a {stream} handle")]
    MissingPipe {
        worker: String,
        stream: &'static str,
    },

    #[error("failed to write payload to worker stdin: {0}")]
    Stdin(#[from] std::io::Error),
}
