use serde::{Deserialize, Serialize};

/// Everything the engine reports about a request's and a worker's life.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // Request lifecycle
    RequestQueued {
        request_id: String,
        source: String,
        model: String,
        priority: String,
    },
    RequestStarted {
        request_id: String,
        source: String,
        worker: String,
        warm: bool,
    },
    RequestCompleted {
        request_id: String,
        source: String,
        input_tokens: u64,
        output_tokens: u64,
        duration_ms: u64,
    },
    RequestFailed {
        request_id: String,
        source: String,
        reason: String,
    },
    QueueRejected {
        source: String,
    },
    QueueTimeout {
        request_id: String,
        source: String,
    },

    // Worker lifecycle
    WorkerSpawned {
        pid: u32,
        worker: String,
        request_id: String,
    },
    WorkerExited {
        pid: u32,
        worker: String,
        exit_code: Option<i32>,
    },
    WorkerLimited {
        worker: String,
    },
    WorkerReaped {
        pid: u32,
        worker: String,
        request_id: String,
    },

    // Warm pool
    WarmSpawned {
        key: String,
    },
    WarmConsumed {
        key: String,
    },

    // Streaming engine
    StreamRetry {
        request_id: String,
        from_worker: String,
        to_worker: String,
        attempt: usize,
    },
    FallbackUsed {
        request_id: String,
        source: String,
    },
    SafetyRefusal {
        request_id: String,
        worker: String,
    },
}

impl Event {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::RequestQueued { .. } => "request_queued",
            Self::RequestStarted { .. } => "request_started",
            Self::RequestCompleted { .. } => "request_completed",
            Self::RequestFailed { .. } => "request_failed",
            Self::QueueRejected { .. } => "queue_rejected",
            Self::QueueTimeout { .. } => "queue_timeout",
            Self::WorkerSpawned { .. } => "worker_spawned",
            Self::WorkerExited { .. } => "worker_exited",
            Self::WorkerLimited { .. } => "worker_limited",
            Self::WorkerReaped { .. } => "worker_reaped",
            Self::WarmSpawned { .. } => "warm_spawned",
            Self::WarmConsumed { .. } => "warm_consumed",
            Self::StreamRetry { .. } => "stream_retry",
            Self::FallbackUsed { .. } => "fallback_used",
            Self::SafetyRefusal { .. } => "safety_refusal",
        }
    }
}
