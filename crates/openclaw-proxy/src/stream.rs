//! The streaming state machine.
//!
//! One attempt = one worker process: spawn (warm if possible), write the
//! payload, interpret line-JSON events into OpenAI deltas, keep the SSE
//! connection alive, and police first-byte, heartbeat and absolute timers.
//! A quick fail (non-zero exit, zero bytes sent, under five seconds) moves
//! the request to an untried worker; once anything reached the client there
//! is exactly one response and no retry. Exhausted pools fall back to the
//! HTTP API. Every path ends the stream with a terminating chunk and
//! `data: [DONE]`.

use std::sync::Arc;
use std::time::Duration;

use openclaw_core::queue::Lease;
use openclaw_core::registry::WorkerMode;
use openclaw_core::router::is_rate_limit_error;
use openclaw_core::spawn::WorkerLine;
use openclaw_core::tokens::estimate_tokens;
use openclaw_events::Event;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::engine::{Engine, RequestContext};
use crate::fallback;
use crate::prompt;
use crate::types::{sse_chunk, sse_comment, sse_done};

/// Warn-only: how long we let the first worker byte take.
const FIRST_BYTE_WARN: Duration = Duration::from_secs(8);
/// Keepalive cadence before / after the first real output.
const KEEPALIVE_INITIAL: Duration = Duration::from_secs(5);
const KEEPALIVE_RELAXED: Duration = Duration::from_secs(30);
/// A failure this fast with nothing sent is safe to retry elsewhere.
const QUICK_FAIL_WINDOW: Duration = Duration::from_secs(5);
/// Grace between TERM and giving up on `wait`.
const TERM_GRACE: Duration = Duration::from_secs(5);

/// Outputs below this size are scanned for refusal phrases.
const REFUSAL_SCAN_LIMIT: usize = 2_048;
const REFUSAL_MARKERS: &[&str] = &[
    "i cannot",
    "i can't",
    "i am not able",
    "i'm not able",
    "not authorized",
    "safety concern",
    "against my guidelines",
];

pub fn is_safety_refusal(text: &str) -> bool {
    if text.len() >= REFUSAL_SCAN_LIMIT {
        return false;
    }
    let lower = text.to_lowercase();
    REFUSAL_MARKERS.iter().any(|m| lower.contains(m))
}

/// Interprets the worker's line-JSON events. Shared by the streaming and
/// sync paths; `ingest` returns text that should reach the client now.
#[derive(Debug, Default)]
pub struct WorkerOutput {
    forwarded: Vec<String>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

impl WorkerOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content_sent(&self) -> bool {
        !self.forwarded.is_empty()
    }

    pub fn collected_text(&self) -> String {
        self.forwarded.concat()
    }

    pub fn ingest(&mut self, line: &str) -> Option<String> {
        let v: Value = serde_json::from_str(line.trim()).ok()?;

        if let Some(usage) = v.get("usage").or_else(|| v.pointer("/message/usage")) {
            self.update_usage(usage);
        }

        let text = match v.get("type").and_then(|t| t.as_str()) {
            Some("stream_event") => {
                let event = v.get("event")?;
                if let Some(usage) = event.get("usage") {
                    self.update_usage(usage);
                }
                match event.get("type").and_then(|t| t.as_str()) {
                    Some("content_block_delta") => event
                        .pointer("/delta/text")
                        .and_then(|t| t.as_str())
                        .map(|t| t.to_string()),
                    Some("message_delta") => {
                        if let Some(usage) = event.pointer("/usage") {
                            self.update_usage(usage);
                        }
                        None
                    }
                    _ => None,
                }
            }
            Some("assistant") => {
                if self.content_sent() {
                    None
                } else {
                    let blocks = v
                        .pointer("/message/content")
                        .or_else(|| v.get("content"))
                        .and_then(|c| c.as_array());
                    blocks.map(|blocks| {
                        blocks
                            .iter()
                            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                            .collect::<String>()
                    })
                }
            }
            Some("content_block_delta") => v
                .pointer("/delta/text")
                .and_then(|t| t.as_str())
                .map(|t| t.to_string()),
            Some("result") => {
                if self.content_sent() {
                    None
                } else {
                    v.get("result").and_then(|r| r.as_str()).map(|r| r.to_string())
                }
            }
            _ => None,
        };

        let text = text.filter(|t| !t.is_empty())?;
        self.forwarded.push(text.clone());
        Some(text)
    }

    fn update_usage(&mut self, usage: &Value) {
        let field = |name: &str| usage.get(name).and_then(|v| v.as_u64());
        let input = field("input_tokens").unwrap_or(0)
            + field("cache_creation_input_tokens").unwrap_or(0)
            + field("cache_read_input_tokens").unwrap_or(0);
        if input > 0 {
            self.input_tokens = Some(input);
        }
        if let Some(output) = field("output_tokens") {
            self.output_tokens = Some(output);
        }
    }
}

enum AttemptEnd {
    /// Worker exited; zero code means success regardless of output volume.
    Exited(Option<i32>),
    Heartbeat,
    Timeout,
    ClientGone,
    SpawnFailed(String),
}

struct Attempt {
    end: AttemptEnd,
    output: WorkerOutput,
    stderr: String,
    elapsed: Duration,
}

/// Drive one streaming request end to end. Holds the queue lease for the
/// duration; the lease drops (and releases) when this returns.
pub async fn stream_chat(
    engine: Arc<Engine>,
    ctx: RequestContext,
    system: Option<String>,
    prompt_text: String,
    lease: Lease,
    tx: mpsc::UnboundedSender<String>,
) {
    let _lease = lease;
    let payload = prompt::build_payload(system.as_deref(), &prompt_text);
    let started = Instant::now();

    // Establish the stream before any worker exists, so reverse proxies do
    // not time out during the spawn window.
    if tx.send(sse_comment("proxy-accepted")).is_err() {
        return;
    }

    let mut tried: Vec<String> = Vec::new();
    let pool_size = engine.router.pool_size();

    loop {
        let worker = if tried.is_empty() {
            engine.router.select(Some(ctx.session_key.as_str()))
        } else {
            engine.router.select_retry(&tried)
        };
        let Some(worker) = worker else { break };

        if let Some(previous) = tried.last() {
            engine.bump(|c| c.stream_retries += 1);
            engine.events.publish(Event::StreamRetry {
                request_id: ctx.request_id.clone(),
                from_worker: previous.clone(),
                to_worker: worker.clone(),
                attempt: tried.len(),
            });
        }
        tried.push(worker.clone());

        let attempt = run_attempt(&engine, &ctx, &worker, &payload, &tx).await;

        match attempt.end {
            AttemptEnd::ClientGone => return,
            AttemptEnd::Exited(Some(0)) => {
                finalize_success(&engine, &ctx, &worker, &attempt, &payload, &tx, started);
                return;
            }
            AttemptEnd::Exited(code) => {
                if is_rate_limit_error(&attempt.stderr)
                    || is_rate_limit_error(&attempt.output.collected_text())
                {
                    engine.router.mark_limited(&worker);
                    engine.events.publish(Event::WorkerLimited {
                        worker: worker.clone(),
                    });
                }
                if attempt.output.content_sent() {
                    finalize_error(
                        &engine,
                        &ctx,
                        &tx,
                        &format!("worker failed mid-stream (exit {code:?})"),
                    );
                    return;
                }
                // Exit 143 is a TERM from the reaper or a timer, not a
                // worker fault; it is never retried.
                let quick_fail = code != Some(143)
                    && attempt.elapsed < QUICK_FAIL_WINDOW
                    && tried.len() < pool_size;
                if quick_fail {
                    continue;
                }
                break;
            }
            AttemptEnd::Heartbeat | AttemptEnd::Timeout => {
                if attempt.output.content_sent() {
                    finalize_error(&engine, &ctx, &tx, "worker timed out mid-stream");
                    return;
                }
                break;
            }
            AttemptEnd::SpawnFailed(err) => {
                tracing::warn!(request = %ctx.request_id, worker = %worker, error = %err, "spawn failed");
                if tried.len() < pool_size {
                    continue;
                }
                break;
            }
        }
    }

    // Nothing reached the client from any worker: last resort.
    if engine.cfg.fallback_api.is_some() {
        engine.bump(|c| c.fallbacks += 1);
        engine.events.publish(Event::FallbackUsed {
            request_id: ctx.request_id.clone(),
            source: ctx.source.clone(),
        });
        match fallback::relay(&engine, &ctx, system.as_deref(), &prompt_text, &tx).await {
            Ok(stats) => {
                engine
                    .ledger
                    .record(&ctx.request_id, ctx.model, stats.input_tokens, stats.output_tokens);
                engine.events.publish(Event::RequestCompleted {
                    request_id: ctx.request_id.clone(),
                    source: ctx.source.clone(),
                    input_tokens: stats.input_tokens,
                    output_tokens: stats.output_tokens,
                    duration_ms: started.elapsed().as_millis() as u64,
                });
                let _ = tx.send(sse_chunk(
                    &ctx.request_id,
                    ctx.created,
                    &ctx.raw_model,
                    json!({}),
                    Some("stop"),
                ));
                let _ = tx.send(sse_done());
            }
            Err(err) => {
                if err.context_overflow {
                    engine.bump(|c| c.context_overflows += 1);
                }
                finalize_error(&engine, &ctx, &tx, &err.message);
            }
        }
        return;
    }

    finalize_error(&engine, &ctx, &tx, "all workers failed");
}

async fn run_attempt(
    engine: &Arc<Engine>,
    ctx: &RequestContext,
    worker: &str,
    payload: &str,
    tx: &mpsc::UnboundedSender<String>,
) -> Attempt {
    let attempt_start = Instant::now();
    let mut output = WorkerOutput::new();
    let mut stderr = String::new();

    let mut proc = match engine.obtain_worker(worker, ctx.model, true) {
        Ok((proc, warm)) => {
            engine.events.publish(Event::RequestStarted {
                request_id: ctx.request_id.clone(),
                source: ctx.source.clone(),
                worker: worker.to_string(),
                warm,
            });
            proc
        }
        Err(err) => {
            engine.router.on_complete(worker);
            return Attempt {
                end: AttemptEnd::SpawnFailed(err.to_string()),
                output,
                stderr,
                elapsed: attempt_start.elapsed(),
            };
        }
    };
    engine.track(ctx, &proc, WorkerMode::Stream);

    if let Err(err) = proc.send_payload(payload).await {
        // A dead child surfaces through its exit status below.
        tracing::debug!(pid = proc.pid, %err, "payload write failed");
    }

    let pid = proc.pid;
    let heartbeat_window = engine.cfg.heartbeat_by_model.for_model(ctx.model);
    let deadline = tokio::time::sleep(engine.cfg.stream_timeout());
    tokio::pin!(deadline);
    let mut heartbeat = Box::pin(tokio::time::sleep(heartbeat_window));
    let mut first_byte_warn = Some(Box::pin(tokio::time::sleep(FIRST_BYTE_WARN)));
    let mut keepalive = tokio::time::interval(KEEPALIVE_INITIAL);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    keepalive.reset();
    let mut saw_output = false;

    let end = loop {
        tokio::select! {
            line = proc.next_line() => match line {
                Some(WorkerLine::Out(text)) => {
                    engine.registry.touch(pid, 0, 0);
                    heartbeat.as_mut().set(tokio::time::sleep(heartbeat_window));
                    if let Some(delta) = output.ingest(&text) {
                        if !saw_output {
                            saw_output = true;
                            first_byte_warn = None;
                            keepalive = tokio::time::interval(KEEPALIVE_RELAXED);
                            keepalive
                                .set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                            keepalive.reset();
                        }
                        let chunk = sse_chunk(
                            &ctx.request_id,
                            ctx.created,
                            &ctx.raw_model,
                            json!({"content": delta}),
                            None,
                        );
                        if tx.send(chunk).is_err() {
                            break AttemptEnd::ClientGone;
                        }
                    }
                }
                Some(WorkerLine::Err(text)) => {
                    if stderr.len() < 8_192 {
                        stderr.push_str(&text);
                        stderr.push('\n');
                    }
                }
                None => break AttemptEnd::Exited(None),
            },
            _ = &mut heartbeat => break AttemptEnd::Heartbeat,
            _ = &mut deadline => break AttemptEnd::Timeout,
            _ = keepalive.tick() => {
                if tx.send(sse_comment("keepalive")).is_err() {
                    break AttemptEnd::ClientGone;
                }
            }
            _ = async {
                match first_byte_warn.as_mut() {
                    Some(warn) => warn.as_mut().await,
                    None => std::future::pending().await,
                }
            } => {
                tracing::warn!(
                    request = %ctx.request_id,
                    worker,
                    "no worker output after {:?}",
                    FIRST_BYTE_WARN
                );
                first_byte_warn = None;
            }
        }
    };

    let end = match end {
        AttemptEnd::Exited(None) => {
            // EOF on both pipes; collect the real exit code.
            let code = match tokio::time::timeout(TERM_GRACE, proc.wait()).await {
                Ok(Ok(status)) => status.code(),
                _ => None,
            };
            AttemptEnd::Exited(code)
        }
        interrupted @ (AttemptEnd::Heartbeat | AttemptEnd::Timeout | AttemptEnd::ClientGone) => {
            proc.terminate();
            let _ = tokio::time::timeout(TERM_GRACE, proc.wait()).await;
            interrupted
        }
        other => other,
    };

    // Flush anything the readers buffered after the loop broke.
    while let Some(line) = proc.try_next_line() {
        match line {
            WorkerLine::Out(text) => {
                if let Some(delta) = output.ingest(&text) {
                    let chunk = sse_chunk(
                        &ctx.request_id,
                        ctx.created,
                        &ctx.raw_model,
                        json!({"content": delta}),
                        None,
                    );
                    let _ = tx.send(chunk);
                }
            }
            WorkerLine::Err(text) => {
                if stderr.len() < 8_192 {
                    stderr.push_str(&text);
                    stderr.push('\n');
                }
            }
        }
    }

    engine.router.on_complete(worker);
    engine.registry.unregister(pid);
    if let AttemptEnd::Exited(code) = &end {
        engine.events.publish(Event::WorkerExited {
            pid,
            worker: worker.to_string(),
            exit_code: *code,
        });
    }

    Attempt {
        end,
        output,
        stderr,
        elapsed: attempt_start.elapsed(),
    }
}

fn finalize_success(
    engine: &Arc<Engine>,
    ctx: &RequestContext,
    worker: &str,
    attempt: &Attempt,
    payload: &str,
    tx: &mpsc::UnboundedSender<String>,
    started: Instant,
) {
    let text = attempt.output.collected_text();
    let input_tokens = attempt
        .output
        .input_tokens
        .unwrap_or_else(|| estimate_tokens(payload.len()));
    let output_tokens = attempt
        .output
        .output_tokens
        .unwrap_or_else(|| estimate_tokens(text.len()));

    if is_safety_refusal(&text) {
        engine.bump(|c| c.safety_refusals += 1);
        engine.events.publish(Event::SafetyRefusal {
            request_id: ctx.request_id.clone(),
            worker: worker.to_string(),
        });
    }

    engine
        .ledger
        .record(&ctx.request_id, ctx.model, input_tokens, output_tokens);
    engine.events.publish(Event::RequestCompleted {
        request_id: ctx.request_id.clone(),
        source: ctx.source.clone(),
        input_tokens,
        output_tokens,
        duration_ms: started.elapsed().as_millis() as u64,
    });

    let _ = tx.send(sse_chunk(
        &ctx.request_id,
        ctx.created,
        &ctx.raw_model,
        json!({}),
        Some("stop"),
    ));
    let _ = tx.send(sse_done());
}

/// Errors still terminate the stream properly: the message rides out as a
/// final text delta so clients never hang.
fn finalize_error(
    engine: &Arc<Engine>,
    ctx: &RequestContext,
    tx: &mpsc::UnboundedSender<String>,
    message: &str,
) {
    engine.events.publish(Event::RequestFailed {
        request_id: ctx.request_id.clone(),
        source: ctx.source.clone(),
        reason: message.to_string(),
    });
    let _ = tx.send(sse_chunk(
        &ctx.request_id,
        ctx.created,
        &ctx.raw_model,
        json!({"content": format!("\n[proxy error: {message}]")}),
        None,
    ));
    let _ = tx.send(sse_chunk(
        &ctx.request_id,
        ctx.created,
        &ctx.raw_model,
        json!({}),
        Some("stop"),
    ));
    let _ = tx.send(sse_done());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_event_deltas_forward() {
        let mut output = WorkerOutput::new();
        let line = json!({
            "type": "stream_event",
            "event": {
                "type": "content_block_delta",
                "delta": {"type": "text_delta", "text": "hello "}
            }
        })
        .to_string();
        assert_eq!(output.ingest(&line).as_deref(), Some("hello "));
        assert!(output.content_sent());
    }

    #[test]
    fn message_delta_usage_updates_counters() {
        let mut output = WorkerOutput::new();
        let line = json!({
            "type": "stream_event",
            "event": {
                "type": "message_delta",
                "usage": {
                    "input_tokens": 10,
                    "cache_creation_input_tokens": 5,
                    "cache_read_input_tokens": 85,
                    "output_tokens": 42
                }
            }
        })
        .to_string();
        assert!(output.ingest(&line).is_none());
        assert_eq!(output.input_tokens, Some(100));
        assert_eq!(output.output_tokens, Some(42));
    }

    #[test]
    fn assistant_text_only_when_nothing_sent() {
        let mut output = WorkerOutput::new();
        let assistant = json!({
            "type": "assistant",
            "message": {"content": [{"type": "text", "text": "full reply"}]}
        })
        .to_string();
        assert_eq!(output.ingest(&assistant).as_deref(), Some("full reply"));

        // Delta-path content already sent: the assistant echo is dropped.
        let mut second = WorkerOutput::new();
        let delta = json!({
            "type": "content_block_delta",
            "delta": {"text": "d"}
        })
        .to_string();
        second.ingest(&delta);
        assert!(second.ingest(&assistant).is_none());
    }

    #[test]
    fn result_forwards_once() {
        let mut output = WorkerOutput::new();
        let result = json!({"type": "result", "result": "final text"}).to_string();
        assert_eq!(output.ingest(&result).as_deref(), Some("final text"));
        assert!(output.ingest(&result).is_none());
    }

    #[test]
    fn garbage_lines_are_ignored() {
        let mut output = WorkerOutput::new();
        assert!(output.ingest("not json at all").is_none());
        assert!(output.ingest("").is_none());
        assert!(!output.content_sent());
    }

    #[test]
    fn refusal_detection_is_small_and_case_insensitive() {
        assert!(is_safety_refusal("I CANNOT help with that."));
        assert!(is_safety_refusal("This raises a safety concern."));
        assert!(!is_safety_refusal("sure, here is the code"));
        // Large outputs are never classified as refusals.
        let large = format!("I cannot {}", "x".repeat(REFUSAL_SCAN_LIMIT));
        assert!(!is_safety_refusal(&large));
    }

    #[test]
    fn top_level_usage_is_picked_up() {
        let mut output = WorkerOutput::new();
        let line = json!({
            "type": "result",
            "result": "ok",
            "usage": {"input_tokens": 7, "output_tokens": 3}
        })
        .to_string();
        output.ingest(&line);
        assert_eq!(output.input_tokens, Some(7));
        assert_eq!(output.output_tokens, Some(3));
    }
}
