//! End-to-end scenarios against fake shell workers.
//!
//! Workers are `/bin/sh` scripts that swallow stdin and emit the same
//! line-JSON events a real CLI agent produces, so the full streaming state
//! machine (retry, fallback, finalization) runs without a real agent.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::post;
use axum::Router;
use openclaw_proxy::engine::{AdmitError, Engine, RequestContext};
use openclaw_proxy::stream::stream_chat;
use openclaw_proxy::ProxyConfig;
use serde_json::Value;
use tokio::sync::mpsc;

fn config_with_workers(worker_yaml: &str, extra: &str) -> ProxyConfig {
    let yaml = format!(
        r#"
warm_pool:
  enabled: false
workers:
{worker_yaml}
{extra}
"#
    );
    serde_yaml::from_str(&yaml).unwrap()
}

/// A worker that fails instantly with no output.
fn failing_worker(name: &str) -> String {
    format!(
        r#"  - name: {name}
    bin: /bin/sh
    args: ["-c", "exit 1"]
"#
    )
}

/// A worker that streams three deltas, reports usage, and exits cleanly.
fn streaming_worker(name: &str) -> String {
    let script = concat!(
        "cat >/dev/null; ",
        r#"echo '{"type":"stream_event","event":{"type":"content_block_delta","delta":{"text":"one "}}}'; "#,
        r#"echo '{"type":"stream_event","event":{"type":"content_block_delta","delta":{"text":"two "}}}'; "#,
        r#"echo '{"type":"stream_event","event":{"type":"content_block_delta","delta":{"text":"three"}}}'; "#,
        r#"echo '{"type":"result","result":"one two three","usage":{"input_tokens":9,"output_tokens":4}}'"#,
    );
    format!(
        r#"  - name: {name}
    bin: /bin/sh
    args: ["-c", "{script}"]
"#,
        script = script.replace('"', "\\\"")
    )
}

fn context(engine: &Arc<Engine>, source: &str) -> RequestContext {
    let req: openclaw_proxy::types::ChatRequest = serde_json::from_value(serde_json::json!({
        "model": "claude-code/sonnet",
        "stream": true,
        "messages": [{"role": "user", "content": "hello"}],
    }))
    .unwrap();
    engine.context(&req, source.to_string(), None)
}

/// Collect every frame the stream task produced, then split data payloads.
async fn collect_frames(mut rx: mpsc::UnboundedReceiver<String>) -> Vec<String> {
    let mut frames = Vec::new();
    while let Some(frame) = rx.recv().await {
        frames.push(frame);
    }
    frames
}

fn content_deltas(frames: &[String]) -> Vec<String> {
    frames
        .iter()
        .filter(|f| f.starts_with("data: ") && !f.contains("[DONE]"))
        .filter_map(|f| {
            let v: Value = serde_json::from_str(f.trim_start_matches("data: ").trim()).ok()?;
            v.pointer("/choices/0/delta/content")
                .and_then(|c| c.as_str())
                .map(|s| s.to_string())
        })
        .collect()
}

fn done_count(frames: &[String]) -> usize {
    frames.iter().filter(|f| f.contains("[DONE]")).count()
}

#[tokio::test]
async fn quick_fail_retries_on_second_worker() {
    // W1 exits 1 instantly with zero bytes sent; the engine re-attempts on
    // W2 exactly once and the client sees W2's three chunks and one [DONE].
    let config = config_with_workers(
        &format!("{}{}", failing_worker("w1"), streaming_worker("w2")),
        "",
    );
    let engine = Engine::new(config, None);

    let ctx = context(&engine, "s5");
    let lease = engine.admit(&ctx).await.unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    stream_chat(
        Arc::clone(&engine),
        ctx,
        None,
        "User: hello".to_string(),
        lease,
        tx,
    )
    .await;

    let frames = collect_frames(rx).await;
    let deltas = content_deltas(&frames);
    assert_eq!(deltas, ["one ", "two ", "three"]);
    assert_eq!(done_count(&frames), 1);
    assert_eq!(engine.counters().stream_retries, 1);
    // Usage came from the worker's report, not the estimate.
    let sonnet = engine.ledger.usage(openclaw_core::ModelFamily::Sonnet);
    assert_eq!(sonnet.input, 9);
    assert_eq!(sonnet.output, 4);
}

#[tokio::test]
async fn healthy_worker_streams_without_retry() {
    let config = config_with_workers(&streaming_worker("only"), "");
    let engine = Engine::new(config, None);

    let ctx = context(&engine, "happy");
    let lease = engine.admit(&ctx).await.unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    stream_chat(
        Arc::clone(&engine),
        ctx,
        Some("be brief".to_string()),
        "User: hello".to_string(),
        lease,
        tx,
    )
    .await;

    let frames = collect_frames(rx).await;
    assert!(frames[0].starts_with(':'), "preamble comes first");
    assert_eq!(content_deltas(&frames).concat(), "one two three");
    assert_eq!(done_count(&frames), 1);
    assert_eq!(engine.counters().stream_retries, 0);
    // The slot came back.
    assert_eq!(engine.queue.stats().active, 0);
}

#[tokio::test]
async fn exhausted_pool_falls_back_to_http_api() {
    // Both workers die with no content; the fallback endpoint's three
    // deltas reach the client, with exactly one [DONE].
    let sse_body = concat!(
        "data: {\"choices\":[{\"delta\":{\"content\":\"f1 \"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"f2 \"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"f3\"}}]}\n\n",
        "data: [DONE]\n\n",
    );
    let app = Router::new().route(
        "/chat/completions",
        post(move || async move {
            (
                [(axum::http::header::CONTENT_TYPE, "text/event-stream")],
                sse_body,
            )
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(axum::serve(listener, app).into_future());

    let fallback = format!(
        r#"fallback_api:
  base_url: http://{addr}
  api_key: test-key
  model: fallback-model
"#
    );
    let config = config_with_workers(
        &format!("{}{}", failing_worker("w1"), failing_worker("w2")),
        &fallback,
    );
    let engine = Engine::new(config, None);

    let ctx = context(&engine, "s6");
    let lease = engine.admit(&ctx).await.unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    stream_chat(
        Arc::clone(&engine),
        ctx,
        None,
        "User: hello".to_string(),
        lease,
        tx,
    )
    .await;

    let frames = collect_frames(rx).await;
    assert_eq!(content_deltas(&frames), ["f1 ", "f2 ", "f3"]);
    assert_eq!(done_count(&frames), 1);
    let counters = engine.counters();
    assert_eq!(counters.stream_retries, 1);
    assert_eq!(counters.fallbacks, 1);
}

#[tokio::test]
async fn no_fallback_still_terminates_the_stream() {
    let config = config_with_workers(&failing_worker("w1"), "");
    let engine = Engine::new(config, None);

    let ctx = context(&engine, "dead-end");
    let lease = engine.admit(&ctx).await.unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    stream_chat(
        Arc::clone(&engine),
        ctx,
        None,
        "User: hello".to_string(),
        lease,
        tx,
    )
    .await;

    let frames = collect_frames(rx).await;
    // The error rides out as a final text delta; the client never hangs.
    let deltas = content_deltas(&frames);
    assert!(deltas.iter().any(|d| d.contains("proxy error")));
    assert_eq!(done_count(&frames), 1);
}

#[tokio::test]
async fn sync_path_returns_a_completion_body() {
    let script = concat!(
        "cat >/dev/null; ",
        r#"echo '{"type":"result","result":"done!","usage":{"input_tokens":5,"output_tokens":3}}'"#,
    );
    let worker = format!(
        r#"  - name: sync
    bin: /bin/sh
    args: ["-c", "{}"]
"#,
        script.replace('"', "\\\"")
    );
    let config = config_with_workers(&worker, "");
    let engine = Engine::new(config, None);

    let req: openclaw_proxy::types::ChatRequest = serde_json::from_value(serde_json::json!({
        "model": "claude-code/sonnet",
        "messages": [{"role": "user", "content": "do it"}],
    }))
    .unwrap();
    let ctx = engine.context(&req, "sync-test".to_string(), None);
    let lease = engine.admit(&ctx).await.unwrap();

    let body = engine.run_sync(&ctx, None, "User: do it").await.unwrap();
    lease.release();

    assert_eq!(body["choices"][0]["message"]["content"], "done!");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert_eq!(body["usage"]["prompt_tokens"], 5);
    assert_eq!(body["usage"]["completion_tokens"], 3);
}

#[tokio::test(start_paused = true)]
async fn queue_timeout_surfaces_as_admit_error() {
    let config: ProxyConfig = serde_yaml::from_str(
        r#"
max_concurrent: 0
queue_timeout_ms: 50
warm_pool:
  enabled: false
"#,
    )
    .unwrap();
    let engine = Engine::new(config, None);

    let ctx = context(&engine, "starved");
    let err = engine.admit(&ctx).await.unwrap_err();
    assert!(matches!(err, AdmitError::QueueTimeout));
    let stats = engine.queue.stats();
    assert_eq!(stats.processed, 0);
    assert_eq!(stats.timed_out, 1);
}
