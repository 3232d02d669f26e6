//! Axum HTTP server.
//!
//! Endpoints:
//! - `POST /v1/chat/completions`: OpenAI-compatible chat (SSE when `stream`)
//! - `GET /v1/models`: known model ids
//! - `GET /health`: liveness and per-worker health
//! - `GET /metrics`: full counters snapshot
//! - `GET /events`: event-log tail
//! - `GET /stream`: SSE firehose of internal events

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::direct;
use crate::engine::{AdmitError, Engine, WorkerError};
use crate::prompt;
use crate::source;
use crate::stream;
use crate::types::{error_body, ChatRequest};

#[derive(Clone)]
struct AppState {
    engine: Arc<Engine>,
}

pub fn create_app(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/events", get(events_tail))
        .route("/stream", get(events_stream))
        .route("/v1/models", get(models))
        .route("/v1/chat/completions", post(chat_completions))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { engine })
}

/// Bind and serve until ctrl-c, then tear the engine down.
pub async fn serve(engine: Arc<Engine>) -> Result<()> {
    engine.start().await;

    let addr = SocketAddr::from(([0, 0, 0, 0], engine.cfg.port));
    let app = create_app(Arc::clone(&engine));
    info!(%addr, "openclaw-proxy listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    let shutdown_engine = Arc::clone(&engine);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutting down");
        shutdown_engine.shutdown();
    })
    .await
    .context("server error")?;
    Ok(())
}

fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    if !state.engine.cfg.auth_enabled() {
        return Ok(());
    }
    let expected = state.engine.cfg.auth_token.as_deref().unwrap_or_default();
    match source::bearer_or_api_key(headers) {
        Some(token) if token == expected => Ok(()),
        _ => Err((
            StatusCode::UNAUTHORIZED,
            Json(error_body("invalid or missing credentials", "auth_error")),
        )
            .into_response()),
    }
}

async fn chat_completions(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<ChatRequest>,
) -> Response {
    if let Err(denied) = check_auth(&state, &headers) {
        return denied;
    }
    let engine = &state.engine;

    let source_id = source::identify_source(&headers, Some(&addr.to_string()));
    let session = source::session_id(&headers);
    let ctx = engine.context(&req, source_id, session);

    let lease = match engine.admit(&ctx).await {
        Ok(lease) => lease,
        Err(err) => return admit_error_response(err),
    };

    // Tool-carrying requests bypass the workers when credentials exist.
    if req.has_tools() && engine.direct_api_available() {
        if ctx.stream {
            let (tx, rx) = mpsc::unbounded_channel::<String>();
            tokio::spawn(direct::stream_direct(
                Arc::clone(engine),
                ctx,
                req,
                lease,
                tx,
            ));
            return sse_response(rx);
        }
        let result = direct::direct_completion(engine, &ctx, &req).await;
        lease.release();
        return match result {
            Ok(body) => Json(body).into_response(),
            Err(message) => (
                StatusCode::BAD_GATEWAY,
                Json(error_body(&message, "upstream_error")),
            )
                .into_response(),
        };
    }

    let system = req.system_prompt();
    let extracted = prompt::extract_prompt(&req.messages, engine.cfg.max_prompt_chars);

    if ctx.stream {
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(stream::stream_chat(
            Arc::clone(engine),
            ctx,
            system,
            extracted.prompt,
            lease,
            tx,
        ));
        return sse_response(rx);
    }

    let result = engine.run_sync(&ctx, system.as_deref(), &extracted.prompt).await;
    lease.release();
    match result {
        Ok(body) => Json(body).into_response(),
        Err(WorkerError::Timeout) => (
            StatusCode::GATEWAY_TIMEOUT,
            Json(error_body("worker timed out", "timeout_error")),
        )
            .into_response(),
        Err(WorkerError::RetriesExhausted(message)) => (
            StatusCode::BAD_GATEWAY,
            Json(error_body(&message, "worker_error")),
        )
            .into_response(),
    }
}

fn admit_error_response(err: AdmitError) -> Response {
    match err {
        AdmitError::QueueFull { retry_after_ms } => {
            let mut resp = (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(error_body("queue full", "overloaded_error")),
            )
                .into_response();
            let secs = (retry_after_ms / 1_000).max(1);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                resp.headers_mut().insert(header::RETRY_AFTER, value);
            }
            resp
        }
        AdmitError::QueueTimeout => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(error_body("timed out waiting for a slot", "overloaded_error")),
        )
            .into_response(),
        AdmitError::RateWaitTimeout => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(error_body(
                "timed out waiting for rate-limit clearance",
                "rate_limit_error",
            )),
        )
            .into_response(),
        AdmitError::Closed => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(error_body("shutting down", "overloaded_error")),
        )
            .into_response(),
    }
}

/// Wrap a frame channel as an SSE response. Dropping the client connection
/// drops the receiver, which the producing task observes as send failures.
fn sse_response(rx: mpsc::UnboundedReceiver<String>) -> Response {
    let stream = async_stream::stream! {
        let mut rx = rx;
        while let Some(frame) = rx.recv().await {
            yield Ok::<_, std::convert::Infallible>(axum::body::Bytes::from(frame));
        }
    };
    let mut resp = Response::new(Body::from_stream(stream));
    let headers = resp.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    // Tell buffering reverse proxies to pass bytes through unmerged.
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    resp
}

async fn models(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(denied) = check_auth(&state, &headers) {
        return denied;
    }
    let data: Vec<_> = ["opus", "sonnet", "haiku"]
        .iter()
        .map(|family| {
            json!({
                "id": format!("claude-code/{family}"),
                "object": "model",
                "owned_by": "openclaw",
            })
        })
        .collect();
    Json(json!({"object": "list", "data": data})).into_response()
}

async fn health(State(state): State<AppState>) -> Response {
    let engine = &state.engine;
    Json(json!({
        "status": "ok",
        "uptime_secs": engine.uptime().as_secs(),
        "queue": engine.queue.stats(),
        "workers": engine.router.stats(),
        "processes": engine.registry.stats(),
        "warm_pool": engine.warm.stats(),
    }))
    .into_response()
}

async fn metrics(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(denied) = check_auth(&state, &headers) {
        return denied;
    }
    let engine = &state.engine;
    Json(json!({
        "queue": engine.queue.stats(),
        "rate_limits": engine.limiter.stats(),
        "workers": engine.router.stats(),
        "processes": engine.registry.stats(),
        "warm_pool": engine.warm.stats(),
        "tokens": engine.ledger.stats(),
        "engine": engine.counters(),
        "events": engine.events.counts(),
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    #[serde(default)]
    since_id: u64,
    #[serde(default = "default_events_limit")]
    limit: usize,
    #[serde(rename = "type")]
    event_type: Option<String>,
}

fn default_events_limit() -> usize {
    100
}

async fn events_tail(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<EventsQuery>,
) -> Response {
    if let Err(denied) = check_auth(&state, &headers) {
        return denied;
    }
    let records = state.engine.events.tail(
        query.since_id,
        query.limit.min(1_000),
        query.event_type.as_deref(),
    );
    Json(json!({"events": records})).into_response()
}

async fn events_stream(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(denied) = check_auth(&state, &headers) {
        return denied;
    }
    let mut rx = state.engine.events.subscribe();
    let stream = async_stream::stream! {
        yield Ok::<_, std::convert::Infallible>(axum::body::Bytes::from(
            crate::types::sse_comment("event-stream"),
        ));
        loop {
            match rx.recv().await {
                Ok(record) => {
                    let frame = match serde_json::to_string(&record) {
                        Ok(json) => format!("data: {json}\n\n"),
                        Err(_) => continue,
                    };
                    yield Ok(axum::body::Bytes::from(frame));
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(missed = n, "event stream subscriber lagged");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    };
    let mut resp = Response::new(Body::from_stream(stream));
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    resp.headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    resp
}
