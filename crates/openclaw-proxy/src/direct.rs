//! Direct Anthropic HTTP-API path.
//!
//! Workers cannot execute client-defined tools, so tool-carrying requests
//! bypass the pool entirely: translate to the native Messages shape, pick
//! the next credential round-robin, and map the native SSE events back
//! into OpenAI chunks (including incremental `tool_calls` argument
//! deltas).

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use openclaw_core::spawn::TokenKind;
use openclaw_core::ModelFamily;
use openclaw_events::Event;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::engine::{Engine, RequestContext};
use crate::translation;
use crate::types::{sse_chunk, sse_done, ChatRequest};

const ANTHROPIC_VERSION: &str = "2023-06-01";
/// Beta marker that lets subscription (OAuth) credentials call the API.
const OAUTH_BETA: &str = "oauth-2025-04-20";

/// Model id sent upstream: a concrete `claude-*` id passes through,
/// aliases map per family.
fn upstream_model(ctx: &RequestContext) -> String {
    if ctx.raw_model.starts_with("claude-") && !ctx.raw_model.contains('/') {
        return ctx.raw_model.clone();
    }
    match ctx.model {
        ModelFamily::Opus => "claude-opus-4-1".to_string(),
        ModelFamily::Sonnet => "claude-sonnet-4-5".to_string(),
        ModelFamily::Haiku => "claude-3-5-haiku-latest".to_string(),
    }
}

fn build_request(
    engine: &Arc<Engine>,
    body: &Value,
) -> Result<reqwest::RequestBuilder, String> {
    let credential = engine
        .next_credential()
        .ok_or_else(|| "no direct-API credentials configured".to_string())?;
    let url = format!(
        "{}/v1/messages",
        engine.cfg.direct_api_base_url.trim_end_matches('/')
    );
    let mut builder = engine
        .http
        .post(&url)
        .header("anthropic-version", ANTHROPIC_VERSION)
        .json(body);
    builder = match credential.kind {
        TokenKind::Flat => builder
            .bearer_auth(&credential.token)
            .header("anthropic-beta", OAUTH_BETA),
        TokenKind::Metered => builder.header("x-api-key", &credential.token),
    };
    Ok(builder)
}

/// Streaming tool-capable request. Ends the stream with a finish chunk and
/// `[DONE]` on every path; the queue lease is released when this returns.
pub async fn stream_direct(
    engine: Arc<Engine>,
    ctx: RequestContext,
    req: ChatRequest,
    lease: openclaw_core::queue::Lease,
    tx: mpsc::UnboundedSender<String>,
) {
    let _lease = lease;
    let finish = run_direct_stream(&engine, &ctx, &req, &tx).await;

    let finish_reason = match finish {
        Ok(reason) => reason,
        Err(message) => {
            engine.events.publish(Event::RequestFailed {
                request_id: ctx.request_id.clone(),
                source: ctx.source.clone(),
                reason: message.clone(),
            });
            let _ = tx.send(sse_chunk(
                &ctx.request_id,
                ctx.created,
                &ctx.raw_model,
                json!({"content": format!("\n[proxy error: {message}]")}),
                None,
            ));
            "stop".to_string()
        }
    };

    let _ = tx.send(sse_chunk(
        &ctx.request_id,
        ctx.created,
        &ctx.raw_model,
        json!({}),
        Some(&finish_reason),
    ));
    let _ = tx.send(sse_done());
}

async fn run_direct_stream(
    engine: &Arc<Engine>,
    ctx: &RequestContext,
    req: &ChatRequest,
    tx: &mpsc::UnboundedSender<String>,
) -> Result<String, String> {
    let mut body =
        translation::to_anthropic(req, &upstream_model(ctx)).map_err(|e| e.to_string())?;
    body["stream"] = json!(true);

    let response = build_request(engine, &body)?
        .send()
        .await
        .map_err(|e| format!("direct API request failed: {e}"))?;

    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        tracing::error!(%status, body = %text, "direct API error");
        return Err(format!("direct API returned {status}"));
    }

    let mut input_tokens = 0u64;
    let mut output_tokens = 0u64;
    let mut stop_reason: Option<String> = None;
    // Native block index -> OpenAI tool_calls index.
    let mut tool_indexes: HashMap<u64, usize> = HashMap::new();

    let mut buffer = String::new();
    let mut stream = response.bytes_stream();

    'outer: while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| format!("direct API stream failed: {e}"))?;
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some((frame, rest)) = split_frame(&buffer) {
            buffer = rest;
            let Some(data) = frame
                .lines()
                .find_map(|l| l.strip_prefix("data:"))
                .map(str::trim_start)
            else {
                continue;
            };
            let Ok(v) = serde_json::from_str::<Value>(data) else {
                continue;
            };

            let delta: Option<Value> = match v.get("type").and_then(|t| t.as_str()) {
                Some("message_start") => {
                    if let Some(tokens) = v
                        .pointer("/message/usage/input_tokens")
                        .and_then(|t| t.as_u64())
                    {
                        input_tokens = tokens;
                    }
                    None
                }
                Some("content_block_start") => {
                    let block = v.get("content_block");
                    if block.and_then(|b| b.get("type")).and_then(|t| t.as_str())
                        == Some("tool_use")
                    {
                        let native_index =
                            v.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
                        let tool_index = tool_indexes.len();
                        tool_indexes.insert(native_index, tool_index);
                        Some(json!({"tool_calls": [{
                            "index": tool_index,
                            "id": block.and_then(|b| b.get("id")).cloned().unwrap_or(json!("call_0")),
                            "type": "function",
                            "function": {
                                "name": block.and_then(|b| b.get("name")).cloned().unwrap_or(json!("unknown")),
                                "arguments": "",
                            }
                        }]}))
                    } else {
                        None
                    }
                }
                Some("content_block_delta") => {
                    match v.pointer("/delta/type").and_then(|t| t.as_str()) {
                        Some("text_delta") => v
                            .pointer("/delta/text")
                            .and_then(|t| t.as_str())
                            .filter(|t| !t.is_empty())
                            .map(|t| json!({"content": t})),
                        Some("input_json_delta") => {
                            let native_index =
                                v.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
                            let tool_index =
                                tool_indexes.get(&native_index).copied().unwrap_or(0);
                            v.pointer("/delta/partial_json")
                                .and_then(|p| p.as_str())
                                .filter(|p| !p.is_empty())
                                .map(|p| {
                                    json!({"tool_calls": [{
                                        "index": tool_index,
                                        "function": {"arguments": p}
                                    }]})
                                })
                        }
                        _ => None,
                    }
                }
                Some("message_delta") => {
                    if let Some(reason) =
                        v.pointer("/delta/stop_reason").and_then(|s| s.as_str())
                    {
                        stop_reason = Some(reason.to_string());
                    }
                    if let Some(tokens) =
                        v.pointer("/usage/output_tokens").and_then(|t| t.as_u64())
                    {
                        output_tokens = tokens;
                    }
                    None
                }
                Some("message_stop") => break 'outer,
                _ => None,
            };

            if let Some(delta) = delta {
                let chunk = sse_chunk(&ctx.request_id, ctx.created, &ctx.raw_model, delta, None);
                if tx.send(chunk).is_err() {
                    // Client hung up: dropping the response aborts upstream.
                    break 'outer;
                }
            }
        }
    }

    engine
        .ledger
        .record(&ctx.request_id, ctx.model, input_tokens, output_tokens);
    engine.events.publish(Event::RequestCompleted {
        request_id: ctx.request_id.clone(),
        source: ctx.source.clone(),
        input_tokens,
        output_tokens,
        duration_ms: 0,
    });

    Ok(stop_reason
        .as_deref()
        .map(translation::map_stop_reason)
        .unwrap_or("stop")
        .to_string())
}

/// Non-streaming tool-capable request.
pub async fn direct_completion(
    engine: &Arc<Engine>,
    ctx: &RequestContext,
    req: &ChatRequest,
) -> Result<Value, String> {
    let body =
        translation::to_anthropic(req, &upstream_model(ctx)).map_err(|e| e.to_string())?;

    let response = build_request(engine, &body)?
        .send()
        .await
        .map_err(|e| format!("direct API request failed: {e}"))?;

    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        tracing::error!(%status, body = %text, "direct API error");
        return Err(format!("direct API returned {status}"));
    }

    let native: Value = response
        .json()
        .await
        .map_err(|e| format!("direct API response decode failed: {e}"))?;

    let (message, finish, input_tokens, output_tokens) =
        translation::completion_from_anthropic(&native);
    engine
        .ledger
        .record(&ctx.request_id, ctx.model, input_tokens, output_tokens);
    engine.events.publish(Event::RequestCompleted {
        request_id: ctx.request_id.clone(),
        source: ctx.source.clone(),
        input_tokens,
        output_tokens,
        duration_ms: 0,
    });

    Ok(crate::types::completion_body(
        &ctx.request_id,
        ctx.created,
        &ctx.raw_model,
        message,
        finish,
        input_tokens,
        output_tokens,
    ))
}

fn split_frame(buffer: &str) -> Option<(String, String)> {
    let idx = buffer.find("\n\n")?;
    let (frame, rest) = buffer.split_at(idx + 2);
    Some((frame.to_string(), rest.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(raw: &str) -> RequestContext {
        RequestContext {
            request_id: "req".to_string(),
            source: "test".to_string(),
            raw_model: raw.to_string(),
            model: ModelFamily::resolve(raw),
            priority: ModelFamily::resolve(raw).priority(),
            stream: true,
            est_tokens: 1,
            session_key: "test".to_string(),
            created: 0,
        }
    }

    #[test]
    fn concrete_model_ids_pass_through() {
        assert_eq!(
            upstream_model(&ctx("claude-sonnet-4-5")),
            "claude-sonnet-4-5"
        );
    }

    #[test]
    fn aliases_map_per_family() {
        assert_eq!(upstream_model(&ctx("claude-code/opus")), "claude-opus-4-1");
        assert_eq!(
            upstream_model(&ctx("claude-code/haiku")),
            "claude-3-5-haiku-latest"
        );
        assert_eq!(upstream_model(&ctx("gpt-4o")), "claude-sonnet-4-5");
    }
}
