//! Last-resort HTTP fallback.
//!
//! When every worker attempt died without a byte reaching the client, the
//! request is replayed against an OpenAI-compatible `chat/completions`
//! endpoint and its deltas are relayed into our envelope. Usage is
//! estimated from character counts; the upstream's numbers never arrive on
//! this path.

use std::sync::Arc;

use futures::StreamExt;
use openclaw_core::tokens::estimate_tokens;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::engine::{Engine, RequestContext};
use crate::types::sse_chunk;

pub struct FallbackStats {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

pub struct FallbackError {
    pub message: String,
    pub context_overflow: bool,
}

const CONTEXT_OVERFLOW_MARKERS: &[&str] = &[
    "context_length_exceeded",
    "context length",
    "prompt is too long",
    "maximum context",
];

fn is_context_overflow(body: &str) -> bool {
    let lower = body.to_lowercase();
    CONTEXT_OVERFLOW_MARKERS.iter().any(|m| lower.contains(m))
}

/// Relay the fallback's SSE deltas to the client. The caller writes the
/// terminating chunk and `[DONE]` on both success and failure.
pub async fn relay(
    engine: &Arc<Engine>,
    ctx: &RequestContext,
    system: Option<&str>,
    prompt_text: &str,
    tx: &mpsc::UnboundedSender<String>,
) -> Result<FallbackStats, FallbackError> {
    let fallback = engine
        .cfg
        .fallback_api
        .as_ref()
        .expect("relay called with fallback configured");

    let mut messages: Vec<Value> = Vec::new();
    if let Some(system) = system.filter(|s| !s.is_empty()) {
        messages.push(json!({"role": "system", "content": system}));
    }
    messages.push(json!({"role": "user", "content": prompt_text}));

    let url = format!(
        "{}/chat/completions",
        fallback.base_url.trim_end_matches('/')
    );
    let body = json!({
        "model": fallback.model,
        "messages": messages,
        "stream": true,
    });

    let response = engine
        .http
        .post(&url)
        .bearer_auth(&fallback.api_key)
        .json(&body)
        .send()
        .await
        .map_err(|e| FallbackError {
            message: format!("fallback request failed: {e}"),
            context_overflow: false,
        })?;

    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        tracing::error!(%status, body = %text, "fallback upstream error");
        return Err(FallbackError {
            context_overflow: is_context_overflow(&text),
            message: format!("fallback upstream returned {status}"),
        });
    }

    let mut chars_out = 0usize;
    let mut buffer = String::new();
    let mut stream = response.bytes_stream();

    'outer: while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| FallbackError {
            message: format!("fallback stream failed: {e}"),
            context_overflow: false,
        })?;
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some((frame, rest)) = split_sse_frame(&buffer) {
            buffer = rest;
            let Some(data) = extract_data_line(&frame) else {
                continue;
            };
            if data.trim() == "[DONE]" {
                break 'outer;
            }
            let Ok(v) = serde_json::from_str::<Value>(data) else {
                continue;
            };
            let Some(text) = v
                .pointer("/choices/0/delta/content")
                .and_then(|c| c.as_str())
            else {
                continue;
            };
            if text.is_empty() {
                continue;
            }
            chars_out += text.len();
            let relayed = sse_chunk(
                &ctx.request_id,
                ctx.created,
                &ctx.raw_model,
                json!({"content": text}),
                None,
            );
            if tx.send(relayed).is_err() {
                // Client went away; abort the upstream by dropping it.
                break 'outer;
            }
        }
    }

    Ok(FallbackStats {
        input_tokens: estimate_tokens(prompt_text.len()),
        output_tokens: estimate_tokens(chars_out),
    })
}

/// First complete SSE frame (terminated by a blank line) and the rest.
fn split_sse_frame(buffer: &str) -> Option<(String, String)> {
    let idx = buffer.find("\n\n")?;
    let (frame, rest) = buffer.split_at(idx + 2);
    Some((frame.to_string(), rest.to_string()))
}

fn extract_data_line(frame: &str) -> Option<&str> {
    frame
        .lines()
        .find_map(|line| line.strip_prefix("data:"))
        .map(|rest| rest.trim_start())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_splitting() {
        let buffer = "data: {\"a\":1}\n\ndata: [DONE]\n\nleftover";
        let (frame, rest) = split_sse_frame(buffer).unwrap();
        assert_eq!(extract_data_line(&frame), Some("{\"a\":1}"));
        let (frame2, rest2) = split_sse_frame(&rest).unwrap();
        assert_eq!(extract_data_line(&frame2), Some("[DONE]"));
        assert_eq!(rest2, "leftover");
        assert!(split_sse_frame(&rest2).is_none());
    }

    #[test]
    fn comment_frames_have_no_data() {
        assert_eq!(extract_data_line(": keepalive\n\n"), None);
    }

    #[test]
    fn context_overflow_classification() {
        assert!(is_context_overflow(
            "{\"error\":{\"code\":\"context_length_exceeded\"}}"
        ));
        assert!(is_context_overflow("Prompt is too long: 210000 tokens"));
        assert!(!is_context_overflow("{\"error\":{\"code\":\"rate_limit\"}}"));
    }
}
