//! OpenAI chat-completions wire types.
//!
//! Incoming requests may use shorthand strings for message content or the
//! multi-part array form; both are accepted via `#[serde(untagged)]`.
//! Loosely-shaped upstream JSON (worker events, fallback SSE) is accessed
//! through `serde_json::Value` instead of dedicated structs.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

/// Either a plain string or the multi-part array form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Lossy plain-text view (non-text parts are dropped).
    pub fn to_plaintext(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| p.text.as_deref())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(flatten)]
    pub extra: Value,
}

/// OpenAI tool definition (`{type: "function", function: {...}}`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ToolFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolFunction {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

/// Request body for `POST /v1/chat/completions`.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub tools: Option<Vec<ToolDef>>,
    #[serde(default)]
    pub tool_choice: Option<Value>,
}

impl ChatRequest {
    pub fn wants_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    pub fn has_tools(&self) -> bool {
        self.tools.as_ref().map_or(false, |t| !t.is_empty())
    }

    /// Concatenated system-message text, if any.
    pub fn system_prompt(&self) -> Option<String> {
        let text: Vec<String> = self
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .filter_map(|m| m.content.as_ref().map(|c| c.to_plaintext()))
            .collect();
        if text.is_empty() {
            None
        } else {
            Some(text.join("\n"))
        }
    }
}

/// One SSE chunk in the OpenAI envelope, ready to write.
pub fn sse_chunk(
    request_id: &str,
    created: i64,
    model: &str,
    delta: Value,
    finish_reason: Option<&str>,
) -> String {
    let body = json!({
        "id": request_id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish_reason,
        }],
    });
    format!("data: {body}\n\n")
}

pub fn sse_done() -> String {
    "data: [DONE]\n\n".to_string()
}

/// Keepalive/preamble comment line; ignored by SSE clients.
pub fn sse_comment(text: &str) -> String {
    format!(":{text}\n\n")
}

/// Non-streaming completion envelope.
pub fn completion_body(
    request_id: &str,
    created: i64,
    model: &str,
    message: Value,
    finish_reason: &str,
    input_tokens: u64,
    output_tokens: u64,
) -> Value {
    json!({
        "id": request_id,
        "object": "chat.completion",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": finish_reason,
        }],
        "usage": {
            "prompt_tokens": input_tokens,
            "completion_tokens": output_tokens,
            "total_tokens": input_tokens + output_tokens,
        },
    })
}

/// `{error: {message, type}}` for non-streaming failures.
pub fn error_body(message: &str, kind: &str) -> Value {
    json!({"error": {"message": message, "type": kind}})
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_shorthand_and_parts_both_parse() {
        let req: ChatRequest = serde_json::from_value(json!({
            "model": "claude-code/sonnet",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": [
                    {"type": "text", "text": "hello"},
                    {"type": "image_url", "image_url": {"url": "data:..."}}
                ]}
            ]
        }))
        .unwrap();
        assert_eq!(req.system_prompt().as_deref(), Some("be brief"));
        assert_eq!(
            req.messages[1].content.as_ref().unwrap().to_plaintext(),
            "hello"
        );
    }

    #[test]
    fn tool_messages_parse() {
        let req: ChatRequest = serde_json::from_value(json!({
            "model": "sonnet",
            "messages": [
                {"role": "assistant", "tool_calls": [{"id": "c1", "type": "function",
                    "function": {"name": "get", "arguments": "{}"}}]},
                {"role": "tool", "tool_call_id": "c1", "content": "42"}
            ],
            "tools": [{"type": "function", "function": {"name": "get", "parameters": {}}}]
        }))
        .unwrap();
        assert!(req.has_tools());
        assert_eq!(req.messages[1].tool_call_id.as_deref(), Some("c1"));
    }

    #[test]
    fn chunk_envelope_shape() {
        let chunk = sse_chunk("req_1", 1_700_000_000, "sonnet", json!({"content": "hi"}), None);
        assert!(chunk.starts_with("data: "));
        assert!(chunk.ends_with("\n\n"));
        let body: Value = serde_json::from_str(chunk.trim_start_matches("data: ").trim()).unwrap();
        assert_eq!(body["object"], "chat.completion.chunk");
        assert_eq!(body["choices"][0]["delta"]["content"], "hi");
        assert!(body["choices"][0]["finish_reason"].is_null());
    }

    #[test]
    fn comment_lines_start_with_colon() {
        assert!(sse_comment("proxy-accepted").starts_with(':'));
        assert_eq!(sse_done(), "data: [DONE]\n\n");
    }
}
