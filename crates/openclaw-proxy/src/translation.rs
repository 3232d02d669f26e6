//! OpenAI ↔ Anthropic translation for the direct HTTP-API path.
//!
//! The native Messages API wants the system prompt as a separate field,
//! strict user/assistant alternation, tool calls as `tool_use` content
//! blocks and tool outputs as `tool_result` blocks on the user role.

use anyhow::{Context, Result};
use serde_json::{json, Map, Value};

use crate::types::{ChatRequest, Role};

const DEFAULT_MAX_TOKENS: u32 = 4_096;

/// Convert an OpenAI chat request into a native Messages request body.
pub fn to_anthropic(req: &ChatRequest, model: &str) -> Result<Value> {
    let mut messages: Vec<Value> = Vec::new();

    for msg in &req.messages {
        match msg.role {
            Role::System => continue,
            Role::User => {
                let text = msg
                    .content
                    .as_ref()
                    .map(|c| c.to_plaintext())
                    .unwrap_or_default();
                if !text.is_empty() {
                    push_block(&mut messages, "user", json!({"type": "text", "text": text}));
                }
            }
            Role::Assistant => {
                if let Some(content) = &msg.content {
                    let text = content.to_plaintext();
                    if !text.is_empty() {
                        push_block(
                            &mut messages,
                            "assistant",
                            json!({"type": "text", "text": text}),
                        );
                    }
                }
                for call in msg.tool_calls.iter().flatten() {
                    let id = call.get("id").and_then(|v| v.as_str()).unwrap_or("call_0");
                    let function = call
                        .get("function")
                        .context("tool_calls[].function missing")?;
                    let name = function
                        .get("name")
                        .and_then(|v| v.as_str())
                        .context("tool_calls[].function.name missing")?;
                    let args = function
                        .get("arguments")
                        .and_then(|v| v.as_str())
                        .unwrap_or("{}");
                    let input: Value =
                        serde_json::from_str(args).unwrap_or_else(|_| json!({"raw": args}));
                    push_block(
                        &mut messages,
                        "assistant",
                        json!({"type": "tool_use", "id": id, "name": name, "input": input}),
                    );
                }
            }
            Role::Tool => {
                let id = msg
                    .tool_call_id
                    .as_deref()
                    .context("tool message without tool_call_id")?;
                let text = msg
                    .content
                    .as_ref()
                    .map(|c| c.to_plaintext())
                    .unwrap_or_default();
                // Tool results ride on the user role in the native shape.
                push_block(
                    &mut messages,
                    "user",
                    json!({"type": "tool_result", "tool_use_id": id, "content": text}),
                );
            }
        }
    }

    let mut out = Map::new();
    out.insert("model".to_string(), json!(model));
    out.insert("messages".to_string(), Value::Array(messages));
    out.insert(
        "max_tokens".to_string(),
        json!(req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)),
    );
    if let Some(system) = req.system_prompt() {
        out.insert("system".to_string(), json!(system));
    }
    if let Some(t) = req.temperature {
        out.insert("temperature".to_string(), json!(t));
    }
    if let Some(tp) = req.top_p {
        out.insert("top_p".to_string(), json!(tp));
    }

    if let Some(tools) = &req.tools {
        let mapped: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.function.name,
                    "description": t.function.description,
                    "input_schema": t.function.parameters.clone().unwrap_or(json!({"type": "object"})),
                })
            })
            .collect();
        out.insert("tools".to_string(), Value::Array(mapped));
    }

    if let Some(choice) = &req.tool_choice {
        out.insert("tool_choice".to_string(), map_tool_choice(choice));
    }

    Ok(Value::Object(out))
}

/// Append a content block, merging into the previous message when the role
/// matches; the native API rejects consecutive same-role messages.
fn push_block(messages: &mut Vec<Value>, role: &str, block: Value) {
    if let Some(last) = messages.last_mut() {
        if last.get("role").and_then(|r| r.as_str()) == Some(role) {
            if let Some(content) = last.get_mut("content").and_then(|c| c.as_array_mut()) {
                content.push(block);
                return;
            }
        }
    }
    messages.push(json!({"role": role, "content": [block]}));
}

fn map_tool_choice(choice: &Value) -> Value {
    match choice.as_str() {
        Some("auto") => json!({"type": "auto"}),
        Some("none") => json!({"type": "none"}),
        Some("required") => json!({"type": "any"}),
        _ => {
            if let Some(name) = choice
                .get("function")
                .and_then(|f| f.get("name"))
                .and_then(|n| n.as_str())
            {
                json!({"type": "tool", "name": name})
            } else {
                json!({"type": "auto"})
            }
        }
    }
}

/// Native stop reason → OpenAI finish reason.
pub fn map_stop_reason(reason: &str) -> &'static str {
    match reason {
        "tool_use" => "tool_calls",
        "end_turn" => "stop",
        "max_tokens" => "length",
        _ => "stop",
    }
}

/// Non-streaming native response → OpenAI assistant message plus finish
/// reason and usage.
pub fn completion_from_anthropic(resp: &Value) -> (Value, &'static str, u64, u64) {
    let mut text = String::new();
    let mut tool_calls: Vec<Value> = Vec::new();

    for block in resp
        .get("content")
        .and_then(|c| c.as_array())
        .into_iter()
        .flatten()
    {
        match block.get("type").and_then(|t| t.as_str()) {
            Some("text") => {
                if let Some(t) = block.get("text").and_then(|t| t.as_str()) {
                    text.push_str(t);
                }
            }
            Some("tool_use") => {
                let args = block
                    .get("input")
                    .map(|i| i.to_string())
                    .unwrap_or_else(|| "{}".to_string());
                tool_calls.push(json!({
                    "id": block.get("id").and_then(|v| v.as_str()).unwrap_or("call_0"),
                    "type": "function",
                    "function": {
                        "name": block.get("name").and_then(|v| v.as_str()).unwrap_or("unknown"),
                        "arguments": args,
                    }
                }));
            }
            _ => {}
        }
    }

    let mut message = json!({"role": "assistant"});
    message["content"] = if text.is_empty() {
        Value::Null
    } else {
        json!(text)
    };
    if !tool_calls.is_empty() {
        message["tool_calls"] = Value::Array(tool_calls);
    }

    let finish = resp
        .get("stop_reason")
        .and_then(|s| s.as_str())
        .map(map_stop_reason)
        .unwrap_or("stop");

    let usage = resp.get("usage");
    let input = usage
        .and_then(|u| u.get("input_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let output = usage
        .and_then(|u| u.get("output_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);

    (message, finish, input, output)
}
