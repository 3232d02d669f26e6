//! Prompt assembly for CLI workers.
//!
//! Workers take one flat text payload on stdin. Conversation history is
//! truncated from the front (oldest first) to fit `max_prompt_chars`; the
//! final user turn always survives, and a sentinel line marks any cut.

use crate::types::{ChatMessage, Role};

const TRUNCATION_SENTINEL: &str = "[...earlier conversation truncated...]";

/// The flattened conversation, ready for payload framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedPrompt {
    pub prompt: String,
    pub truncated: bool,
}

/// Flatten non-system turns into labeled segments and fit them to
/// `max_chars` by dropping from the front.
pub fn extract_prompt(messages: &[ChatMessage], max_chars: usize) -> ExtractedPrompt {
    let mut segments: Vec<String> = Vec::new();
    for message in messages {
        let label = match message.role {
            Role::System => continue,
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::Tool => "Tool",
        };
        let Some(content) = &message.content else {
            continue;
        };
        let text = content.to_plaintext();
        if text.is_empty() {
            continue;
        }
        segments.push(format!("{label}: {text}"));
    }

    if segments.is_empty() {
        return ExtractedPrompt {
            prompt: String::new(),
            truncated: false,
        };
    }

    let joined_len =
        |segments: &[String]| segments.iter().map(|s| s.len() + 2).sum::<usize>();

    let mut start = 0;
    while segments.len() - start > 1 && joined_len(&segments[start..]) > max_chars {
        start += 1;
    }
    let truncated = start > 0;

    let mut parts: Vec<&str> = Vec::new();
    if truncated {
        parts.push(TRUNCATION_SENTINEL);
    }
    parts.extend(segments[start..].iter().map(String::as_str));

    ExtractedPrompt {
        prompt: parts.join("\n\n"),
        truncated,
    }
}

/// Full stdin payload: system framing plus the flattened prompt.
pub fn build_payload(system: Option<&str>, prompt: &str) -> String {
    match system {
        Some(system) if !system.is_empty() => {
            format!("[System Instructions]\n{system}\n\n[User Request]\n{prompt}")
        }
        _ => prompt.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessageContent;

    fn msg(role: Role, text: &str) -> ChatMessage {
        ChatMessage {
            role,
            content: Some(MessageContent::Text(text.to_string())),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    #[test]
    fn short_history_passes_through() {
        let messages = vec![
            msg(Role::System, "sys"),
            msg(Role::User, "first"),
            msg(Role::Assistant, "reply"),
            msg(Role::User, "second"),
        ];
        let extracted = extract_prompt(&messages, 10_000);
        assert!(!extracted.truncated);
        assert_eq!(
            extracted.prompt,
            "User: first\n\nAssistant: reply\n\nUser: second"
        );
    }

    #[test]
    fn truncation_drops_oldest_first_and_marks_it() {
        let messages = vec![
            msg(Role::User, &"a".repeat(100)),
            msg(Role::Assistant, &"b".repeat(100)),
            msg(Role::User, "final question"),
        ];
        let extracted = extract_prompt(&messages, 150);
        assert!(extracted.truncated);
        assert!(extracted.prompt.starts_with(TRUNCATION_SENTINEL));
        assert!(extracted.prompt.ends_with("User: final question"));
        assert!(!extracted.prompt.contains("aaaa"));
    }

    #[test]
    fn final_turn_survives_even_when_oversized() {
        let messages = vec![
            msg(Role::User, "old"),
            msg(Role::User, &"x".repeat(500)),
        ];
        let extracted = extract_prompt(&messages, 100);
        assert!(extracted.truncated);
        // The sole retained segment may exceed the cap; it is never dropped.
        assert!(extracted.prompt.contains(&"x".repeat(500)));
    }

    #[test]
    fn payload_framing() {
        assert_eq!(
            build_payload(Some("be brief"), "User: hi"),
            "[System Instructions]\nbe brief\n\n[User Request]\nUser: hi"
        );
        assert_eq!(build_payload(None, "User: hi"), "User: hi");
        assert_eq!(build_payload(Some(""), "User: hi"), "User: hi");
    }

    #[test]
    fn fitted_length_respects_cap_or_is_single_segment() {
        let messages: Vec<ChatMessage> = (0..20)
            .map(|i| msg(Role::User, &format!("turn {i} {}", "pad ".repeat(20))))
            .collect();
        let max = 300;
        let extracted = extract_prompt(&messages, max);
        let without_sentinel = extracted
            .prompt
            .trim_start_matches(TRUNCATION_SENTINEL)
            .trim_start();
        assert!(
            without_sentinel.len() <= max || !without_sentinel.contains("\n\n"),
            "either fits the cap or is the sole final segment"
        );
    }
}
