//! Claude "assistant prefill" removal, per §4.7: when thinking is enabled,
//! a trailing assistant message that is pure text (the client priming the
//! model's reply, e.g. to force JSON output) cannot be sent to the upstream
//! as-is — Claude-style extended thinking requires the assistant's *last*
//! turn in history to be a real model turn, not a synthetic continuation.
//! The prefill text is stripped out of the message list and folded into a
//! system-instruction hint that asks the model to start its own reply the
//! same way.
use qproxy_protocol::claude::count_tokens::types::{
    BetaMessageContent as ClaudeMessageContent, BetaMessageParam as ClaudeMessageParam,
    BetaMessageRole as ClaudeMessageRole,
};

/// Hint appended to the system instruction in place of a removed prefill.
pub fn prefill_hint(prefill_text: &str) -> String {
    let trimmed = prefill_text.trim_start();
    if trimmed.starts_with('{') || looks_like_json_only_instruction(trimmed) {
        "Return only a single JSON object and start your response with '{'.".to_string()
    } else {
        format!("Start your response with the following prefix exactly: {prefill_text}")
    }
}

fn looks_like_json_only_instruction(trimmed: &str) -> bool {
    trimmed.starts_with('[') || trimmed.eq_ignore_ascii_case("```json")
}

/// Returns true if `content` is non-empty and carries no blocks other than
/// plain text (no tool_use/tool_result/thinking/image/etc.) — the shape a
/// prefill takes.
fn is_text_only(content: &ClaudeMessageContent) -> Option<String> {
    match content {
        ClaudeMessageContent::Text(text) if !text.is_empty() => Some(text.clone()),
        ClaudeMessageContent::Blocks(blocks) => {
            use qproxy_protocol::claude::count_tokens::types::BetaContentBlockParam as Block;
            let mut joined = String::new();
            for block in blocks {
                match block {
                    Block::Text(text_block) => {
                        if !joined.is_empty() {
                            joined.push('\n');
                        }
                        joined.push_str(&text_block.text);
                    }
                    _ => return None,
                }
            }
            if joined.is_empty() { None } else { Some(joined) }
        }
        _ => None,
    }
}

/// If thinking is enabled and the last message is a text-only assistant
/// prefill, remove it from history and return the hint to fold into the
/// system instruction. No-op (returns `messages` unchanged, `None` hint)
/// when thinking is off or the last turn isn't a bare-text assistant turn.
pub fn strip_assistant_prefill(
    messages: Vec<ClaudeMessageParam>,
    thinking_enabled: bool,
) -> (Vec<ClaudeMessageParam>, Option<String>) {
    if !thinking_enabled {
        return (messages, None);
    }
    let Some(last) = messages.last() else {
        return (messages, None);
    };
    if last.role != ClaudeMessageRole::Assistant {
        return (messages, None);
    }
    let Some(prefill_text) = is_text_only(&last.content) else {
        return (messages, None);
    };

    let hint = prefill_hint(&prefill_text);
    let mut messages = messages;
    messages.pop();
    (messages, Some(hint))
}

#[cfg(test)]
mod tests {
    use super::*;
    use qproxy_protocol::claude::count_tokens::types::BetaMessageRole;

    fn assistant_text(text: &str) -> ClaudeMessageParam {
        ClaudeMessageParam {
            role: BetaMessageRole::Assistant,
            content: ClaudeMessageContent::Text(text.to_string()),
        }
    }

    #[test]
    fn noop_when_thinking_disabled() {
        let messages = vec![assistant_text("{")];
        let (out, hint) = strip_assistant_prefill(messages.clone(), false);
        assert_eq!(out.len(), messages.len());
        assert!(hint.is_none());
    }

    #[test]
    fn strips_trailing_json_prefill_and_hints_json_only() {
        let messages = vec![assistant_text("{")];
        let (out, hint) = strip_assistant_prefill(messages, true);
        assert!(out.is_empty());
        assert_eq!(
            hint.as_deref(),
            Some("Return only a single JSON object and start your response with '{'.")
        );
    }

    #[test]
    fn strips_trailing_plain_prefill_and_hints_exact_prefix() {
        let messages = vec![assistant_text("Sure, here's the plan:")];
        let (out, hint) = strip_assistant_prefill(messages, true);
        assert!(out.is_empty());
        assert!(hint.unwrap().contains("Sure, here's the plan:"));
    }

    #[test]
    fn leaves_non_trailing_assistant_turns_alone() {
        let messages = vec![assistant_text("first"), assistant_text("ignored: not last user turn")];
        // last message is still assistant/text here, so it *is* stripped —
        // only a user-authored last turn should be left untouched.
        let (out, _hint) = strip_assistant_prefill(messages, true);
        assert_eq!(out.len(), 1);
    }
}
