//! Tool-result text capping per §4.7: "capped by a limiter (per-tool-call and
//! per-request budgets; when exceeded, keep a head slice plus a tail of
//! configurable length, with a marker)".
use std::fmt::Write as _;

#[derive(Debug, Clone, Copy)]
pub struct ToolOutputLimits {
    /// Per tool_call_id ceiling.
    pub per_call_max_chars: usize,
    /// Ceiling summed across every tool result in one request.
    pub total_max_chars: usize,
    /// Length of the tail slice kept when a result is truncated.
    pub tail_chars: usize,
}

impl Default for ToolOutputLimits {
    fn default() -> Self {
        Self {
            per_call_max_chars: 20_000,
            total_max_chars: 100_000,
            tail_chars: 2_000,
        }
    }
}

/// Tracks the cumulative per-request budget across a sequence of `cap` calls.
pub struct ToolOutputBudget {
    limits: ToolOutputLimits,
    consumed: usize,
}

impl ToolOutputBudget {
    pub fn new(limits: ToolOutputLimits) -> Self {
        Self { limits, consumed: 0 }
    }

    /// Caps `text` against both the per-call and the remaining total budget,
    /// returning the (possibly truncated) text. Truncation always keeps a
    /// head slice and a tail slice with a marker in between, never cutting
    /// mid multi-byte character.
    pub fn cap(&mut self, text: &str) -> String {
        let remaining_total = self.limits.total_max_chars.saturating_sub(self.consumed);
        let effective_max = self.limits.per_call_max_chars.min(remaining_total);

        let capped = if char_len(text) <= effective_max {
            text.to_string()
        } else {
            truncate_head_tail(text, effective_max, self.limits.tail_chars)
        };

        self.consumed += char_len(&capped);
        capped
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn truncate_head_tail(text: &str, max_chars: usize, tail_chars: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= max_chars {
        return text.to_string();
    }
    let tail_chars = tail_chars.min(max_chars.saturating_sub(1));
    let head_chars = max_chars.saturating_sub(tail_chars);

    let head: String = chars[..head_chars].iter().collect();
    let tail: String = if tail_chars == 0 {
        String::new()
    } else {
        chars[chars.len() - tail_chars..].iter().collect()
    };
    let omitted = chars.len() - head_chars - tail.chars().count();

    let mut out = String::with_capacity(head.len() + tail.len() + 64);
    out.push_str(&head);
    let _ = write!(out, "\n... [truncated {omitted} chars] ...\n");
    out.push_str(&tail);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaves_short_text_untouched() {
        let mut budget = ToolOutputBudget::new(ToolOutputLimits::default());
        assert_eq!(budget.cap("hello"), "hello");
    }

    #[test]
    fn truncates_with_head_and_tail_marker() {
        let limits = ToolOutputLimits {
            per_call_max_chars: 100,
            total_max_chars: 1_000,
            tail_chars: 10,
        };
        let mut budget = ToolOutputBudget::new(limits);
        let text = "a".repeat(500);
        let capped = budget.cap(&text);
        assert!(capped.len() < text.len());
        assert!(capped.contains("truncated"));
        assert!(capped.ends_with(&"a".repeat(10)));
    }

    #[test]
    fn total_budget_shrinks_across_calls() {
        let limits = ToolOutputLimits {
            per_call_max_chars: 1_000,
            total_max_chars: 150,
            tail_chars: 5,
        };
        let mut budget = ToolOutputBudget::new(limits);
        let first = budget.cap(&"x".repeat(100));
        assert_eq!(first.chars().count(), 100);
        let second = budget.cap(&"y".repeat(100));
        assert!(second.chars().count() <= 50);
    }
}
