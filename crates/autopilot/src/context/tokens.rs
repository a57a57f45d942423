//! Token estimation for pre-flight context sizing.
//!
//! Estimates are character-based with a per-family ratio. They are only used
//! to decide what fits in the next request; billing always uses the counts
//! the model API reports.

use crate::{Message, ToolDef};

/// Default characters per token (conservative estimate for English text).
/// Most tokenizers average 3-4 chars per token; 3.5 sits in the middle.
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 3.5;

/// Fixed per-message cost for role markers and separators.
pub const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Estimates token counts for one model family.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenCounter {
    chars_per_token: f64,
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self {
            chars_per_token: DEFAULT_CHARS_PER_TOKEN,
        }
    }
}

impl TokenCounter {
    /// Pick a ratio from the model name.
    pub fn for_model(model: &str) -> Self {
        let m = model.to_lowercase();
        let cpt = if m.contains("claude") {
            3.5
        } else if m.contains("gpt") || m.contains("o1") || m.contains("o3") || m.contains("gemini")
        {
            4.0
        } else if m.contains("deepseek") || m.contains("qwen") {
            3.2
        } else {
            DEFAULT_CHARS_PER_TOKEN
        };
        Self {
            chars_per_token: cpt,
        }
    }

    /// Use an explicit ratio, e.g. one calibrated from reported usage.
    pub fn with_chars_per_token(chars_per_token: f64) -> Self {
        Self {
            chars_per_token: if chars_per_token > 0.0 {
                chars_per_token
            } else {
                DEFAULT_CHARS_PER_TOKEN
            },
        }
    }

    pub fn chars_per_token(&self) -> f64 {
        self.chars_per_token
    }

    /// Estimated tokens for a piece of text. Rounds up.
    pub fn count_text(&self, text: &str) -> usize {
        let chars = text.chars().count();
        (chars as f64 / self.chars_per_token).ceil() as usize
    }

    /// Estimated tokens for structured content, counted on its JSON form.
    pub fn count_value(&self, value: &serde_json::Value) -> usize {
        self.count_text(&value.to_string())
    }

    pub fn count_message(&self, message: &Message) -> usize {
        let mut tokens = MESSAGE_OVERHEAD_TOKENS;
        if let Some(content) = &message.content {
            tokens += self.count_text(content);
        }
        if let Some(calls) = &message.tool_calls {
            for call in calls {
                tokens += self.count_text(&call.function.name);
                tokens += self.count_text(&call.function.arguments);
                tokens += MESSAGE_OVERHEAD_TOKENS;
            }
        }
        tokens
    }

    pub fn count_messages(&self, messages: &[Message]) -> usize {
        messages.iter().map(|m| self.count_message(m)).sum()
    }

    /// Tokens the tool schemas add to every request.
    pub fn count_tools(&self, tools: &[ToolDef]) -> usize {
        tools
            .iter()
            .map(|t| serde_json::to_string(t).map_or(0, |s| self.count_text(&s)))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolCall;

    #[test]
    fn count_rounds_up() {
        let counter = TokenCounter::with_chars_per_token(4.0);
        assert_eq!(counter.count_text(""), 0);
        assert_eq!(counter.count_text("abc"), 1);
        assert_eq!(counter.count_text("abcd"), 1);
        assert_eq!(counter.count_text("abcde"), 2);
    }

    #[test]
    fn counts_chars_not_bytes() {
        let counter = TokenCounter::with_chars_per_token(1.0);
        assert_eq!(counter.count_text("héllo"), 5);
    }

    #[test]
    fn message_includes_overhead_and_calls() {
        let counter = TokenCounter::with_chars_per_token(4.0);
        let plain = counter.count_message(&Message::user("abcdefgh"));
        assert_eq!(plain, MESSAGE_OVERHEAD_TOKENS + 2);

        let with_call = counter.count_message(&Message::assistant_tool_calls(
            None,
            vec![ToolCall::function("c1", "read", r#"{"a":1}"#)],
        ));
        assert!(with_call > MESSAGE_OVERHEAD_TOKENS * 2);
    }

    #[test]
    fn family_ratios() {
        assert_eq!(
            TokenCounter::for_model("anthropic/claude-sonnet-4").chars_per_token(),
            3.5
        );
        assert_eq!(TokenCounter::for_model("openai/gpt-4o").chars_per_token(), 4.0);
        assert_eq!(
            TokenCounter::for_model("unknown").chars_per_token(),
            DEFAULT_CHARS_PER_TOKEN
        );
    }

    #[test]
    fn invalid_ratio_falls_back() {
        assert_eq!(
            TokenCounter::with_chars_per_token(0.0).chars_per_token(),
            DEFAULT_CHARS_PER_TOKEN
        );
    }
}
