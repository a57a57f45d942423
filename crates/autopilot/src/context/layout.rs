//! Payload layout: pinned prefix, summary, verbatim turns.
//!
//! Every request is assembled from three zones:
//! 1. **Pinned prefix**: system prompt, task description and the log of
//!    resolved decisions. Never summarized. Rendered byte-identically as
//!    long as its inputs do not change, so it also anchors prompt caching.
//! 2. **Summary**: one message standing in for every folded turn.
//! 3. **Verbatim turns**: the most recent turns, unmodified.
//!
//! Queued human input goes last.

use crate::Message;
use crate::session::Decision;
use serde::{Deserialize, Serialize};

/// Content exempt from summarization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinnedPrefix {
    pub system: String,
    pub task: String,
    pub decisions: Vec<Decision>,
}

impl PinnedPrefix {
    pub fn new(system: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            task: task.into(),
            decisions: Vec::new(),
        }
    }

    pub fn with_decisions(mut self, decisions: Vec<Decision>) -> Self {
        self.decisions = decisions;
        self
    }

    pub fn to_messages(&self) -> Vec<Message> {
        let mut task = format!("<task>\n{}\n</task>", self.task);
        if !self.decisions.is_empty() {
            task.push_str("\n\n<decisions>\n");
            for (i, d) in self.decisions.iter().enumerate() {
                task.push_str(&format!(
                    "{}. {} -> {} (after turn {})\n",
                    i + 1,
                    d.question,
                    d.answer,
                    d.resolved_at_turn
                ));
            }
            task.push_str("</decisions>");
        }
        vec![Message::system(self.system.clone()), Message::user(task)]
    }
}

/// Per-zone breakdown of estimated payload tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextBreakdown {
    /// Pinned prefix plus tool schemas.
    pub pinned_tokens: usize,
    pub summary_tokens: usize,
    pub verbatim_tokens: usize,
    pub pending_input_tokens: usize,
    pub total_tokens: usize,
}

impl ContextBreakdown {
    pub fn to_log_string(&self) -> String {
        format!(
            "~{} tokens (pinned {}, summary {}, verbatim {}, input {})",
            self.total_tokens,
            self.pinned_tokens,
            self.summary_tokens,
            self.verbatim_tokens,
            self.pending_input_tokens
        )
    }
}

/// The materialized payload for the next request.
#[derive(Debug, Clone)]
pub struct ContextWindow {
    pub messages: Vec<Message>,
    pub estimated_tokens: usize,
    pub breakdown: ContextBreakdown,
    /// Number of verbatim turns included.
    pub verbatim_turns: usize,
    /// Whether building this payload folded turns into the summary.
    pub summarized: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MessageRole;

    #[test]
    fn prefix_is_system_then_task() {
        let prefix = PinnedPrefix::new("You are careful.", "Add a flag");
        let msgs = prefix.to_messages();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, MessageRole::System);
        assert_eq!(msgs[1].content.as_deref(), Some("<task>\nAdd a flag\n</task>"));
    }

    #[test]
    fn decisions_render_in_order() {
        let prefix = PinnedPrefix::new("sys", "task").with_decisions(vec![
            Decision {
                question: "Which DB?".into(),
                answer: "sqlite".into(),
                resolved_at_turn: 3,
            },
            Decision {
                question: "Keep API?".into(),
                answer: "yes".into(),
                resolved_at_turn: 7,
            },
        ]);
        let task = prefix.to_messages()[1].content.clone().unwrap();
        let first = task.find("Which DB?").unwrap();
        let second = task.find("Keep API?").unwrap();
        assert!(first < second);
        assert!(task.contains("1. Which DB? -> sqlite (after turn 3)"));
    }

    #[test]
    fn rendering_is_stable() {
        let prefix = PinnedPrefix::new("sys", "task");
        assert_eq!(prefix.to_messages(), prefix.to_messages());
    }
}
