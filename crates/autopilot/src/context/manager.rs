//! The [`ContextManager`]: authoritative turn history and payload building.
//!
//! The history of recorded turns is never modified. What changes is the
//! *boundary*: turns before it are represented by a single summary turn,
//! turns after it are sent verbatim. [`ContextManager::build_payload`]
//! moves the boundary forward when the estimated payload crosses
//! `checkpoint_threshold × max_context_tokens`, and fails with
//! [`AutopilotError::ContextOverflow`] when even the minimal payload does not
//! fit under `max_context_tokens − reserved_output_tokens`.

use super::layout::{ContextBreakdown, ContextWindow, PinnedPrefix};
use super::summarizer::{Summarizer, SummaryLimits};
use super::tokens::TokenCounter;
use crate::session::{Decision, Turn};
use crate::{AutopilotError, Message};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Context sizing policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub max_context_tokens: usize,
    pub reserved_output_tokens: usize,
    /// Fraction of `max_context_tokens` above which older turns are folded
    /// into the summary.
    pub checkpoint_threshold: f64,
    /// Turns kept verbatim when folding, as long as that gets the payload
    /// under the threshold.
    pub keep_recent_turns: usize,
    /// Upper bound on the summary message. The effective bound is the
    /// smaller of this and a fifth of the threshold.
    pub max_summary_tokens: usize,
    pub summary_limits: SummaryLimits,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: 200_000,
            reserved_output_tokens: 8_192,
            checkpoint_threshold: 0.6,
            keep_recent_turns: 6,
            max_summary_tokens: 4_000,
            summary_limits: SummaryLimits::default(),
        }
    }
}

impl ContextConfig {
    /// Hard ceiling for the payload.
    pub fn hard_limit(&self) -> usize {
        self.max_context_tokens
            .saturating_sub(self.reserved_output_tokens)
    }

    /// Payload size above which summarization kicks in.
    pub fn threshold_tokens(&self) -> usize {
        (self.max_context_tokens as f64 * self.checkpoint_threshold) as usize
    }

    pub fn summary_budget(&self) -> usize {
        self.max_summary_tokens.min(self.threshold_tokens() / 5)
    }

    pub fn validate(&self) -> Result<(), AutopilotError> {
        if self.max_context_tokens == 0 {
            return Err(AutopilotError::config("context.max_context_tokens must be > 0"));
        }
        if self.reserved_output_tokens >= self.max_context_tokens {
            return Err(AutopilotError::config(format!(
                "context.reserved_output_tokens ({}) must be below max_context_tokens ({})",
                self.reserved_output_tokens, self.max_context_tokens
            )));
        }
        if !(self.checkpoint_threshold > 0.0 && self.checkpoint_threshold < 1.0) {
            return Err(AutopilotError::config(format!(
                "context.checkpoint_threshold must be in (0, 1), got {}",
                self.checkpoint_threshold
            )));
        }
        Ok(())
    }
}

/// Serializable state of a [`ContextManager`].
///
/// `boundary` is the context window pointer: turns `[0, boundary)` are
/// covered by `summary`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub prefix: PinnedPrefix,
    pub history: Vec<Turn>,
    pub boundary: usize,
    pub summary: Option<Turn>,
    #[serde(default)]
    pub pending_inputs: Vec<String>,
}

/// Owns the turn history and decides what goes into each request.
#[derive(Debug)]
pub struct ContextManager {
    config: ContextConfig,
    counter: TokenCounter,
    summarizer: Summarizer,
    prefix: PinnedPrefix,
    history: Vec<Turn>,
    boundary: usize,
    summary: Option<Turn>,
    pending_inputs: Vec<String>,
    /// Tokens the tool schemas add to every request.
    tool_tokens: usize,
}

impl ContextManager {
    pub fn new(config: ContextConfig, counter: TokenCounter, prefix: PinnedPrefix) -> Self {
        let summarizer = Summarizer::new(counter).with_limits(config.summary_limits);
        Self {
            config,
            counter,
            summarizer,
            prefix,
            history: Vec::new(),
            boundary: 0,
            summary: None,
            pending_inputs: Vec::new(),
            tool_tokens: 0,
        }
    }

    /// Rebuild a manager from a checkpointed snapshot.
    pub fn restore(config: ContextConfig, counter: TokenCounter, snapshot: ContextSnapshot) -> Self {
        let mut manager = Self::new(config, counter, snapshot.prefix);
        manager.boundary = snapshot.boundary.min(snapshot.history.len());
        manager.history = snapshot.history;
        manager.summary = snapshot.summary;
        manager.pending_inputs = snapshot.pending_inputs;
        manager
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            prefix: self.prefix.clone(),
            history: self.history.clone(),
            boundary: self.boundary,
            summary: self.summary.clone(),
            pending_inputs: self.pending_inputs.clone(),
        }
    }

    /// Account for tool schemas sent alongside every payload.
    pub fn with_tool_tokens(mut self, tokens: usize) -> Self {
        self.tool_tokens = tokens;
        self
    }

    pub fn set_tool_tokens(&mut self, tokens: usize) {
        self.tool_tokens = tokens;
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn prefix(&self) -> &PinnedPrefix {
        &self.prefix
    }

    pub fn history(&self) -> &[Turn] {
        &self.history
    }

    pub fn boundary(&self) -> usize {
        self.boundary
    }

    pub fn summary(&self) -> Option<&Turn> {
        self.summary.as_ref()
    }

    /// Index the next recorded turn should carry.
    pub fn next_turn_index(&self) -> u32 {
        self.history.last().map_or(0, |t| t.index + 1)
    }

    /// Append a resolved decision to the pinned prefix.
    pub fn pin_decision(&mut self, decision: Decision) {
        self.prefix.decisions.push(decision);
    }

    /// Queue human input for the next request.
    pub fn queue_input(&mut self, text: impl Into<String>) {
        self.pending_inputs.push(text.into());
    }

    /// Take queued input, to be recorded as the first blocks of the next turn.
    pub fn take_pending_inputs(&mut self) -> Vec<String> {
        std::mem::take(&mut self.pending_inputs)
    }

    pub fn has_pending_input(&self) -> bool {
        !self.pending_inputs.is_empty()
    }

    /// Append a completed turn to the history.
    pub fn record_turn(&mut self, turn: Turn) {
        debug!(
            "Recorded turn {} ({}, {} blocks)",
            turn.index,
            turn.terminal,
            turn.blocks.len()
        );
        self.history.push(turn);
    }

    /// Fold `older` into a single summary turn.
    ///
    /// Summary turns inside `older` are merged, never re-expanded.
    pub fn summarize(&self, older: &[Turn]) -> Turn {
        self.summarizer
            .summarize(older, self.config.summary_budget())
    }

    /// Estimated size of the payload as it stands.
    pub fn estimate(&self) -> ContextBreakdown {
        let pinned_tokens =
            self.counter.count_messages(&self.prefix.to_messages()) + self.tool_tokens;
        let summary_tokens = self
            .summary
            .as_ref()
            .map_or(0, |s| self.counter.count_messages(&s.to_messages()));
        let verbatim_tokens: usize = self.history[self.boundary..]
            .iter()
            .map(|t| self.counter.count_messages(&t.to_messages()))
            .sum();
        let pending_input_tokens: usize = self
            .pending_inputs
            .iter()
            .map(|text| self.counter.count_message(&Message::user(text.clone())))
            .sum();
        ContextBreakdown {
            pinned_tokens,
            summary_tokens,
            verbatim_tokens,
            pending_input_tokens,
            total_tokens: pinned_tokens + summary_tokens + verbatim_tokens + pending_input_tokens,
        }
    }

    /// Materialize the payload for the next request, folding older turns
    /// into the summary first if the estimate is over the threshold.
    pub fn build_payload(&mut self) -> Result<ContextWindow, AutopilotError> {
        let threshold = self.config.threshold_tokens();
        let limit = self.config.hard_limit();
        let mut breakdown = self.estimate();
        let before = breakdown.total_tokens;
        let mut summarized = false;

        if breakdown.total_tokens > threshold {
            let protected = self.protected_from();
            let keep_start = self
                .history
                .len()
                .saturating_sub(self.config.keep_recent_turns)
                .min(protected);
            if keep_start > self.boundary {
                self.fold_to(keep_start);
                summarized = true;
                breakdown = self.estimate();
            }
            while breakdown.total_tokens > threshold && self.boundary < protected {
                self.fold_to(self.boundary + 1);
                summarized = true;
                breakdown = self.estimate();
            }
            if summarized {
                info!(
                    "Context summarized: turns before {} folded, {} -> {} tokens (threshold {})",
                    self.boundary, before, breakdown.total_tokens, threshold
                );
            }
        }

        if breakdown.total_tokens > limit {
            return Err(AutopilotError::ContextOverflow {
                required: breakdown.total_tokens,
                limit,
            });
        }

        debug!("Context payload: {}", breakdown.to_log_string());
        Ok(ContextWindow {
            messages: self.materialize(),
            estimated_tokens: breakdown.total_tokens,
            breakdown,
            verbatim_turns: self.history.len() - self.boundary,
            summarized,
        })
    }

    /// First history index that must stay verbatim: the last turn. Tool
    /// results in earlier turns have already been answered by the model and
    /// fold like any other turn.
    fn protected_from(&self) -> usize {
        self.history
            .len()
            .saturating_sub(1)
            .max(self.boundary)
    }

    fn fold_to(&mut self, new_boundary: usize) {
        let mut span: Vec<Turn> = Vec::with_capacity(new_boundary - self.boundary + 1);
        if let Some(summary) = self.summary.take() {
            span.push(summary);
        }
        span.extend(self.history[self.boundary..new_boundary].iter().cloned());
        self.summary = Some(self.summarize(&span));
        self.boundary = new_boundary;
    }

    fn materialize(&self) -> Vec<Message> {
        let mut messages = self.prefix.to_messages();
        if let Some(summary) = &self.summary {
            messages.extend(summary.to_messages());
        }
        for turn in &self.history[self.boundary..] {
            messages.extend(turn.to_messages());
        }
        for text in &self.pending_inputs {
            messages.push(Message::user(text.clone()));
        }
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolCall;
    use crate::session::{ContentBlock, ToolResult, TurnTerminal};

    /// One char per token keeps the arithmetic exact: each message costs its
    /// length plus the fixed overhead.
    fn counter() -> TokenCounter {
        TokenCounter::with_chars_per_token(1.0)
    }

    fn config(max: usize, reserved: usize, keep_recent: usize) -> ContextConfig {
        ContextConfig {
            max_context_tokens: max,
            reserved_output_tokens: reserved,
            keep_recent_turns: keep_recent,
            ..ContextConfig::default()
        }
    }

    /// Pinned prefix of exactly `tokens` tokens.
    fn prefix(tokens: usize) -> PinnedPrefix {
        // Two messages of overhead 4, plus 15 chars of <task> tags.
        let system_len = tokens - 8 - 15 - 1;
        PinnedPrefix::new("s".repeat(system_len), "t")
    }

    /// Text-only turn of exactly `tokens` tokens.
    fn text_turn(index: u32, tokens: usize) -> Turn {
        Turn::new(index, TurnTerminal::Text).with_block(ContentBlock::Text {
            text: "x".repeat(tokens - 4),
        })
    }

    fn tool_turn(index: u32) -> Turn {
        let call = ToolCall::function(format!("c{index}"), "read_file", r#"{"path":"a.rs"}"#);
        Turn::new(index, TurnTerminal::ToolUse)
            .with_block(ContentBlock::ToolCall { call: call.clone() })
            .with_block(ContentBlock::ToolResult {
                result: ToolResult::success(&call, "y".repeat(100), 1),
            })
    }

    #[test]
    fn fixtures_have_exact_sizes() {
        let manager = ContextManager::new(config(1000, 100, 6), counter(), prefix(200));
        assert_eq!(manager.estimate().pinned_tokens, 200);
        let mut manager = manager;
        manager.record_turn(text_turn(0, 150));
        assert_eq!(manager.estimate().verbatim_tokens, 150);
    }

    #[test]
    fn summary_appears_and_payload_drops_under_threshold() {
        let mut manager = ContextManager::new(config(1000, 100, 6), counter(), prefix(200));
        let pinned_before = manager.prefix().to_messages();
        let mut saw_summary = false;

        for i in 0..10 {
            manager.record_turn(text_turn(i, 150));
            let window = manager.build_payload().unwrap();
            assert!(window.estimated_tokens <= 900);
            if window.summarized {
                saw_summary = true;
                assert!(window.estimated_tokens <= 600, "{}", window.estimated_tokens);
            }
        }

        assert!(saw_summary);
        assert!(manager.summary().is_some());
        assert_eq!(manager.history().len(), 10);
        assert_eq!(manager.prefix().to_messages(), pinned_before);
        let window = manager.build_payload().unwrap();
        assert!(window.estimated_tokens <= 600);
        assert_eq!(&window.messages[..2], &pinned_before[..]);
    }

    #[test]
    fn keeps_recent_turns_when_that_is_enough() {
        let mut manager = ContextManager::new(config(10_000, 100, 3), counter(), prefix(200));
        for i in 0..40 {
            manager.record_turn(text_turn(i, 150));
        }
        let window = manager.build_payload().unwrap();
        assert!(window.summarized);
        assert_eq!(window.verbatim_turns, 3);
        assert_eq!(manager.boundary(), 37);
    }

    #[test]
    fn no_summary_under_threshold() {
        let mut manager = ContextManager::new(config(10_000, 100, 2), counter(), prefix(200));
        for i in 0..5 {
            manager.record_turn(text_turn(i, 150));
        }
        let window = manager.build_payload().unwrap();
        assert!(!window.summarized);
        assert_eq!(window.verbatim_turns, 5);
        assert!(manager.summary().is_none());
    }

    #[test]
    fn unanswered_tool_results_stay_verbatim() {
        let mut manager = ContextManager::new(config(1000, 100, 0), counter(), prefix(200));
        manager.record_turn(text_turn(0, 150));
        manager.record_turn(text_turn(1, 150));
        manager.record_turn(text_turn(2, 150));
        manager.record_turn(tool_turn(3));
        let window = manager.build_payload().unwrap();
        assert!(window.summarized);
        assert_eq!(manager.boundary(), 3);
        assert!(manager.history()[manager.boundary()].has_tool_results());
    }

    #[test]
    fn answered_tool_results_fold_with_later_text_turns() {
        let mut manager = ContextManager::new(config(1000, 100, 0), counter(), prefix(200));
        manager.record_turn(tool_turn(0));
        for i in 1..=8 {
            manager.record_turn(text_turn(i, 150));
            let window = manager.build_payload().unwrap();
            assert!(window.estimated_tokens <= 900, "turn {i}: {}", window.estimated_tokens);
        }
        assert!(manager.boundary() > 1);
        assert!(manager.summary().is_some());
    }

    #[test]
    fn overflow_when_prefix_and_last_turn_do_not_fit() {
        let mut manager = ContextManager::new(config(1000, 100, 6), counter(), prefix(800));
        manager.record_turn(text_turn(0, 150));
        match manager.build_payload() {
            Err(AutopilotError::ContextOverflow { required, limit }) => {
                assert_eq!(limit, 900);
                assert!(required > 900);
            }
            other => panic!("expected overflow, got {other:?}"),
        }
    }

    #[test]
    fn pending_input_is_sent_last_and_taken_once() {
        let mut manager = ContextManager::new(config(10_000, 100, 6), counter(), prefix(200));
        manager.record_turn(text_turn(0, 50));
        manager.queue_input("use sqlite");
        let window = manager.build_payload().unwrap();
        assert_eq!(
            window.messages.last().and_then(|m| m.content.as_deref()),
            Some("use sqlite")
        );
        assert_eq!(manager.take_pending_inputs(), vec!["use sqlite"]);
        assert!(!manager.has_pending_input());
    }

    #[test]
    fn snapshot_restore_roundtrip() {
        let mut manager = ContextManager::new(config(1000, 100, 1), counter(), prefix(200));
        for i in 0..6 {
            manager.record_turn(text_turn(i, 150));
            manager.build_payload().unwrap();
        }
        manager.pin_decision(Decision {
            question: "q".into(),
            answer: "a".into(),
            resolved_at_turn: 5,
        });
        let snapshot = manager.snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();
        let back: ContextSnapshot = serde_json::from_str(&json).unwrap();
        let mut restored = ContextManager::restore(config(1000, 100, 1), counter(), back);
        assert_eq!(restored.snapshot(), snapshot);
        assert_eq!(
            restored.build_payload().unwrap().messages,
            manager.build_payload().unwrap().messages
        );
    }

    #[test]
    fn config_validation() {
        assert!(ContextConfig::default().validate().is_ok());
        assert!(config(1000, 1000, 2).validate().is_err());
        let bad = ContextConfig {
            checkpoint_threshold: 1.5,
            ..ContextConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
