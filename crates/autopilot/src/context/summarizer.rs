//! Extractive, incremental summarization of older turns.
//!
//! Folding older turns into a summary never calls the model. The
//! [`Summarizer`] pulls out the facts a continuing agent needs (files it
//! touched, open questions, outstanding TODOs, one progress line per action)
//! into a [`SummaryDigest`] and merges that with the digest of any earlier
//! summary in the span. The result is deterministic, and summarizing a
//! summary on its own returns it unchanged.

use super::file_tracker::{FileAccess, FileAccessTracker};
use super::tokens::{MESSAGE_OVERHEAD_TOKENS, TokenCounter};
use crate::session::{ContentBlock, Turn};
use serde::{Deserialize, Serialize};

/// Caps on each section of a digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SummaryLimits {
    pub max_files: usize,
    pub max_questions: usize,
    pub max_todos: usize,
    pub max_progress: usize,
}

impl Default for SummaryLimits {
    fn default() -> Self {
        Self {
            max_files: 20,
            max_questions: 10,
            max_todos: 10,
            max_progress: 40,
        }
    }
}

/// Structured content of a summary turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryDigest {
    pub first_turn: u32,
    pub last_turn: u32,
    /// Number of original turns folded in, across all merges.
    pub turns_covered: u32,
    pub files: Vec<FileAccess>,
    pub open_questions: Vec<String>,
    pub todos: Vec<String>,
    pub progress: Vec<String>,
}

impl SummaryDigest {
    /// Text sent to the model in place of the folded turns.
    pub fn render(&self) -> String {
        let mut out = format!(
            "[Summary of turns {}-{} ({} turns folded)]\n",
            self.first_turn, self.last_turn, self.turns_covered
        );
        if !self.files.is_empty() {
            out.push_str("Files touched:\n");
            for f in &self.files {
                out.push_str(&format!("- {} ({}, turn {})\n", f.path, f.access, f.turn));
            }
        }
        push_section(&mut out, "Open questions", &self.open_questions);
        push_section(&mut out, "Outstanding TODOs", &self.todos);
        push_section(&mut out, "Progress", &self.progress);
        out
    }

    fn is_empty(&self) -> bool {
        self.turns_covered == 0
    }

    /// Drop the oldest entry of the least important non-empty section.
    /// Returns `false` once there is nothing left to drop.
    fn drop_one(&mut self) -> bool {
        if !self.progress.is_empty() {
            self.progress.remove(0);
        } else if !self.todos.is_empty() {
            self.todos.remove(0);
        } else if !self.files.is_empty() {
            self.files.remove(0);
        } else if !self.open_questions.is_empty() {
            self.open_questions.remove(0);
        } else {
            return false;
        }
        true
    }
}

fn push_section(out: &mut String, title: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    out.push_str(title);
    out.push_str(":\n");
    for item in items {
        out.push_str("- ");
        out.push_str(item);
        out.push('\n');
    }
}

/// Builds summary turns from spans of older turns.
#[derive(Debug, Clone)]
pub struct Summarizer {
    limits: SummaryLimits,
    counter: TokenCounter,
}

impl Summarizer {
    pub fn new(counter: TokenCounter) -> Self {
        Self {
            limits: SummaryLimits::default(),
            counter,
        }
    }

    pub fn with_limits(mut self, limits: SummaryLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Fold `older` into one summary turn whose message fits in
    /// `budget_tokens`.
    ///
    /// Summary turns inside `older` are merged rather than re-expanded.
    /// When the digest is over budget the oldest progress lines go first,
    /// then TODOs, then files, then open questions.
    pub fn summarize(&self, older: &[Turn], budget_tokens: usize) -> Turn {
        let mut digest = SummaryDigest::default();
        let mut files = FileAccessTracker::new(self.limits.max_files);

        for turn in older {
            match turn.blocks.first() {
                Some(ContentBlock::Summary { digest: prev }) => {
                    self.merge_digest(&mut digest, &mut files, prev);
                }
                _ => {
                    self.cover(&mut digest, turn.index, turn.index, 1);
                    self.extract(&mut digest, &mut files, turn);
                }
            }
        }

        digest.files = files.entries();
        cap_front(&mut digest.open_questions, self.limits.max_questions);
        cap_front(&mut digest.todos, self.limits.max_todos);
        cap_front(&mut digest.progress, self.limits.max_progress);

        let text_budget = budget_tokens.saturating_sub(MESSAGE_OVERHEAD_TOKENS);
        while self.counter.count_text(&digest.render()) > text_budget {
            if !digest.drop_one() {
                break;
            }
        }

        Turn::summary(digest.last_turn, digest)
    }

    /// Estimated tokens of the message a summary turn renders to.
    pub fn estimate(&self, digest: &SummaryDigest) -> usize {
        self.counter.count_text(&digest.render()) + MESSAGE_OVERHEAD_TOKENS
    }

    fn cover(&self, digest: &mut SummaryDigest, first: u32, last: u32, count: u32) {
        if digest.is_empty() {
            digest.first_turn = first;
            digest.last_turn = last;
        } else {
            digest.first_turn = digest.first_turn.min(first);
            digest.last_turn = digest.last_turn.max(last);
        }
        digest.turns_covered += count;
    }

    fn merge_digest(
        &self,
        digest: &mut SummaryDigest,
        files: &mut FileAccessTracker,
        prev: &SummaryDigest,
    ) {
        self.cover(digest, prev.first_turn, prev.last_turn, prev.turns_covered);
        for f in &prev.files {
            files.record(f.clone());
        }
        extend_unique(&mut digest.open_questions, prev.open_questions.iter().cloned());
        extend_unique(&mut digest.todos, prev.todos.iter().cloned());
        extend_unique(&mut digest.progress, prev.progress.iter().cloned());
    }

    fn extract(&self, digest: &mut SummaryDigest, files: &mut FileAccessTracker, turn: &Turn) {
        let index = turn.index;
        let mut acted = false;

        for block in &turn.blocks {
            match block {
                ContentBlock::Input { text } => {
                    extend_unique(
                        &mut digest.progress,
                        [format!("turn {index}: input: {}", preview(text, 100))],
                    );
                }
                ContentBlock::Text { text } => {
                    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
                        if line.contains("TODO") || line.starts_with("- [ ]") {
                            extend_unique(&mut digest.todos, [preview(line, 160)]);
                        } else if line.ends_with('?') {
                            extend_unique(&mut digest.open_questions, [preview(line, 160)]);
                        }
                    }
                }
                ContentBlock::ToolCall { call } => {
                    acted = true;
                    files.record_call(call, index);
                    let outcome = turn
                        .tool_results()
                        .find(|r| r.call_id == call.id)
                        .map_or("no result", |r| match &r.outcome {
                            Ok(_) => "ok",
                            Err(e) => e.kind(),
                        });
                    extend_unique(
                        &mut digest.progress,
                        [format!(
                            "turn {index}: {} {} -> {outcome}",
                            call.name(),
                            preview(&call.function.arguments, 80)
                        )],
                    );
                }
                ContentBlock::ToolResult { .. } | ContentBlock::Summary { .. } => {}
            }
        }

        if !acted
            && let Some(first_line) = turn.blocks.iter().find_map(|b| match b {
                ContentBlock::Text { text } => text.lines().find(|l| !l.trim().is_empty()),
                _ => None,
            })
        {
            extend_unique(
                &mut digest.progress,
                [format!("turn {index}: said: {}", preview(first_line.trim(), 120))],
            );
        }
    }
}

fn extend_unique(list: &mut Vec<String>, items: impl IntoIterator<Item = String>) {
    for item in items {
        if !list.contains(&item) {
            list.push(item);
        }
    }
}

fn cap_front(list: &mut Vec<String>, max: usize) {
    if list.len() > max {
        list.drain(..list.len() - max);
    }
}

/// Single-line, char-safe preview.
fn preview(text: &str, max_chars: usize) -> String {
    let flat: String = text
        .chars()
        .map(|c| if c == '\n' { ' ' } else { c })
        .take(max_chars)
        .collect();
    if text.chars().count() > max_chars {
        format!("{flat}...")
    } else {
        flat
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolCall;
    use crate::ToolError;
    use crate::session::{ToolResult, TurnTerminal};

    fn summarizer() -> Summarizer {
        Summarizer::new(TokenCounter::default())
    }

    fn tool_turn(index: u32, path: &str, fail: bool) -> Turn {
        let call = ToolCall::function(
            format!("c{index}"),
            "edit_file",
            format!(r#"{{"path":"{path}","old":"a","new":"b"}}"#),
        );
        let result = if fail {
            ToolResult::failure(&call, ToolError::not_found(path), 2)
        } else {
            ToolResult::success(&call, "edited", 2)
        };
        Turn::new(index, TurnTerminal::ToolUse)
            .with_block(ContentBlock::Text {
                text: "TODO: update the docs\nShould the CLI flag be global?".into(),
            })
            .with_block(ContentBlock::ToolCall { call })
            .with_block(ContentBlock::ToolResult { result })
    }

    fn digest_of(turn: &Turn) -> &SummaryDigest {
        match &turn.blocks[0] {
            ContentBlock::Summary { digest } => digest,
            other => panic!("expected summary, got {other:?}"),
        }
    }

    #[test]
    fn preserves_files_todos_and_questions() {
        let turns = vec![tool_turn(0, "src/a.rs", false), tool_turn(1, "src/b.rs", true)];
        let summary = summarizer().summarize(&turns, 10_000);
        let digest = digest_of(&summary);

        assert_eq!(digest.first_turn, 0);
        assert_eq!(digest.last_turn, 1);
        assert_eq!(digest.turns_covered, 2);
        assert_eq!(digest.files.len(), 2);
        assert_eq!(digest.todos, vec!["TODO: update the docs"]);
        assert_eq!(digest.open_questions, vec!["Should the CLI flag be global?"]);
        assert!(digest.progress[1].ends_with("-> not_found"));
        assert!(summary.is_summary());
    }

    #[test]
    fn resummarizing_a_summary_is_identity() {
        let s = summarizer();
        let turns: Vec<Turn> = (0..6).map(|i| tool_turn(i, &format!("f{i}.rs"), false)).collect();
        let once = s.summarize(&turns, 200);
        let twice = s.summarize(std::slice::from_ref(&once), 200);
        assert_eq!(once, twice);
    }

    #[test]
    fn merging_keeps_earlier_facts() {
        let s = summarizer();
        let first = s.summarize(&[tool_turn(0, "src/a.rs", false)], 10_000);
        let merged = s.summarize(&[first, tool_turn(1, "src/b.rs", false)], 10_000);
        let digest = digest_of(&merged);
        assert_eq!(digest.turns_covered, 2);
        let paths: Vec<&str> = digest.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["src/a.rs", "src/b.rs"]);
    }

    #[test]
    fn respects_token_budget() {
        let s = summarizer();
        let turns: Vec<Turn> = (0..30)
            .map(|i| tool_turn(i, &format!("src/module_{i}.rs"), false))
            .collect();
        let summary = s.summarize(&turns, 120);
        assert!(s.estimate(digest_of(&summary)) <= 120);
        // Header survives even when everything else is dropped.
        assert!(digest_of(&summary).render().starts_with("[Summary of turns 0-29"));
    }

    #[test]
    fn preview_is_char_safe() {
        let text = "é".repeat(10);
        assert_eq!(preview(&text, 3), "ééé...");
        assert_eq!(preview("a\nb", 10), "a b");
    }
}
