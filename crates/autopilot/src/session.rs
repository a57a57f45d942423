//! Sessions, turns and the content blocks they are made of.
//!
//! A [`Session`] is one continuous attempt at a task. Its history is a list
//! of [`Turn`]s, each one request/response cycle with the model plus the
//! tool results attached to it. Turns are append-only: once recorded they
//! are only read or folded into a summary.

use crate::context::summarizer::SummaryDigest;
use crate::model::router::ModelTierPolicy;
use crate::{Message, ToolCall, ToolError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

// ── SessionId ──────────────────────────────────────────────────────

static SESSION_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Identifier of a session. Also the name of its checkpoint stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a new id of the form `ses-{timestamp_hex}-{counter_hex}`.
    pub fn generate() -> Self {
        let ts = Utc::now().timestamp_millis();
        let count = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("ses-{ts:x}-{count:04x}"))
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

// ── Session ────────────────────────────────────────────────────────

/// Coarse lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Paused,
    Completed,
    Failed,
    Aborted,
}

impl SessionStatus {
    /// `Completed` and `Failed` sessions never run again. An `Aborted`
    /// session can be resumed from its last checkpoint.
    pub fn is_final(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Running => "running",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// A decision resolved by a human. Pinned into every payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub question: String,
    pub answer: String,
    /// Turn after which the decision was made.
    pub resolved_at_turn: u32,
}

/// One continuous attempt at a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub project_path: PathBuf,
    pub task: String,
    pub tier_policy: ModelTierPolicy,
    pub created_at: DateTime<Utc>,
    pub status: SessionStatus,
    /// Session this one was forked from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forked_from: Option<SessionId>,
    #[serde(default)]
    pub decisions: Vec<Decision>,
}

impl Session {
    pub fn new(
        task: impl Into<String>,
        project_path: impl Into<PathBuf>,
        tier_policy: ModelTierPolicy,
    ) -> Self {
        Self {
            id: SessionId::generate(),
            project_path: project_path.into(),
            task: task.into(),
            tier_policy,
            created_at: Utc::now(),
            status: SessionStatus::Running,
            forked_from: None,
            decisions: Vec::new(),
        }
    }

    /// A fresh session seeded with this session's task, project, policy and
    /// resolved decisions.
    pub fn fork(&self) -> Self {
        Self {
            id: SessionId::generate(),
            created_at: Utc::now(),
            status: SessionStatus::Running,
            forked_from: Some(self.id.clone()),
            ..self.clone()
        }
    }
}

// ── Turn ───────────────────────────────────────────────────────────

/// Why a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnTerminal {
    Text,
    ToolUse,
    Stop,
    Error,
}

impl fmt::Display for TurnTerminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TurnTerminal::Text => "text",
            TurnTerminal::ToolUse => "tool_use",
            TurnTerminal::Stop => "stop",
            TurnTerminal::Error => "error",
        };
        f.write_str(s)
    }
}

/// Outcome of one tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub tool: String,
    pub outcome: Result<String, ToolError>,
    pub duration_ms: u64,
}

impl ToolResult {
    pub fn success(call: &ToolCall, output: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            call_id: call.id.clone(),
            tool: call.function.name.clone(),
            outcome: Ok(output.into()),
            duration_ms,
        }
    }

    pub fn failure(call: &ToolCall, error: ToolError, duration_ms: u64) -> Self {
        Self {
            call_id: call.id.clone(),
            tool: call.function.name.clone(),
            outcome: Err(error),
            duration_ms,
        }
    }

    pub fn is_error(&self) -> bool {
        self.outcome.is_err()
    }

    /// Text the model sees for this result.
    pub fn render(&self) -> String {
        match &self.outcome {
            Ok(output) => output.clone(),
            Err(e) => format!("Error ({}): {e}", e.kind()),
        }
    }
}

/// A role-tagged piece of a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Input injected by a human (decision answer, guidance) or by the
    /// orchestrator itself (continuation nudges).
    Input { text: String },
    /// Text produced by the model.
    Text { text: String },
    ToolCall { call: ToolCall },
    ToolResult { result: ToolResult },
    /// A summary standing in for older turns.
    Summary { digest: SummaryDigest },
}

/// One request/response cycle with the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub index: u32,
    pub blocks: Vec<ContentBlock>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub duration_ms: u64,
    pub terminal: TurnTerminal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl Turn {
    pub fn new(index: u32, terminal: TurnTerminal) -> Self {
        Self {
            index,
            blocks: Vec::new(),
            input_tokens: 0,
            output_tokens: 0,
            duration_ms: 0,
            terminal,
            model: None,
        }
    }

    /// A summary turn covering everything up to and including `index`.
    pub fn summary(index: u32, digest: SummaryDigest) -> Self {
        let mut turn = Self::new(index, TurnTerminal::Stop);
        turn.blocks.push(ContentBlock::Summary { digest });
        turn
    }

    pub fn with_block(mut self, block: ContentBlock) -> Self {
        self.blocks.push(block);
        self
    }

    pub fn with_usage(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.input_tokens = input_tokens;
        self.output_tokens = output_tokens;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn is_summary(&self) -> bool {
        matches!(self.blocks.first(), Some(ContentBlock::Summary { .. }))
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCall> {
        self.blocks.iter().filter_map(|b| match b {
            ContentBlock::ToolCall { call } => Some(call),
            _ => None,
        })
    }

    pub fn tool_results(&self) -> impl Iterator<Item = &ToolResult> {
        self.blocks.iter().filter_map(|b| match b {
            ContentBlock::ToolResult { result } => Some(result),
            _ => None,
        })
    }

    pub fn has_tool_results(&self) -> bool {
        self.tool_results().next().is_some()
    }

    /// Tool calls in this turn that have no result yet.
    pub fn unresolved_calls(&self) -> Vec<&ToolCall> {
        self.tool_calls()
            .filter(|call| !self.tool_results().any(|r| r.call_id == call.id))
            .collect()
    }

    /// Whether every tool call has exactly one result.
    pub fn is_closed(&self) -> bool {
        self.tool_calls()
            .all(|call| self.tool_results().filter(|r| r.call_id == call.id).count() == 1)
    }

    /// Convert to payload messages.
    ///
    /// Model text and the tool calls that follow it share one assistant
    /// message, the way chat completion APIs expect them.
    pub fn to_messages(&self) -> Vec<Message> {
        let mut messages = Vec::new();
        let mut text: Option<String> = None;
        let mut calls: Vec<ToolCall> = Vec::new();

        fn flush(messages: &mut Vec<Message>, text: &mut Option<String>, calls: &mut Vec<ToolCall>) {
            if !calls.is_empty() {
                messages.push(Message::assistant_tool_calls(text.take(), std::mem::take(calls)));
            } else if let Some(t) = text.take() {
                messages.push(Message::assistant_text(t));
            }
        }

        for block in &self.blocks {
            match block {
                ContentBlock::Text { text: t } => {
                    if !calls.is_empty() {
                        flush(&mut messages, &mut text, &mut calls);
                    }
                    match &mut text {
                        Some(existing) => {
                            existing.push('\n');
                            existing.push_str(t);
                        }
                        None => text = Some(t.clone()),
                    }
                }
                ContentBlock::ToolCall { call } => calls.push(call.clone()),
                ContentBlock::Input { text: t } => {
                    flush(&mut messages, &mut text, &mut calls);
                    messages.push(Message::user(t.clone()));
                }
                ContentBlock::ToolResult { result } => {
                    flush(&mut messages, &mut text, &mut calls);
                    messages.push(Message::tool_result(&result.call_id, result.render()));
                }
                ContentBlock::Summary { digest } => {
                    flush(&mut messages, &mut text, &mut calls);
                    messages.push(Message::user(digest.render()));
                }
            }
        }
        flush(&mut messages, &mut text, &mut calls);
        messages
    }
}
