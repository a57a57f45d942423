//! Run states and the persisted session state.
//!
//! ```text
//! Starting ──► Running ──┬──► Completed
//!    ▲            │      ├──► Failed
//!    │            │      ├──► Paused ─────────────┐
//!    │            │      ├──► AwaitingDecision ───┤ resume
//!    │            │      └──► AwaitingHumanAction ┘   │
//!    │            ▼                                   ▼
//!    └───────── Aborted ◄──────────────────────── Running
//! ```
//!
//! `Completed` and `Failed` are final; a retry goes through a fork.
//! `Aborted` is left by resuming, which restarts from the last checkpoint.

use crate::context::ContextSnapshot;
use crate::cost::Budget;
use crate::session::{Session, SessionStatus, Turn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Why a session is paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    /// Cumulative cost reached the hard ceiling.
    BudgetMaxed,
    /// A human declined to continue past the alert threshold.
    BudgetAlertDeclined,
    /// `max_turns` model turns have run.
    TurnLimit,
}

impl fmt::Display for PauseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PauseReason::BudgetMaxed => write!(f, "budget max reached"),
            PauseReason::BudgetAlertDeclined => write!(f, "budget alert declined"),
            PauseReason::TurnLimit => write!(f, "turn limit reached"),
        }
    }
}

/// Who raised a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    /// The model called `request_decision`.
    Agent,
    /// Spend crossed the alert threshold.
    BudgetAlert,
}

/// A question blocking the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRequest {
    /// Tool call that asked, for agent decisions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    pub question: String,
    #[serde(default)]
    pub options: Vec<String>,
    pub kind: DecisionKind,
}

/// An action only a human can perform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HumanActionRequest {
    /// Tool call that asked. `None` when the orchestrator itself needs
    /// guidance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    pub instructions: String,
}

/// Orchestrator state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    Starting,
    Running,
    Paused { reason: PauseReason },
    AwaitingDecision { request: DecisionRequest },
    AwaitingHumanAction { request: HumanActionRequest },
    Completed { summary: String },
    Failed { error_kind: String, message: String },
    Aborted,
}

impl RunState {
    pub fn name(&self) -> &'static str {
        match self {
            RunState::Starting => "starting",
            RunState::Running => "running",
            RunState::Paused { .. } => "paused",
            RunState::AwaitingDecision { .. } => "awaiting_decision",
            RunState::AwaitingHumanAction { .. } => "awaiting_human_action",
            RunState::Completed { .. } => "completed",
            RunState::Failed { .. } => "failed",
            RunState::Aborted => "aborted",
        }
    }

    /// `Completed` or `Failed`: nothing more happens in this session.
    pub fn is_final(&self) -> bool {
        matches!(self, RunState::Completed { .. } | RunState::Failed { .. })
    }

    /// Waiting on something outside the orchestrator.
    pub fn is_blocked(&self) -> bool {
        matches!(
            self,
            RunState::Paused { .. }
                | RunState::AwaitingDecision { .. }
                | RunState::AwaitingHumanAction { .. }
        )
    }

    pub fn session_status(&self) -> SessionStatus {
        match self {
            RunState::Starting | RunState::Running => SessionStatus::Running,
            RunState::Paused { .. }
            | RunState::AwaitingDecision { .. }
            | RunState::AwaitingHumanAction { .. } => SessionStatus::Paused,
            RunState::Completed { .. } => SessionStatus::Completed,
            RunState::Failed { .. } => SessionStatus::Failed,
            RunState::Aborted => SessionStatus::Aborted,
        }
    }

    /// Whether the state machine allows moving from `self` to `to`.
    pub fn can_transition(&self, to: &RunState) -> bool {
        use RunState::*;
        match (self, to) {
            (Completed { .. } | Failed { .. }, _) => false,
            (_, Starting) => matches!(self, Aborted),
            (Starting, Running | Failed { .. } | Aborted) => true,
            (Starting, _) => false,
            (Running, _) => true,
            // Budget max can interrupt any wait.
            (_, Paused { .. }) => !matches!(self, Aborted),
            (
                Paused { .. } | AwaitingDecision { .. } | AwaitingHumanAction { .. },
                Running | Aborted | Failed { .. },
            ) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Paused { reason } => write!(f, "paused ({reason})"),
            RunState::AwaitingDecision { request } => {
                write!(f, "awaiting decision: {}", request.question)
            }
            RunState::AwaitingHumanAction { request } => {
                write!(f, "awaiting human action: {}", request.instructions)
            }
            RunState::Failed { error_kind, message } => {
                write!(f, "failed ({error_kind}): {message}")
            }
            other => f.write_str(other.name()),
        }
    }
}

/// Everything needed to resume a session. The payload of every checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub session: Session,
    pub state: RunState,
    pub budget: Budget,
    pub context: ContextSnapshot,
    /// Assistant turn whose tool calls are still waiting on a human.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_turn: Option<Turn>,
    /// Consecutive failures per call site.
    #[serde(default)]
    pub retry_ledger: BTreeMap<String, u32>,
    #[serde(default)]
    pub consecutive_tool_failures: u32,
    #[serde(default)]
    pub idle_text_turns: u32,
    /// Model turns run so far, across resumes.
    #[serde(default)]
    pub turns_completed: u32,
    /// Turn count at which the session pauses.
    pub turn_limit: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}
