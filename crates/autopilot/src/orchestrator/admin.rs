//! Offline operations on stored sessions.
//!
//! These read and write the checkpoint store directly, without a live
//! orchestrator: status reports, listing, and raising the budget of a
//! session that is not running.

use super::state::{RunState, SessionState};
use crate::checkpoint::{CheckpointId, CheckpointManager, CheckpointReason};
use crate::cost::{BudgetStatus, CostTracker, PricingTable};
use crate::session::{SessionId, SessionStatus};
use crate::AutopilotError;
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::PathBuf;
use tracing::{info, warn};

/// What `status` shows for one session.
#[derive(Debug, Clone)]
pub struct SessionStatusReport {
    pub session_id: SessionId,
    pub task: String,
    pub project_path: PathBuf,
    pub status: SessionStatus,
    pub state: RunState,
    pub budget: BudgetStatus,
    pub max_usd: f64,
    pub turns: u32,
    pub decisions: usize,
    pub forked_from: Option<SessionId>,
    pub checkpoint: CheckpointId,
    pub saved_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl SessionStatusReport {
    fn from_state(state: SessionState, checkpoint: CheckpointId, saved_at: DateTime<Utc>) -> Self {
        let max_usd = state.budget.thresholds.max_usd;
        let budget = CostTracker::from_budget(PricingTable::default(), state.budget).status();
        Self {
            session_id: state.session.id,
            task: state.session.task,
            project_path: state.session.project_path,
            status: state.state.session_status(),
            state: state.state,
            budget,
            max_usd,
            turns: state.turns_completed,
            decisions: state.session.decisions.len(),
            forked_from: state.session.forked_from,
            checkpoint,
            saved_at,
            last_error: state.last_error,
        }
    }

    /// One line for `list`.
    pub fn summary_line(&self) -> String {
        let task: String = self.task.chars().take(60).collect();
        format!(
            "{}  {:<9}  ${:>8.2}  {:>4} turns  {task}",
            self.session_id, self.status, self.budget.cost_usd, self.turns
        )
    }
}

impl fmt::Display for SessionStatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "session:     {}", self.session_id)?;
        if let Some(parent) = &self.forked_from {
            writeln!(f, "forked from: {parent}")?;
        }
        writeln!(f, "task:        {}", self.task)?;
        writeln!(f, "project:     {}", self.project_path.display())?;
        writeln!(f, "state:       {}", self.state)?;
        writeln!(
            f,
            "budget:      ${:.4} of ${:.2} ({}, ${:.2} left)",
            self.budget.cost_usd, self.max_usd, self.budget.level, self.budget.remaining_usd
        )?;
        writeln!(f, "turns:       {}", self.turns)?;
        writeln!(f, "decisions:   {}", self.decisions)?;
        write!(
            f,
            "checkpoint:  {} at {}",
            self.checkpoint,
            self.saved_at.format("%Y-%m-%d %H:%M:%S UTC")
        )?;
        if let Some(error) = &self.last_error {
            write!(f, "\nlast error:  {error}")?;
        }
        Ok(())
    }
}

/// Report on a session from its latest valid checkpoint.
pub fn session_status(
    checkpoints: &CheckpointManager,
    session_id: &str,
) -> Result<SessionStatusReport, AutopilotError> {
    let checkpoint = checkpoints
        .load_latest::<SessionState>(session_id)?
        .ok_or_else(|| AutopilotError::SessionNotFound(session_id.to_string()))?;
    let id = CheckpointId {
        session_id: checkpoint.session_id.clone(),
        seq: checkpoint.seq,
    };
    Ok(SessionStatusReport::from_state(
        checkpoint.state,
        id,
        checkpoint.saved_at,
    ))
}

/// Reports for every stored session, oldest id first. Sessions whose
/// checkpoints cannot be read are skipped with a warning.
pub fn list_sessions(
    checkpoints: &CheckpointManager,
) -> Result<Vec<SessionStatusReport>, AutopilotError> {
    let mut reports = Vec::new();
    for session_id in checkpoints.sessions()? {
        match session_status(checkpoints, &session_id) {
            Ok(report) => reports.push(report),
            Err(e) => warn!("Skipping session {session_id}: {e}"),
        }
    }
    Ok(reports)
}

/// Raise the hard budget ceiling of a session that is not running, and
/// confirm its budget alert. The next resume picks the change up.
pub fn raise_budget(
    checkpoints: &CheckpointManager,
    session_id: &str,
    max_usd: f64,
) -> Result<CheckpointId, AutopilotError> {
    let checkpoint = checkpoints
        .load_latest::<SessionState>(session_id)?
        .ok_or_else(|| AutopilotError::SessionNotFound(session_id.to_string()))?;
    let mut state = checkpoint.state;

    if matches!(state.state, RunState::Starting | RunState::Running) || state.state.is_final() {
        return Err(AutopilotError::InvalidState {
            state: state.state.name().to_string(),
            action: "raise the budget",
        });
    }

    let mut tracker = CostTracker::from_budget(PricingTable::default(), state.budget);
    tracker.raise_max(max_usd)?;
    tracker.acknowledge_alert();
    state.budget = tracker.budget().clone();

    let id = checkpoints.save(session_id, CheckpointReason::External, &state)?;
    info!("Session {session_id}: budget max raised to ${max_usd:.2} ({id})");
    Ok(id)
}
