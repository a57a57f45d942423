//! Events and handlers for the [`Orchestrator`](super::Orchestrator).
//!
//! The orchestrator reports the lifecycle of a session through
//! [`OrchestratorEvent`] variants. Callers implement [`EventHandler`] to
//! observe them for logging, progress display or tests.
//!
//! | Handler | Use case |
//! |---------|----------|
//! | [`NoopHandler`] | Tests or fire-and-forget runs |
//! | [`LoggingHandler`] | Structured logging via `tracing` |
//! | [`FnEventHandler`] | Quick closures for simple callbacks |
//! | [`CompositeEventHandler`] | Compose multiple handlers in order |

use super::state::RunState;
use crate::checkpoint::{CheckpointId, CheckpointReason};
use crate::context::ContextBreakdown;
use crate::cost::{BudgetStatus, ThresholdCrossing};
use crate::model::TokenUsage;
use crate::session::ToolResult;
use crate::ModelError;
use std::time::Duration;
use tracing::{debug, info, warn};

// ── Events ─────────────────────────────────────────────────────────

/// Events emitted by the orchestrator during a session.
#[derive(Debug)]
pub enum OrchestratorEvent<'a> {
    SessionStarted {
        session_id: &'a str,
        task: &'a str,
    },
    /// A session was loaded from a checkpoint.
    SessionResumed {
        session_id: &'a str,
        checkpoint: &'a CheckpointId,
        state: &'a RunState,
    },
    StateChanged {
        from: &'a RunState,
        to: &'a RunState,
    },
    /// A model turn is about to be requested.
    TurnStart {
        turn: u32,
        model: &'a str,
        breakdown: &'a ContextBreakdown,
    },
    /// Older turns were folded into the summary before this turn.
    Summarized { turn: u32, verbatim_turns: usize },
    ApiRetry {
        attempt: u32,
        delay: Duration,
        error: &'a ModelError,
    },
    Text { turn: u32, text: &'a str },
    ToolCallsReceived { turn: u32, count: usize },
    ToolResult { turn: u32, result: &'a ToolResult },
    Usage {
        turn: u32,
        usage: &'a TokenUsage,
        budget: &'a BudgetStatus,
    },
    BudgetThreshold { crossing: &'a ThresholdCrossing },
    CheckpointSaved {
        id: &'a CheckpointId,
        reason: CheckpointReason,
    },
    /// The session stopped and is waiting on a human.
    AwaitingInput { state: &'a RunState },
    /// The run loop returned.
    Finished { state: &'a RunState },
}

// ── Handlers ───────────────────────────────────────────────────────

/// Observer of [`OrchestratorEvent`]s.
///
/// Handlers run inline on the orchestrator task, so they should return
/// quickly.
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &OrchestratorEvent<'_>) {
        let _ = event;
    }
}

/// Ignores every event.
pub struct NoopHandler;
impl EventHandler for NoopHandler {}

/// An event handler backed by a closure.
///
/// ```ignore
/// let handler = FnEventHandler::new(|event| {
///     if let OrchestratorEvent::Text { text, .. } = event {
///         println!("{text}");
///     }
/// });
/// ```
pub struct FnEventHandler<F>(F)
where
    F: Fn(&OrchestratorEvent<'_>) + Send + Sync;

impl<F> FnEventHandler<F>
where
    F: Fn(&OrchestratorEvent<'_>) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> EventHandler for FnEventHandler<F>
where
    F: Fn(&OrchestratorEvent<'_>) + Send + Sync,
{
    fn on_event(&self, event: &OrchestratorEvent<'_>) {
        (self.0)(event)
    }
}

/// Dispatches each event to several handlers in registration order.
///
/// ```ignore
/// let handler = CompositeEventHandler::new()
///     .with(LoggingHandler)
///     .with_if(verbose, progress_printer);
/// ```
pub struct CompositeEventHandler {
    handlers: Vec<Box<dyn EventHandler>>,
}

impl CompositeEventHandler {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn with(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    /// Add `handler` only when `condition` holds.
    pub fn with_if(self, condition: bool, handler: impl EventHandler + 'static) -> Self {
        if condition { self.with(handler) } else { self }
    }

    /// Add a handler from an `Option`. `None` is a no-op.
    pub fn with_opt(self, handler: Option<impl EventHandler + 'static>) -> Self {
        match handler {
            Some(h) => self.with(h),
            None => self,
        }
    }
}

impl Default for CompositeEventHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler for CompositeEventHandler {
    fn on_event(&self, event: &OrchestratorEvent<'_>) {
        for handler in &self.handlers {
            handler.on_event(event);
        }
    }
}

/// Logs events via `tracing`.
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn on_event(&self, event: &OrchestratorEvent<'_>) {
        match event {
            OrchestratorEvent::SessionStarted { session_id, task } => {
                let preview: String = task.chars().take(120).collect();
                info!("Session {session_id} started: {preview}");
            }
            OrchestratorEvent::SessionResumed {
                session_id,
                checkpoint,
                state,
            } => {
                info!("Session {session_id} resumed from checkpoint {checkpoint} ({state})");
            }
            OrchestratorEvent::StateChanged { from, to } => {
                info!("State: {} -> {}", from.name(), to.name());
            }
            OrchestratorEvent::TurnStart {
                turn,
                model,
                breakdown,
            } => {
                info!("[turn {turn}] {model}, {}", breakdown.to_log_string());
            }
            OrchestratorEvent::Summarized {
                turn,
                verbatim_turns,
            } => {
                info!("[turn {turn}] history summarized, {verbatim_turns} turn(s) kept verbatim");
            }
            OrchestratorEvent::ApiRetry {
                attempt,
                delay,
                error,
            } => {
                warn!(
                    "Model API error, retry {attempt} in {}ms: {error}",
                    delay.as_millis()
                );
            }
            OrchestratorEvent::Text { turn, text } => {
                let preview: String = text.chars().take(200).collect();
                debug!(
                    "[turn {turn}] text: {preview}{}",
                    if text.chars().count() > 200 { "..." } else { "" }
                );
            }
            OrchestratorEvent::ToolCallsReceived { turn, count } => {
                debug!("[turn {turn}] {count} tool call(s)");
            }
            OrchestratorEvent::ToolResult { turn, result } => {
                if let Err(e) = &result.outcome {
                    warn!("[turn {turn}] {} failed: {e}", result.tool);
                } else {
                    debug!(
                        "[turn {turn}] {} ok in {}ms",
                        result.tool, result.duration_ms
                    );
                }
            }
            OrchestratorEvent::Usage {
                turn,
                usage,
                budget,
            } => {
                debug!(
                    "[turn {turn}] tokens: {} in + {} out, total ${:.4} ({})",
                    usage.input_tokens, usage.output_tokens, budget.cost_usd, budget.level
                );
            }
            OrchestratorEvent::BudgetThreshold { crossing } => {
                warn!(
                    "Budget {} -> {} at ${:.4}",
                    crossing.from, crossing.to, crossing.cost_usd
                );
            }
            OrchestratorEvent::CheckpointSaved { id, reason } => {
                debug!("Checkpoint {id} saved ({reason:?})");
            }
            OrchestratorEvent::AwaitingInput { state } => {
                info!("Waiting for input: {state}");
            }
            OrchestratorEvent::Finished { state } => {
                info!("Run finished: {state}");
            }
        }
    }
}
