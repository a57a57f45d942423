//! The [`Orchestrator`]: drives one session through the run-state machine.
//!
//! Each step of the loop:
//!
//! 1. Checks the gates: abort, budget max, unconfirmed budget alert, an open
//!    human request, idle text turns, the turn limit. A closed gate moves the
//!    session into a waiting state and checkpoints.
//! 2. Builds the payload through the [`ContextManager`], summarizing first
//!    if it crossed the threshold.
//! 3. Calls the model with bounded retries, racing the abort signal.
//! 4. Bills the turn and checkpoints on a threshold crossing.
//! 5. Executes workspace tool calls through the [`ToolExecutionEngine`] and
//!    intercepts control tool calls.
//! 6. Records the turn and checkpoints.
//!
//! A session waiting on a human either waits on the [`ControlReceiver`]
//! given to [`Orchestrator::with_control`], or returns its [`RunOutcome`]
//! so the caller can resume it later from the checkpoint.

use super::config::OrchestratorConfig;
use super::events::{EventHandler, NoopHandler, OrchestratorEvent};
use super::protocol::{self, ControlRequest};
use super::state::{
    DecisionKind, DecisionRequest, HumanActionRequest, PauseReason, RunState, SessionState,
};
use crate::checkpoint::{Checkpoint, CheckpointId, CheckpointManager, CheckpointReason};
use crate::context::{ContextManager, PinnedPrefix, TokenCounter};
use crate::control::{AbortSignal, ControlMessage, ControlReceiver, ResumeSignal};
use crate::cost::{BudgetStatus, CostTracker};
use crate::model::retry::call_with_retry;
use crate::model::{ModelClient, ModelReply, ModelRequest, TierSignal, TokenUsage};
use crate::session::{ContentBlock, Decision, Session, SessionId, ToolResult, Turn, TurnTerminal};
use crate::tools::ToolExecutionEngine;
use crate::{AutopilotError, ToolCall, ToolDef, ToolError};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Queued after a text-only reply that did not finish the task.
const CONTINUE_NUDGE: &str = "You replied without calling a tool. Continue working on the task \
     with the available tools, or call `task_complete` if it is finished.";

/// Option labels of the budget alert decision.
const ALERT_CONTINUE: &str = "continue";
const ALERT_PAUSE: &str = "pause";

/// How a run loop ended.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub session_id: SessionId,
    pub state: RunState,
    /// Originating error kind when the session failed.
    pub error_kind: Option<String>,
    pub last_checkpoint: Option<CheckpointId>,
    pub budget: BudgetStatus,
    pub turns: u32,
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self.state, RunState::Completed { .. })
    }
}

/// Mutable state of the session being driven.
struct Run {
    session: Session,
    state: RunState,
    cost: CostTracker,
    context: ContextManager,
    pending_turn: Option<Turn>,
    retry_ledger: BTreeMap<String, u32>,
    consecutive_tool_failures: u32,
    idle_text_turns: u32,
    turns_completed: u32,
    turn_limit: u32,
    last_error: Option<String>,
    last_checkpoint: Option<CheckpointId>,
}

impl Run {
    fn snapshot(&self) -> SessionState {
        SessionState {
            session: self.session.clone(),
            state: self.state.clone(),
            budget: self.cost.budget().clone(),
            context: self.context.snapshot(),
            pending_turn: self.pending_turn.clone(),
            retry_ledger: self.retry_ledger.clone(),
            consecutive_tool_failures: self.consecutive_tool_failures,
            idle_text_turns: self.idle_text_turns,
            turns_completed: self.turns_completed,
            turn_limit: self.turn_limit,
            last_error: self.last_error.clone(),
        }
    }
}

/// Drives sessions against a model, a tool engine and a checkpoint store.
///
/// ```ignore
/// let outcome = Orchestrator::new(&client, &engine, checkpoints, config)
///     .with_event_handler(&LoggingHandler)
///     .start("Add a /health endpoint", "./my-service")
///     .await?;
/// ```
pub struct Orchestrator<'a> {
    client: &'a dyn ModelClient,
    engine: &'a ToolExecutionEngine,
    checkpoints: CheckpointManager,
    config: OrchestratorConfig,
    event_handler: &'a dyn EventHandler,
    control: Option<ControlReceiver>,
    abort: AbortSignal,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        client: &'a dyn ModelClient,
        engine: &'a ToolExecutionEngine,
        checkpoints: CheckpointManager,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            client,
            engine,
            checkpoints,
            config,
            event_handler: &NoopHandler,
            control: None,
            abort: AbortSignal::never(),
        }
    }

    pub fn with_event_handler(mut self, handler: &'a dyn EventHandler) -> Self {
        self.event_handler = handler;
        self
    }

    /// Wait on `control` whenever the session blocks on a human, and abort
    /// when its handle says so.
    pub fn with_control(mut self, control: ControlReceiver) -> Self {
        self.abort = control.abort_signal();
        self.control = Some(control);
        self
    }

    /// Observe `abort` without taking resume input. Blocked sessions
    /// return instead of waiting.
    pub fn with_abort_signal(mut self, abort: AbortSignal) -> Self {
        self.abort = abort;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    // ── Entry points ──────────────────────────────────────────────────

    /// Create a session for `task` in `project_path` and run it.
    pub async fn start(
        self,
        task: impl Into<String>,
        project_path: impl Into<PathBuf>,
    ) -> Result<RunOutcome, AutopilotError> {
        let session = Session::new(task, project_path, self.config.routing.clone());
        self.start_session(session).await
    }

    /// Run a session the caller created, e.g. to learn its id up front.
    pub async fn start_session(mut self, session: Session) -> Result<RunOutcome, AutopilotError> {
        self.config.validate()?;
        self.emit(OrchestratorEvent::SessionStarted {
            session_id: session.id.as_str(),
            task: &session.task,
        });
        let mut run = self.fresh_run(session);
        self.save(&mut run, CheckpointReason::Start)?;
        self.transition(&mut run, RunState::Running)?;
        self.drive(&mut run).await
    }

    /// Continue a session from its latest valid checkpoint.
    ///
    /// A paused session is released if its cause is gone. A session waiting
    /// on a human stays waiting; use [`resume_with`](Self::resume_with).
    pub async fn resume(self, session_id: &str) -> Result<RunOutcome, AutopilotError> {
        self.resume_inner(session_id, None).await
    }

    /// Continue a session, answering what it is waiting on with `signal`.
    pub async fn resume_with(
        self,
        session_id: &str,
        signal: ResumeSignal,
    ) -> Result<RunOutcome, AutopilotError> {
        self.resume_inner(session_id, Some(signal)).await
    }

    /// Start a new session seeded with the task, project, routing and
    /// resolved decisions of `session_id`. Works on finished sessions.
    pub async fn fork(self, session_id: &str) -> Result<RunOutcome, AutopilotError> {
        let checkpoint = self.load(session_id)?;
        let session = checkpoint.state.session.fork();
        info!("Forking session {session_id} into {}", session.id);
        self.start_session(session).await
    }

    async fn resume_inner(
        mut self,
        session_id: &str,
        signal: Option<ResumeSignal>,
    ) -> Result<RunOutcome, AutopilotError> {
        self.config.validate()?;
        let checkpoint = self.load(session_id)?;
        let id = CheckpointId {
            session_id: checkpoint.session_id.clone(),
            seq: checkpoint.seq,
        };
        let mut run = self.restore_run(checkpoint.state, id.clone());
        self.emit(OrchestratorEvent::SessionResumed {
            session_id: run.session.id.as_str(),
            checkpoint: &id,
            state: &run.state,
        });

        if run.state.is_final() {
            return Err(AutopilotError::InvalidState {
                state: run.state.name().to_string(),
                action: "resume",
            });
        }
        if matches!(run.state, RunState::Starting | RunState::Running) {
            // The process that owned this session died without a final write.
            info!("Session {session_id} was interrupted mid-run, recovering");
            run.state = RunState::Aborted;
        }
        if run.state == RunState::Aborted {
            self.transition(&mut run, RunState::Starting)?;
            self.transition(&mut run, RunState::Running)?;
        }

        match signal {
            Some(signal) => self
                .apply_resume(&mut run, &signal)
                .map_err(AutopilotError::ResumeRejected)?,
            None => match run.state.clone() {
                RunState::Paused { .. } => {
                    if let Err(reason) = self.apply_resume(&mut run, &ResumeSignal::Continue) {
                        info!("Session {session_id} stays paused: {reason}");
                    }
                }
                // Confirmed offline through a budget raise.
                RunState::AwaitingDecision { request }
                    if request.kind == DecisionKind::BudgetAlert
                        && !run.cost.needs_confirmation() =>
                {
                    self.transition(&mut run, RunState::Running)?;
                }
                _ => {}
            },
        }

        self.save(&mut run, CheckpointReason::Start)?;
        self.drive(&mut run).await
    }

    // ── Run loop ──────────────────────────────────────────────────────

    async fn drive(&mut self, run: &mut Run) -> Result<RunOutcome, AutopilotError> {
        loop {
            if run.state.is_final() || run.state == RunState::Aborted {
                break;
            }
            if run.state.is_blocked() {
                self.emit(OrchestratorEvent::AwaitingInput { state: &run.state });
                if !self.wait_for_control(run).await? {
                    break;
                }
                continue;
            }
            self.step(run).await?;
        }
        self.emit(OrchestratorEvent::Finished { state: &run.state });
        Ok(self.outcome(run))
    }

    /// One gated model turn.
    async fn step(&self, run: &mut Run) -> Result<(), AutopilotError> {
        if self.abort.is_aborted() {
            return self.abort_run(run);
        }
        if let Some((blocked, reason)) = self.gate(run) {
            self.transition(run, blocked)?;
            self.save(run, reason)?;
            return Ok(());
        }

        let turn_index = run.context.next_turn_index();
        let window = match run.context.build_payload() {
            Ok(window) => window,
            Err(e) => return self.fail(run, e),
        };
        if window.summarized {
            self.emit(OrchestratorEvent::Summarized {
                turn: turn_index,
                verbatim_turns: window.verbatim_turns,
            });
            self.save(run, CheckpointReason::Summarization)?;
        }

        let model = run
            .session
            .tier_policy
            .model_for(TierSignal {
                turn: turn_index,
                consecutive_tool_failures: run.consecutive_tool_failures,
            })
            .to_string();
        self.emit(OrchestratorEvent::TurnStart {
            turn: turn_index,
            model: &model,
            breakdown: &window.breakdown,
        });

        let request = ModelRequest {
            model,
            messages: window.messages,
            tools: self.tool_defs(),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        };
        let started = Instant::now();
        let client = self.client;
        let handler = self.event_handler;
        let request_ref = &request;
        let mut abort = self.abort.clone();
        let mut failed_usage = Vec::new();
        let response = tokio::select! {
            result = call_with_retry(
                &self.config.retry,
                move |_| client.complete(request_ref),
                |attempt, delay, error| {
                    failed_usage.extend(error.billed_usage().copied());
                    handler.on_event(&OrchestratorEvent::ApiRetry { attempt, delay, error })
                },
            ) => Some(result),
            _ = abort.cancelled() => None,
        };

        // Empty replies are billed by the provider even though they are retried.
        if let Some(Err(AutopilotError::ApiRetriesExhausted { last, .. })) = &response {
            failed_usage.extend(last.billed_usage().copied());
        }
        for usage in &failed_usage {
            self.bill(run, turn_index, &request.model, usage)?;
        }

        let response = match response {
            Some(Ok(response)) => response,
            Some(Err(e)) => return self.fail(run, e),
            None => return self.abort_run(run),
        };

        // Billing comes first so the spend is on disk even if a tool hangs.
        self.bill(run, turn_index, &response.model, &response.usage)?;
        run.turns_completed += 1;

        let terminal = match &response.reply {
            ModelReply::Text(_) => TurnTerminal::Text,
            ModelReply::ToolUse { .. } => TurnTerminal::ToolUse,
            ModelReply::Stop => TurnTerminal::Stop,
        };
        let mut turn = Turn::new(turn_index, terminal)
            .with_usage(response.usage.input_tokens, response.usage.output_tokens)
            .with_model(response.model.clone());
        for text in run.context.take_pending_inputs() {
            turn = turn.with_block(ContentBlock::Input { text });
        }

        let mut reason = CheckpointReason::Turn;
        let mut completion = None;
        let mut failure = None;

        match response.reply {
            ModelReply::Text(text) => {
                self.emit(OrchestratorEvent::Text {
                    turn: turn_index,
                    text: &text,
                });
                completion = protocol::completion_marker(&text);
                turn = turn.with_block(ContentBlock::Text { text });
                if completion.is_none() {
                    self.note_idle(run);
                }
            }
            ModelReply::Stop => self.note_idle(run),
            ModelReply::ToolUse { text, calls } => {
                run.idle_text_turns = 0;
                if let Some(text) = text {
                    self.emit(OrchestratorEvent::Text {
                        turn: turn_index,
                        text: &text,
                    });
                    turn = turn.with_block(ContentBlock::Text { text });
                }
                for call in &calls {
                    turn = turn.with_block(ContentBlock::ToolCall { call: call.clone() });
                }
                self.emit(OrchestratorEvent::ToolCallsReceived {
                    turn: turn_index,
                    count: calls.len(),
                });

                let batch = self.run_tool_calls(run, &calls).await;
                for result in batch.results {
                    self.emit(OrchestratorEvent::ToolResult {
                        turn: turn_index,
                        result: &result,
                    });
                    turn = turn.with_block(ContentBlock::ToolResult { result });
                }
                completion = batch.completion;
                failure = batch.exhausted;
                if batch.executed {
                    reason = CheckpointReason::ToolBatch;
                }
            }
        }

        turn.duration_ms = started.elapsed().as_millis() as u64;
        if turn.is_closed() {
            run.context.record_turn(turn);
        } else {
            if reason == CheckpointReason::Turn {
                reason = CheckpointReason::AwaitingHuman;
            }
            run.pending_turn = Some(turn);
        }

        if let Some(e) = failure {
            return self.fail(run, e);
        }
        if let Some(summary) = completion {
            info!("Session {} completed: {summary}", run.session.id);
            self.transition(run, RunState::Completed { summary })?;
            self.save(run, CheckpointReason::Terminal)?;
            return Ok(());
        }
        if self.abort.is_aborted() {
            return self.abort_run(run);
        }
        self.save(run, reason)?;
        Ok(())
    }

    /// The waiting state the session must enter before the next model call,
    /// if any.
    fn gate(&self, run: &mut Run) -> Option<(RunState, CheckpointReason)> {
        let thresholds = run.cost.budget().thresholds;
        if run.cost.is_maxed() {
            return Some((
                RunState::Paused {
                    reason: PauseReason::BudgetMaxed,
                },
                CheckpointReason::Paused,
            ));
        }
        if let Some(state) = self.open_request(run) {
            return Some((state, CheckpointReason::AwaitingHuman));
        }
        if run.cost.needs_confirmation() {
            let request = DecisionRequest {
                call_id: None,
                question: format!(
                    "Spend has reached ${:.2}, past the alert threshold of ${:.2} (hard max ${:.2}). \
                     Continue?",
                    run.cost.budget().cost_usd,
                    thresholds.alert_usd,
                    thresholds.max_usd
                ),
                options: vec![ALERT_CONTINUE.to_string(), ALERT_PAUSE.to_string()],
                kind: DecisionKind::BudgetAlert,
            };
            return Some((
                RunState::AwaitingDecision { request },
                CheckpointReason::AwaitingHuman,
            ));
        }
        if run.idle_text_turns >= self.config.max_idle_text_turns {
            let request = HumanActionRequest {
                call_id: None,
                instructions: format!(
                    "The agent replied {} times in a row without using tools or finishing. \
                     Give it guidance to continue.",
                    run.idle_text_turns
                ),
            };
            return Some((
                RunState::AwaitingHumanAction { request },
                CheckpointReason::AwaitingHuman,
            ));
        }
        if run.turns_completed >= run.turn_limit {
            return Some((
                RunState::Paused {
                    reason: PauseReason::TurnLimit,
                },
                CheckpointReason::Paused,
            ));
        }
        None
    }

    /// The human request an open pending turn is waiting on. A pending turn
    /// with no open control call is closed and recorded.
    fn open_request(&self, run: &mut Run) -> Option<RunState> {
        let pending = run.pending_turn.as_ref()?;
        let state = pending
            .unresolved_calls()
            .into_iter()
            .find_map(|call| match protocol::parse_control_call(call) {
                Some(Ok(ControlRequest::Decision {
                    call_id,
                    question,
                    options,
                })) => Some(RunState::AwaitingDecision {
                    request: DecisionRequest {
                        call_id: Some(call_id),
                        question,
                        options,
                        kind: DecisionKind::Agent,
                    },
                }),
                Some(Ok(ControlRequest::HumanAction {
                    call_id,
                    instructions,
                })) => Some(RunState::AwaitingHumanAction {
                    request: HumanActionRequest {
                        call_id: Some(call_id),
                        instructions,
                    },
                }),
                _ => None,
            });
        if state.is_none() {
            self.close_pending(run);
        }
        state
    }

    /// Give every unresolved call of the pending turn an `Interrupted`
    /// result and record it.
    fn close_pending(&self, run: &mut Run) {
        let Some(mut turn) = run.pending_turn.take() else {
            return;
        };
        let open: Vec<ToolCall> = turn.unresolved_calls().into_iter().cloned().collect();
        for call in &open {
            warn!("Closing unresolved call {} ({}) as interrupted", call.id, call.name());
            turn.blocks.push(ContentBlock::ToolResult {
                result: ToolResult::failure(call, ToolError::Interrupted, 0),
            });
        }
        run.context.record_turn(turn);
    }

    fn note_idle(&self, run: &mut Run) {
        run.idle_text_turns += 1;
        debug!(
            "Text-only turn without completion ({}/{})",
            run.idle_text_turns, self.config.max_idle_text_turns
        );
        if run.idle_text_turns < self.config.max_idle_text_turns {
            run.context.queue_input(CONTINUE_NUDGE);
        }
    }

    // ── Tool calls ────────────────────────────────────────────────────

    async fn run_tool_calls(&self, run: &mut Run, calls: &[ToolCall]) -> ToolBatch {
        let mut workspace_calls: Vec<ToolCall> = Vec::new();
        let mut requests: Vec<(&ToolCall, ControlRequest)> = Vec::new();
        let mut results: Vec<ToolResult> = Vec::new();

        for call in calls {
            match protocol::parse_control_call(call) {
                None => workspace_calls.push(call.clone()),
                Some(Ok(request)) => requests.push((call, request)),
                Some(Err(e)) => results.push(ToolResult::failure(call, e, 0)),
            }
        }

        let executed = !workspace_calls.is_empty();
        if executed {
            results.extend(self.engine.execute(&workspace_calls, &self.abort).await);
        }

        let mut completion = None;
        let mut blocking_seen = false;
        let asks_human = requests.iter().any(|(_, r)| r.is_blocking());
        for (call, request) in requests {
            match request {
                ControlRequest::Complete { .. } if asks_human => {
                    results.push(ToolResult::failure(
                        call,
                        ToolError::policy(
                            "task_complete ignored: a human request in the same turn is still open",
                        ),
                        0,
                    ));
                }
                ControlRequest::Complete { summary, .. } => {
                    results.push(ToolResult::success(call, "Completion recorded.", 0));
                    completion = Some(summary);
                }
                _ if blocking_seen => {
                    results.push(ToolResult::failure(
                        call,
                        ToolError::policy(
                            "only one human request per turn; ask again once the first is resolved",
                        ),
                        0,
                    ));
                }
                // Left unresolved: the gate turns it into a waiting state.
                _ => blocking_seen = true,
            }
        }

        let exhausted = self.update_retry_ledger(run, calls, &results);

        // Order results as the calls were given.
        let mut ordered = Vec::with_capacity(results.len());
        for call in calls {
            if let Some(pos) = results.iter().position(|r| r.call_id == call.id) {
                ordered.push(results.swap_remove(pos));
            }
        }
        ordered.append(&mut results);

        ToolBatch {
            results: ordered,
            completion,
            exhausted,
            executed,
        }
    }

    /// Count failures per call site. Returns the error that fails the
    /// session when one site ran out of retries.
    fn update_retry_ledger(
        &self,
        run: &mut Run,
        calls: &[ToolCall],
        results: &[ToolResult],
    ) -> Option<AutopilotError> {
        let mut exhausted = None;
        let mut executed = 0u32;
        let mut failed = 0u32;

        for result in results {
            if matches!(result.outcome, Err(ToolError::Interrupted)) {
                continue;
            }
            let Some(call) = calls.iter().find(|c| c.id == result.call_id) else {
                continue;
            };
            let site = self
                .engine
                .registry()
                .validate(call)
                .map(|v| v.call_site)
                .unwrap_or_else(|_| call.name().to_string());
            executed += 1;

            if result.is_error() {
                failed += 1;
                let attempts = run.retry_ledger.entry(site.clone()).or_insert(0);
                *attempts += 1;
                debug!("Call site {site} failed ({} in a row)", *attempts);
                if *attempts > self.config.max_retries_per_call_site && exhausted.is_none() {
                    exhausted = Some(AutopilotError::ToolRetriesExhausted {
                        call_site: site,
                        attempts: *attempts,
                    });
                }
            } else {
                run.retry_ledger.remove(&site);
            }
        }

        if executed > 0 {
            if failed == executed {
                run.consecutive_tool_failures += 1;
            } else {
                run.consecutive_tool_failures = 0;
            }
        }
        exhausted
    }

    fn tool_defs(&self) -> Vec<ToolDef> {
        let mut defs = self.engine.definitions();
        defs.extend(protocol::control_tool_defs());
        defs
    }

    // ── Waiting on a human ────────────────────────────────────────────

    /// Block until a control message releases the session. Returns `false`
    /// when there is nobody to wait for.
    async fn wait_for_control(&mut self, run: &mut Run) -> Result<bool, AutopilotError> {
        let Some(mut control) = self.control.take() else {
            return Ok(false);
        };
        let result = self.await_control_message(run, &mut control).await;
        self.control = Some(control);
        result
    }

    async fn await_control_message(
        &self,
        run: &mut Run,
        control: &mut ControlReceiver,
    ) -> Result<bool, AutopilotError> {
        let mut abort = self.abort.clone();
        loop {
            let message = tokio::select! {
                _ = abort.cancelled() => {
                    self.abort_run(run)?;
                    return Ok(true);
                }
                message = control.recv() => message,
            };
            match message {
                None => {
                    debug!("Control channel closed while {}", run.state.name());
                    return Ok(false);
                }
                Some(ControlMessage::Resume(signal)) => match self.apply_resume(run, &signal) {
                    Ok(()) => {
                        self.save(run, CheckpointReason::Start)?;
                        if !run.state.is_blocked() {
                            return Ok(true);
                        }
                    }
                    Err(reason) => warn!("Resume input rejected: {reason}"),
                },
                Some(ControlMessage::RaiseBudget { max_usd }) => {
                    match self.raise_budget(run, max_usd) {
                        Ok(()) => {
                            self.save(run, CheckpointReason::External)?;
                            if !run.state.is_blocked() {
                                return Ok(true);
                            }
                        }
                        Err(e) => warn!("Budget raise rejected: {e}"),
                    }
                }
            }
        }
    }

    /// Apply human input to the state the session is waiting in.
    fn apply_resume(&self, run: &mut Run, signal: &ResumeSignal) -> Result<(), String> {
        let to_running = |this: &Self, run: &mut Run| {
            this.transition(run, RunState::Running)
                .map_err(|e| e.to_string())
        };

        match run.state.clone() {
            RunState::Paused {
                reason: PauseReason::BudgetMaxed,
            } => {
                if run.cost.is_maxed() {
                    return Err(format!(
                        "budget is at its max of ${:.2}; raise it first",
                        run.cost.budget().thresholds.max_usd
                    ));
                }
                to_running(self, run)
            }
            RunState::Paused {
                reason: PauseReason::BudgetAlertDeclined,
            } => {
                run.cost.acknowledge_alert();
                to_running(self, run)
            }
            RunState::Paused {
                reason: PauseReason::TurnLimit,
            } => {
                run.turn_limit = run.turns_completed + self.config.max_turns;
                info!("Turn limit extended to {}", run.turn_limit);
                to_running(self, run)
            }
            RunState::AwaitingDecision { request } => {
                let answer = protocol::resolve_answer(&request.options, signal)?;
                match request.kind {
                    DecisionKind::BudgetAlert if answer == ALERT_PAUSE => self
                        .transition(
                            run,
                            RunState::Paused {
                                reason: PauseReason::BudgetAlertDeclined,
                            },
                        )
                        .map_err(|e| e.to_string()),
                    DecisionKind::BudgetAlert => {
                        run.cost.acknowledge_alert();
                        to_running(self, run)
                    }
                    DecisionKind::Agent => {
                        let resolved_at_turn =
                            run.pending_turn.as_ref().map_or(0, |t| t.index);
                        resolve_pending(
                            run,
                            request.call_id.as_deref(),
                            format!("Human decision: {answer}"),
                        )?;
                        let decision = Decision {
                            question: request.question,
                            answer,
                            resolved_at_turn,
                        };
                        info!("Decision pinned: {} -> {}", decision.question, decision.answer);
                        run.session.decisions.push(decision.clone());
                        run.context.pin_decision(decision);
                        to_running(self, run)
                    }
                }
            }
            RunState::AwaitingHumanAction { request } => {
                let report = match signal {
                    ResumeSignal::Input(text) => Some(text.trim().to_string()),
                    ResumeSignal::Continue => None,
                    ResumeSignal::Select(_) => {
                        return Err("select applies only to decisions".to_string());
                    }
                };
                match request.call_id.as_deref() {
                    Some(call_id) => {
                        let text = match report {
                            Some(report) => {
                                format!("Human completed the action and reports: {report}")
                            }
                            None => "Human completed the requested action.".to_string(),
                        };
                        resolve_pending(run, Some(call_id), text)?;
                    }
                    None => {
                        run.context.queue_input(
                            report.unwrap_or_else(|| "Continue with the task.".to_string()),
                        );
                        run.idle_text_turns = 0;
                    }
                }
                to_running(self, run)
            }
            RunState::Starting | RunState::Running | RunState::Aborted => match signal {
                ResumeSignal::Input(text) => {
                    run.context.queue_input(text.clone());
                    Ok(())
                }
                ResumeSignal::Continue => Ok(()),
                ResumeSignal::Select(_) => {
                    Err(format!("nothing to select while {}", run.state.name()))
                }
            },
            RunState::Completed { .. } | RunState::Failed { .. } => {
                Err(format!("session is {}", run.state.name()))
            }
        }
    }

    /// Raise the hard budget ceiling. Also counts as confirming the alert.
    fn raise_budget(&self, run: &mut Run, max_usd: f64) -> Result<(), AutopilotError> {
        run.cost.raise_max(max_usd)?;
        run.cost.acknowledge_alert();
        let release = match &run.state {
            RunState::Paused {
                reason: PauseReason::BudgetMaxed | PauseReason::BudgetAlertDeclined,
            } => !run.cost.is_maxed(),
            RunState::AwaitingDecision { request } => request.kind == DecisionKind::BudgetAlert,
            _ => false,
        };
        if release {
            self.transition(run, RunState::Running)?;
        }
        Ok(())
    }

    // ── State and persistence ─────────────────────────────────────────

    fn transition(&self, run: &mut Run, to: RunState) -> Result<(), AutopilotError> {
        if !run.state.can_transition(&to) {
            warn!("Rejected transition {} -> {}", run.state.name(), to.name());
            return Err(AutopilotError::InvalidState {
                state: run.state.name().to_string(),
                action: "change state",
            });
        }
        self.emit(OrchestratorEvent::StateChanged {
            from: &run.state,
            to: &to,
        });
        run.session.status = to.session_status();
        run.state = to;
        Ok(())
    }

    fn abort_run(&self, run: &mut Run) -> Result<(), AutopilotError> {
        if run.state.is_final() || run.state == RunState::Aborted {
            return Ok(());
        }
        info!("Session {} aborted", run.session.id);
        self.transition(run, RunState::Aborted)?;
        self.save(run, CheckpointReason::Shutdown)?;
        Ok(())
    }

    /// Record usage against the budget, checkpointing on a threshold crossing.
    fn bill(
        &self,
        run: &mut Run,
        turn: u32,
        model: &str,
        usage: &TokenUsage,
    ) -> Result<(), AutopilotError> {
        let crossing = run.cost.record(model, usage);
        let status = run.cost.status();
        self.emit(OrchestratorEvent::Usage {
            turn,
            usage,
            budget: &status,
        });
        if let Some(crossing) = &crossing {
            self.emit(OrchestratorEvent::BudgetThreshold { crossing });
            self.save(run, CheckpointReason::BudgetThreshold)?;
        }
        Ok(())
    }

    fn fail(&self, run: &mut Run, error: AutopilotError) -> Result<(), AutopilotError> {
        warn!("Session {} failed: {error}", run.session.id);
        let message = error.to_string();
        run.last_error = Some(message.clone());
        self.transition(
            run,
            RunState::Failed {
                error_kind: error.kind().to_string(),
                message,
            },
        )?;
        self.save(run, CheckpointReason::Terminal)?;
        Ok(())
    }

    fn save(&self, run: &mut Run, reason: CheckpointReason) -> Result<CheckpointId, AutopilotError> {
        let snapshot = run.snapshot();
        let id = self
            .checkpoints
            .save(run.session.id.as_str(), reason, &snapshot)?;
        self.emit(OrchestratorEvent::CheckpointSaved { id: &id, reason });
        run.last_checkpoint = Some(id.clone());
        Ok(id)
    }

    fn load(&self, session_id: &str) -> Result<Checkpoint<SessionState>, AutopilotError> {
        self.checkpoints
            .load_latest::<SessionState>(session_id)?
            .ok_or_else(|| AutopilotError::SessionNotFound(session_id.to_string()))
    }

    fn fresh_run(&self, session: Session) -> Run {
        let prefix = PinnedPrefix::new(self.config.system_prompt.clone(), session.task.clone())
            .with_decisions(session.decisions.clone());
        let context = self.context_manager(&session, |config, counter| {
            ContextManager::new(config, counter, prefix)
        });
        Run {
            cost: CostTracker::new(
                self.config.budget.pricing_table(),
                self.config.budget.thresholds(),
            ),
            context,
            state: RunState::Starting,
            pending_turn: None,
            retry_ledger: BTreeMap::new(),
            consecutive_tool_failures: 0,
            idle_text_turns: 0,
            turns_completed: 0,
            turn_limit: self.config.max_turns,
            last_error: None,
            last_checkpoint: None,
            session,
        }
    }

    fn restore_run(&self, state: SessionState, checkpoint: CheckpointId) -> Run {
        let snapshot = state.context;
        let context = self.context_manager(&state.session, |config, counter| {
            ContextManager::restore(config, counter, snapshot)
        });
        Run {
            cost: CostTracker::from_budget(self.config.budget.pricing_table(), state.budget),
            context,
            state: state.state,
            pending_turn: state.pending_turn,
            retry_ledger: state.retry_ledger,
            consecutive_tool_failures: state.consecutive_tool_failures,
            idle_text_turns: state.idle_text_turns,
            turns_completed: state.turns_completed,
            turn_limit: state.turn_limit,
            last_error: state.last_error,
            last_checkpoint: Some(checkpoint),
            session: state.session,
        }
    }

    fn context_manager(
        &self,
        session: &Session,
        build: impl FnOnce(crate::context::ContextConfig, TokenCounter) -> ContextManager,
    ) -> ContextManager {
        let counter = TokenCounter::for_model(session.tier_policy.primary_model());
        let tool_tokens = counter.count_tools(&self.tool_defs());
        build(self.config.context.clone(), counter).with_tool_tokens(tool_tokens)
    }

    fn outcome(&self, run: &Run) -> RunOutcome {
        let error_kind = match &run.state {
            RunState::Failed { error_kind, .. } => Some(error_kind.clone()),
            _ => None,
        };
        RunOutcome {
            session_id: run.session.id.clone(),
            state: run.state.clone(),
            error_kind,
            last_checkpoint: run.last_checkpoint.clone(),
            budget: run.cost.status(),
            turns: run.turns_completed,
        }
    }

    fn emit(&self, event: OrchestratorEvent<'_>) {
        self.event_handler.on_event(&event);
    }
}

/// Results of one turn's tool calls.
struct ToolBatch {
    results: Vec<ToolResult>,
    completion: Option<String>,
    exhausted: Option<AutopilotError>,
    /// Whether any workspace tool ran.
    executed: bool,
}

/// Attach `text` as the result of the open control call `call_id` and
/// record the pending turn once it is closed.
fn resolve_pending(run: &mut Run, call_id: Option<&str>, text: String) -> Result<(), String> {
    let Some(mut turn) = run.pending_turn.take() else {
        return Err("no pending tool call to answer".to_string());
    };
    let call = turn
        .unresolved_calls()
        .into_iter()
        .find(|c| Some(c.id.as_str()) == call_id)
        .cloned();
    let Some(call) = call else {
        run.pending_turn = Some(turn);
        return Err(format!("call {} is not open", call_id.unwrap_or("?")));
    };
    turn.blocks.push(ContentBlock::ToolResult {
        result: ToolResult::success(&call, text, 0),
    });
    if turn.is_closed() {
        run.context.record_turn(turn);
    } else {
        run.pending_turn = Some(turn);
    }
    Ok(())
}
