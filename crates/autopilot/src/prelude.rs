//! Convenience re-exports for common `autopilot` types.
//!
//! Meant to be glob-imported by programs that drive sessions:
//!
//! ```ignore
//! use autopilot::prelude::*;
//! ```
//!
//! Specialized types (summarizer limits, the retry loop, checkpoint index
//! entries, DAG grouping) stay in their modules.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::{
    AutopilotError, CheckpointError, Message, ModelError, ToolCall, ToolDef, ToolError,
    json_schema_for,
};

// ── Orchestrator ────────────────────────────────────────────────────
pub use crate::orchestrator::{
    CompositeEventHandler, EventHandler, FnEventHandler, LoggingHandler, NoopHandler,
    Orchestrator, OrchestratorConfig, OrchestratorEvent, RunOutcome, RunState,
    SessionStatusReport, list_sessions, raise_budget, session_status,
};

// ── Sessions and control ────────────────────────────────────────────
pub use crate::control::{AbortSignal, ControlHandle, ControlReceiver, ResumeSignal, channel};
pub use crate::session::{Session, SessionId, SessionStatus};

// ── Models ──────────────────────────────────────────────────────────
pub use crate::model::{ModelClient, ModelTierPolicy, OpenRouterClient, ScriptedClient};

// ── Context, cost, checkpoints ──────────────────────────────────────
pub use crate::checkpoint::{CheckpointManager, FsCheckpointStore};
pub use crate::context::{ContextConfig, TokenCounter};
pub use crate::cost::{BudgetConfig, BudgetLevel, CostTracker};

// ── Tools ───────────────────────────────────────────────────────────
pub use crate::tools::{Tool, ToolExecutionEngine, ToolFuture, ToolRegistry, ToolsConfig, parse_args};
