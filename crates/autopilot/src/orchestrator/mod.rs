//! The control loop that drives a session.
//!
//! - [`run`]: the [`Orchestrator`] and its [`RunOutcome`].
//! - [`state`]: [`RunState`] machine and the persisted [`SessionState`].
//! - [`config`]: [`OrchestratorConfig`], loaded from TOML.
//! - [`events`]: [`OrchestratorEvent`] and the [`EventHandler`] observers.
//! - [`protocol`]: control tools the model uses to ask a human or finish.
//! - [`admin`]: offline status, listing and budget raises.

pub mod admin;
pub mod config;
pub mod events;
pub mod protocol;
pub mod run;
pub mod state;

pub use admin::{SessionStatusReport, list_sessions, raise_budget, session_status};
pub use config::{DEFAULT_SYSTEM_PROMPT, OrchestratorConfig};
pub use events::{
    CompositeEventHandler, EventHandler, FnEventHandler, LoggingHandler, NoopHandler,
    OrchestratorEvent,
};
pub use run::{Orchestrator, RunOutcome};
pub use state::{
    DecisionKind, DecisionRequest, HumanActionRequest, PauseReason, RunState, SessionState,
};
