//! Error taxonomy for the orchestrator and its subsystems.
//!
//! Errors are split by who handles them:
//!
//! - [`ToolError`] is reported back to the model as a failed tool result so
//!   it can self-correct. It never terminates a session on its own.
//! - [`ModelError`] comes from the Model API boundary. Transient variants are
//!   retried with backoff inside the loop.
//! - [`CheckpointError`] comes from the durable store.
//! - [`AutopilotError`] is what reaches the caller of the orchestrator, and
//!   what a `Failed` session records as its originating error kind.

use crate::model::TokenUsage;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

// ── Tool errors ────────────────────────────────────────────────────

/// Typed failure of a single tool call.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolError {
    /// The call did not finish within its per-tool timeout.
    #[error("tool '{tool}' timed out after {secs}s")]
    Timeout { tool: String, secs: u64 },

    /// A file, directory or program the call referred to does not exist.
    #[error("not found: {message}")]
    NotFound { message: String },

    /// The call was rejected before executing: unknown tool, arguments that
    /// fail schema validation, a path outside the workspace, or a command
    /// outside the allow-list.
    #[error("policy violation: {message}")]
    PolicyViolation { message: String },

    /// The tool ran and failed.
    #[error("execution error: {message}")]
    ExecutionError { message: String },

    /// The session was aborted before the call produced a result.
    #[error("interrupted before completion")]
    Interrupted,
}

impl ToolError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub fn policy(message: impl Into<String>) -> Self {
        Self::PolicyViolation {
            message: message.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::ExecutionError {
            message: message.into(),
        }
    }

    /// Map an I/O error on `path` to the closest tool error.
    pub fn from_io(path: &Path, err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::not_found(format!("'{}'", path.display())),
            std::io::ErrorKind::PermissionDenied => {
                Self::policy(format!("permission denied for '{}'", path.display()))
            }
            _ => Self::execution(format!("'{}': {err}", path.display())),
        }
    }

    /// Stable short tag, used in rendered results and retry ledgers.
    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::Timeout { .. } => "timeout",
            ToolError::NotFound { .. } => "not_found",
            ToolError::PolicyViolation { .. } => "policy_violation",
            ToolError::ExecutionError { .. } => "execution_error",
            ToolError::Interrupted => "interrupted",
        }
    }
}

// ── Model API errors ───────────────────────────────────────────────

/// Failure at the Model API boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// Timeouts, network failures, rate limits and 5xx responses.
    #[error("transient model API error: {0}")]
    Transient(String),

    /// HTTP 200 with no content, no tool calls and no output tokens. The
    /// provider still bills the input, so the usage travels with the error.
    #[error("empty model response ({} input tokens billed)", .usage.input_tokens)]
    EmptyResponse { usage: TokenUsage },

    /// Authentication failures, malformed requests and other 4xx responses.
    #[error("model API rejected the request: {0}")]
    Permanent(String),

    /// The response was neither text, tool calls, nor a stop signal.
    #[error("model protocol error: {0}")]
    Protocol(String),
}

impl ModelError {
    /// Classify an HTTP status returned by the model API.
    pub fn from_status(status: u16, body: &str) -> Self {
        let preview: String = body.chars().take(300).collect();
        let message = format!("HTTP {status}: {preview}");
        match status {
            408 | 425 | 429 | 500..=599 => ModelError::Transient(message),
            _ => ModelError::Permanent(message),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ModelError::Transient(_) | ModelError::EmptyResponse { .. })
    }

    /// Usage the provider billed for a failed attempt, if it reported any.
    pub fn billed_usage(&self) -> Option<&TokenUsage> {
        match self {
            ModelError::EmptyResponse { usage } if usage.total() > 0 => Some(usage),
            _ => None,
        }
    }
}

// ── Checkpoint errors ──────────────────────────────────────────────

/// Failure of the durable checkpoint store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CheckpointError {
    #[error("checkpoint I/O error at {path}: {message}")]
    Io { path: String, message: String },

    #[error("checkpoint serialization error: {0}")]
    Serialization(String),

    /// Checkpoints exist for the session but none of them verifies.
    #[error(
        "checkpoint stream for session {session_id} is corrupt and has no valid fallback: {detail}"
    )]
    Corrupt { session_id: String, detail: String },
}

impl CheckpointError {
    pub fn io(path: &Path, err: &std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CheckpointError {
    fn from(err: serde_json::Error) -> Self {
        CheckpointError::Serialization(err.to_string())
    }
}

// ── Orchestrator errors ────────────────────────────────────────────

/// Crate-level error.
#[derive(Error, Debug)]
pub enum AutopilotError {
    /// The pinned prefix plus the turns that must stay verbatim do not fit
    /// under `max_context_tokens - reserved_output_tokens`. Fatal.
    #[error("context overflow: payload needs {required} tokens but the ceiling is {limit}")]
    ContextOverflow { required: usize, limit: usize },

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("model API still failing after {attempts} attempts: {last}")]
    ApiRetriesExhausted { attempts: u32, last: ModelError },

    #[error("tool call site '{call_site}' failed {attempts} times in a row")]
    ToolRetriesExhausted { call_site: String, attempts: u32 },

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("cannot {action} while session is {state}")]
    InvalidState { state: String, action: &'static str },

    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Resume input that does not fit the state the session is waiting in.
    #[error("resume input rejected: {0}")]
    ResumeRejected(String),
}

impl AutopilotError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Stable tag for the originating error kind of a failed session.
    pub fn kind(&self) -> &'static str {
        match self {
            AutopilotError::ContextOverflow { .. } => "context_overflow",
            AutopilotError::Model(ModelError::Transient(_) | ModelError::EmptyResponse { .. }) => {
                "api_transient_error"
            }
            AutopilotError::Model(ModelError::Permanent(_)) => "api_permanent_error",
            AutopilotError::Model(ModelError::Protocol(_)) => "api_protocol_error",
            AutopilotError::ApiRetriesExhausted { .. } => "api_retries_exhausted",
            AutopilotError::ToolRetriesExhausted { .. } => "tool_retries_exhausted",
            AutopilotError::Checkpoint(CheckpointError::Corrupt { .. }) => "checkpoint_corruption",
            AutopilotError::Checkpoint(_) => "checkpoint_io",
            AutopilotError::Config(_) => "config",
            AutopilotError::InvalidState { .. } => "invalid_state",
            AutopilotError::SessionNotFound(_) => "session_not_found",
            AutopilotError::ResumeRejected(_) => "resume_rejected",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(ModelError::from_status(429, "slow down").is_transient());
        assert!(ModelError::from_status(503, "").is_transient());
        assert!(!ModelError::from_status(401, "bad key").is_transient());
        assert!(matches!(
            ModelError::from_status(400, "bad request"),
            ModelError::Permanent(_)
        ));
    }

    #[test]
    fn tool_error_serde_is_tagged() {
        let err = ToolError::Timeout {
            tool: "run_command".into(),
            secs: 30,
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "timeout");
        let back: ToolError = serde_json::from_value(json).unwrap();
        assert_eq!(back, err);

        let json = serde_json::to_string(&ToolError::Interrupted).unwrap();
        assert_eq!(json, r#"{"kind":"interrupted"}"#);
    }

    #[test]
    fn io_not_found_maps_to_not_found() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = ToolError::from_io(Path::new("src/a.rs"), &io);
        assert_eq!(err.kind(), "not_found");
        assert!(err.to_string().contains("src/a.rs"));
    }

    #[test]
    fn autopilot_error_kinds() {
        let overflow = AutopilotError::ContextOverflow {
            required: 1200,
            limit: 900,
        };
        assert_eq!(overflow.kind(), "context_overflow");
        assert!(overflow.to_string().contains("1200"));

        let corrupt = AutopilotError::from(CheckpointError::Corrupt {
            session_id: "ses-1".into(),
            detail: "checksum mismatch".into(),
        });
        assert_eq!(corrupt.kind(), "checkpoint_corruption");
    }
}
