//! Autonomous execution orchestrator for long-running LLM coding tasks.
//!
//! `autopilot` drives a remote model through many request/response turns
//! while keeping four things under control: what goes into each request
//! (the [`ContextManager`](context::ContextManager)), what the run costs
//! (the [`CostTracker`](cost::CostTracker)), how the run survives crashes
//! (the [`CheckpointManager`](checkpoint::CheckpointManager)) and how the
//! side effects the model asks for are executed (the
//! [`ToolExecutionEngine`](tools::engine::ToolExecutionEngine)).
//!
//! The [`Orchestrator`](orchestrator::Orchestrator) ties them together in a
//! single control loop per session.
//!
//! # Getting started
//!
//! ```ignore
//! use autopilot::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), AutopilotError> {
//!     let client = OpenRouterClient::new(std::env::var("OPENROUTER_KEY").unwrap_or_default())?;
//!     let config = OrchestratorConfig::load(".autopilot/config.toml")?;
//!
//!     let registry = Arc::new(ToolRegistry::new().with_builtin_tools(&config.tools));
//!     let engine = ToolExecutionEngine::new(registry, "/path/to/project", &config.tools);
//!     let store = FsCheckpointStore::new(".autopilot/sessions")?;
//!
//!     let outcome = Orchestrator::new(&client, &engine, CheckpointManager::new(Arc::new(store)), config)
//!         .with_event_handler(&LoggingHandler)
//!         .start("Add a --verbose flag to the CLI", "/path/to/project")
//!         .await?;
//!
//!     println!("{} finished as {}", outcome.session_id, outcome.state);
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`orchestrator`] | Control loop, run states, configuration, events |
//! | [`context`] | Token counting, pinned prefix, summarization, payload building |
//! | [`tools`] | [`Tool`](tools::core::Tool) trait, registry, command policy, concurrent engine |
//! | [`cost`] | Pricing tables, budget thresholds, cost tracking |
//! | [`checkpoint`] | Durable checkpoint store and recovery |
//! | [`model`] | Model API boundary, OpenRouter client, retry, model tiers |
//! | [`control`] | Resume, budget and abort signals for a running session |

pub mod checkpoint;
pub mod context;
pub mod control;
pub mod cost;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod prelude;
pub mod session;
pub mod tools;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use error::{AutopilotError, CheckpointError, ModelError, ToolError};

// ── Constants ──────────────────────────────────────────────────────

/// Default model for all LLM calls.
pub const DEFAULT_MODEL: &str = "anthropic/claude-sonnet-4";

// ── Schema generation ──────────────────────────────────────────────

/// Generate a JSON Schema `serde_json::Value` from a type that implements
/// `schemars::JsonSchema`.
///
/// Tool argument structs derive `JsonSchema` so the schema the model sees and
/// the schema arguments are validated against can never drift apart.
///
/// ```
/// use autopilot::json_schema_for;
/// use schemars::JsonSchema;
/// use serde::Deserialize;
///
/// #[derive(Deserialize, JsonSchema)]
/// #[serde(deny_unknown_fields)]
/// struct ReadArgs {
///     path: String,
/// }
///
/// let schema = json_schema_for::<ReadArgs>();
/// assert_eq!(schema["type"], "object");
/// assert_eq!(schema["additionalProperties"], false);
/// ```
pub fn json_schema_for<T: JsonSchema>() -> serde_json::Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema)
        .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}))
}

// ── Message types ──────────────────────────────────────────────────

/// Role of a message in the conversation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::Tool => write!(f, "tool"),
        }
    }
}

/// A message in the materialized payload sent to the model.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    pub role: MessageRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant_text(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Assistant message carrying tool calls, optionally with the text the
    /// model produced alongside them.
    pub fn assistant_tool_calls(text: Option<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: text,
            tool_calls: Some(calls),
            tool_call_id: None,
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(call_id.into()),
        }
    }
}

// ── Tool types ─────────────────────────────────────────────────────

/// The type of a tool definition. Currently always `Function`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum ToolType {
    #[serde(rename = "function")]
    Function,
}

/// Tool definition sent to the API (function-calling format).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ToolDef {
    #[serde(rename = "type")]
    pub tool_type: ToolType,
    pub function: FunctionDef,
}

impl ToolDef {
    /// Create a function-calling tool definition.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            tool_type: ToolType::Function,
            function: FunctionDef {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// The type of a tool call. Currently always `Function`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum CallType {
    #[serde(rename = "function")]
    Function,
}

/// A tool call requested by the model.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: CallType,
    pub function: FunctionCallData,
}

impl ToolCall {
    /// Build a function call with raw JSON arguments.
    pub fn function(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            call_type: CallType::Function,
            function: FunctionCallData {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct FunctionCallData {
    pub name: String,
    pub arguments: String,
}
