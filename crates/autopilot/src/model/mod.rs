//! The Model API boundary.
//!
//! The orchestrator never talks to a vendor API directly. It builds a
//! [`ModelRequest`] from the materialized context and the tool schemas, hands
//! it to a [`ModelClient`], and gets back a [`ModelResponse`] that is already
//! classified into one of the three shapes the loop understands: text, tool
//! calls, or a stop signal. Anything else is a [`ModelError::Protocol`].
//!
//! Usage counts on the response are authoritative and are what the
//! [`CostTracker`](crate::cost::CostTracker) bills against.

pub mod openrouter;
pub mod retry;
pub mod router;
pub mod scripted;

use crate::{Message, ModelError, ToolCall, ToolDef};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

pub use openrouter::OpenRouterClient;
pub use retry::RetryConfig;
pub use router::{ModelTierPolicy, TierSignal};
pub use scripted::ScriptedClient;

/// A request to the model.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDef>,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Token counts reported by the model API for one request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// The three response shapes the orchestrator accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelReply {
    /// A text-only response.
    Text(String),
    /// One or more tool calls, possibly with text alongside.
    ToolUse {
        text: Option<String>,
        calls: Vec<ToolCall>,
    },
    /// The model ended its turn without text or tool calls.
    Stop,
}

/// A classified model response.
#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub reply: ModelReply,
    pub usage: TokenUsage,
    /// The model that actually served the request.
    pub model: String,
}

/// Boxed future returned by [`ModelClient::complete`].
pub type ModelFuture<'a> = Pin<Box<dyn Future<Output = Result<ModelResponse, ModelError>> + Send + 'a>>;

/// A remote model reachable through the Model API boundary.
///
/// Uses a boxed future so the trait stays dyn-compatible.
pub trait ModelClient: Send + Sync {
    fn complete<'a>(&'a self, request: &'a ModelRequest) -> ModelFuture<'a>;
}

/// Classify a raw completion into a [`ModelReply`].
///
/// An empty completion that consumed no output tokens is treated as a
/// transient [`ModelError::EmptyResponse`] rather than a stop: providers
/// occasionally answer HTTP 200 with an empty body. The reported usage rides
/// along so the caller can still bill it.
pub fn classify_reply(
    content: Option<String>,
    tool_calls: Vec<ToolCall>,
    finish_reason: Option<&str>,
    usage: &TokenUsage,
) -> Result<ModelReply, ModelError> {
    let text = content.filter(|c| !c.trim().is_empty());

    if !tool_calls.is_empty() {
        return Ok(ModelReply::ToolUse {
            text,
            calls: tool_calls,
        });
    }
    if let Some(text) = text {
        return Ok(ModelReply::Text(text));
    }
    match finish_reason {
        _ if usage.output_tokens == 0 => Err(ModelError::EmptyResponse { usage: *usage }),
        Some("stop") | Some("end_turn") | None => Ok(ModelReply::Stop),
        Some(other) => Err(ModelError::Protocol(format!(
            "response has no content and no tool calls (finish_reason={other})"
        ))),
    }
}
