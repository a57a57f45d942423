//! A model client that replays canned responses.
//!
//! Useful for dry runs and for exercising the orchestrator without network
//! access. Every request is recorded so callers can assert on what was sent.

use super::{ModelClient, ModelFuture, ModelReply, ModelRequest, ModelResponse, TokenUsage};
use crate::{ModelError, ToolCall};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// One scripted step: either a response or an error.
type ScriptStep = Result<ModelResponse, ModelError>;

/// Replays a queue of responses in order.
///
/// When the queue runs dry every further request fails with a permanent
/// error, so a test never loops forever on a missing step.
#[derive(Debug, Default)]
pub struct ScriptedClient {
    steps: Mutex<VecDeque<ScriptStep>>,
    requests: Mutex<Vec<ModelRequest>>,
    latency: Option<Duration>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every response by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Queue a text-only reply.
    pub fn text(self, text: impl Into<String>, usage: TokenUsage) -> Self {
        self.reply(ModelReply::Text(text.into()), usage)
    }

    /// Queue a tool-use reply.
    pub fn tool_calls(self, calls: Vec<ToolCall>, usage: TokenUsage) -> Self {
        self.reply(ModelReply::ToolUse { text: None, calls }, usage)
    }

    /// Queue an arbitrary reply.
    pub fn reply(self, reply: ModelReply, usage: TokenUsage) -> Self {
        self.push(Ok(ModelResponse {
            reply,
            usage,
            model: "scripted".into(),
        }))
    }

    /// Queue an error.
    pub fn error(self, error: ModelError) -> Self {
        self.push(Err(error))
    }

    fn push(self, step: ScriptStep) -> Self {
        if let Ok(mut steps) = self.steps.lock() {
            steps.push_back(step);
        }
        self
    }

    /// All requests received so far.
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Number of requests received so far.
    pub fn request_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Steps not yet consumed.
    pub fn remaining(&self) -> usize {
        self.steps.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl ModelClient for ScriptedClient {
    fn complete<'a>(&'a self, request: &'a ModelRequest) -> ModelFuture<'a> {
        Box::pin(async move {
            if let Ok(mut requests) = self.requests.lock() {
                requests.push(request.clone());
            }
            if let Some(latency) = self.latency {
                tokio::time::sleep(latency).await;
            }
            let step = self.steps.lock().ok().and_then(|mut s| s.pop_front());
            match step {
                Some(Ok(mut response)) => {
                    response.model = request.model.clone();
                    Ok(response)
                }
                Some(Err(e)) => Err(e),
                None => Err(ModelError::Permanent("script exhausted".into())),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ModelRequest {
        ModelRequest {
            model: "m".into(),
            messages: vec![],
            tools: vec![],
            max_tokens: 10,
            temperature: 0.0,
        }
    }

    #[tokio::test]
    async fn replays_in_order_then_fails() {
        let client = ScriptedClient::new()
            .error(ModelError::Transient("HTTP 503".into()))
            .text("hello", TokenUsage::new(1, 1));
        let req = request();

        assert!(client.complete(&req).await.unwrap_err().is_transient());
        let ok = client.complete(&req).await.unwrap();
        assert_eq!(ok.reply, ModelReply::Text("hello".into()));
        assert_eq!(ok.model, "m");
        assert!(client.complete(&req).await.is_err());
        assert_eq!(client.request_count(), 3);
    }
}
