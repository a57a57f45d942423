//! [`ModelClient`] for the OpenRouter chat completions API.

use super::{ModelClient, ModelFuture, ModelRequest, ModelResponse, TokenUsage, classify_reply};
use crate::{Message, ModelError, ToolCall, ToolDef};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

pub const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Request timeout for a single completion.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

// ── Wire types ─────────────────────────────────────────────────────

/// Chat completion request body.
#[derive(Serialize, Debug)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "is_zero_u32")]
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "<[ToolDef]>::is_empty")]
    tools: &'a [ToolDef],
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

#[derive(Deserialize, Debug)]
struct RawChatResponse {
    choices: Option<Vec<RawChoice>>,
    error: Option<ApiErrorResponse>,
    #[serde(default)]
    usage: Option<RawUsage>,
}

#[derive(Deserialize, Debug)]
struct RawChoice {
    message: RawResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct RawResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Deserialize, Debug)]
struct ApiErrorResponse {
    message: String,
    #[serde(default)]
    code: Option<serde_json::Value>,
}

#[derive(Deserialize, Debug)]
struct RawUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
}

// ── Client ─────────────────────────────────────────────────────────

/// Async HTTP client for the OpenRouter chat completions API.
pub struct OpenRouterClient {
    client: reqwest::Client,
    api_key: String,
    referer: String,
    title: String,
}

impl std::fmt::Debug for OpenRouterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenRouterClient")
            .field("referer", &self.referer)
            .field("title", &self.title)
            .finish_non_exhaustive()
    }
}

impl OpenRouterClient {
    /// Create a new client with the given API key and default headers.
    pub fn new(api_key: impl Into<String>) -> Result<Self, ModelError> {
        Self::with_headers(api_key, "https://github.com/tacryt-socryp/autopilot", "autopilot")
    }

    /// Create a new client with custom Referer and X-Title headers.
    pub fn with_headers(
        api_key: impl Into<String>,
        referer: impl Into<String>,
        title: impl Into<String>,
    ) -> Result<Self, ModelError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("autopilot/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ModelError::Permanent(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            referer: referer.into(),
            title: title.into(),
        })
    }

    async fn chat(&self, request: &ModelRequest) -> Result<ModelResponse, ModelError> {
        let body = ChatRequest {
            model: &request.model,
            messages: &request.messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            tools: &request.tools,
        };
        debug!(
            "LLM request: model={}, messages={}, tools={}, max_tokens={}",
            request.model,
            request.messages.len(),
            request.tools.len(),
            request.max_tokens,
        );
        trace!(
            "Request payload size: {} bytes",
            serde_json::to_string(&body).map_or(0, |s| s.len())
        );

        let start = Instant::now();
        let resp = self
            .client
            .post(OPENROUTER_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("HTTP-Referer", &self.referer)
            .header("X-Title", &self.title)
            .json(&body)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = resp.status();
        let text = resp.text().await.map_err(classify_reqwest_error)?;
        debug!(
            "LLM response: HTTP {} in {:.1}s ({} bytes)",
            status,
            start.elapsed().as_secs_f64(),
            text.len()
        );

        if !status.is_success() {
            return Err(ModelError::from_status(status.as_u16(), &text));
        }

        let parsed: RawChatResponse = serde_json::from_str(&text)
            .map_err(|e| ModelError::Protocol(format!("failed to parse response: {e}")))?;

        if let Some(err) = parsed.error {
            let code = err
                .code
                .as_ref()
                .and_then(|c| c.as_u64().or_else(|| c.as_str().and_then(|s| s.parse().ok())))
                .and_then(|c| u16::try_from(c).ok())
                .unwrap_or(500);
            return Err(ModelError::from_status(code, &err.message));
        }

        let usage = parsed
            .usage
            .map(|u| {
                TokenUsage::new(
                    u.prompt_tokens.unwrap_or(0),
                    u.completion_tokens.unwrap_or(0),
                )
            })
            .unwrap_or_default();
        debug!(
            "Token usage: prompt={}, completion={}",
            usage.input_tokens, usage.output_tokens
        );

        let choice = parsed
            .choices
            .and_then(|c| c.into_iter().next())
            .ok_or_else(|| ModelError::Protocol("response has no choices".into()))?;

        let reply = classify_reply(
            choice.message.content,
            choice.message.tool_calls.unwrap_or_default(),
            choice.finish_reason.as_deref(),
            &usage,
        )?;

        Ok(ModelResponse {
            reply,
            usage,
            model: request.model.clone(),
        })
    }
}

impl ModelClient for OpenRouterClient {
    fn complete<'a>(&'a self, request: &'a ModelRequest) -> ModelFuture<'a> {
        Box::pin(self.chat(request))
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> ModelError {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        ModelError::Transient(format!("request failed: {err}"))
    } else if let Some(status) = err.status() {
        ModelError::from_status(status.as_u16(), &err.to_string())
    } else {
        ModelError::Transient(format!("request failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_skips_empty_tools() {
        let messages = vec![Message::user("hi")];
        let body = ChatRequest {
            model: "m",
            messages: &messages,
            max_tokens: 100,
            temperature: 0.2,
            tools: &[],
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("tools").is_none());
        assert_eq!(json["model"], "m");
    }

    #[test]
    fn raw_response_parses_tool_calls() {
        let raw = r#"{
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "read_file", "arguments": "{\"path\":\"a.rs\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 120, "completion_tokens": 14}
        }"#;
        let parsed: RawChatResponse = serde_json::from_str(raw).unwrap();
        let choice = parsed.choices.unwrap().into_iter().next().unwrap();
        assert_eq!(choice.message.tool_calls.unwrap()[0].function.name, "read_file");
        assert_eq!(parsed.usage.unwrap().prompt_tokens, Some(120));
    }

    #[test]
    fn client_debug_hides_key() {
        let client = OpenRouterClient::new("sk-secret").unwrap();
        assert!(!format!("{client:?}").contains("sk-secret"));
    }
}
