//! Control tools: how the model talks to the orchestrator itself.
//!
//! Three tools are offered next to the workspace tools but never reach the
//! [`ToolExecutionEngine`](crate::tools::ToolExecutionEngine):
//!
//! - `request_decision` blocks the session on a question for a human.
//! - `request_human_action` blocks it on something only a human can do.
//! - `task_complete` ends it.
//!
//! A text reply containing `<task_complete>` also ends the session, for
//! models that answer in prose instead of calling the tool.

use crate::control::ResumeSignal;
use crate::{ToolCall, ToolDef, ToolError, json_schema_for};
use schemars::JsonSchema;
use serde::Deserialize;

pub const REQUEST_DECISION: &str = "request_decision";
pub const REQUEST_HUMAN_ACTION: &str = "request_human_action";
pub const TASK_COMPLETE: &str = "task_complete";

const COMPLETION_OPEN: &str = "<task_complete>";
const COMPLETION_CLOSE: &str = "</task_complete>";

/// Arguments for `request_decision`.
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct RequestDecisionArgs {
    /// The question, phrased so it can be answered without reading the
    /// conversation.
    pub question: String,
    /// Candidate answers. Leave empty for a free-form answer.
    #[serde(default)]
    pub options: Vec<String>,
}

/// Arguments for `request_human_action`.
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct RequestHumanActionArgs {
    /// Step-by-step instructions for the human.
    pub instructions: String,
}

/// Arguments for `task_complete`.
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct TaskCompleteArgs {
    /// What was done.
    pub summary: String,
}

/// A parsed control tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    Decision {
        call_id: String,
        question: String,
        options: Vec<String>,
    },
    HumanAction {
        call_id: String,
        instructions: String,
    },
    Complete {
        call_id: String,
        summary: String,
    },
}

impl ControlRequest {
    /// Whether the session must wait for a human before continuing.
    pub fn is_blocking(&self) -> bool {
        !matches!(self, ControlRequest::Complete { .. })
    }

    pub fn call_id(&self) -> &str {
        match self {
            ControlRequest::Decision { call_id, .. }
            | ControlRequest::HumanAction { call_id, .. }
            | ControlRequest::Complete { call_id, .. } => call_id,
        }
    }
}

pub fn is_control_tool(name: &str) -> bool {
    matches!(name, REQUEST_DECISION | REQUEST_HUMAN_ACTION | TASK_COMPLETE)
}

/// Definitions sent to the model alongside the workspace tools.
pub fn control_tool_defs() -> Vec<ToolDef> {
    vec![
        ToolDef::new(
            REQUEST_DECISION,
            "Ask a human to make a decision you cannot settle from the project. \
             The session pauses until they answer; the answer is returned as this \
             call's result and pinned for the rest of the session.",
            json_schema_for::<RequestDecisionArgs>(),
        ),
        ToolDef::new(
            REQUEST_HUMAN_ACTION,
            "Ask a human to perform an action you cannot (credentials, external \
             accounts, hardware). The session pauses until they report back.",
            json_schema_for::<RequestHumanActionArgs>(),
        ),
        ToolDef::new(
            TASK_COMPLETE,
            "Declare the task finished. Call this only when the work is done.",
            json_schema_for::<TaskCompleteArgs>(),
        ),
    ]
}

/// Parse a control tool call. `None` if `call` is not a control tool.
pub fn parse_control_call(call: &ToolCall) -> Option<Result<ControlRequest, ToolError>> {
    let name = call.name();
    if !is_control_tool(name) {
        return None;
    }
    let raw = call.function.arguments.trim();
    let raw = if raw.is_empty() { "{}" } else { raw };
    let invalid = |e: serde_json::Error| ToolError::policy(format!("invalid arguments for {name}: {e}"));
    let call_id = call.id.clone();

    let parsed = match name {
        REQUEST_DECISION => serde_json::from_str::<RequestDecisionArgs>(raw)
            .map_err(invalid)
            .and_then(|args| {
                if args.question.trim().is_empty() {
                    return Err(ToolError::policy("question must not be empty"));
                }
                Ok(ControlRequest::Decision {
                    call_id,
                    question: args.question,
                    options: args.options,
                })
            }),
        REQUEST_HUMAN_ACTION => serde_json::from_str::<RequestHumanActionArgs>(raw)
            .map_err(invalid)
            .and_then(|args| {
                if args.instructions.trim().is_empty() {
                    return Err(ToolError::policy("instructions must not be empty"));
                }
                Ok(ControlRequest::HumanAction {
                    call_id,
                    instructions: args.instructions,
                })
            }),
        _ => serde_json::from_str::<TaskCompleteArgs>(raw)
            .map_err(invalid)
            .map(|args| ControlRequest::Complete {
                call_id,
                summary: args.summary,
            }),
    };
    Some(parsed)
}

/// Detect the completion marker in a text reply.
///
/// Returns the summary: the text between `<task_complete>` and
/// `</task_complete>` when both are present, otherwise the reply with the
/// marker removed.
pub fn completion_marker(text: &str) -> Option<String> {
    let (before, after) = text.split_once(COMPLETION_OPEN)?;
    let summary = match after.split_once(COMPLETION_CLOSE) {
        Some((inner, _)) => inner.trim().to_string(),
        None => format!("{before}{after}").trim().to_string(),
    };
    Some(summary)
}

/// Turn a [`ResumeSignal`] into the answer of a pending decision.
///
/// `Select` is 1-based. `Continue` takes the first option. Free text that
/// matches an option (case-insensitively) is normalized to that option.
pub fn resolve_answer(options: &[String], signal: &ResumeSignal) -> Result<String, String> {
    match signal {
        ResumeSignal::Select(n) => match n.checked_sub(1).and_then(|i| options.get(i)) {
            Some(option) => Ok(option.clone()),
            None => Err(format!(
                "option {n} out of range (1..={})",
                options.len()
            )),
        },
        ResumeSignal::Continue => match options.first() {
            Some(option) => Ok(option.clone()),
            None => Err("this decision has no options; answer with text".to_string()),
        },
        ResumeSignal::Input(text) => {
            let text = text.trim();
            if text.is_empty() {
                return Err("empty answer".to_string());
            }
            Ok(options
                .iter()
                .find(|o| o.eq_ignore_ascii_case(text))
                .cloned()
                .unwrap_or_else(|| text.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> Vec<String> {
        vec!["postgres".into(), "sqlite".into()]
    }

    #[test]
    fn parses_decision_request() {
        let call = ToolCall::function(
            "c1",
            REQUEST_DECISION,
            r#"{"question":"Which database?","options":["postgres","sqlite"]}"#,
        );
        let parsed = parse_control_call(&call).unwrap().unwrap();
        assert_eq!(
            parsed,
            ControlRequest::Decision {
                call_id: "c1".into(),
                question: "Which database?".into(),
                options: options(),
            }
        );
        assert!(parsed.is_blocking());
    }

    #[test]
    fn workspace_tools_are_not_control_calls() {
        let call = ToolCall::function("c1", "read_file", r#"{"path":"a"}"#);
        assert!(parse_control_call(&call).is_none());
    }

    #[test]
    fn malformed_control_call_is_policy_violation() {
        let call = ToolCall::function("c1", REQUEST_HUMAN_ACTION, r#"{"instructions":""}"#);
        let err = parse_control_call(&call).unwrap().unwrap_err();
        assert_eq!(err.kind(), "policy_violation");

        let call = ToolCall::function("c2", TASK_COMPLETE, r#"{"summary":1}"#);
        assert!(parse_control_call(&call).unwrap().is_err());
    }

    #[test]
    fn completion_marker_variants() {
        assert_eq!(
            completion_marker("All done. <task_complete>Added the endpoint</task_complete>"),
            Some("Added the endpoint".into())
        );
        assert_eq!(
            completion_marker("Tests pass.\n<task_complete>"),
            Some("Tests pass.".into())
        );
        assert_eq!(completion_marker("still working on it"), None);
    }

    #[test]
    fn answers_from_signals() {
        assert_eq!(resolve_answer(&options(), &ResumeSignal::Select(2)), Ok("sqlite".into()));
        assert!(resolve_answer(&options(), &ResumeSignal::Select(0)).is_err());
        assert!(resolve_answer(&options(), &ResumeSignal::Select(3)).is_err());
        assert_eq!(resolve_answer(&options(), &ResumeSignal::Continue), Ok("postgres".into()));
        assert_eq!(
            resolve_answer(&options(), &ResumeSignal::Input("SQLite".into())),
            Ok("sqlite".into())
        );
        assert_eq!(
            resolve_answer(&[], &ResumeSignal::Input("use redis".into())),
            Ok("use redis".into())
        );
        assert!(resolve_answer(&[], &ResumeSignal::Continue).is_err());
    }
}
