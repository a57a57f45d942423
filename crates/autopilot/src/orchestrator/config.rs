//! Orchestrator configuration.
//!
//! Every knob of a run lives in one [`OrchestratorConfig`], loaded from a
//! TOML file where each concern has its own table:
//!
//! ```toml
//! max_turns = 200
//! max_retries_per_call_site = 3
//!
//! [routing]
//! strategy = "single"
//! model = "anthropic/claude-sonnet-4"
//!
//! [context]
//! max_context_tokens = 200000
//! checkpoint_threshold = 0.6
//!
//! [budget]
//! warn_usd = 10.0
//! alert_usd = 25.0
//! max_usd = 50.0
//!
//! [tools]
//! pool_size = 4
//! ```
//!
//! Missing tables and fields fall back to [`Default`].

use crate::context::ContextConfig;
use crate::cost::BudgetConfig;
use crate::model::{ModelTierPolicy, RetryConfig};
use crate::tools::ToolsConfig;
use crate::AutopilotError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Default system prompt. Describes the control tools so the model knows
/// how to finish and when to ask a human.
pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are an autonomous software engineering agent working inside a project \
directory. Use the file and command tools to make progress on the task \
without waiting for confirmation.

Independent tool calls in one response run in parallel. To order a call \
after another call of the same response, pass that call's id in its \
`depends_on` argument.

When a choice has lasting consequences and you cannot settle it from the \
project itself, call `request_decision` with a question and the options. \
When something only a human can do is required (credentials, hardware, \
an external account), call `request_human_action` with precise \
instructions. Resolved decisions are listed at the top of the \
conversation; do not ask them again.

When the task is done, call `task_complete` with a short summary of what \
changed.";

/// Configuration for an [`Orchestrator`](super::Orchestrator) run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub system_prompt: String,
    /// Model turns allowed before the session pauses.
    pub max_turns: u32,
    /// Output token cap per request. Must fit in
    /// `context.reserved_output_tokens`.
    pub max_tokens: u32,
    pub temperature: f32,
    /// Failures of one call site tolerated before the session fails.
    pub max_retries_per_call_site: u32,
    /// Consecutive text-only turns without completion before the session
    /// asks a human for guidance.
    pub max_idle_text_turns: u32,
    pub routing: ModelTierPolicy,
    pub context: ContextConfig,
    pub budget: BudgetConfig,
    pub tools: ToolsConfig,
    pub retry: RetryConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_turns: 200,
            max_tokens: 8_192,
            temperature: 0.2,
            max_retries_per_call_site: 3,
            max_idle_text_turns: 3,
            routing: ModelTierPolicy::default(),
            context: ContextConfig::default(),
            budget: BudgetConfig::default(),
            tools: ToolsConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Read a TOML config file. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AutopilotError> {
        let path = path.as_ref();
        let config = match std::fs::read_to_string(path) {
            Ok(text) => toml::from_str::<Self>(&text).map_err(|e| {
                AutopilotError::config(format!("{}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No config at {}, using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                return Err(AutopilotError::config(format!(
                    "cannot read {}: {e}",
                    path.display()
                )));
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the orchestrator cannot run with.
    pub fn validate(&self) -> Result<(), AutopilotError> {
        self.context.validate()?;
        self.budget.thresholds().validate()?;
        self.tools.validate()?;
        self.retry.validate()?;

        if self.max_turns == 0 {
            return Err(AutopilotError::config("max_turns must be > 0"));
        }
        if self.max_tokens == 0 || self.max_tokens as usize > self.context.reserved_output_tokens {
            return Err(AutopilotError::config(format!(
                "max_tokens ({}) must be in 1..={} (context.reserved_output_tokens)",
                self.max_tokens, self.context.reserved_output_tokens
            )));
        }
        if self.max_retries_per_call_site == 0 {
            return Err(AutopilotError::config("max_retries_per_call_site must be > 0"));
        }
        if self.max_idle_text_turns == 0 {
            return Err(AutopilotError::config("max_idle_text_turns must be > 0"));
        }
        if self.routing.models().iter().any(|m| m.trim().is_empty()) {
            return Err(AutopilotError::config("routing: model names must not be empty"));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(AutopilotError::config(format!(
                "temperature must be in [0, 2], got {}",
                self.temperature
            )));
        }
        Ok(())
    }

    /// Route every turn to one model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.routing = ModelTierPolicy::single(model);
        self
    }

    pub fn with_routing(mut self, routing: ModelTierPolicy) -> Self {
        self.routing = routing;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_retries_per_call_site(mut self, retries: u32) -> Self {
        self.max_retries_per_call_site = retries;
        self
    }

    pub fn with_max_idle_text_turns(mut self, turns: u32) -> Self {
        self.max_idle_text_turns = turns;
        self
    }

    pub fn with_context(mut self, context: ContextConfig) -> Self {
        self.context = context;
        self
    }

    /// Set the three spend thresholds in USD, keeping the pricing table.
    pub fn with_budget(mut self, warn_usd: f64, alert_usd: f64, max_usd: f64) -> Self {
        self.budget.warn_usd = warn_usd;
        self.budget.alert_usd = alert_usd;
        self.budget.max_usd = max_usd;
        self
    }

    pub fn with_budget_config(mut self, budget: BudgetConfig) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_tools(mut self, tools: ToolsConfig) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        OrchestratorConfig::default().validate().unwrap();
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = OrchestratorConfig::load(dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.max_turns, 200);
        assert_eq!(config.budget.max_usd, 50.0);
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
max_turns = 12

[routing]
strategy = "tiered"
light = "openai/gpt-4o-mini"
standard = "anthropic/claude-sonnet-4"
heavy = "anthropic/claude-opus-4"
light_turns = 2
escalate_after_failures = 3

[budget]
max_usd = 5.0
alert_usd = 4.0
warn_usd = 1.0

[tools]
pool_size = 2
"#,
        )
        .unwrap();

        let config = OrchestratorConfig::load(&path).unwrap();
        assert_eq!(config.max_turns, 12);
        assert_eq!(config.budget.max_usd, 5.0);
        assert_eq!(config.tools.pool_size, 2);
        assert_eq!(config.routing.models().len(), 3);
        assert_eq!(config.max_retries_per_call_site, 3);
    }

    #[test]
    fn invalid_toml_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "max_turns = \"many\"").unwrap();
        let err = OrchestratorConfig::load(&path).unwrap_err();
        assert_eq!(err.kind(), "config");
    }

    #[test]
    fn negative_retry_multiplier_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[retry]\nmultiplier = -2.0\n").unwrap();
        let err = OrchestratorConfig::load(&path).unwrap_err();
        assert_eq!(err.kind(), "config");
        assert!(err.to_string().contains("retry.multiplier"), "{err}");
    }

    #[test]
    fn rejects_inconsistent_settings() {
        assert!(OrchestratorConfig::default().with_max_turns(0).validate().is_err());
        assert!(OrchestratorConfig::default().with_max_tokens(100_000).validate().is_err());
        assert!(OrchestratorConfig::default().with_budget(10.0, 5.0, 50.0).validate().is_err());
        assert!(OrchestratorConfig::default().with_model("").validate().is_err());
        assert!(
            OrchestratorConfig::default()
                .with_max_retries_per_call_site(0)
                .validate()
                .is_err()
        );
    }
}
