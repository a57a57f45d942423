//! Model-tier selection for a session.
//!
//! Use a cheaper model while the task is going smoothly and escalate to a
//! more capable model when the agent starts failing. The policy is part of
//! the persisted [`Session`](crate::session::Session), so a resumed session
//! keeps routing the same way.

use serde::{Deserialize, Serialize};

/// Inputs the tier policy looks at each turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierSignal {
    /// Zero-based index of the turn about to be requested.
    pub turn: u32,
    /// Tool failures in a row across the most recent turns.
    pub consecutive_tool_failures: u32,
}

/// Model routing strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum ModelTierPolicy {
    /// Use a single model for every turn.
    Single { model: String },
    /// Light model for the opening turns, standard model afterwards, heavy
    /// model once tool failures pile up.
    Tiered {
        light: String,
        standard: String,
        heavy: String,
        /// Number of opening turns served by the light model.
        light_turns: u32,
        /// Consecutive tool failures that escalate to the heavy model.
        escalate_after_failures: u32,
    },
}

impl ModelTierPolicy {
    pub fn single(model: impl Into<String>) -> Self {
        ModelTierPolicy::Single {
            model: model.into(),
        }
    }

    /// The model to use for the next turn.
    pub fn model_for(&self, signal: TierSignal) -> &str {
        match self {
            ModelTierPolicy::Single { model } => model,
            ModelTierPolicy::Tiered {
                light,
                standard,
                heavy,
                light_turns,
                escalate_after_failures,
            } => {
                if *escalate_after_failures > 0
                    && signal.consecutive_tool_failures >= *escalate_after_failures
                {
                    heavy
                } else if signal.turn < *light_turns {
                    light
                } else {
                    standard
                }
            }
        }
    }

    /// The model most turns run on. Used to pick the token-counting family.
    pub fn primary_model(&self) -> &str {
        match self {
            ModelTierPolicy::Single { model } => model,
            ModelTierPolicy::Tiered { standard, .. } => standard,
        }
    }

    /// Every model this policy can route to.
    pub fn models(&self) -> Vec<&str> {
        match self {
            ModelTierPolicy::Single { model } => vec![model],
            ModelTierPolicy::Tiered {
                light,
                standard,
                heavy,
                ..
            } => vec![light, standard, heavy],
        }
    }
}

impl Default for ModelTierPolicy {
    fn default() -> Self {
        ModelTierPolicy::single(crate::DEFAULT_MODEL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiered() -> ModelTierPolicy {
        ModelTierPolicy::Tiered {
            light: "haiku".into(),
            standard: "sonnet".into(),
            heavy: "opus".into(),
            light_turns: 3,
            escalate_after_failures: 2,
        }
    }

    #[test]
    fn single_model() {
        let policy = ModelTierPolicy::single("claude-sonnet");
        let signal = TierSignal {
            turn: 10,
            consecutive_tool_failures: 5,
        };
        assert_eq!(policy.model_for(signal), "claude-sonnet");
    }

    #[test]
    fn tiered_uses_light_then_standard() {
        let policy = tiered();
        assert_eq!(policy.model_for(TierSignal::default()), "haiku");
        let later = TierSignal {
            turn: 3,
            consecutive_tool_failures: 0,
        };
        assert_eq!(policy.model_for(later), "sonnet");
    }

    #[test]
    fn tiered_escalates_on_failures() {
        let policy = tiered();
        let failing = TierSignal {
            turn: 1,
            consecutive_tool_failures: 2,
        };
        assert_eq!(policy.model_for(failing), "opus");
    }

    #[test]
    fn policy_roundtrips_through_toml() {
        let text = r#"
strategy = "tiered"
light = "haiku"
standard = "sonnet"
heavy = "opus"
light_turns = 3
escalate_after_failures = 2
"#;
        let parsed: ModelTierPolicy = toml::from_str(text).unwrap();
        assert_eq!(parsed, tiered());
        assert_eq!(parsed.primary_model(), "sonnet");
    }
}
