//! Budget enforcement from reported token usage.
//!
//! The [`CostTracker`] bills every turn against the usage counts the model
//! API returned, using an injected [`PricingTable`]. Local token estimates
//! never reach this module. After every recorded turn the cumulative cost is
//! compared to three strictly ordered thresholds:
//!
//! | Level | Effect |
//! |-------|--------|
//! | `warn` | notification only |
//! | `alert` | the orchestrator asks for confirmation before the next call |
//! | `max` | hard stop: the session pauses until the ceiling is raised |

use crate::AutopilotError;
use crate::model::TokenUsage;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

// ── Pricing ────────────────────────────────────────────────────────

/// Per-model pricing (USD per 1M tokens).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelPricing {
    pub const fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }

    pub fn cost(&self, usage: &TokenUsage) -> f64 {
        (usage.input_tokens as f64 / 1_000_000.0) * self.input_per_million
            + (usage.output_tokens as f64 / 1_000_000.0) * self.output_per_million
    }
}

impl Default for ModelPricing {
    fn default() -> Self {
        Self::new(3.0, 15.0)
    }
}

/// Maps a model name pattern to its pricing.
///
/// Patterns are matched against the lowercased name segment after the last
/// `/`. A pattern is a list of fragments separated by `*` that must appear
/// in order; a leading `^` anchors the first fragment at the start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingRule {
    pub pattern: String,
    #[serde(flatten)]
    pub pricing: ModelPricing,
}

impl PricingRule {
    pub fn new(pattern: impl Into<String>, pricing: ModelPricing) -> Self {
        Self {
            pattern: pattern.into(),
            pricing,
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        let (anchored, pattern) = match self.pattern.strip_prefix('^') {
            Some(rest) => (true, rest),
            None => (false, self.pattern.as_str()),
        };
        let mut rest = name;
        for (i, fragment) in pattern.split('*').filter(|f| !f.is_empty()).enumerate() {
            match rest.find(fragment) {
                Some(0) => {}
                Some(_) if i == 0 && anchored => return false,
                Some(pos) => {
                    rest = rest.get(pos..).unwrap_or_default();
                }
                None => return false,
            }
            rest = rest.get(fragment.len()..).unwrap_or_default();
        }
        true
    }
}

/// Ordered pricing rules with a fallback. First match wins.
#[derive(Debug, Clone, PartialEq)]
pub struct PricingTable {
    rules: Vec<PricingRule>,
    fallback: ModelPricing,
}

impl Default for PricingTable {
    /// Approximate list prices for common model families.
    fn default() -> Self {
        Self {
            rules: vec![
                PricingRule::new("opus", ModelPricing::new(15.0, 75.0)),
                PricingRule::new("sonnet", ModelPricing::new(3.0, 15.0)),
                PricingRule::new("haiku", ModelPricing::new(0.25, 1.25)),
                PricingRule::new("4o-mini", ModelPricing::new(0.15, 0.60)),
                PricingRule::new("gpt-4", ModelPricing::new(2.50, 10.0)),
                PricingRule::new("^o1", ModelPricing::new(15.0, 60.0)),
                PricingRule::new("^o3", ModelPricing::new(15.0, 60.0)),
                PricingRule::new("gemini*flash", ModelPricing::new(0.075, 0.30)),
                PricingRule::new("gemini", ModelPricing::new(1.25, 5.0)),
                PricingRule::new("deepseek", ModelPricing::new(0.27, 1.10)),
            ],
            fallback: ModelPricing::default(),
        }
    }
}

impl PricingTable {
    /// A table with no rules: every model bills at `fallback`.
    pub fn flat(fallback: ModelPricing) -> Self {
        Self {
            rules: Vec::new(),
            fallback,
        }
    }

    /// Add rules that take precedence over the existing ones.
    pub fn with_overrides(mut self, rules: impl IntoIterator<Item = PricingRule>) -> Self {
        let mut merged: Vec<PricingRule> = rules.into_iter().collect();
        merged.append(&mut self.rules);
        self.rules = merged;
        self
    }

    pub fn pricing_for(&self, model: &str) -> ModelPricing {
        let name = model.rsplit('/').next().unwrap_or(model).to_lowercase();
        self.rules
            .iter()
            .find(|r| r.matches(&name))
            .map_or(self.fallback, |r| r.pricing)
    }
}

// ── Thresholds ─────────────────────────────────────────────────────

/// Budget configuration: thresholds in USD plus pricing overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub warn_usd: f64,
    pub alert_usd: f64,
    pub max_usd: f64,
    /// Checked before the built-in pricing table.
    pub pricing: Vec<PricingRule>,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            warn_usd: 10.0,
            alert_usd: 25.0,
            max_usd: 50.0,
            pricing: Vec::new(),
        }
    }
}

impl BudgetConfig {
    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            warn_usd: self.warn_usd,
            alert_usd: self.alert_usd,
            max_usd: self.max_usd,
        }
    }

    pub fn pricing_table(&self) -> PricingTable {
        PricingTable::default().with_overrides(self.pricing.iter().cloned())
    }
}

/// Strictly ordered cost thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub warn_usd: f64,
    pub alert_usd: f64,
    pub max_usd: f64,
}

impl Thresholds {
    pub fn validate(&self) -> Result<(), AutopilotError> {
        let ordered = 0.0 <= self.warn_usd
            && self.warn_usd < self.alert_usd
            && self.alert_usd < self.max_usd;
        if ordered {
            Ok(())
        } else {
            Err(AutopilotError::config(format!(
                "budget thresholds must satisfy 0 <= warn < alert < max, got warn=${} alert=${} max=${}",
                self.warn_usd, self.alert_usd, self.max_usd
            )))
        }
    }

    pub fn level_for(&self, cost_usd: f64) -> BudgetLevel {
        if cost_usd >= self.max_usd {
            BudgetLevel::Maxed
        } else if cost_usd >= self.alert_usd {
            BudgetLevel::Alert
        } else if cost_usd >= self.warn_usd {
            BudgetLevel::Warn
        } else {
            BudgetLevel::Ok
        }
    }
}

/// Where cumulative cost stands relative to the thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetLevel {
    Ok,
    Warn,
    Alert,
    Maxed,
}

impl fmt::Display for BudgetLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BudgetLevel::Ok => "ok",
            BudgetLevel::Warn => "warn",
            BudgetLevel::Alert => "alert",
            BudgetLevel::Maxed => "maxed",
        };
        f.write_str(s)
    }
}

// ── Budget ─────────────────────────────────────────────────────────

/// Cumulative counters plus thresholds. Persisted in every checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Budget {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub turns_billed: u32,
    pub thresholds: Thresholds,
    /// Set once a human confirmed spending past `alert`.
    #[serde(default)]
    pub alert_acknowledged: bool,
}

impl Budget {
    pub fn new(thresholds: Thresholds) -> Self {
        Self {
            input_tokens: 0,
            output_tokens: 0,
            cost_usd: 0.0,
            turns_billed: 0,
            thresholds,
            alert_acknowledged: false,
        }
    }

    pub fn level(&self) -> BudgetLevel {
        self.thresholds.level_for(self.cost_usd)
    }
}

/// Snapshot returned by [`CostTracker::status`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub level: BudgetLevel,
    pub cost_usd: f64,
    /// USD left before `max`. Never negative.
    pub remaining_usd: f64,
}

/// A change of [`BudgetLevel`] caused by one recorded turn.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdCrossing {
    pub from: BudgetLevel,
    pub to: BudgetLevel,
    pub cost_usd: f64,
}

// ── CostTracker ────────────────────────────────────────────────────

/// Accumulates usage and cost for one session.
#[derive(Debug, Clone)]
pub struct CostTracker {
    pricing: PricingTable,
    budget: Budget,
}

impl CostTracker {
    pub fn new(pricing: PricingTable, thresholds: Thresholds) -> Self {
        Self::from_budget(pricing, Budget::new(thresholds))
    }

    /// Continue from persisted counters.
    pub fn from_budget(pricing: PricingTable, budget: Budget) -> Self {
        Self { pricing, budget }
    }

    pub fn budget(&self) -> &Budget {
        &self.budget
    }

    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }

    /// Bill one turn. Returns the crossing if the level went up.
    pub fn record(&mut self, model: &str, usage: &TokenUsage) -> Option<ThresholdCrossing> {
        let from = self.budget.level();
        let cost = self.pricing.pricing_for(model).cost(usage).max(0.0);

        self.budget.input_tokens += usage.input_tokens;
        self.budget.output_tokens += usage.output_tokens;
        self.budget.cost_usd += cost;
        self.budget.turns_billed += 1;

        let to = self.budget.level();
        if to > from {
            match to {
                BudgetLevel::Maxed => warn!(
                    "Budget max reached: ${:.4} of ${:.2}",
                    self.budget.cost_usd, self.budget.thresholds.max_usd
                ),
                _ => info!(
                    "Budget crossed {to}: ${:.4} (max ${:.2})",
                    self.budget.cost_usd, self.budget.thresholds.max_usd
                ),
            }
            Some(ThresholdCrossing {
                from,
                to,
                cost_usd: self.budget.cost_usd,
            })
        } else {
            None
        }
    }

    pub fn status(&self) -> BudgetStatus {
        BudgetStatus {
            level: self.budget.level(),
            cost_usd: self.budget.cost_usd,
            remaining_usd: (self.budget.thresholds.max_usd - self.budget.cost_usd).max(0.0),
        }
    }

    /// Whether the next model call must wait for a human to confirm the
    /// spend past `alert`.
    pub fn needs_confirmation(&self) -> bool {
        self.budget.level() == BudgetLevel::Alert && !self.budget.alert_acknowledged
    }

    pub fn is_maxed(&self) -> bool {
        self.budget.level() == BudgetLevel::Maxed
    }

    pub fn acknowledge_alert(&mut self) {
        self.budget.alert_acknowledged = true;
    }

    /// Raise the `max` ceiling. Only ever raises.
    pub fn raise_max(&mut self, max_usd: f64) -> Result<(), AutopilotError> {
        let current = self.budget.thresholds.max_usd;
        if !max_usd.is_finite() || max_usd <= current {
            return Err(AutopilotError::config(format!(
                "new budget max ${max_usd} must be above the current max ${current}"
            )));
        }
        self.budget.thresholds.max_usd = max_usd;
        info!("Budget max raised: ${current:.2} -> ${max_usd:.2}");
        Ok(())
    }

    /// One-line summary for logs.
    pub fn summary(&self) -> String {
        format!(
            "tokens: {} in + {} out, cost: ${:.4} of ${:.2} ({})",
            self.budget.input_tokens,
            self.budget.output_tokens,
            self.budget.cost_usd,
            self.budget.thresholds.max_usd,
            self.budget.level()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds(warn: f64, alert: f64, max: f64) -> Thresholds {
        Thresholds {
            warn_usd: warn,
            alert_usd: alert,
            max_usd: max,
        }
    }

    /// $1 per million input tokens, nothing for output.
    fn dollar_table() -> PricingTable {
        PricingTable::flat(ModelPricing::new(1.0, 0.0))
    }

    fn dollars(usd: f64) -> TokenUsage {
        TokenUsage::new((usd * 1_000_000.0).round() as u64, 0)
    }

    #[test]
    fn pricing_lookup_known_models() {
        let table = PricingTable::default();
        assert_eq!(table.pricing_for("anthropic/claude-opus-4").input_per_million, 15.0);
        assert_eq!(table.pricing_for("anthropic/claude-3.5-haiku").input_per_million, 0.25);
        assert_eq!(table.pricing_for("openai/gpt-4o-mini").input_per_million, 0.15);
        assert_eq!(table.pricing_for("openai/o3-mini").output_per_million, 60.0);
        assert_eq!(table.pricing_for("google/gemini-2.0-flash").input_per_million, 0.075);
        assert_eq!(table.pricing_for("google/gemini-2.5-pro").input_per_million, 1.25);
        assert_eq!(table.pricing_for("mystery-model"), ModelPricing::default());
    }

    #[test]
    fn org_prefix_does_not_match() {
        let table = PricingTable::default();
        assert_eq!(
            table.pricing_for("opus-labs/tiny-model"),
            ModelPricing::default()
        );
        assert!(!PricingRule::new("^o1", ModelPricing::default()).matches("gpt-o1"));
    }

    #[test]
    fn overrides_take_precedence() {
        let table = PricingTable::default()
            .with_overrides([PricingRule::new("sonnet", ModelPricing::new(1.0, 2.0))]);
        assert_eq!(
            table.pricing_for("anthropic/claude-sonnet-4"),
            ModelPricing::new(1.0, 2.0)
        );
    }

    #[test]
    fn cost_estimation() {
        let cost = ModelPricing::new(3.0, 15.0).cost(&TokenUsage::new(1_000_000, 100_000));
        assert!((cost - 4.5).abs() < 1e-9);
    }

    #[test]
    fn threshold_validation() {
        assert!(thresholds(10.0, 25.0, 50.0).validate().is_ok());
        assert!(thresholds(10.0, 10.0, 50.0).validate().is_err());
        assert!(thresholds(30.0, 25.0, 50.0).validate().is_err());
        assert!(thresholds(10.0, 60.0, 50.0).validate().is_err());
    }

    #[test]
    fn crossings_are_reported_once() {
        let mut tracker = CostTracker::new(dollar_table(), thresholds(1.0, 2.0, 3.0));
        assert_eq!(tracker.record("m", &dollars(0.5)), None);

        let warn = tracker.record("m", &dollars(0.6)).unwrap();
        assert_eq!((warn.from, warn.to), (BudgetLevel::Ok, BudgetLevel::Warn));
        assert_eq!(tracker.record("m", &dollars(0.1)), None);

        let maxed = tracker.record("m", &dollars(2.0)).unwrap();
        assert_eq!(maxed.from, BudgetLevel::Warn);
        assert_eq!(maxed.to, BudgetLevel::Maxed);
        assert!(tracker.is_maxed());
        assert_eq!(tracker.status().remaining_usd, 0.0);
    }

    #[test]
    fn cost_is_monotonic() {
        let mut tracker = CostTracker::new(dollar_table(), thresholds(10.0, 25.0, 50.0));
        let mut last = 0.0;
        for usd in [0.0, 1.5, 0.0, 3.25, 0.01] {
            tracker.record("m", &dollars(usd));
            let now = tracker.status().cost_usd;
            assert!(now >= last);
            last = now;
        }
        assert_eq!(tracker.budget().turns_billed, 5);
    }

    #[test]
    fn fifty_dollars_and_a_cent_is_maxed() {
        let mut tracker = CostTracker::new(dollar_table(), thresholds(10.0, 25.0, 50.0));
        tracker.record("m", &dollars(49.0));
        tracker.acknowledge_alert();
        assert!(!tracker.is_maxed());
        let crossing = tracker.record("m", &dollars(1.01)).unwrap();
        assert_eq!(crossing.to, BudgetLevel::Maxed);
        assert!(tracker.is_maxed());
    }

    #[test]
    fn alert_needs_confirmation_until_acknowledged() {
        let mut tracker = CostTracker::new(dollar_table(), thresholds(1.0, 2.0, 10.0));
        tracker.record("m", &dollars(2.5));
        assert!(tracker.needs_confirmation());
        tracker.acknowledge_alert();
        assert!(!tracker.needs_confirmation());
    }

    #[test]
    fn raise_max_only_raises() {
        let mut tracker = CostTracker::new(dollar_table(), thresholds(1.0, 2.0, 3.0));
        tracker.record("m", &dollars(3.5));
        assert!(tracker.is_maxed());
        assert!(tracker.raise_max(2.5).is_err());
        tracker.raise_max(10.0).unwrap();
        assert!(!tracker.is_maxed());
        assert_eq!(tracker.status().level, BudgetLevel::Alert);
    }

    #[test]
    fn budget_config_from_toml() {
        let config: BudgetConfig = toml::from_str(
            r#"
warn_usd = 5.0
alert_usd = 8.0
max_usd = 12.0

[[pricing]]
pattern = "my-model"
input_per_million = 0.5
output_per_million = 1.0
"#,
        )
        .unwrap();
        assert!(config.thresholds().validate().is_ok());
        assert_eq!(
            config.pricing_table().pricing_for("acme/my-model-v2"),
            ModelPricing::new(0.5, 1.0)
        );
    }
}
