//! Automatic retry with exponential backoff and jitter.
//!
//! Retries transient [`ModelError`] failures (429, 5xx, network timeouts,
//! empty responses) with configurable exponential backoff. Permanent and
//! protocol errors are returned immediately.

use crate::{AutopilotError, ModelError};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    pub initial_delay_ms: u64,
    /// Maximum delay between retries, in milliseconds.
    pub max_delay_ms: u64,
    /// Backoff multiplier (typically 2.0 for exponential backoff).
    pub multiplier: f64,
    /// Whether to add jitter to prevent thundering herd.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 500,
            max_delay_ms: 8_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Create a config with the given number of retries. Uses sensible defaults.
    pub fn with_retries(retries: u32) -> Self {
        Self {
            max_retries: retries,
            ..Default::default()
        }
    }

    /// Total attempts including the first one.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Reject settings that would make the backoff shrink or go negative.
    pub fn validate(&self) -> Result<(), AutopilotError> {
        if !(self.multiplier.is_finite() && self.multiplier >= 1.0) {
            return Err(AutopilotError::config(format!(
                "retry.multiplier must be a finite number >= 1, got {}",
                self.multiplier
            )));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(AutopilotError::config(format!(
                "retry.initial_delay_ms ({}) must not exceed max_delay_ms ({})",
                self.initial_delay_ms, self.max_delay_ms
            )));
        }
        Ok(())
    }

    /// Calculate the delay for a given retry number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let initial = self.initial_delay_ms as f64 / 1000.0;
        let base = initial * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay_ms as f64 / 1000.0);

        if self.jitter {
            // Deterministic jitter keeps backoff reproducible without pulling
            // in a random number generator.
            let jitter_factor = match attempt % 4 {
                0 => 0.75,
                1 => 0.90,
                2 => 0.60,
                _ => 0.85,
            };
            backoff(capped * jitter_factor)
        } else {
            backoff(capped)
        }
    }
}

/// Out-of-range delays (negative, NaN) become zero instead of panicking.
fn backoff(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO)
}

/// Run `op` until it succeeds, fails permanently, or runs out of attempts.
///
/// `op` receives the zero-based attempt number. `on_retry` is called before
/// each backoff sleep with the retry number, the delay, and the error that
/// caused it.
pub async fn call_with_retry<T, F, Fut>(
    config: &RetryConfig,
    mut op: F,
    mut on_retry: impl FnMut(u32, Duration, &ModelError),
) -> Result<T, AutopilotError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ModelError>>,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_transient() => return Err(AutopilotError::Model(e)),
            Err(e) => {
                if attempt >= config.max_retries {
                    warn!(
                        "Model API still failing after {} attempt(s): {e}",
                        attempt + 1
                    );
                    return Err(AutopilotError::ApiRetriesExhausted {
                        attempts: attempt + 1,
                        last: e,
                    });
                }
                let delay = config.delay_for_attempt(attempt);
                on_retry(attempt + 1, delay, &e);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
