//! Concurrent execution of the tool calls of one turn.
//!
//! [`ToolExecutionEngine::execute`] takes every call of a turn and returns
//! exactly one [`ToolResult`] per call, in call order:
//!
//! 1. Each call is validated against the [`ToolRegistry`]. Rejections become
//!    `PolicyViolation` results without running anything.
//! 2. Valid calls are grouped into waves ([`dag`](super::dag)).
//! 3. Each wave runs concurrently on a bounded pool, each call under its own
//!    timeout. A failing or panicking call never cancels its siblings.
//! 4. On abort, in-flight calls get a grace period; calls still running
//!    after it, and calls never started, are reported as `Interrupted`.

use crate::control::AbortSignal;
use crate::session::ToolResult;
use crate::tools::core::{
    TimeoutClass, ToolRegistry, ValidatedCall, log_tool_call, truncate_result,
};
use crate::tools::dag::{ScheduleEntry, build_execution_waves};
use crate::tools::policy::DEFAULT_ALLOWED_COMMANDS;
use crate::{AutopilotError, ToolCall, ToolDef, ToolError};
use futures::FutureExt;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info, trace, warn};

// ── Configuration ──────────────────────────────────────────────────

/// Tool execution settings (`[tools]` in the config file).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Maximum number of calls running at once.
    pub pool_size: usize,
    pub read_only_timeout_secs: f64,
    pub mutating_timeout_secs: f64,
    pub command_timeout_secs: f64,
    /// Per-tool timeout overrides, by tool name.
    pub timeout_overrides: BTreeMap<String, f64>,
    /// Programs `run_command` may start.
    pub allowed_commands: Vec<String>,
    pub max_result_bytes: usize,
    /// How long in-flight calls may keep running after an abort.
    pub abort_grace_secs: f64,
    /// Run every call on its own, in order.
    pub sequential: bool,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            read_only_timeout_secs: 30.0,
            mutating_timeout_secs: 60.0,
            command_timeout_secs: 300.0,
            timeout_overrides: BTreeMap::new(),
            allowed_commands: DEFAULT_ALLOWED_COMMANDS
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            max_result_bytes: crate::tools::core::DEFAULT_MAX_RESULT_BYTES,
            abort_grace_secs: 5.0,
            sequential: false,
        }
    }
}

fn secs(value: f64, fallback: f64) -> Duration {
    Duration::try_from_secs_f64(value)
        .or_else(|_| Duration::try_from_secs_f64(fallback))
        .unwrap_or(Duration::ZERO)
}

impl ToolsConfig {
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    pub fn with_timeout_override(mut self, tool: impl Into<String>, secs: f64) -> Self {
        self.timeout_overrides.insert(tool.into(), secs);
        self
    }

    pub fn with_abort_grace(mut self, secs: f64) -> Self {
        self.abort_grace_secs = secs;
        self
    }

    pub fn with_allowed_commands(mut self, commands: Vec<String>) -> Self {
        self.allowed_commands = commands;
        self
    }

    pub fn with_sequential(mut self, sequential: bool) -> Self {
        self.sequential = sequential;
        self
    }

    pub fn timeout_for(&self, tool: &str, class: TimeoutClass) -> Duration {
        let default = match class {
            TimeoutClass::ReadOnly => self.read_only_timeout_secs,
            TimeoutClass::Mutating => self.mutating_timeout_secs,
            TimeoutClass::Command => self.command_timeout_secs,
        };
        let configured = self.timeout_overrides.get(tool).copied().unwrap_or(default);
        secs(configured, default)
    }

    pub fn abort_grace(&self) -> Duration {
        secs(self.abort_grace_secs, 5.0)
    }

    pub fn validate(&self) -> Result<(), AutopilotError> {
        if self.pool_size == 0 {
            return Err(AutopilotError::config("tools.pool_size must be at least 1"));
        }
        let timeouts = [
            ("tools.read_only_timeout_secs", self.read_only_timeout_secs),
            ("tools.mutating_timeout_secs", self.mutating_timeout_secs),
            ("tools.command_timeout_secs", self.command_timeout_secs),
        ];
        for (name, value) in timeouts
            .into_iter()
            .chain(self.timeout_overrides.iter().map(|(k, v)| (k.as_str(), *v)))
        {
            if !value.is_finite() || value <= 0.0 {
                return Err(AutopilotError::config(format!(
                    "timeout {name} must be a positive number of seconds, got {value}"
                )));
            }
        }
        if !self.abort_grace_secs.is_finite() || self.abort_grace_secs < 0.0 {
            return Err(AutopilotError::config(
                "tools.abort_grace_secs must be a non-negative number",
            ));
        }
        if self.max_result_bytes == 0 {
            return Err(AutopilotError::config("tools.max_result_bytes must be positive"));
        }
        Ok(())
    }
}

// ── Engine ─────────────────────────────────────────────────────────

/// Dispatches the tool calls of a turn.
#[derive(Debug, Clone)]
pub struct ToolExecutionEngine {
    registry: Arc<ToolRegistry>,
    workspace: PathBuf,
    pool: Arc<Semaphore>,
    config: ToolsConfig,
}

impl ToolExecutionEngine {
    pub fn new(
        registry: Arc<ToolRegistry>,
        workspace: impl Into<PathBuf>,
        config: &ToolsConfig,
    ) -> Self {
        Self {
            registry,
            workspace: workspace.into(),
            pool: Arc::new(Semaphore::new(config.pool_size.max(1))),
            config: config.clone(),
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn config(&self) -> &ToolsConfig {
        &self.config
    }

    pub fn definitions(&self) -> Vec<ToolDef> {
        self.registry.definitions()
    }

    /// Run `calls` and return one result per call, in call order.
    pub async fn execute(&self, calls: &[ToolCall], abort: &AbortSignal) -> Vec<ToolResult> {
        let mut results: Vec<Option<ToolResult>> = vec![None; calls.len()];
        let mut valid: Vec<(usize, ValidatedCall)> = Vec::with_capacity(calls.len());

        for (i, call) in calls.iter().enumerate() {
            match self.registry.validate(call) {
                Ok(v) => valid.push((i, v)),
                Err(e) => {
                    warn!("Rejected tool call {} ({}): {e}", call.id, call.name());
                    results[i] = Some(ToolResult::failure(call, e, 0));
                }
            }
        }

        let waves = if self.config.sequential {
            (0..valid.len()).map(|i| vec![i]).collect()
        } else {
            let entries: Vec<ScheduleEntry> = valid
                .iter()
                .map(|(_, v)| ScheduleEntry {
                    call_id: v.call.id.clone(),
                    depends_on: v.depends_on.clone(),
                    capability: v.capability,
                    resource_key: v.resource_key.clone(),
                })
                .collect();
            build_execution_waves(&entries)
        };
        debug!(
            "Executing {} tool calls in {} waves ({} rejected)",
            valid.len(),
            waves.len(),
            calls.len() - valid.len()
        );

        let mut abort = abort.clone();
        for wave in &waves {
            if abort.is_aborted() {
                break;
            }
            let batch: Vec<(usize, &ValidatedCall)> =
                wave.iter().map(|&w| (valid[w].0, &valid[w].1)).collect();
            let aborted = self.run_wave(&batch, &mut results, &mut abort).await;
            if aborted {
                break;
            }
        }

        calls
            .iter()
            .zip(results)
            .map(|(call, result)| {
                result.unwrap_or_else(|| ToolResult::failure(call, ToolError::Interrupted, 0))
            })
            .collect()
    }

    /// Run one wave. Returns `true` if an abort cut it short.
    async fn run_wave(
        &self,
        batch: &[(usize, &ValidatedCall)],
        results: &mut [Option<ToolResult>],
        abort: &mut AbortSignal,
    ) -> bool {
        let mut pending: FuturesUnordered<_> = batch
            .iter()
            .map(|&(index, call)| async move { (index, self.run_one(call).await) })
            .collect();

        let mut deadline: Option<tokio::time::Instant> = None;
        while !pending.is_empty() {
            let next = match deadline {
                None => {
                    tokio::select! {
                        next = pending.next() => next,
                        () = abort.cancelled() => {
                            let grace = self.config.abort_grace();
                            warn!(
                                "Abort requested, giving {} in-flight tool calls {:.1}s to finish",
                                pending.len(),
                                grace.as_secs_f64()
                            );
                            deadline = Some(tokio::time::Instant::now() + grace);
                            continue;
                        }
                    }
                }
                Some(at) => match tokio::time::timeout_at(at, pending.next()).await {
                    Ok(next) => next,
                    Err(_) => break,
                },
            };
            match next {
                Some((index, result)) => results[index] = Some(result),
                None => break,
            }
        }

        if !pending.is_empty() {
            warn!(
                "Dropping {} tool calls still running after the grace period",
                pending.len()
            );
        }
        deadline.is_some() || abort.is_aborted()
    }

    async fn run_one(&self, v: &ValidatedCall) -> ToolResult {
        let _permit = self.pool.acquire().await.ok();
        let name = v.call.name();
        let timeout = self.config.timeout_for(name, v.tool.timeout_class());
        log_tool_call(name, &v.call.function.arguments);

        let start = Instant::now();
        let run = AssertUnwindSafe(v.tool.execute(v.args.clone(), &self.workspace)).catch_unwind();
        let outcome = match tokio::time::timeout(timeout, run).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_panic)) => Err(ToolError::execution(format!("tool '{name}' panicked"))),
            Err(_) => {
                info!(
                    "Tool {name} timed out after {:.1}s (limit: {:.0}s)",
                    start.elapsed().as_secs_f64(),
                    timeout.as_secs_f64()
                );
                Err(ToolError::Timeout {
                    tool: name.to_string(),
                    secs: timeout.as_secs().max(1),
                })
            }
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(output) => {
                debug!(
                    "Tool {name} completed in {duration_ms}ms ({} bytes)",
                    output.len()
                );
                trace!(
                    "Tool {name} result preview: {}",
                    output.chars().take(300).collect::<String>()
                );
                ToolResult::success(
                    &v.call,
                    truncate_result(output, self.config.max_result_bytes),
                    duration_ms,
                )
            }
            Err(e) => {
                debug!("Tool {name} failed in {duration_ms}ms: {e}");
                ToolResult::failure(&v.call, e, duration_ms)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control;
    use crate::json_schema_for;
    use crate::tools::core::{Capability, Tool, ToolFuture};
    use schemars::JsonSchema;
    use serde_json::Value;
    use std::sync::Mutex;

    #[derive(Deserialize, JsonSchema)]
    struct SleepArgs {
        ms: u64,
        #[serde(default)]
        key: Option<String>,
        #[serde(default)]
        fail: bool,
    }

    /// Sleeps, then records its call order in a shared log.
    struct Sleep {
        name: &'static str,
        capability: Capability,
        log: Arc<Mutex<Vec<u64>>>,
    }

    impl Tool for Sleep {
        fn definition(&self) -> ToolDef {
            ToolDef::new(self.name, "sleep", json_schema_for::<SleepArgs>())
        }

        fn capability(&self) -> Capability {
            self.capability
        }

        fn resource_key(&self, args: &Value) -> Option<String> {
            args["key"].as_str().map(String::from)
        }

        fn execute<'a>(&'a self, args: Value, _workspace: &'a Path) -> ToolFuture<'a> {
            Box::pin(async move {
                let args: SleepArgs = crate::tools::core::parse_args(args)?;
                tokio::time::sleep(Duration::from_millis(args.ms)).await;
                if let Ok(mut log) = self.log.lock() {
                    log.push(args.ms);
                }
                if args.fail {
                    return Err(ToolError::execution("asked to fail"));
                }
                Ok(format!("slept {}ms", args.ms))
            })
        }
    }

    struct Panics;

    impl Tool for Panics {
        fn definition(&self) -> ToolDef {
            ToolDef::new("panics", "panics", serde_json::json!({"type": "object"}))
        }

        fn execute<'a>(&'a self, _args: Value, _workspace: &'a Path) -> ToolFuture<'a> {
            Box::pin(async move { panic!("boom") })
        }
    }

    fn engine(config: ToolsConfig) -> (ToolExecutionEngine, Arc<Mutex<Vec<u64>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = ToolRegistry::new()
            .with(Sleep {
                name: "read_slow",
                capability: Capability::ReadOnly,
                log: log.clone(),
            })
            .with(Sleep {
                name: "write_slow",
                capability: Capability::Mutating,
                log: log.clone(),
            })
            .with(Panics);
        (
            ToolExecutionEngine::new(Arc::new(registry), "/tmp", &config),
            log,
        )
    }

    fn call(id: &str, tool: &str, args: &str) -> ToolCall {
        ToolCall::function(id, tool, args)
    }

    #[tokio::test]
    async fn independent_reads_run_concurrently() {
        let (engine, _) = engine(ToolsConfig::default());
        let calls = vec![
            call("a", "read_slow", r#"{"ms":200,"key":"file:a"}"#),
            call("b", "read_slow", r#"{"ms":150,"key":"file:b"}"#),
        ];
        let start = Instant::now();
        let results = engine.execute(&calls, &AbortSignal::never()).await;
        let elapsed = start.elapsed();

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| !r.is_error()));
        assert!(elapsed < Duration::from_millis(340), "took {elapsed:?}");
    }

    #[tokio::test]
    async fn results_keep_call_order() {
        let (engine, log) = engine(ToolsConfig::default());
        let calls = vec![
            call("slow", "read_slow", r#"{"ms":80,"key":"x"}"#),
            call("fast", "read_slow", r#"{"ms":5,"key":"y"}"#),
        ];
        let results = engine.execute(&calls, &AbortSignal::never()).await;
        assert_eq!(results[0].call_id, "slow");
        assert_eq!(results[1].call_id, "fast");
        // Finished in the opposite order.
        assert_eq!(*log.lock().unwrap(), vec![5, 80]);
    }

    #[tokio::test]
    async fn same_resource_writes_are_serialized() {
        let (engine, log) = engine(ToolsConfig::default());
        let calls = vec![
            call("w1", "write_slow", r#"{"ms":60,"key":"file:a"}"#),
            call("w2", "write_slow", r#"{"ms":5,"key":"file:a"}"#),
        ];
        engine.execute(&calls, &AbortSignal::never()).await;
        assert_eq!(*log.lock().unwrap(), vec![60, 5]);
    }

    #[tokio::test]
    async fn failures_do_not_cancel_siblings() {
        let (engine, _) = engine(ToolsConfig::default());
        let calls = vec![
            call("bad", "read_slow", r#"{"ms":1,"key":"a","fail":true}"#),
            call("unknown", "nope", "{}"),
            call("boom", "panics", "{}"),
            call("good", "read_slow", r#"{"ms":20,"key":"b"}"#),
        ];
        let results = engine.execute(&calls, &AbortSignal::never()).await;
        assert_eq!(results.len(), 4);
        assert_eq!(
            results[0].outcome.as_ref().unwrap_err().kind(),
            "execution_error"
        );
        assert_eq!(
            results[1].outcome.as_ref().unwrap_err().kind(),
            "policy_violation"
        );
        assert!(results[2].render().contains("panicked"));
        assert_eq!(results[3].outcome.as_deref(), Ok("slept 20ms"));
    }

    #[tokio::test]
    async fn per_tool_timeout() {
        let config = ToolsConfig::default().with_timeout_override("read_slow", 0.05);
        let (engine, _) = engine(config);
        let calls = vec![call("t", "read_slow", r#"{"ms":2000,"key":"a"}"#)];
        let start = Instant::now();
        let results = engine.execute(&calls, &AbortSignal::never()).await;
        assert!(start.elapsed() < Duration::from_millis(1000));
        assert!(matches!(
            results[0].outcome,
            Err(ToolError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn abort_interrupts_after_grace() {
        let config = ToolsConfig::default().with_abort_grace(0.05);
        let (engine, _) = engine(config);
        let calls = vec![
            call("quick", "read_slow", r#"{"ms":5,"key":"a"}"#),
            call("stuck", "read_slow", r#"{"ms":5000,"key":"b"}"#),
            call("later", "write_slow", r#"{"ms":5,"key":"b"}"#),
        ];
        let (handle, rx) = control::channel();
        let abort = rx.abort_signal();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            handle.abort();
        });

        let start = Instant::now();
        let results = engine.execute(&calls, &abort).await;
        assert!(start.elapsed() < Duration::from_millis(1000));
        assert_eq!(results.len(), 3);
        assert!(!results[0].is_error());
        assert_eq!(results[1].outcome, Err(ToolError::Interrupted));
        assert_eq!(results[2].outcome, Err(ToolError::Interrupted));
    }

    #[tokio::test]
    async fn sequential_mode_runs_one_at_a_time() {
        let config = ToolsConfig::default().with_sequential(true);
        let (engine, log) = engine(config);
        let calls = vec![
            call("a", "read_slow", r#"{"ms":40,"key":"a"}"#),
            call("b", "read_slow", r#"{"ms":1,"key":"b"}"#),
        ];
        engine.execute(&calls, &AbortSignal::never()).await;
        assert_eq!(*log.lock().unwrap(), vec![40, 1]);
    }

    #[test]
    fn config_timeouts_and_validation() {
        let config = ToolsConfig::default().with_timeout_override("run_command", 12.0);
        assert_eq!(
            config.timeout_for("run_command", TimeoutClass::Command),
            Duration::from_secs(12)
        );
        assert_eq!(
            config.timeout_for("read_file", TimeoutClass::ReadOnly),
            Duration::from_secs(30)
        );
        assert!(config.validate().is_ok());
        assert!(ToolsConfig::default().with_pool_size(0).validate().is_err());
        assert!(
            ToolsConfig::default()
                .with_timeout_override("x", -1.0)
                .validate()
                .is_err()
        );
    }
}
