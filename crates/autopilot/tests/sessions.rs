//! End-to-end session scenarios against a scripted model.

use autopilot::checkpoint::{CheckpointManager, FsCheckpointStore};
use autopilot::control::ResumeSignal;
use autopilot::cost::{ModelPricing, PricingRule};
use autopilot::model::{RetryConfig, ScriptedClient, TokenUsage};
use autopilot::orchestrator::{
    self, Orchestrator, OrchestratorConfig, PauseReason, RunState, SessionState,
};
use autopilot::tools::{ToolExecutionEngine, ToolRegistry, ToolsConfig};
use autopilot::{Message, ToolCall};
use std::path::PathBuf;
use std::sync::Arc;

struct Fixture {
    _dir: tempfile::TempDir,
    workspace: PathBuf,
    sessions: PathBuf,
    store: FsCheckpointStore,
    engine: ToolExecutionEngine,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("project");
        std::fs::create_dir_all(&workspace).unwrap();
        std::fs::write(workspace.join("a.txt"), "alpha").unwrap();
        std::fs::write(workspace.join("b.txt"), "beta").unwrap();

        let sessions = dir.path().join("sessions");
        let store = FsCheckpointStore::new(&sessions).unwrap();
        let tools = ToolsConfig::default();
        let registry = Arc::new(ToolRegistry::new().with_builtin_tools(&tools));
        let engine = ToolExecutionEngine::new(registry, &workspace, &tools);
        Self {
            _dir: dir,
            workspace,
            sessions,
            store,
            engine,
        }
    }

    fn checkpoints(&self) -> CheckpointManager {
        CheckpointManager::new(Arc::new(self.store.clone()))
    }
}

/// One cent per input token on the test model.
fn config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default()
        .with_model("test/metered")
        .with_budget(10.0, 25.0, 50.0)
        .with_retry(RetryConfig {
            initial_delay_ms: 1,
            max_delay_ms: 2,
            ..RetryConfig::with_retries(2)
        });
    config.budget.pricing = vec![PricingRule::new(
        "metered",
        ModelPricing::new(10_000.0, 0.0),
    )];
    config
}

fn cents(amount: u64) -> TokenUsage {
    TokenUsage::new(amount, 0)
}

fn read(id: &str, path: &str) -> ToolCall {
    ToolCall::function(id, "read_file", format!(r#"{{"path":"{path}"}}"#))
}

fn complete(id: &str) -> ToolCall {
    ToolCall::function(id, "task_complete", r#"{"summary":"done"}"#)
}

fn ask_database(id: &str) -> ToolCall {
    ToolCall::function(
        id,
        "request_decision",
        r#"{"question":"Which database?","options":["postgres","sqlite"]}"#,
    )
}

fn tool_message<'a>(messages: &'a [Message], call_id: &str) -> Option<&'a str> {
    messages
        .iter()
        .find(|m| m.tool_call_id.as_deref() == Some(call_id))
        .and_then(|m| m.content.as_deref())
}

#[tokio::test]
async fn parallel_reads_are_all_answered_before_the_next_request() {
    let f = Fixture::new();
    let client = ScriptedClient::new()
        .tool_calls(vec![read("r1", "a.txt"), read("r2", "b.txt")], cents(1))
        .tool_calls(vec![complete("c1")], cents(1));

    let outcome = Orchestrator::new(&client, &f.engine, f.checkpoints(), config())
        .start("read both files", &f.workspace)
        .await
        .unwrap();
    assert!(outcome.is_completed());

    let second = &client.requests()[1].messages;
    assert_eq!(tool_message(second, "r1"), Some("alpha"));
    assert_eq!(tool_message(second, "r2"), Some("beta"));
    let r1 = second.iter().position(|m| m.tool_call_id.as_deref() == Some("r1"));
    let r2 = second.iter().position(|m| m.tool_call_id.as_deref() == Some("r2"));
    assert!(r1 < r2);
}

#[tokio::test]
async fn budget_overrun_pauses_until_raised() {
    let f = Fixture::new();
    let client = ScriptedClient::new()
        .tool_calls(vec![read("r1", "a.txt")], cents(5_001))
        .tool_calls(vec![complete("c1")], cents(1));

    let outcome = Orchestrator::new(&client, &f.engine, f.checkpoints(), config())
        .start("spend it all", &f.workspace)
        .await
        .unwrap();

    assert_eq!(
        outcome.state,
        RunState::Paused {
            reason: PauseReason::BudgetMaxed
        }
    );
    assert!(outcome.budget.cost_usd > 50.0);
    assert_eq!(client.request_count(), 1);
    assert_eq!(client.remaining(), 1);

    // Resuming without a raise stays paused and sends nothing.
    let id = outcome.session_id.to_string();
    let again = Orchestrator::new(&client, &f.engine, f.checkpoints(), config())
        .resume(&id)
        .await
        .unwrap();
    assert_eq!(again.state, outcome.state);
    assert_eq!(client.request_count(), 1);

    orchestrator::raise_budget(&f.checkpoints(), &id, 80.0).unwrap();
    let outcome = Orchestrator::new(&client, &f.engine, f.checkpoints(), config())
        .resume(&id)
        .await
        .unwrap();
    assert!(outcome.is_completed());
    assert_eq!(client.request_count(), 2);
}

#[tokio::test]
async fn decision_answer_is_returned_and_pinned() {
    let f = Fixture::new();
    let asking = ScriptedClient::new().tool_calls(vec![ask_database("d1")], cents(1));
    let outcome = Orchestrator::new(&asking, &f.engine, f.checkpoints(), config())
        .start("set up persistence", &f.workspace)
        .await
        .unwrap();

    let RunState::AwaitingDecision { request } = &outcome.state else {
        panic!("expected a pending decision, got {}", outcome.state);
    };
    assert_eq!(request.question, "Which database?");
    assert_eq!(request.options, vec!["postgres", "sqlite"]);

    let id = outcome.session_id.to_string();
    let finishing = ScriptedClient::new().tool_calls(vec![complete("c1")], cents(1));
    let outcome = Orchestrator::new(&finishing, &f.engine, f.checkpoints(), config())
        .resume_with(&id, ResumeSignal::Select(2))
        .await
        .unwrap();
    assert!(outcome.is_completed());

    let messages = &finishing.requests()[0].messages;
    assert_eq!(tool_message(messages, "d1"), Some("Human decision: sqlite"));
    assert!(messages.iter().any(|m| {
        m.content
            .as_deref()
            .is_some_and(|c| c.contains("Which database? -> sqlite"))
    }));

    let report = orchestrator::session_status(&f.checkpoints(), &id).unwrap();
    assert_eq!(report.decisions, 1);
}

#[tokio::test]
async fn out_of_range_option_is_rejected_without_a_request() {
    let f = Fixture::new();
    let asking = ScriptedClient::new().tool_calls(vec![ask_database("d1")], cents(1));
    let outcome = Orchestrator::new(&asking, &f.engine, f.checkpoints(), config())
        .start("set up persistence", &f.workspace)
        .await
        .unwrap();
    let id = outcome.session_id.to_string();

    let idle = ScriptedClient::new();
    let err = Orchestrator::new(&idle, &f.engine, f.checkpoints(), config())
        .resume_with(&id, ResumeSignal::Select(7))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "resume_rejected");
    assert_eq!(idle.request_count(), 0);
}

#[tokio::test]
async fn checkpoint_reloads_in_a_fresh_store() {
    let f = Fixture::new();
    let asking = ScriptedClient::new()
        .tool_calls(vec![read("r1", "a.txt")], cents(300))
        .tool_calls(vec![ask_database("d1")], cents(1));
    let outcome = Orchestrator::new(&asking, &f.engine, f.checkpoints(), config())
        .start("set up persistence", &f.workspace)
        .await
        .unwrap();
    let id = outcome.session_id.to_string();
    let saved = f.checkpoints().load_latest::<SessionState>(&id).unwrap().unwrap();

    let reopened = CheckpointManager::new(Arc::new(FsCheckpointStore::new(&f.sessions).unwrap()));
    let loaded = reopened.load_latest::<SessionState>(&id).unwrap().unwrap();

    assert_eq!(loaded.seq, saved.seq);
    assert_eq!(Some(loaded.seq), outcome.last_checkpoint.map(|c| c.seq));
    assert_eq!(loaded.state.state, saved.state.state);
    assert_eq!(loaded.state.session, saved.state.session);
    assert_eq!(loaded.state.budget.cost_usd, saved.state.budget.cost_usd);
    assert_eq!(loaded.state.turns_completed, 2);
    assert_eq!(loaded.state.context, saved.state.context);
}

#[tokio::test]
async fn crash_mid_write_recovers_previous_checkpoint() {
    let f = Fixture::new();
    let asking = ScriptedClient::new().tool_calls(vec![ask_database("d1")], cents(1));
    let outcome = Orchestrator::new(&asking, &f.engine, f.checkpoints(), config())
        .start("set up persistence", &f.workspace)
        .await
        .unwrap();
    let id = outcome.session_id.to_string();
    let good = f.checkpoints().latest_id(&id).unwrap().unwrap().seq;

    // A process killed while writing checkpoint `good + 1`: a temp file, a
    // half-written blob and a torn index line.
    let dir = f.store.session_dir(&id);
    let next = good + 1;
    std::fs::write(dir.join(format!(".ckpt-{next:06}.json.tmp")), b"{\"seq\":").unwrap();
    std::fs::write(dir.join(format!("ckpt-{next:06}.json")), b"{\"seq\":").unwrap();
    let mut index = std::fs::read_to_string(dir.join("index.jsonl")).unwrap();
    index.push_str(&format!("{{\"seq\":{next},\"timesta"));
    std::fs::write(dir.join("index.jsonl"), index).unwrap();

    let report = orchestrator::session_status(&f.checkpoints(), &id).unwrap();
    assert_eq!(report.checkpoint.seq, good);
    assert!(matches!(report.state, RunState::AwaitingDecision { .. }));

    let finishing = ScriptedClient::new().tool_calls(vec![complete("c1")], cents(1));
    let outcome = Orchestrator::new(&finishing, &f.engine, f.checkpoints(), config())
        .resume_with(&id, ResumeSignal::Continue)
        .await
        .unwrap();
    assert!(outcome.is_completed());

    // New checkpoints skip the orphaned sequence number.
    let latest = f.checkpoints().latest_id(&id).unwrap().unwrap();
    assert!(latest.seq > next);
    let reloaded = f.checkpoints().load_latest::<SessionState>(&id).unwrap().unwrap();
    assert_eq!(reloaded.seq, latest.seq);
}

#[tokio::test]
async fn unreadable_checkpoints_need_manual_recovery() {
    let f = Fixture::new();
    let asking = ScriptedClient::new().tool_calls(vec![ask_database("d1")], cents(1));
    let outcome = Orchestrator::new(&asking, &f.engine, f.checkpoints(), config())
        .start("set up persistence", &f.workspace)
        .await
        .unwrap();
    let id = outcome.session_id.to_string();

    for entry in std::fs::read_dir(f.store.session_dir(&id)).unwrap() {
        let path = entry.unwrap().path();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        if name.starts_with("ckpt-") {
            std::fs::write(&path, b"garbage").unwrap();
        }
    }

    let err = orchestrator::session_status(&f.checkpoints(), &id).unwrap_err();
    assert_eq!(err.kind(), "checkpoint_corruption");

    let idle = ScriptedClient::new();
    let err = Orchestrator::new(&idle, &f.engine, f.checkpoints(), config())
        .resume(&id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "checkpoint_corruption");
    assert_eq!(idle.request_count(), 0);
}
