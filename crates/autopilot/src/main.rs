//! Run and manage autonomous coding sessions from the command line.
//!
//! Reads the API key from the `OPENROUTER_KEY` environment variable.
//!
//! # Examples
//!
//! ```sh
//! # Start a session on a project
//! autopilot start --project ./my-app "Add a --verbose flag to the CLI"
//!
//! # Answer a pending decision, then keep going
//! autopilot resume ses-19a2f0c3b1d-4e7a12 --option 2
//!
//! # Stop a running session from another terminal
//! autopilot stop ses-19a2f0c3b1d-4e7a12
//!
//! # Give a paused session more money
//! autopilot raise-budget ses-19a2f0c3b1d-4e7a12 --max 80
//! ```

use autopilot::AutopilotError;
use autopilot::checkpoint::{CheckpointId, CheckpointManager, FsCheckpointStore};
use autopilot::control::{self, ControlHandle, ResumeSignal};
use autopilot::model::OpenRouterClient;
use autopilot::orchestrator::{
    self, LoggingHandler, Orchestrator, OrchestratorConfig, PauseReason, RunOutcome, RunState,
    SessionState,
};
use autopilot::session::Session;
use autopilot::tools::{ToolExecutionEngine, ToolRegistry};
use autopilot::CheckpointError;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// How often a running session checks for a `stop` request.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Autonomous execution orchestrator for long-running LLM coding tasks.
#[derive(Parser)]
#[command(name = "autopilot", version)]
struct Cli {
    /// Orchestrator config file (TOML). Missing file means defaults.
    #[arg(long, global = true, default_value = ".autopilot/config.toml")]
    config: PathBuf,

    /// Directory holding session checkpoints
    #[arg(long, global = true, default_value = ".autopilot/sessions")]
    store: PathBuf,

    /// Debug logging for autopilot (overridden by RUST_LOG)
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a new session
    Start {
        /// Task description
        #[arg(conflicts_with = "task_file", required_unless_present = "task_file")]
        task: Option<String>,

        /// Read the task description from a file
        #[arg(long)]
        task_file: Option<PathBuf>,

        /// Project directory the session works in
        #[arg(long, default_value = ".")]
        project: PathBuf,

        /// Route every turn to this model instead of the configured routing
        #[arg(long)]
        model: Option<String>,

        /// Hard budget ceiling in USD
        #[arg(long)]
        max_usd: Option<f64>,
    },

    /// Resume a paused, waiting or interrupted session
    Resume {
        session: String,

        /// Free-form answer or report for a waiting session
        #[arg(long, conflicts_with = "option")]
        input: Option<String>,

        /// 1-based option number of a pending decision
        #[arg(long)]
        option: Option<usize>,
    },

    /// Start a new session seeded from an existing one
    Fork { session: String },

    /// Show the state of one session
    Status { session: String },

    /// List stored sessions
    List,

    /// Ask the process running a session to checkpoint and stop
    Stop { session: String },

    /// Raise the hard budget ceiling of a session that is not running
    RaiseBudget {
        session: String,

        /// New ceiling in USD
        #[arg(long = "max")]
        max_usd: f64,
    },
}

/// What a session-driving command asks the orchestrator to do.
enum Launch {
    Start(Session),
    Resume {
        session_id: String,
        signal: Option<ResumeSignal>,
    },
}

impl Launch {
    fn session_id(&self) -> String {
        match self {
            Launch::Start(session) => session.id.to_string(),
            Launch::Resume { session_id, .. } => session_id.clone(),
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("Error: {e}");
            if let AutopilotError::Checkpoint(CheckpointError::Corrupt { session_id, .. }) = &e {
                eprintln!(
                    "No readable checkpoint is left for {session_id}. Inspect the session \
                     directory and remove damaged ckpt-*.json files, or start over."
                );
            }
            process::exit(1);
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "info,autopilot=debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();
}

async fn run(cli: Cli) -> Result<i32, AutopilotError> {
    let store = FsCheckpointStore::new(&cli.store)?;
    let checkpoints = CheckpointManager::new(Arc::new(store.clone()));

    match cli.command {
        Command::Start {
            task,
            task_file,
            project,
            model,
            max_usd,
        } => {
            let mut config = OrchestratorConfig::load(&cli.config)?;
            if let Some(model) = model {
                config = config.with_model(model);
            }
            if let Some(max_usd) = max_usd {
                config.budget.max_usd = max_usd;
                config.validate()?;
            }
            let task = read_task(task, task_file)?;
            let project = canonical_project(&project)?;
            let session = Session::new(task, &project, config.routing.clone());
            println!("Session {}", session.id);
            drive(&store, checkpoints, config, project, Launch::Start(session)).await
        }

        Command::Resume {
            session,
            input,
            option,
        } => {
            let config = OrchestratorConfig::load(&cli.config)?;
            let stored = stored_session(&checkpoints, &session)?;
            let signal = match (input, option) {
                (Some(text), _) => Some(ResumeSignal::Input(text)),
                (None, Some(n)) => Some(ResumeSignal::Select(n)),
                (None, None) => None,
            };
            let launch = Launch::Resume {
                session_id: session,
                signal,
            };
            drive(&store, checkpoints, config, stored.project_path, launch).await
        }

        Command::Fork { session } => {
            let config = OrchestratorConfig::load(&cli.config)?;
            let forked = stored_session(&checkpoints, &session)?.fork();
            println!("Session {} (forked from {session})", forked.id);
            let project = forked.project_path.clone();
            drive(&store, checkpoints, config, project, Launch::Start(forked)).await
        }

        Command::Status { session } => {
            println!("{}", orchestrator::session_status(&checkpoints, &session)?);
            Ok(0)
        }

        Command::List => {
            let reports = orchestrator::list_sessions(&checkpoints)?;
            if reports.is_empty() {
                println!("No sessions in {}", store.root().display());
            }
            for report in reports {
                println!("{}", report.summary_line());
            }
            Ok(0)
        }

        Command::Stop { session } => {
            let report = orchestrator::session_status(&checkpoints, &session)?;
            if report.state.is_final() {
                println!("Session {session} already finished ({})", report.state);
                return Ok(0);
            }
            store.request_stop(&session)?;
            println!("Stop requested for {session}; it checkpoints and exits at the next safe point.");
            Ok(0)
        }

        Command::RaiseBudget { session, max_usd } => {
            let id = orchestrator::raise_budget(&checkpoints, &session, max_usd)?;
            println!("Budget ceiling for {session} is now ${max_usd:.2} ({id}).");
            println!("Continue with: autopilot resume {session}");
            Ok(0)
        }
    }
}

async fn drive(
    store: &FsCheckpointStore,
    checkpoints: CheckpointManager,
    config: OrchestratorConfig,
    project: PathBuf,
    launch: Launch,
) -> Result<i32, AutopilotError> {
    let session_id = launch.session_id();
    store.clear_stop(&session_id)?;
    let (handle, _receiver) = control::channel();
    let watcher = spawn_abort_watcher(store.clone(), session_id, handle.clone());

    let client = openrouter_client()?;
    let registry = Arc::new(ToolRegistry::new().with_builtin_tools(&config.tools));
    let engine = ToolExecutionEngine::new(registry, &project, &config.tools);
    let orchestrator = Orchestrator::new(&client, &engine, checkpoints, config)
        .with_event_handler(&LoggingHandler)
        .with_abort_signal(handle.abort_signal());

    let outcome = match launch {
        Launch::Start(session) => orchestrator.start_session(session).await,
        Launch::Resume {
            session_id,
            signal: Some(signal),
        } => orchestrator.resume_with(&session_id, signal).await,
        Launch::Resume {
            session_id,
            signal: None,
        } => orchestrator.resume(&session_id).await,
    };
    watcher.abort();
    let outcome = outcome?;
    report_outcome(&outcome);
    Ok(exit_code(&outcome))
}

/// Abort the session on Ctrl-C or when `autopilot stop` drops the marker.
fn spawn_abort_watcher(
    store: FsCheckpointStore,
    session_id: String,
    handle: ControlHandle,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        let mut poll = tokio::time::interval(STOP_POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = &mut ctrl_c => {
                    warn!("Interrupted, stopping session {session_id}");
                    handle.abort();
                    return;
                }
                _ = poll.tick() => {
                    if store.stop_requested(&session_id) {
                        info!("Stop requested for session {session_id}");
                        handle.abort();
                        return;
                    }
                }
            }
        }
    })
}

fn openrouter_client() -> Result<OpenRouterClient, AutopilotError> {
    let api_key = std::env::var("OPENROUTER_KEY")
        .map_err(|_| AutopilotError::config("OPENROUTER_KEY environment variable not set"))?;
    Ok(OpenRouterClient::new(api_key)?)
}

fn stored_session(checkpoints: &CheckpointManager, session_id: &str) -> Result<Session, AutopilotError> {
    let checkpoint = checkpoints
        .load_latest::<SessionState>(session_id)?
        .ok_or_else(|| AutopilotError::SessionNotFound(session_id.to_string()))?;
    Ok(checkpoint.state.session)
}

fn read_task(task: Option<String>, task_file: Option<PathBuf>) -> Result<String, AutopilotError> {
    let task = match (task, task_file) {
        (Some(task), _) => task,
        (None, Some(path)) => std::fs::read_to_string(&path)
            .map_err(|e| AutopilotError::config(format!("cannot read {}: {e}", path.display())))?,
        (None, None) => String::new(),
    };
    if task.trim().is_empty() {
        return Err(AutopilotError::config("task must not be empty"));
    }
    Ok(task.trim().to_string())
}

fn canonical_project(path: &Path) -> Result<PathBuf, AutopilotError> {
    let path = path
        .canonicalize()
        .map_err(|e| AutopilotError::config(format!("project {}: {e}", path.display())))?;
    if !path.is_dir() {
        return Err(AutopilotError::config(format!(
            "project {} is not a directory",
            path.display()
        )));
    }
    Ok(path)
}

fn report_outcome(outcome: &RunOutcome) {
    let id = &outcome.session_id;
    println!("Session {id}: {}", outcome.state);
    println!(
        "Spent ${:.4} ({}) over {} turn(s)",
        outcome.budget.cost_usd, outcome.budget.level, outcome.turns
    );

    match &outcome.state {
        RunState::AwaitingDecision { request } => {
            println!("\n{}", request.question);
            for (i, option) in request.options.iter().enumerate() {
                println!("  {}. {option}", i + 1);
            }
            println!("\nAnswer with: autopilot resume {id} --option <N>  (or --input <TEXT>)");
        }
        RunState::AwaitingHumanAction { request } => {
            println!("\n{}", request.instructions);
            println!("\nWhen done: autopilot resume {id} --input <REPORT>");
        }
        RunState::Paused {
            reason: PauseReason::BudgetMaxed,
        } => {
            println!("Raise the ceiling with: autopilot raise-budget {id} --max <USD>");
        }
        RunState::Paused { .. } | RunState::Aborted => {
            println!("Continue with: autopilot resume {id}");
        }
        RunState::Failed { .. } => {
            println!("{}", failure_hint(id.as_str(), outcome.last_checkpoint.as_ref()));
        }
        _ => {}
    }
}

/// Where a failed session can be inspected from, and how to retry it.
fn failure_hint(session_id: &str, last_checkpoint: Option<&CheckpointId>) -> String {
    let checkpoint = last_checkpoint.map_or_else(|| "none".to_string(), ToString::to_string);
    format!(
        "Last valid checkpoint: {checkpoint}\nStart a fresh attempt with: autopilot fork {session_id}"
    )
}

fn exit_code(outcome: &RunOutcome) -> i32 {
    match outcome.state {
        RunState::Failed { .. } => 1,
        RunState::Aborted => 130,
        _ => 0,
    }
}
