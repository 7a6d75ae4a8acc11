//! CLI surface for the agent core.
//!
//! Exit codes: 0 success, 1 user error, 2 session failed, 3 verifier
//! rejected outstanding claims, 4 internal error.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use compymac_core::tools::builtin::register_workspace_tools;
use compymac_core::{
    export_events, fork_session, harness, load_latest, replay, AgentLoop, AnthropicClient,
    ArtifactId, ClientConfig, CoreConfig, CostSummary, Error, EventKind, ExportFormat,
    RolloutOrchestrator, Session, SessionContext, SessionId, SessionOutcome, SessionStatus,
    TokenUsage, ToolRegistry, TraceStore,
};

#[derive(Parser, Debug)]
#[clap(
    name = "compymac",
    about = "Guard-railed agent sessions with verified completion"
)]
struct Cli {
    /// Data directory (event database + blobs)
    #[arg(long, default_value = ".compymac")]
    data_dir: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a new session for a goal
    Run {
        /// The user goal
        goal: String,
        /// Workspace root the agent operates in
        #[arg(long, default_value = ".")]
        workspace: String,
        /// Model id override
        #[arg(long)]
        model: Option<String>,
    },
    /// Resume a paused session from its latest checkpoint
    Resume {
        session_id: String,
        /// Model id override
        #[arg(long)]
        model: Option<String>,
    },
    /// Request a running session to pause at its next turn boundary
    Pause { session_id: String },
    /// List sessions
    List {
        /// Filter by status (running, paused, interrupted, completed, failed)
        #[arg(long)]
        status: Option<String>,
    },
    /// Print a session's trace and cost summary
    Inspect {
        session_id: String,
        /// First sequence number to print
        #[arg(long, default_value_t = 1)]
        from_seq: u64,
        /// Output format: log or json
        #[arg(long, default_value = "log")]
        format: String,
        /// Replay the conversation instead of raw events
        #[arg(long)]
        messages: bool,
    },
    /// Fork a new session from a checkpoint
    Fork {
        session_id: String,
        checkpoint_id: String,
    },
}

const EXIT_OK: u8 = 0;
const EXIT_USER: u8 = 1;
const EXIT_FAILED: u8 = 2;
const EXIT_REJECTED: u8 = 3;
const EXIT_INTERNAL: u8 = 4;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(CliError::User(message)) => {
            eprintln!("error: {}", message);
            EXIT_USER
        }
        Err(CliError::Failed(message)) => {
            eprintln!("session failed: {}", message);
            EXIT_FAILED
        }
        Err(CliError::Rejected(message)) => {
            eprintln!("verifier rejected: {}", message);
            EXIT_REJECTED
        }
        Err(CliError::Internal(message)) => {
            eprintln!("internal error: {}", message);
            EXIT_INTERNAL
        }
    };
    ExitCode::from(code)
}

enum CliError {
    User(String),
    Failed(String),
    Rejected(String),
    Internal(String),
}

impl From<Error> for CliError {
    fn from(error: Error) -> Self {
        match &error {
            Error::NotFound(_) | Error::Config(_) => CliError::User(error.to_string()),
            Error::VerifierRejected { .. } => CliError::Rejected(error.to_string()),
            Error::Storage(_) | Error::SessionClosed { .. } => {
                CliError::Failed(error.to_string())
            }
            _ => CliError::Internal(error.to_string()),
        }
    }
}

fn open_store(data_dir: &str) -> Result<(Arc<CoreConfig>, Arc<TraceStore>), CliError> {
    let expanded = shellexpand::tilde(data_dir).to_string();
    let config = Arc::new(CoreConfig::rooted(expanded));
    let trace = Arc::new(TraceStore::open(config.database_path(), &config.blob_dir)?);
    Ok((config, trace))
}

fn llm_client(model: Option<String>) -> Result<Arc<AnthropicClient>, CliError> {
    let api_key = std::env::var("ANTHROPIC_API_KEY")
        .map_err(|_| CliError::User("ANTHROPIC_API_KEY is not set".to_string()))?;
    let mut client_config = ClientConfig::new(api_key);
    if let Some(model) = model {
        client_config = client_config.with_default_model(model);
    }
    Ok(Arc::new(AnthropicClient::new(client_config)?))
}

async fn dispatch(cli: Cli) -> Result<u8, CliError> {
    match cli.command {
        Commands::Run {
            goal,
            workspace,
            model,
        } => {
            let (config, trace) = open_store(&cli.data_dir)?;
            let workspace = PathBuf::from(shellexpand::tilde(&workspace).to_string());

            let session = Session::new(goal, workspace.clone());
            trace.create_session(&session)?;
            println!("session {}", session.id);

            drive_session(config, trace, session.id, workspace, model, false).await
        }
        Commands::Resume { session_id, model } => {
            let (config, trace) = open_store(&cli.data_dir)?;
            let id = parse_session(&session_id)?;
            let manifest = trace
                .get_session(&id)?
                .ok_or_else(|| CliError::User(format!("no session {}", session_id)))?;
            if manifest.status.is_terminal() {
                return Err(CliError::User(format!(
                    "session {} is {}",
                    session_id, manifest.status
                )));
            }
            let workspace = manifest.workspace.clone();
            drive_session(config, trace, id, workspace, model, true).await
        }
        Commands::Pause { session_id } => {
            let (_config, trace) = open_store(&cli.data_dir)?;
            let id = parse_session(&session_id)?;
            let manifest = trace
                .get_session(&id)?
                .ok_or_else(|| CliError::User(format!("no session {}", session_id)))?;
            if manifest.status != SessionStatus::Running {
                return Err(CliError::User(format!(
                    "session {} is {}, not running",
                    session_id, manifest.status
                )));
            }
            trace.set_status(&id, SessionStatus::Paused)?;
            println!("pause requested; honored at the next turn boundary");
            Ok(EXIT_OK)
        }
        Commands::List { status } => {
            let (_config, trace) = open_store(&cli.data_dir)?;
            let filter = match status.as_deref() {
                None => None,
                Some(raw) => Some(
                    SessionStatus::parse(raw)
                        .ok_or_else(|| CliError::User(format!("unknown status '{}'", raw)))?,
                ),
            };
            for session in trace.list_sessions(filter)? {
                println!(
                    "{}  {:<11} {:<16} seq={:<6} {}",
                    session.id,
                    session.status,
                    session.phase,
                    session.last_seq,
                    session.goal
                );
            }
            Ok(EXIT_OK)
        }
        Commands::Inspect {
            session_id,
            from_seq,
            format,
            messages,
        } => {
            let (_config, trace) = open_store(&cli.data_dir)?;
            let id = parse_session(&session_id)?;
            let manifest = trace
                .get_session(&id)?
                .ok_or_else(|| CliError::User(format!("no session {}", session_id)))?;

            if messages {
                let state = replay(&trace, &id, manifest.last_seq)?;
                for message in &state.messages {
                    println!("[{:?}] {}", message.role, message.content);
                }
                return Ok(EXIT_OK);
            }

            let events = trace.iterate(&id, from_seq, None)?;
            let export_format = match format.as_str() {
                "json" => ExportFormat::JsonLines,
                "log" => ExportFormat::Log,
                other => {
                    return Err(CliError::User(format!("unknown format '{}'", other)));
                }
            };
            println!("{}", export_events(&events, export_format));

            let mut cost = CostSummary::new();
            for event in trace.query_by_kind(&id, &[EventKind::LlmResponse])? {
                if let Some(usage) = event.payload.get("usage") {
                    if let Ok(usage) = serde_json::from_value::<TokenUsage>(usage.clone()) {
                        cost.add(&usage, 0.0);
                    }
                }
            }
            eprintln!(
                "-- status={} degraded={} {}",
                manifest.status, manifest.degraded, cost
            );
            Ok(EXIT_OK)
        }
        Commands::Fork {
            session_id,
            checkpoint_id,
        } => {
            let (_config, trace) = open_store(&cli.data_dir)?;
            let id = parse_session(&session_id)?;
            let checkpoint = ArtifactId::parse(&checkpoint_id)
                .map_err(|_| CliError::User(format!("malformed checkpoint '{}'", checkpoint_id)))?;
            let child = fork_session(&trace, &id, &checkpoint)?;
            println!("forked session {}", child.id);
            Ok(EXIT_OK)
        }
    }
}

fn parse_session(raw: &str) -> Result<SessionId, CliError> {
    SessionId::parse(raw).map_err(|_| CliError::User(format!("malformed session id '{}'", raw)))
}

/// Run (or resume) the agent loop with the verification harness alongside.
async fn drive_session(
    config: Arc<CoreConfig>,
    trace: Arc<TraceStore>,
    session: SessionId,
    workspace: PathBuf,
    model: Option<String>,
    resume_from_checkpoint: bool,
) -> Result<u8, CliError> {
    let client = llm_client(model)?;

    let mut registry = ToolRegistry::new();
    register_workspace_tools(&mut registry, &workspace)?;
    let registry = Arc::new(registry);

    let orchestrator = Arc::new(RolloutOrchestrator::new(&config));
    let ctx = SessionContext::new(
        session.clone(),
        Arc::clone(&trace),
        registry,
        Arc::clone(&config),
    );

    let mut agent = if resume_from_checkpoint {
        let snapshot = load_latest(&trace, &session)?;
        AgentLoop::resume(ctx, client, orchestrator, snapshot)?
    } else {
        AgentLoop::new(ctx, client, orchestrator)?
    };

    let todos = agent.todos();
    let verifier = tokio::spawn(harness::attach(
        Arc::clone(&trace),
        session.clone(),
        workspace,
        Arc::clone(&todos),
    ));

    let outcome = agent.run().await;
    verifier.abort();

    match outcome {
        Ok(SessionOutcome::Completed) => {
            println!("completed");
            Ok(EXIT_OK)
        }
        Ok(SessionOutcome::Paused) => {
            println!("paused at checkpoint; resume with `compymac resume {}`", session);
            Ok(EXIT_OK)
        }
        Err(error) => {
            let rejected = todos
                .list()
                .map(|todos| {
                    todos
                        .iter()
                        .any(|t| t.rejections > 0 && t.status != compymac_core::TodoStatus::Verified)
                })
                .unwrap_or(false);
            if rejected {
                Err(CliError::Rejected(error.to_string()))
            } else {
                Err(CliError::Failed(error.to_string()))
            }
        }
    }
}
