// ABOUTME: The manifold binary - wires config, store, and engine together
// ABOUTME: Subcommands: run (execute an instruction), status, sessions, init

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use manifold_core::{
    BackendType, CachedSessionStore, Config, ExecutionMode, ExecutionRequest, Manifold,
    SessionStore,
};
use manifold_store::SqliteStore;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Parser)]
#[command(name = "manifold", about = "Unified execution engine for AI coding-agent CLIs")]
struct Cli {
    /// Path to a config file (defaults to ~/.config/manifold/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute one instruction against a backend, streaming messages to stdout
    Run {
        /// The instruction to execute
        instruction: String,
        /// Which backend to run against
        #[arg(long, default_value = "claude")]
        backend: BackendType,
        /// Project identifier for session continuity
        #[arg(long)]
        project: String,
        /// Working directory handed to the backend (defaults to cwd)
        #[arg(long)]
        dir: Option<PathBuf>,
        /// Unified model name
        #[arg(long)]
        model: Option<String>,
        /// Execution mode: chat, plan, or act
        #[arg(long, default_value = "act")]
        mode: ExecutionMode,
        /// First prompt of a fresh project (excludes planning tools)
        #[arg(long)]
        initial: bool,
    },
    /// Check whether a backend is installed and ready
    Status {
        #[arg(long, default_value = "claude")]
        backend: BackendType,
        /// Validate a model name against the backend
        #[arg(long)]
        model: Option<String>,
    },
    /// Inspect or clear stored backend sessions for a project
    Sessions {
        #[arg(long)]
        project: String,
        /// Clear the stored session for one backend
        #[arg(long)]
        clear: Option<BackendType>,
        /// Clear all stored sessions for the project
        #[arg(long)]
        clear_all: bool,
    },
    /// Create the config directory and a default config file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    manifold_log::init();
    let cli = Cli::parse();

    if let Command::Init = cli.command {
        let path = Config::init()?;
        println!("Config ready at {}", path.display());
        return Ok(());
    }

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let db_path = config.db_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create data dir: {}", parent.display()))?;
    }
    let store = Arc::new(SqliteStore::open(&db_path).await?);
    let sessions: Arc<dyn SessionStore> = Arc::new(CachedSessionStore::new(store.clone()));
    let engine = Manifold::with_default_backends(&config, store.clone(), sessions);

    match cli.command {
        Command::Run {
            instruction,
            backend,
            project,
            dir,
            model,
            mode,
            initial,
        } => {
            run(
                &engine,
                &store,
                RunArgs {
                    instruction,
                    backend,
                    project,
                    dir,
                    model,
                    mode,
                    initial,
                },
            )
            .await
        }
        Command::Status { backend, model } => {
            let status = engine.check_status(backend, model.as_deref()).await;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Command::Sessions {
            project,
            clear,
            clear_all,
        } => {
            if clear_all {
                engine.clear_all_sessions(&project).await?;
                println!("Cleared all sessions for {project}");
            } else if let Some(backend) = clear {
                engine.clear_session(&project, backend).await?;
                println!("Cleared {backend} session for {project}");
            } else {
                let sessions = engine.sessions_for(&project).await?;
                if sessions.is_empty() {
                    println!("No stored sessions for {project}");
                }
                for (backend, session_id) in sessions {
                    println!("{backend}\t{session_id}");
                }
            }
            Ok(())
        }
        Command::Init => unreachable!("handled above"),
    }
}

struct RunArgs {
    instruction: String,
    backend: BackendType,
    project: String,
    dir: Option<PathBuf>,
    model: Option<String>,
    mode: ExecutionMode,
    initial: bool,
}

async fn run(engine: &Manifold, store: &SqliteStore, args: RunArgs) -> Result<()> {
    // Stream visible envelopes to stdout while the run executes.
    let mut rx = store.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok((_, envelope)) => {
                    if let Ok(line) = serde_json::to_string(&envelope) {
                        println!("{line}");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Dropped envelopes for slow stdout");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let working_dir = match args.dir {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to resolve working directory")?,
    };

    let request = ExecutionRequest {
        project_id: args.project,
        conversation_id: uuid::Uuid::new_v4().to_string(),
        session_id: uuid::Uuid::new_v4().to_string(),
        instruction: args.instruction,
        working_dir,
        resume_session_id: None,
        model: args.model,
        images: Vec::new(),
        documents: Vec::new(),
        is_initial_prompt: args.initial,
        mode: args.mode,
        backend: args.backend,
    };

    let result = engine.execute(request).await;

    // Let the printer drain what the run just published, then stop it.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    printer.abort();

    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.success {
        bail!(
            "execution failed: {}",
            result.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}
