use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

mod agent;
mod commands;
mod config;
mod coordinator;
mod detection;
mod journal;
mod llm;
mod notifications;
mod sandbox;
mod state;
mod store;
mod templates;
mod tools;

#[derive(Parser)]
#[command(name = "imaginate")]
#[command(
    author,
    version,
    about = "Agentic code generation - describe an app, get a sandboxed build and a live preview"
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the config file (defaults to ./imaginate.toml)
    #[arg(short, long, global = true, env = "IMAGINATE_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default imaginate.toml into the current directory
    Init {
        /// Force overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Generate an app from a prompt
    Run {
        /// What to build
        #[arg(required_unless_present = "resume")]
        prompt: Option<String>,

        /// Project (conversation) to continue; a new one is created if omitted
        #[arg(short, long)]
        project: Option<String>,

        /// Resume a run that stopped on an error
        #[arg(long, value_name = "RUN_ID", conflicts_with_all = ["prompt", "project"])]
        resume: Option<Uuid>,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show a project's conversation
    History {
        /// Project id
        #[arg(short, long)]
        project: String,
    },

    /// Show recent runs, or one run in detail
    Status {
        /// Run to inspect
        run_id: Option<Uuid>,
    },
}

/// Sets up console logging and, when enabled, a daily JSON log file.
fn init_logging(
    verbose: bool,
    workspace: Option<&commands::Workspace>,
) -> Result<Option<WorkerGuard>> {
    let filter = if verbose {
        EnvFilter::new("imaginate=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("imaginate=info"))
    };

    let (file_layer, guard) = match workspace.filter(|w| w.config.logging.file) {
        Some(workspace) => {
            let dir = workspace.data_dir.join("logs");
            std::fs::create_dir_all(&dir)?;
            let appender = tracing_appender::rolling::daily(dir, "imaginate.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().json().with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    Ok(guard)
}

/// Loads the workspace config, then starts logging into its data directory.
fn open_workspace(
    config: Option<&Path>,
    verbose: bool,
) -> Result<(commands::Workspace, Option<WorkerGuard>)> {
    let workspace = commands::Workspace::load(config)?;
    let guard = init_logging(verbose, Some(&workspace))?;
    Ok((workspace, guard))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.config.as_deref();

    match cli.command {
        // Init writes the config file, so it runs without loading one.
        Commands::Init { force } => {
            let _log_guard = init_logging(cli.verbose, None)?;
            commands::init::run(force)?;
        }
        Commands::Run {
            prompt,
            project,
            resume,
            json,
        } => {
            let (workspace, _log_guard) = open_workspace(config, cli.verbose)?;
            let target = match resume {
                Some(run_id) => commands::run::Target::Resume(run_id),
                None => commands::run::Target::New {
                    prompt: prompt.unwrap_or_default(),
                    project,
                },
            };
            commands::run::run(&workspace, target, json).await?;
        }
        Commands::History { project } => {
            let (workspace, _log_guard) = open_workspace(config, cli.verbose)?;
            commands::history::run(&workspace, &project).await?;
        }
        Commands::Status { run_id } => {
            let (workspace, _log_guard) = open_workspace(config, cli.verbose)?;
            commands::status::run(&workspace, run_id).await?;
        }
    }

    Ok(())
}
