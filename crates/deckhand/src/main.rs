//! Deckhand - signed, sandboxed provisioning agent
//!
//! Main entry point for the Deckhand CLI.

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};

mod commands;

use commands::{check, run, sign};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// Deckhand - signed, sandboxed provisioning agent
#[derive(Parser)]
#[command(name = "deckhand")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Config file (default: discovered)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the agent: dequeue, verify and execute jobs until stopped
    Run(run::RunArgs),

    /// Issue a signed job envelope
    Sign(sign::SignArgs),

    /// Check that an installer contract is loadable and runnable here
    Check(check::CheckArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loaded = deckhand_config::load_config(cli.config.as_deref()).context("failed to load config")?;

    // The agent log only matters for long-running agents.
    let log_dir = matches!(cli.command, Commands::Run(_)).then(|| loaded.config.paths.logs.clone());
    let _guard = init_tracing(cli.verbose, log_dir.as_deref());

    if let Some(path) = &loaded.source {
        tracing::debug!(path = %path.display(), "Using config file");
    }

    let ctx = commands::Context {
        config: loaded.config,
        config_source: loaded.source,
        verbose: cli.verbose,
    };

    match cli.command {
        Commands::Run(args) => run::run(args, &ctx).await,
        Commands::Sign(args) => sign::run(args, &ctx).await,
        Commands::Check(args) => check::run(args, &ctx).await,
    }
}

/// Console (human-readable, stderr) plus an optional daily JSON file.
///
/// `RUST_LOG` replaces the console filter when set.
fn init_tracing(verbose: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::prelude::*;

    let filter = if verbose {
        "deckhand=debug,deckhand_agent=debug,deckhand_sandbox=debug,deckhand_config=debug,info"
    } else {
        "deckhand=info,deckhand_agent=info,deckhand_sandbox=info,deckhand_config=warn,warn"
    };
    let console_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    let mut file_error = None;
    let (file_layer, guard) = match log_dir.map(open_agent_log) {
        Some(Ok(appender)) => {
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(EnvFilter::new(
                    "deckhand=debug,deckhand_agent=debug,deckhand_sandbox=debug,deckhand_config=debug,info",
                ));
            (Some(layer), Some(guard))
        }
        Some(Err(e)) => {
            file_error = Some(e);
            (None, None)
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .with(file_layer)
        .init();

    if let Some(e) = file_error {
        tracing::warn!(error = %e, "Agent log file unavailable, logging to console only");
    }
    guard
}

fn open_agent_log(dir: &Path) -> Result<RollingFileAppender> {
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("agent")
        .filename_suffix("log")
        .build(dir)
        .with_context(|| format!("cannot open agent log in {}", dir.display()))
}
