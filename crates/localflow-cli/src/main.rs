//! Localflow CLI entry point.
//!
//! Binary name: `localflow`
//!
//! Parses CLI arguments, opens the workflow database, registers activities
//! and definitions, then dispatches to the command handler.

mod activities;
mod cli;
mod state;

use clap::Parser;
use clap_complete::generate;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_filter(cli.verbose, cli.quiet)))
        .with_target(false)
        .init();

    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "localflow", &mut std::io::stdout());
        return Ok(());
    }

    let state = AppState::init().await?;
    tracing::debug!(
        workers = state.config.worker_pool_size,
        activities = state.activities.len(),
        "ready"
    );

    match cli.command {
        Commands::Register { path } => {
            cli::workflow::handle_register(&state, path, cli.json).await?;
        }

        Commands::Start { name, run } => {
            cli::workflow::handle_start(&state, &name, run, cli.json).await?;
        }

        Commands::Run { id, follow } => {
            cli::workflow::handle_run(&state, id.as_deref(), follow, cli.json).await?;
        }

        Commands::Inspect { id } => {
            cli::workflow::handle_inspect(&state, &id, cli.json).await?;
        }

        Commands::History { id } => {
            cli::workflow::handle_history(&state, &id, cli.json).await?;
        }

        Commands::List { status } => {
            cli::workflow::handle_list(&state, status.as_deref(), cli.json).await?;
        }

        Commands::Definitions => {
            cli::workflow::handle_definitions(&state, cli.json).await?;
        }

        Commands::Cancel { id } => {
            cli::workflow::handle_cancel(&state, &id, cli.json).await?;
        }

        Commands::Timers => {
            cli::workflow::handle_timers(&state, cli.json).await?;
        }

        Commands::Completions { .. } => unreachable!("handled above"),
    }

    Ok(())
}

/// Tracing filter for the given verbosity. `-v` turns on debug output for
/// every localflow crate, not just the binary.
fn log_filter(verbose: u8, quiet: bool) -> &'static str {
    match verbose {
        0 if quiet => "error",
        0 => "warn",
        1 => "info,localflow_core=debug,localflow_infra=debug,localflow=debug",
        _ => "trace",
    }
}

/// Wait for Ctrl+C or SIGTERM.
pub(crate) async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
