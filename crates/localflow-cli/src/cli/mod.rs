//! CLI command definitions for the `localflow` binary.
//!
//! Uses clap derive macros for argument parsing. Every command is a verb
//! acting on workflow definitions or instances (e.g., `localflow start
//! order_flow`, `localflow history <id>`).

pub mod workflow;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Durable local workflow orchestration.
#[derive(Parser)]
#[command(name = "localflow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Compile and store workflow definitions.
    ///
    /// PATH may be a `.flow` file or a directory of them; defaults to the
    /// `workflows/` directory under the data directory.
    Register {
        path: Option<PathBuf>,
    },

    /// Create a pending instance of a registered workflow.
    Start {
        /// Workflow name.
        name: String,

        /// Drive the new instance right away.
        #[arg(long)]
        run: bool,
    },

    /// Recover state, drive every unfinished instance and fire due timers.
    Run {
        /// Only drive this instance (full UUID or unique prefix).
        id: Option<String>,

        /// Keep polling timers until none remain (Ctrl+C to stop).
        #[arg(long, short)]
        follow: bool,
    },

    /// Show one instance: status, cursor, events and pending timers.
    Inspect {
        /// Instance ID (full UUID or unique prefix).
        id: String,
    },

    /// Show the event history of an instance.
    History {
        /// Instance ID (full UUID or unique prefix).
        id: String,
    },

    /// List workflow instances.
    #[command(alias = "ls")]
    List {
        /// Only show instances with this status.
        #[arg(long)]
        status: Option<String>,
    },

    /// List registered workflow definitions.
    Definitions,

    /// Cancel an unfinished instance.
    Cancel {
        /// Instance ID (full UUID or unique prefix).
        id: String,
    },

    /// List pending timers.
    Timers,

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}
