//! CLI command definitions using clap derive.

pub mod workflow;

use clap::{Parser, Subcommand};

/// Hostelry - workflow engine for hostel operations.
#[derive(Parser)]
#[command(name = "hostelry", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output as JSON instead of formatted tables
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress log output
    #[arg(long, short, global = true)]
    pub quiet: bool,

    /// Increase verbosity (-v info, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export spans to stdout through OpenTelemetry
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List the built-in workflow definitions
    Workflows,

    /// Execute a built-in workflow and persist its snapshot
    Run {
        /// Workflow type (e.g. onboard_admin, booking_approval)
        workflow_type: String,

        /// Initial context as a JSON object
        #[arg(long, short)]
        context: Option<String>,

        /// Make the named step fail, to exercise retries and rollback
        #[arg(long)]
        fail: Option<String>,

        /// Who triggered the run
        #[arg(long)]
        initiated_by: Option<String>,
    },

    /// Show a persisted execution snapshot
    Show {
        /// Execution ID
        execution_id: String,
    },

    /// Delete expired snapshots from the store
    Purge,
}
