//! Hostelry CLI entry point.
//!
//! Binary name: `hostelry`
//!
//! Parses CLI arguments, initializes tracing, then dispatches to the
//! workflow command handlers.

mod cli;
mod demo;

use clap::Parser;

use cli::{Cli, Commands};
use hostelry_infra::config::default_data_dir;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Set up tracing based on verbosity
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,hostelry_core=debug",
        _ => "trace",
    };

    hostelry_observe::tracing_setup::init_tracing(filter, cli.otel)
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;

    let data_dir = default_data_dir();

    let outcome = match cli.command {
        Commands::Workflows => cli::workflow::handle_workflows(cli.json),

        Commands::Run {
            workflow_type,
            context,
            fail,
            initiated_by,
        } => {
            cli::workflow::handle_run(
                &data_dir,
                &workflow_type,
                context.as_deref(),
                fail.as_deref(),
                initiated_by,
                cli.json,
            )
            .await
        }

        Commands::Show { execution_id } => {
            cli::workflow::handle_show(&data_dir, &execution_id, cli.json).await
        }

        Commands::Purge => cli::workflow::handle_purge(&data_dir, cli.json).await,
    };

    hostelry_observe::tracing_setup::shutdown_tracing();
    outcome
}
