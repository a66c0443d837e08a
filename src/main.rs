//! dockyard - Main entry point.

use clap::Parser;

use dockyard::cli::{Cli, Command, init_logging, run_doctor_command, run_prune_command, run_reaper_command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load .env if present
    let _ = dotenvy::dotenv();

    init_logging(cli.log_json);

    match cli.command {
        Command::Reaper(args) => run_reaper_command(args).await,
        Command::Prune(args) => run_prune_command(args).await,
        Command::Doctor => run_doctor_command().await,
    }
}
