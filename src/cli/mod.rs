//! CLI command handling.
//!
//! Provides subcommands for:
//! - Running the reaper server inside the sidecar (`reaper`)
//! - Removing one session's leftovers by hand (`prune`)
//! - Checking that a container engine is reachable (`doctor`)

mod doctor;
mod prune;
mod reaper;

pub use doctor::run_doctor_command;
pub use prune::{PruneArgs, run_prune_command};
pub use reaper::{ReaperArgs, run_reaper_command};

use clap::{ColorChoice, Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "dockyard")]
#[command(about = "Ephemeral container dependencies with crash-safe cleanup")]
#[command(
    long_about = "dockyard provisions throwaway containers for test suites.\nExamples:\n  dockyard doctor  # Check the Docker setup\n  dockyard prune --session <id>  # Remove a session's leftovers"
)]
#[command(version)]
#[command(color = ColorChoice::Auto)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the reaper server (used inside the reaper sidecar)
    #[command(
        about = "Run the reaper server",
        long_about = "Watches client connections and prunes labelled resources once a client is lost.\nExample: dockyard reaper --port 8080 --grace-period-secs 10"
    )]
    Reaper(ReaperArgs),

    /// Remove every resource of a session now
    #[command(
        about = "Prune a session's resources",
        long_about = "Removes containers, networks, volumes and images carrying the given labels.\nExample: dockyard prune --session 6f1c... --json"
    )]
    Prune(PruneArgs),

    /// Check Docker availability
    Doctor,
}

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
pub fn init_logging(json: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("dockyard=info"));
    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(false))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reaper_defaults() {
        let cli = Cli::try_parse_from(["dockyard", "reaper"]).unwrap();
        let Command::Reaper(args) = cli.command else {
            panic!("expected reaper command");
        };
        assert_eq!(args.port, 8080);
        assert_eq!(args.bind, "0.0.0.0");
        assert_eq!(args.grace_period_secs, 10);
        assert_eq!(args.connect_timeout_secs, 60);
    }

    #[test]
    fn test_prune_requires_a_filter() {
        assert!(Cli::try_parse_from(["dockyard", "prune"]).is_err());

        let cli = Cli::try_parse_from([
            "dockyard",
            "prune",
            "--filter",
            "team=storage",
            "--json",
        ])
        .unwrap();
        let Command::Prune(args) = cli.command else {
            panic!("expected prune command");
        };
        assert!(args.json);
        assert_eq!(args.filters().unwrap().len(), 1);
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
