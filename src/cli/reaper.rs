//! `dockyard reaper`: the server side of the dead-man's switch.

use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use tokio::net::TcpListener;

use crate::cancel::CancelSource;
use crate::engine::DockerEngine;
use crate::reaper::{ExitReason, ReaperServer, ReaperServerConfig};

#[derive(Args, Debug, Clone)]
pub struct ReaperArgs {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: String,

    /// Port to listen on
    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    /// Seconds to wait after the last client leaves before pruning
    #[arg(long, default_value_t = 10)]
    pub grace_period_secs: u64,

    /// Exit if no client connects within this many seconds
    #[arg(long, default_value_t = 60)]
    pub connect_timeout_secs: u64,
}

pub async fn run_reaper_command(args: ReaperArgs) -> anyhow::Result<()> {
    let engine = DockerEngine::connect().await?;
    let listener = TcpListener::bind((args.bind.as_str(), args.port)).await?;

    let source = CancelSource::new();
    let cancel = source.token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, stopping reaper");
            source.cancel();
        }
    });

    let server = ReaperServer::new(
        Arc::new(engine),
        ReaperServerConfig {
            grace_period: Duration::from_secs(args.grace_period_secs),
            connect_timeout: Duration::from_secs(args.connect_timeout_secs),
        },
    );
    let outcome = server.run(listener, cancel).await;

    match outcome.reason {
        ExitReason::ConnectTimeout => tracing::warn!("Reaper exiting: no client connected"),
        ExitReason::Idle | ExitReason::Cancelled => tracing::info!(
            "Reaper exiting ({:?}), removed {} object(s)",
            outcome.reason,
            outcome.pruned.total()
        ),
    }
    if !outcome.pruned.errors.is_empty() {
        anyhow::bail!(
            "reaper left {} object(s) behind: {}",
            outcome.pruned.errors.len(),
            outcome.pruned.errors.join("; ")
        );
    }
    Ok(())
}
