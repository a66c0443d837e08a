//! `dockyard prune`: manual cleanup of labelled resources.

use clap::Args;

use crate::engine::DockerEngine;
use crate::error::ReaperError;
use crate::reaper::{Filter, prune};
use crate::session::SESSION_LABEL;

#[derive(Args, Debug, Clone)]
#[command(group(clap::ArgGroup::new("target").required(true).multiple(true)))]
pub struct PruneArgs {
    /// Session id whose resources should be removed
    #[arg(long, group = "target")]
    pub session: Option<String>,

    /// Extra label filter as key=value (repeatable)
    #[arg(long = "filter", group = "target")]
    pub filter: Vec<String>,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

impl PruneArgs {
    pub fn filters(&self) -> Result<Vec<Filter>, ReaperError> {
        let mut filters: Vec<Filter> = self
            .filter
            .iter()
            .map(|f| Filter::parse(f))
            .collect::<Result<_, _>>()?;
        if let Some(session) = &self.session {
            filters.push(Filter::new(SESSION_LABEL, session.clone()));
        }
        Ok(filters)
    }
}

pub async fn run_prune_command(args: PruneArgs) -> anyhow::Result<()> {
    let filters = args.filters()?;
    let engine = DockerEngine::connect().await?;
    let report = prune(&engine, &filters).await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Removed {} container(s)", report.containers.len());
        println!("Removed {} network(s)", report.networks.len());
        println!("Removed {} volume(s)", report.volumes.len());
        println!("Removed {} image(s)", report.images.len());
        for error in &report.errors {
            eprintln!("  ! {}", error);
        }
    }

    if !report.errors.is_empty() {
        anyhow::bail!("{} object(s) could not be removed", report.errors.len());
    }
    Ok(())
}
