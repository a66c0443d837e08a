//! `dockyard doctor`: is a container engine usable from here?

use crate::engine::{ContainerEngine, DockerEngine, check_docker};

pub async fn run_doctor_command() -> anyhow::Result<()> {
    let detection = check_docker().await;
    println!("Docker: {}", detection.status.as_str());
    if let Some(hint) = detection.hint() {
        println!("  hint: {}", hint);
    }
    if !detection.status.is_ok() {
        anyhow::bail!("docker is not usable");
    }

    let engine = DockerEngine::connect().await?;
    engine.ping().await?;
    println!("Engine API: reachable");

    match crate::config::DockyardConfig::from_env() {
        Ok(config) if config.reaper.disabled => println!("Reaper: disabled"),
        Ok(config) => println!(
            "Reaper: {}",
            config
                .reaper
                .addr
                .unwrap_or_else(|| format!("sidecar ({})", config.reaper.image))
        ),
        Err(e) => {
            println!("Settings: {}", e);
            anyhow::bail!("invalid dockyard settings");
        }
    }
    Ok(())
}
