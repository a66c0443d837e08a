//! Container definition of the reaper sidecar.
//!
//! The sidecar runs `dockyard reaper` with the engine socket bound in. It
//! carries the reaper label rather than the session label so pruning a
//! session never removes the reaper itself; it removes itself on exit.
//! Each link gets its own sidecar name, since a sidecar from an earlier link
//! of the same session may still be shutting down.

use std::time::Duration;

use crate::builder::ContainerBuilder;
use crate::config::ReaperSettings;
use crate::configuration::{Mount, PullPolicy};
use crate::session::{REAPER_LABEL, Session};
use crate::wait::WaitStrategy;

/// Port the reaper listens on inside the sidecar.
pub const REAPER_PORT: u16 = 8080;

pub fn reaper_container(settings: &ReaperSettings, session: &Session) -> ContainerBuilder {
    ContainerBuilder::new()
        .with_image(settings.image.clone())
        .with_pull_policy(PullPolicy::missing())
        .with_name(format!(
            "dockyard-reaper-{}-{}",
            session.id(),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        ))
        .with_command([
            "reaper".to_string(),
            "--port".to_string(),
            REAPER_PORT.to_string(),
            "--grace-period-secs".to_string(),
            settings.grace_period.as_secs().to_string(),
            "--connect-timeout-secs".to_string(),
            settings.connect_timeout.as_secs().to_string(),
        ])
        .with_random_port_binding(REAPER_PORT)
        .with_mount(Mount::bind(&settings.docker_socket, "/var/run/docker.sock"))
        .with_label(REAPER_LABEL, session.id().to_string())
        .with_privileged(settings.privileged)
        .with_auto_remove(true)
        .with_wait_strategy(
            WaitStrategy::log("Reaper listening").with_timeout(Duration::from_secs(60)),
        )
        .with_wait_strategy(WaitStrategy::tcp(REAPER_PORT).with_timeout(Duration::from_secs(30)))
}
