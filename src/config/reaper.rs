use std::time::Duration;

use crate::config::helpers::{Lookup, optional_env, parse_bool_env, parse_optional_env};
use crate::error::ConfigError;

pub const DEFAULT_REAPER_IMAGE: &str = "dockyard/reaper:0.1.0";

/// How the session's reaper is obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaperSettings {
    /// Skip the reaper entirely; cleanup relies on disposal only.
    pub disabled: bool,
    /// Image of the reaper sidecar.
    pub image: String,
    /// Connect to an already running reaper instead of launching one.
    pub addr: Option<String>,
    /// How long the reaper waits after a lost connection before pruning.
    pub grace_period: Duration,
    /// How long the reaper waits for its first client.
    pub connect_timeout: Duration,
    /// Run the sidecar privileged (needed on some SELinux hosts).
    pub privileged: bool,
    /// Engine socket bound into the sidecar.
    pub docker_socket: String,
}

impl Default for ReaperSettings {
    fn default() -> Self {
        Self {
            disabled: false,
            image: DEFAULT_REAPER_IMAGE.to_string(),
            addr: None,
            grace_period: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(60),
            privileged: false,
            docker_socket: "/var/run/docker.sock".to_string(),
        }
    }
}

impl ReaperSettings {
    pub(crate) fn resolve(lookup: Lookup<'_>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            disabled: parse_bool_env(lookup, "DOCKYARD_REAPER_DISABLED", defaults.disabled)?,
            image: optional_env(lookup, "DOCKYARD_REAPER_IMAGE")?.unwrap_or(defaults.image),
            addr: optional_env(lookup, "DOCKYARD_REAPER_ADDR")?,
            grace_period: Duration::from_secs(parse_optional_env(
                lookup,
                "DOCKYARD_REAPER_GRACE_SECS",
                defaults.grace_period.as_secs(),
            )?),
            connect_timeout: Duration::from_secs(parse_optional_env(
                lookup,
                "DOCKYARD_REAPER_CONNECT_TIMEOUT_SECS",
                defaults.connect_timeout.as_secs(),
            )?),
            privileged: parse_bool_env(lookup, "DOCKYARD_REAPER_PRIVILEGED", defaults.privileged)?,
            docker_socket: defaults.docker_socket,
        })
    }
}
