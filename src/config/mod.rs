//! Runtime settings resolved from the environment.
//!
//! Every setting has a default, so an empty environment yields a working
//! configuration. The binary loads `.env` with `dotenvy` before resolving.

mod helpers;
mod reaper;

use std::time::Duration;

pub use helpers::Lookup;
pub use reaper::{DEFAULT_REAPER_IMAGE, ReaperSettings};

use crate::config::helpers::{optional_env, parse_optional_env, process_env};
use crate::error::ConfigError;
use crate::wait::PollPolicy;

/// All dockyard settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockyardConfig {
    pub reaper: ReaperSettings,
    /// Host used to reach mapped ports.
    pub host: String,
    /// Policy for wait strategies that leave fields unset.
    pub wait: PollPolicy,
    /// Grace period given to containers on stop.
    pub stop_timeout: Duration,
}

impl Default for DockyardConfig {
    fn default() -> Self {
        Self {
            reaper: ReaperSettings::default(),
            host: "127.0.0.1".to_string(),
            wait: PollPolicy::default(),
            stop_timeout: Duration::from_secs(10),
        }
    }
}

impl DockyardConfig {
    /// Resolve from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&process_env)
    }

    /// Resolve from an arbitrary key lookup.
    pub fn from_lookup(lookup: Lookup<'_>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let timeout_secs = parse_optional_env(
            lookup,
            "DOCKYARD_WAIT_TIMEOUT_SECS",
            defaults.wait.timeout.as_secs(),
        )?;
        let interval_ms = parse_optional_env(
            lookup,
            "DOCKYARD_WAIT_INTERVAL_MS",
            defaults.wait.interval.as_millis() as u64,
        )?;
        if timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "DOCKYARD_WAIT_TIMEOUT_SECS".to_string(),
                message: "must be positive".to_string(),
            });
        }
        if interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "DOCKYARD_WAIT_INTERVAL_MS".to_string(),
                message: "must be positive".to_string(),
            });
        }

        Ok(Self {
            reaper: ReaperSettings::resolve(lookup)?,
            host: optional_env(lookup, "DOCKYARD_HOST_OVERRIDE")?.unwrap_or(defaults.host),
            wait: PollPolicy {
                timeout: Duration::from_secs(timeout_secs),
                interval: Duration::from_millis(interval_ms),
                max_consecutive_failures: None,
            },
            stop_timeout: defaults.stop_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn from(pairs: &[(&str, &str)]) -> Result<DockyardConfig, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        DockyardConfig::from_lookup(&move |key: &str| map.get(key).cloned())
    }

    #[test]
    fn test_empty_environment_gives_defaults() {
        assert_eq!(from(&[]).unwrap(), DockyardConfig::default());
    }

    #[test]
    fn test_overrides() {
        let config = from(&[
            ("DOCKYARD_REAPER_DISABLED", "true"),
            ("DOCKYARD_REAPER_ADDR", "10.0.0.5:8080"),
            ("DOCKYARD_REAPER_GRACE_SECS", "3"),
            ("DOCKYARD_HOST_OVERRIDE", "docker.internal"),
            ("DOCKYARD_WAIT_INTERVAL_MS", "250"),
        ])
        .unwrap();

        assert!(config.reaper.disabled);
        assert_eq!(config.reaper.addr.as_deref(), Some("10.0.0.5:8080"));
        assert_eq!(config.reaper.grace_period, Duration::from_secs(3));
        assert_eq!(config.reaper.image, DEFAULT_REAPER_IMAGE);
        assert_eq!(config.host, "docker.internal");
        assert_eq!(config.wait.interval, Duration::from_millis(250));
        assert_eq!(config.wait.timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_invalid_values_name_the_key() {
        let err = from(&[("DOCKYARD_REAPER_CONNECT_TIMEOUT_SECS", "soon")]).unwrap_err();
        assert!(err.to_string().contains("DOCKYARD_REAPER_CONNECT_TIMEOUT_SECS"));

        let err = from(&[("DOCKYARD_WAIT_INTERVAL_MS", "0")]).unwrap_err();
        assert!(err.to_string().contains("must be positive"));
    }
}
