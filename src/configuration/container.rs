//! Container configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::configuration::combine::{self, Hooks};
use crate::configuration::image::PullPolicy;
use crate::configuration::{Labelled, Named, ResourceConfiguration, check_labels, check_name};
use crate::orchestrator::ContainerHandle;
use crate::orchestrator::output::OutputConsumer;
use crate::resource::ResourceKind;
use crate::wait::WaitStrategy;

/// Callback run with the live handle once the container is ready.
pub type StartupCallback =
    dyn Fn(ContainerHandle) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

/// Where a mount's data comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountSource {
    /// A host path bound into the container.
    Bind(PathBuf),
    /// A named engine volume.
    Volume(String),
    /// An in-memory filesystem.
    Tmpfs,
}

/// A filesystem mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub source: MountSource,
    /// Absolute path inside the container.
    pub target: String,
    pub read_only: bool,
}

impl Mount {
    pub fn bind(host: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            source: MountSource::Bind(host.into()),
            target: target.into(),
            read_only: false,
        }
    }

    pub fn volume(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: MountSource::Volume(name.into()),
            target: target.into(),
            read_only: false,
        }
    }

    pub fn tmpfs(target: impl Into<String>) -> Self {
        Self {
            source: MountSource::Tmpfs,
            target: target.into(),
            read_only: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

/// File contents copied into the container before it starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceMapping {
    pub contents: Bytes,
    /// Unix permission bits.
    pub mode: u32,
}

impl ResourceMapping {
    pub fn from_bytes(contents: impl Into<Bytes>) -> Self {
        Self {
            contents: contents.into(),
            mode: 0o644,
        }
    }

    /// Read a host file now; the copy happens at start time.
    pub fn from_file(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let contents = std::fs::read(path)?;
        Ok(Self::from_bytes(contents))
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }
}

/// Desired state of a container.
///
/// Port keys are normalized `"<port>/<protocol>"` strings; a port binding
/// with an empty host port asks the engine for a random one.
#[derive(Debug, Clone, Default)]
pub struct ContainerConfiguration {
    pub image: Option<String>,
    pub pull_policy: Option<PullPolicy>,
    pub name: Option<String>,
    pub hostname: Option<String>,
    pub mac_address: Option<String>,
    pub working_dir: Option<String>,
    pub entrypoint: Vec<String>,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub exposed_ports: BTreeMap<String, ()>,
    pub port_bindings: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    /// Target path inside the container to contents.
    pub resource_mappings: BTreeMap<String, ResourceMapping>,
    pub mounts: Vec<Mount>,
    /// Network names; missing networks are created on realization.
    pub networks: Vec<String>,
    pub network_aliases: Vec<String>,
    pub output_consumers: Hooks<dyn OutputConsumer>,
    pub wait_strategies: Vec<WaitStrategy>,
    pub startup_callbacks: Hooks<StartupCallback>,
    pub auto_remove: bool,
    pub privileged: bool,
}

impl ContainerConfiguration {
    /// A configuration with only the output consumer set.
    pub fn consumer(consumer: Arc<dyn OutputConsumer>) -> Self {
        Self {
            output_consumers: Hooks::single(consumer),
            ..Default::default()
        }
    }

    /// A configuration with only the startup callback set.
    pub fn callback(callback: Arc<StartupCallback>) -> Self {
        Self {
            startup_callbacks: Hooks::single(callback),
            ..Default::default()
        }
    }
}

impl ResourceConfiguration for ContainerConfiguration {
    const KIND: ResourceKind = ResourceKind::Container;

    fn merge(&self, newer: &Self) -> Self {
        Self {
            image: combine::scalar(&self.image, &newer.image),
            pull_policy: combine::scalar(&self.pull_policy, &newer.pull_policy),
            name: combine::scalar(&self.name, &newer.name),
            hostname: combine::scalar(&self.hostname, &newer.hostname),
            mac_address: combine::scalar(&self.mac_address, &newer.mac_address),
            working_dir: combine::scalar(&self.working_dir, &newer.working_dir),
            entrypoint: combine::sequence(&self.entrypoint, &newer.entrypoint),
            command: combine::sequence(&self.command, &newer.command),
            env: combine::mapping(&self.env, &newer.env),
            exposed_ports: combine::mapping(&self.exposed_ports, &newer.exposed_ports),
            port_bindings: combine::mapping(&self.port_bindings, &newer.port_bindings),
            labels: combine::mapping(&self.labels, &newer.labels),
            resource_mappings: combine::mapping(&self.resource_mappings, &newer.resource_mappings),
            mounts: combine::sequence(&self.mounts, &newer.mounts),
            networks: combine::sequence(&self.networks, &newer.networks),
            network_aliases: combine::sequence(&self.network_aliases, &newer.network_aliases),
            output_consumers: combine::hooks(&self.output_consumers, &newer.output_consumers),
            wait_strategies: combine::sequence(&self.wait_strategies, &newer.wait_strategies),
            startup_callbacks: combine::hooks(&self.startup_callbacks, &newer.startup_callbacks),
            auto_remove: combine::flag(self.auto_remove, newer.auto_remove),
            privileged: combine::flag(self.privileged, newer.privileged),
        }
    }

    fn violations(&self) -> Vec<String> {
        let mut violations = Vec::new();

        match self.image.as_deref() {
            None => violations.push("image is required".to_string()),
            Some(image) if image.trim().is_empty() => {
                violations.push("image must not be empty".to_string())
            }
            Some(_) => {}
        }

        check_name(self.name.as_deref(), &mut violations);
        check_labels(&self.labels, &mut violations);

        for key in self.env.keys() {
            if key.is_empty() || key.contains('=') {
                violations.push(format!("invalid environment variable name '{}'", key));
            }
        }

        for port in self.exposed_ports.keys().chain(self.port_bindings.keys()) {
            if parse_port(port).is_none() {
                violations.push(format!("invalid container port '{}'", port));
            }
        }
        for (port, host_port) in &self.port_bindings {
            if !host_port.is_empty() && host_port.parse::<u16>().is_err() {
                violations.push(format!("invalid host port '{}' for {}", host_port, port));
            }
        }

        for mount in &self.mounts {
            if !mount.target.starts_with('/') {
                violations.push(format!("mount target '{}' must be absolute", mount.target));
            }
            if let MountSource::Volume(name) = &mount.source
                && name.trim().is_empty()
            {
                violations.push(format!("volume name for '{}' must not be empty", mount.target));
            }
        }

        for target in self.resource_mappings.keys() {
            if !target.starts_with('/') || target.ends_with('/') {
                violations.push(format!("resource mapping target '{}' must be an absolute file path", target));
            }
        }

        for network in &self.networks {
            if network.trim().is_empty() {
                violations.push("network name must not be empty".to_string());
            }
        }

        for strategy in &self.wait_strategies {
            violations.extend(strategy.violations());
        }

        violations
    }

    fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }
}

impl Named for ContainerConfiguration {
    fn named(name: String) -> Self {
        Self {
            name: Some(name),
            ..Default::default()
        }
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl Labelled for ContainerConfiguration {
    fn labelled(labels: BTreeMap<String, String>) -> Self {
        Self {
            labels,
            ..Default::default()
        }
    }
}

/// Normalize `"5432"` to `"5432/tcp"`; keeps an explicit protocol.
pub fn normalize_port(port: &str) -> String {
    if port.contains('/') {
        port.to_string()
    } else {
        format!("{}/tcp", port)
    }
}

/// Split a normalized port key into number and protocol.
pub fn parse_port(port: &str) -> Option<(u16, &str)> {
    let (number, protocol) = port.split_once('/')?;
    let number = number.parse::<u16>().ok().filter(|n| *n != 0)?;
    matches!(protocol, "tcp" | "udp" | "sctp").then_some((number, protocol))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_merge_applies_field_rules() {
        let old = ContainerConfiguration {
            image: Some("postgres:16".to_string()),
            command: vec!["-c".to_string(), "fsync=off".to_string()],
            env: env(&[("A", "old"), ("B", "b")]),
            privileged: true,
            ..Default::default()
        };
        let new = ContainerConfiguration {
            name: Some("db".to_string()),
            command: vec!["-c".to_string()],
            env: env(&[("A", "new")]),
            privileged: false,
            auto_remove: true,
            ..Default::default()
        };

        let merged = old.merge(&new);
        assert_eq!(merged.image.as_deref(), Some("postgres:16"));
        assert_eq!(merged.name.as_deref(), Some("db"));
        assert_eq!(merged.command, vec!["-c", "fsync=off", "-c"]);
        assert_eq!(merged.env, env(&[("A", "new"), ("B", "b")]));
        assert!(merged.privileged);
        assert!(merged.auto_remove);
    }

    #[test]
    fn test_merge_with_empty_is_identity() {
        let a = ContainerConfiguration {
            image: Some("redis:7".to_string()),
            hostname: Some("cache".to_string()),
            mounts: vec![Mount::tmpfs("/data")],
            port_bindings: BTreeMap::from([("6379/tcp".to_string(), String::new())]),
            auto_remove: true,
            ..Default::default()
        };
        let merged = a.merge(&ContainerConfiguration::default());
        assert_eq!(merged.image, a.image);
        assert_eq!(merged.hostname, a.hostname);
        assert_eq!(merged.mounts, a.mounts);
        assert_eq!(merged.port_bindings, a.port_bindings);
        assert_eq!(merged.auto_remove, a.auto_remove);
    }

    #[test]
    fn test_violations_lists_everything() {
        let config = ContainerConfiguration {
            name: Some(" ".to_string()),
            port_bindings: BTreeMap::from([("abc/tcp".to_string(), "x".to_string())]),
            mounts: vec![Mount::bind("/tmp", "relative")],
            ..Default::default()
        };
        let violations = config.violations();
        assert!(violations.contains(&"image is required".to_string()));
        assert!(violations.contains(&"name must not be empty".to_string()));
        assert!(violations.iter().any(|v| v.contains("invalid container port")));
        assert!(violations.iter().any(|v| v.contains("invalid host port")));
        assert!(violations.iter().any(|v| v.contains("must be absolute")));
    }

    #[test]
    fn test_port_helpers() {
        assert_eq!(normalize_port("5432"), "5432/tcp");
        assert_eq!(normalize_port("53/udp"), "53/udp");
        assert_eq!(parse_port("5432/tcp"), Some((5432, "tcp")));
        assert_eq!(parse_port("0/tcp"), None);
        assert_eq!(parse_port("5432/icmp"), None);
        assert_eq!(parse_port("5432"), None);
    }
}
