//! Container-specific builder operations.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;

use crate::builder::{Builder, ContainerBuilder};
use crate::cancel::CancelToken;
use crate::configuration::container::normalize_port;
use crate::configuration::{ContainerConfiguration, Mount, PullPolicy, ResourceMapping};
use crate::error::Result;
use crate::orchestrator::output::OutputConsumer;
use crate::orchestrator::{ContainerHandle, Orchestrator};
use crate::wait::WaitStrategy;

impl Builder<ContainerConfiguration> {
    fn with(&self, configuration: ContainerConfiguration) -> Self {
        self.merge(configuration)
    }

    pub fn with_image(&self, image: impl Into<String>) -> Self {
        self.with(ContainerConfiguration {
            image: Some(image.into()),
            ..Default::default()
        })
    }

    pub fn with_pull_policy(&self, policy: PullPolicy) -> Self {
        self.with(ContainerConfiguration {
            pull_policy: Some(policy),
            ..Default::default()
        })
    }

    pub fn with_hostname(&self, hostname: impl Into<String>) -> Self {
        self.with(ContainerConfiguration {
            hostname: Some(hostname.into()),
            ..Default::default()
        })
    }

    pub fn with_mac_address(&self, mac: impl Into<String>) -> Self {
        self.with(ContainerConfiguration {
            mac_address: Some(mac.into()),
            ..Default::default()
        })
    }

    pub fn with_working_dir(&self, dir: impl Into<String>) -> Self {
        self.with(ContainerConfiguration {
            working_dir: Some(dir.into()),
            ..Default::default()
        })
    }

    /// Appends to the entrypoint.
    pub fn with_entrypoint<I, S>(&self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with(ContainerConfiguration {
            entrypoint: args.into_iter().map(Into::into).collect(),
            ..Default::default()
        })
    }

    /// Appends to the command.
    pub fn with_command<I, S>(&self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with(ContainerConfiguration {
            command: args.into_iter().map(Into::into).collect(),
            ..Default::default()
        })
    }

    pub fn with_env(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.with(ContainerConfiguration {
            env: BTreeMap::from([(key.into(), value.into())]),
            ..Default::default()
        })
    }

    pub fn with_envs<I, K, V>(&self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.with(ContainerConfiguration {
            env: vars
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            ..Default::default()
        })
    }

    /// Expose a port without binding it. Accepts `"5432"` or `"53/udp"`.
    pub fn with_exposed_port(&self, port: impl AsRef<str>) -> Self {
        self.with(ContainerConfiguration {
            exposed_ports: BTreeMap::from([(normalize_port(port.as_ref()), ())]),
            ..Default::default()
        })
    }

    /// Bind a TCP container port to a fixed host port.
    pub fn with_port_binding(&self, host_port: u16, container_port: u16) -> Self {
        self.with_port_binding_spec(container_port.to_string(), host_port.to_string())
    }

    /// Bind a TCP container port to a host port chosen by the engine.
    pub fn with_random_port_binding(&self, container_port: u16) -> Self {
        self.with_port_binding_spec(container_port.to_string(), String::new())
    }

    /// Raw binding; an empty host port means random.
    pub fn with_port_binding_spec(
        &self,
        container_port: impl AsRef<str>,
        host_port: impl Into<String>,
    ) -> Self {
        self.with(ContainerConfiguration {
            port_bindings: BTreeMap::from([(normalize_port(container_port.as_ref()), host_port.into())]),
            ..Default::default()
        })
    }

    pub fn with_mount(&self, mount: Mount) -> Self {
        self.with(ContainerConfiguration {
            mounts: vec![mount],
            ..Default::default()
        })
    }

    pub fn with_bind_mount(&self, host: impl Into<std::path::PathBuf>, target: impl Into<String>) -> Self {
        self.with_mount(Mount::bind(host, target))
    }

    pub fn with_volume_mount(&self, volume: impl Into<String>, target: impl Into<String>) -> Self {
        self.with_mount(Mount::volume(volume, target))
    }

    pub fn with_tmpfs_mount(&self, target: impl Into<String>) -> Self {
        self.with_mount(Mount::tmpfs(target))
    }

    /// Copy contents to `target` inside the container before it starts.
    pub fn with_resource_mapping(&self, target: impl Into<String>, mapping: ResourceMapping) -> Self {
        self.with(ContainerConfiguration {
            resource_mappings: BTreeMap::from([(target.into(), mapping)]),
            ..Default::default()
        })
    }

    /// Attach to a network by name; it is created if missing.
    pub fn with_network(&self, network: impl Into<String>) -> Self {
        self.with(ContainerConfiguration {
            networks: vec![network.into()],
            ..Default::default()
        })
    }

    pub fn with_network_alias(&self, alias: impl Into<String>) -> Self {
        self.with(ContainerConfiguration {
            network_aliases: vec![alias.into()],
            ..Default::default()
        })
    }

    pub fn with_output_consumer(&self, consumer: impl OutputConsumer + 'static) -> Self {
        self.with(ContainerConfiguration::consumer(Arc::new(consumer)))
    }

    pub fn with_wait_strategy(&self, strategy: WaitStrategy) -> Self {
        self.with(ContainerConfiguration {
            wait_strategies: vec![strategy],
            ..Default::default()
        })
    }

    /// Run `callback` with the live handle once the container is ready.
    /// A failing callback fails the start and rolls the container back.
    pub fn with_startup_callback<F, Fut>(&self, callback: F) -> Self
    where
        F: Fn(ContainerHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.with(ContainerConfiguration::callback(Arc::new(
            move |handle: ContainerHandle| callback(handle).boxed(),
        )))
    }

    pub fn with_auto_remove(&self, auto_remove: bool) -> Self {
        self.with(ContainerConfiguration {
            auto_remove,
            ..Default::default()
        })
    }

    pub fn with_privileged(&self, privileged: bool) -> Self {
        self.with(ContainerConfiguration {
            privileged,
            ..Default::default()
        })
    }

    /// Build, then realize through `orchestrator`.
    pub async fn start(&self, orchestrator: &Orchestrator) -> Result<ContainerHandle> {
        self.start_with_cancel(orchestrator, &CancelToken::never()).await
    }

    pub async fn start_with_cancel(
        &self,
        orchestrator: &Orchestrator,
        cancel: &CancelToken,
    ) -> Result<ContainerHandle> {
        let definition = self.build()?;
        orchestrator.start_container(&definition, cancel).await
    }

    /// Build, then create without starting; see [`ContainerHandle::start`].
    pub async fn create(&self, orchestrator: &Orchestrator) -> Result<ContainerHandle> {
        let definition = self.build()?;
        orchestrator
            .create_container(&definition, &CancelToken::never())
            .await
    }
}

impl From<ContainerConfiguration> for ContainerBuilder {
    fn from(configuration: ContainerConfiguration) -> Self {
        Self::from_configuration(configuration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_ports_are_normalized() {
        let builder = ContainerBuilder::new()
            .with_image("nginx")
            .with_exposed_port("53/udp")
            .with_port_binding(8080, 80)
            .with_random_port_binding(443);
        let config = builder.configuration();

        assert!(config.exposed_ports.contains_key("53/udp"));
        assert_eq!(config.port_bindings["80/tcp"], "8080");
        assert_eq!(config.port_bindings["443/tcp"], "");
        assert!(builder.build().is_ok());
    }

    #[test]
    fn test_repeated_calls_stack() {
        let config = ContainerBuilder::new()
            .with_command(["-c", "fsync=off"])
            .with_command(["-c", "fsync=off"])
            .with_wait_strategy(WaitStrategy::tcp(5432))
            .with_wait_strategy(WaitStrategy::log("ready"))
            .configuration()
            .clone();

        assert_eq!(config.command, vec!["-c", "fsync=off", "-c", "fsync=off"]);
        assert_eq!(config.wait_strategies.len(), 2);
    }

    #[test]
    fn test_privileged_is_sticky() {
        let config = ContainerBuilder::new()
            .with_privileged(true)
            .with_privileged(false)
            .configuration()
            .clone();
        assert!(config.privileged);
    }

    #[test]
    fn test_startup_callbacks_compose() {
        let config = ContainerBuilder::new()
            .with_startup_callback(|_| async { Ok(()) })
            .with_startup_callback(|_| async { Ok(()) })
            .configuration()
            .clone();
        assert_eq!(config.startup_callbacks.len(), 2);
    }

    #[test]
    fn test_invalid_wait_strategy_fails_build() {
        let err = ContainerBuilder::new()
            .with_image("alpine")
            .with_wait_strategy(WaitStrategy::log("(unclosed"))
            .build()
            .unwrap_err();
        assert_eq!(err.violations.len(), 1);
        assert!(err.violations[0].contains("invalid log pattern"));
    }
}
