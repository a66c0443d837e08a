//! Network builder operations.

use std::collections::BTreeMap;

use crate::builder::Builder;
use crate::configuration::{NetworkConfiguration, NetworkDriver};
use crate::error::Result;
use crate::orchestrator::{NetworkHandle, Orchestrator};

impl Builder<NetworkConfiguration> {
    pub fn with_driver(&self, driver: NetworkDriver) -> Self {
        self.merge(NetworkConfiguration {
            driver: Some(driver),
            ..Default::default()
        })
    }

    /// Add a driver option.
    pub fn with_option(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.merge(NetworkConfiguration {
            options: BTreeMap::from([(key.into(), value.into())]),
            ..Default::default()
        })
    }

    pub async fn create(&self, orchestrator: &Orchestrator) -> Result<NetworkHandle> {
        orchestrator.create_network(&self.build()?).await
    }
}

#[cfg(test)]
mod tests {
    use crate::builder::NetworkBuilder;
    use crate::configuration::NetworkDriver;

    #[test]
    fn test_network_builder_defaults_and_options() {
        let builder = NetworkBuilder::new()
            .with_option("com.docker.network.driver.mtu", "1400")
            .with_label("team", "storage");
        let config = builder.configuration();

        assert_eq!(config.driver, Some(NetworkDriver::Bridge));
        assert!(config.name.is_some());
        assert_eq!(config.options["com.docker.network.driver.mtu"], "1400");

        let overlay = builder.with_driver(NetworkDriver::Overlay);
        assert_eq!(overlay.configuration().driver, Some(NetworkDriver::Overlay));
        assert_eq!(builder.configuration().driver, Some(NetworkDriver::Bridge));
    }

    #[test]
    fn test_two_network_builders_get_distinct_names() {
        let a = NetworkBuilder::new();
        let b = NetworkBuilder::new();
        assert_ne!(a.configuration().name, b.configuration().name);
    }
}
