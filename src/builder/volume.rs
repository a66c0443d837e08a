//! Volume builder operations.

use std::collections::BTreeMap;

use crate::builder::Builder;
use crate::configuration::VolumeConfiguration;
use crate::error::Result;
use crate::orchestrator::{Orchestrator, VolumeHandle};

impl Builder<VolumeConfiguration> {
    pub fn with_driver(&self, driver: impl Into<String>) -> Self {
        self.merge(VolumeConfiguration {
            driver: Some(driver.into()),
            ..Default::default()
        })
    }

    pub fn with_driver_option(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.merge(VolumeConfiguration {
            driver_options: BTreeMap::from([(key.into(), value.into())]),
            ..Default::default()
        })
    }

    pub async fn create(&self, orchestrator: &Orchestrator) -> Result<VolumeHandle> {
        orchestrator.create_volume(&self.build()?).await
    }
}

#[cfg(test)]
mod tests {
    use crate::builder::VolumeBuilder;

    #[test]
    fn test_volume_driver_options_merge() {
        let config = VolumeBuilder::new()
            .with_driver("local")
            .with_driver_option("type", "tmpfs")
            .with_driver_option("device", "tmpfs")
            .configuration()
            .clone();
        assert_eq!(config.driver.as_deref(), Some("local"));
        assert_eq!(config.driver_options.len(), 2);
    }

    #[test]
    fn test_later_driver_wins() {
        let base = VolumeBuilder::new().with_driver("local");
        let overridden = base.with_driver("nfs");
        assert_eq!(overridden.configuration().driver.as_deref(), Some("nfs"));
        assert_eq!(base.configuration().driver.as_deref(), Some("local"));
    }
}
