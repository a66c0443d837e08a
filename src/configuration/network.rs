//! Network configuration.

use std::collections::BTreeMap;

use crate::configuration::combine;
use crate::configuration::{Labelled, Named, ResourceConfiguration, check_labels, check_name};
use crate::resource::ResourceKind;

/// Network driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkDriver {
    Bridge,
    Host,
    Overlay,
    Other(String),
}

impl NetworkDriver {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Bridge => "bridge",
            Self::Host => "host",
            Self::Overlay => "overlay",
            Self::Other(s) => s,
        }
    }
}

/// Desired state of a network.
#[derive(Debug, Clone, Default)]
pub struct NetworkConfiguration {
    pub name: Option<String>,
    pub driver: Option<NetworkDriver>,
    /// Driver options.
    pub options: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

impl ResourceConfiguration for NetworkConfiguration {
    const KIND: ResourceKind = ResourceKind::Network;

    fn merge(&self, newer: &Self) -> Self {
        Self {
            name: combine::scalar(&self.name, &newer.name),
            driver: combine::scalar(&self.driver, &newer.driver),
            options: combine::mapping(&self.options, &newer.options),
            labels: combine::mapping(&self.labels, &newer.labels),
        }
    }

    fn violations(&self) -> Vec<String> {
        let mut violations = Vec::new();
        if self.name.is_none() {
            violations.push("name is required".to_string());
        }
        check_name(self.name.as_deref(), &mut violations);
        check_labels(&self.labels, &mut violations);
        violations
    }

    /// Random UUID name on the bridge driver.
    fn init() -> Self {
        Self {
            name: Some(uuid::Uuid::new_v4().to_string()),
            driver: Some(NetworkDriver::Bridge),
            ..Default::default()
        }
    }

    fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }
}

impl Named for NetworkConfiguration {
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

impl Labelled for NetworkConfiguration {
    fn labelled(labels: BTreeMap<String, String>) -> Self {
        Self {
            labels,
            ..Default::default()
        }
    }
}
