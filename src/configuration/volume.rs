//! Volume configuration.

use std::collections::BTreeMap;

use crate::configuration::combine;
use crate::configuration::{Labelled, Named, ResourceConfiguration, check_labels, check_name};
use crate::resource::ResourceKind;

/// Desired state of a named volume.
#[derive(Debug, Clone, Default)]
pub struct VolumeConfiguration {
    pub name: Option<String>,
    pub driver: Option<String>,
    pub driver_options: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

impl ResourceConfiguration for VolumeConfiguration {
    const KIND: ResourceKind = ResourceKind::Volume;

    fn merge(&self, newer: &Self) -> Self {
        Self {
            name: combine::scalar(&self.name, &newer.name),
            driver: combine::scalar(&self.driver, &newer.driver),
            driver_options: combine::mapping(&self.driver_options, &newer.driver_options),
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

    fn init() -> Self {
        Self {
            name: Some(uuid::Uuid::new_v4().to_string()),
            ..Default::default()
        }
    }

    fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }
}

impl Named for VolumeConfiguration {
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

impl Labelled for VolumeConfiguration {
    fn labelled(labels: BTreeMap<String, String>) -> Self {
        Self {
            labels,
            ..Default::default()
        }
    }
}
