//! Immutable resource configurations and the merge algebra that composes them.
//!
//! A configuration is a plain value where every field is optional. Two
//! configurations of the same kind are combined with [`ResourceConfiguration::merge`],
//! which applies the rule matching each field's type (see [`combine`]):
//!
//! | Field type | Rule |
//! |---|---|
//! | scalar (name, image, hostname) | newer wins when present |
//! | sequence (command, mounts, wait strategies) | `old ++ new` |
//! | mapping (env, ports, labels, options) | key union, newer wins |
//! | flag (auto-remove, privileged) | sticky-true OR |
//! | callback (startup, output consumers) | both run, old first |

pub mod combine;
pub mod container;
pub mod image;
pub mod network;
pub mod volume;

use std::collections::BTreeMap;

pub use combine::Hooks;
pub use container::{ContainerConfiguration, Mount, MountSource, ResourceMapping, StartupCallback};
pub use image::{ImageConfiguration, PullPolicy};
pub use network::{NetworkConfiguration, NetworkDriver};
pub use volume::VolumeConfiguration;

use crate::resource::ResourceKind;

/// A composable description of one kind of resource.
pub trait ResourceConfiguration: Clone + Default + Send + Sync + std::fmt::Debug + 'static {
    /// Kind of resource this configuration describes.
    const KIND: ResourceKind;

    /// Combine `self` (old) with `newer`, field by field.
    fn merge(&self, newer: &Self) -> Self;

    /// Every violation that prevents this configuration from being realized.
    fn violations(&self) -> Vec<String>;

    /// Starting point of a fresh builder.
    fn init() -> Self {
        Self::default()
    }

    /// Labels that will be applied at creation.
    fn labels(&self) -> &BTreeMap<String, String>;
}

/// Configurations that carry a name.
pub trait Named: ResourceConfiguration {
    /// A configuration with only the name set.
    fn named(name: String) -> Self;

    fn name(&self) -> Option<&str>;
}

/// Configurations that carry labels.
pub trait Labelled: ResourceConfiguration {
    /// A configuration with only the labels set.
    fn labelled(labels: BTreeMap<String, String>) -> Self;
}

/// Shared check for the optional name field.
pub(crate) fn check_name(name: Option<&str>, violations: &mut Vec<String>) {
    if let Some(name) = name
        && name.trim().is_empty()
    {
        violations.push("name must not be empty".to_string());
    }
}

/// Shared check for label keys.
pub(crate) fn check_labels(labels: &BTreeMap<String, String>, violations: &mut Vec<String>) {
    for key in labels.keys() {
        if key.trim().is_empty() {
            violations.push("label keys must not be empty".to_string());
        }
    }
}
