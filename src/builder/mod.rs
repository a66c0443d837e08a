//! Fluent, immutable builders.
//!
//! A [`Builder`] wraps a configuration. Every `with_*` call takes `&self`,
//! merges a one-field configuration into a copy and returns a new builder,
//! so a shared base can be branched freely, including across threads:
//!
//! ```rust,no_run
//! use dockyard::builder::ContainerBuilder;
//! use dockyard::wait::WaitStrategy;
//! use std::time::Duration;
//!
//! let base = ContainerBuilder::new()
//!     .with_image("postgres:16-alpine")
//!     .with_env("POSTGRES_PASSWORD", "postgres");
//!
//! let primary = base
//!     .with_port_binding(5432, 5432)
//!     .with_wait_strategy(WaitStrategy::tcp(5432).with_timeout(Duration::from_secs(30)));
//! let replica = base.with_name("replica");
//! ```
//!
//! Capabilities shared by several resource kinds (naming, labelling) come
//! from the [`Named`] and [`Labelled`] traits; kind-specific operations
//! live in inherent impls on `Builder<KindConfiguration>`.

mod container;
mod image;
mod network;
mod volume;

use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::Arc;

use crate::configuration::{
    ContainerConfiguration, ImageConfiguration, Labelled, Named, NetworkConfiguration,
    ResourceConfiguration, VolumeConfiguration,
};
use crate::error::ConfigurationError;

pub type ContainerBuilder = Builder<ContainerConfiguration>;
pub type NetworkBuilder = Builder<NetworkConfiguration>;
pub type VolumeBuilder = Builder<VolumeConfiguration>;
pub type ImageBuilder = Builder<ImageConfiguration>;

/// Immutable builder over a resource configuration.
#[derive(Debug)]
pub struct Builder<C: ResourceConfiguration> {
    configuration: Arc<C>,
}

impl<C: ResourceConfiguration> Clone for Builder<C> {
    fn clone(&self) -> Self {
        Self {
            configuration: Arc::clone(&self.configuration),
        }
    }
}

impl<C: ResourceConfiguration> Builder<C> {
    /// A builder starting from the kind's initial configuration.
    pub fn new() -> Self {
        Self::from_configuration(C::init())
    }

    /// A builder wrapping an existing configuration.
    pub fn from_configuration(configuration: C) -> Self {
        Self {
            configuration: Arc::new(configuration),
        }
    }

    /// The accumulated configuration.
    pub fn configuration(&self) -> &C {
        &self.configuration
    }

    /// Combine the current configuration with `newer` into a new builder.
    pub fn merge(&self, newer: C) -> Self {
        Self::from_configuration(self.configuration.merge(&newer))
    }

    /// Validate and freeze the configuration.
    ///
    /// Reports every violation, not only the first.
    pub fn build(&self) -> Result<Definition<C>, ConfigurationError> {
        let violations = self.configuration.violations();
        if !violations.is_empty() {
            return Err(ConfigurationError {
                kind: C::KIND,
                violations,
            });
        }
        Ok(Definition {
            configuration: Arc::clone(&self.configuration),
        })
    }
}

impl<C: ResourceConfiguration> Default for Builder<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Named> Builder<C> {
    pub fn with_name(&self, name: impl Into<String>) -> Self {
        self.merge(C::named(name.into()))
    }
}

impl<C: Labelled> Builder<C> {
    pub fn with_label(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.merge(C::labelled(BTreeMap::from([(key.into(), value.into())])))
    }

    pub fn with_labels<I, K, V>(&self, labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.merge(C::labelled(
            labels
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        ))
    }
}

/// A validated configuration, ready to be realized by the orchestrator.
#[derive(Debug)]
pub struct Definition<C: ResourceConfiguration> {
    configuration: Arc<C>,
}

impl<C: ResourceConfiguration> Clone for Definition<C> {
    fn clone(&self) -> Self {
        Self {
            configuration: Arc::clone(&self.configuration),
        }
    }
}

impl<C: ResourceConfiguration> Deref for Definition<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.configuration
    }
}
