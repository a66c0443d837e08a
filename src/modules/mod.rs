//! Ready-made service presets.
//!
//! A preset is a plain struct with named, validated fields. It compiles to an
//! ordinary [`ContainerBuilder`], so callers can keep layering on top of it
//! with the usual merge rules:
//!
//! ```rust,no_run
//! use dockyard::modules::{Module, Postgres};
//!
//! # fn demo() -> Result<(), dockyard::error::ConfigurationError> {
//! let builder = Postgres::default()
//!     .with_database("orders")
//!     .builder()?
//!     .with_env("TZ", "UTC");
//! # Ok(())
//! # }
//! ```

mod localstack;
mod mongodb;
mod postgres;

pub use localstack::LocalStack;
pub use mongodb::MongoDb;
pub use postgres::Postgres;

use crate::builder::ContainerBuilder;
use crate::error::ConfigurationError;
use crate::resource::ResourceKind;

/// A preset that compiles to a container builder.
pub trait Module {
    /// Every problem with the preset's fields.
    fn violations(&self) -> Vec<String>;

    /// The builder for a preset known to be valid.
    fn configure(&self) -> ContainerBuilder;

    /// Validate, then compile.
    fn builder(&self) -> Result<ContainerBuilder, ConfigurationError> {
        let violations = self.violations();
        if !violations.is_empty() {
            return Err(ConfigurationError {
                kind: ResourceKind::Container,
                violations,
            });
        }
        Ok(self.configure())
    }
}

/// Shared check for credentials embedded in connection strings.
pub(crate) fn check_credential(field: &str, value: &str, violations: &mut Vec<String>) {
    if value.is_empty() {
        violations.push(format!("{} must not be empty", field));
    } else if value.contains(['@', ':', '/']) {
        violations.push(format!("{} must not contain '@', ':' or '/'", field));
    }
}
