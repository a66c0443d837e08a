//! Ephemeral container dependencies for test suites.
//!
//! Describe containers, networks, volumes and images with immutable
//! [`builder`]s, realize them through an [`Orchestrator`], and get back
//! handles that clean up after themselves. A reaper process watches each
//! session over a TCP connection and removes whatever a crashed run leaves
//! behind.
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use dockyard::{ContainerBuilder, Orchestrator, WaitStrategy};
//!
//! # async fn demo() -> dockyard::Result<()> {
//! let orchestrator = Orchestrator::connect().await?;
//! let redis = ContainerBuilder::new()
//!     .with_image("redis:7-alpine")
//!     .with_random_port_binding(6379)
//!     .with_wait_strategy(WaitStrategy::tcp(6379).with_timeout(Duration::from_secs(30)))
//!     .start(&orchestrator)
//!     .await?;
//!
//! let port = redis.mapped_port(6379).await?;
//! println!("redis on {}:{}", redis.host(), port);
//! redis.dispose().await;
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod cancel;
pub mod cli;
pub mod config;
pub mod configuration;
pub mod engine;
pub mod error;
pub mod modules;
pub mod orchestrator;
pub mod reaper;
pub mod resource;
pub mod session;
pub mod testing;
pub mod wait;

pub use builder::{ContainerBuilder, ImageBuilder, NetworkBuilder, VolumeBuilder};
pub use cancel::{CancelSource, CancelToken};
pub use error::{Error, Result};
pub use orchestrator::{ContainerHandle, DisposalReport, Orchestrator, ReaperStatus};
pub use resource::{ResourceKind, ResourceState};
pub use session::Session;
pub use wait::WaitStrategy;
