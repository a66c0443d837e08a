//! Container engine seam.
//!
//! The orchestrator and the reaper only talk to the engine through
//! [`ContainerEngine`]. [`DockerEngine`] implements it over bollard; the
//! in-memory [`FakeEngine`](crate::testing::FakeEngine) implements it for tests.

mod detect;
mod docker;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;

pub use detect::{DockerDetection, DockerStatus, Platform, check_docker};
pub use docker::{DockerEngine, connect_docker};

use crate::configuration::Mount;
use crate::error::EngineError;
use crate::resource::ResourceKind;

/// Locally cached image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalImage {
    pub id: String,
    pub repo_tags: Vec<String>,
}

/// Fully assembled container creation parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: Option<String>,
    pub image: String,
    pub hostname: Option<String>,
    pub mac_address: Option<String>,
    pub working_dir: Option<String>,
    pub entrypoint: Vec<String>,
    pub command: Vec<String>,
    /// `KEY=VALUE` pairs.
    pub env: Vec<String>,
    pub exposed_ports: Vec<String>,
    /// Container port to host port; `None` lets the engine pick.
    pub port_bindings: BTreeMap<String, Option<u16>>,
    pub mounts: Vec<Mount>,
    pub labels: BTreeMap<String, String>,
    pub networks: Vec<String>,
    pub network_aliases: Vec<String>,
    pub privileged: bool,
    pub auto_remove: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkSpec {
    pub name: String,
    pub driver: String,
    pub options: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeSpec {
    pub name: String,
    pub driver: Option<String>,
    pub driver_options: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

/// Runtime view of a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerStatus {
    pub running: bool,
    pub exit_code: Option<i64>,
    /// Normalized container port to bound host port.
    pub ports: BTreeMap<String, u16>,
}

/// Result of a one-shot command inside a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One frame of container output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub bytes: Bytes,
}

/// Remote engine API used by the orchestrator and the reaper.
///
/// Removal of an object that does not exist must return
/// [`EngineError::NotFound`]; callers treat it as success.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Check that the daemon answers.
    async fn ping(&self) -> Result<(), EngineError>;

    async fn inspect_image(&self, reference: &str) -> Result<Option<LocalImage>, EngineError>;
    async fn pull_image(&self, reference: &str) -> Result<(), EngineError>;
    async fn remove_image(&self, reference: &str) -> Result<(), EngineError>;

    /// Id of the network with exactly this name, if any.
    async fn find_network(&self, name: &str) -> Result<Option<String>, EngineError>;
    async fn create_network(&self, spec: &NetworkSpec) -> Result<String, EngineError>;
    async fn remove_network(&self, id: &str) -> Result<(), EngineError>;

    async fn create_volume(&self, spec: &VolumeSpec) -> Result<String, EngineError>;
    async fn remove_volume(&self, name: &str) -> Result<(), EngineError>;

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError>;
    /// Extract a tar archive at the container root.
    async fn upload_archive(&self, id: &str, archive: Bytes) -> Result<(), EngineError>;
    async fn start_container(&self, id: &str) -> Result<(), EngineError>;
    /// Stopping a stopped container is not an error.
    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), EngineError>;
    /// Force-removes the container and its anonymous volumes.
    async fn remove_container(&self, id: &str) -> Result<(), EngineError>;
    async fn inspect_container(&self, id: &str) -> Result<ContainerStatus, EngineError>;
    async fn exec(&self, id: &str, command: &[String]) -> Result<ExecResult, EngineError>;

    /// Forward the container's output to `sink` until the container exits
    /// or the receiver is dropped. Returns once attached.
    async fn follow_output(
        &self,
        id: &str,
        sink: mpsc::UnboundedSender<OutputChunk>,
    ) -> Result<(), EngineError>;

    /// Ids of every object of `kind` carrying label `key=value`.
    async fn list_labelled(
        &self,
        kind: ResourceKind,
        key: &str,
        value: &str,
    ) -> Result<Vec<String>, EngineError>;

    /// Remove any kind of object by id.
    async fn remove(&self, kind: ResourceKind, id: &str) -> Result<(), EngineError> {
        match kind {
            ResourceKind::Container => self.remove_container(id).await,
            ResourceKind::Network => self.remove_network(id).await,
            ResourceKind::Volume => self.remove_volume(id).await,
            ResourceKind::Image => self.remove_image(id).await,
        }
    }
}
