//! In-memory [`ContainerEngine`] for tests.
//!
//! [`FakeEngine`] keeps containers, networks, volumes and images in maps,
//! records every mutating call, and can be told to fail specific operations
//! either persistently ([`FakeEngine::fail`]) or once ([`FakeEngine::fail_once`]).
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dockyard::testing::FakeEngine;
//!
//! let engine = Arc::new(FakeEngine::new().with_image("postgres:16-alpine"));
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::engine::{
    ContainerEngine, ContainerSpec, ContainerStatus, ExecResult, LocalImage, NetworkSpec,
    OutputChunk, OutputStream, VolumeSpec,
};
use crate::error::EngineError;
use crate::resource::ResourceKind;

/// First host port handed out for random bindings.
const FIRST_RANDOM_PORT: u16 = 32768;

/// Engine operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Ping,
    InspectImage,
    PullImage,
    RemoveImage,
    CreateNetwork,
    RemoveNetwork,
    CreateVolume,
    RemoveVolume,
    CreateContainer,
    UploadArchive,
    StartContainer,
    StopContainer,
    RemoveContainer,
    InspectContainer,
    Exec,
    FollowOutput,
    List,
}

/// A recorded mutating call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    PullImage(String),
    CreateNetwork(String),
    CreateVolume(String),
    /// Carries the image reference.
    CreateContainer(String),
    UploadArchive(String),
    StartContainer(String),
    StopContainer(String),
    Exec(String, Vec<String>),
    FollowOutput(String),
    Remove(ResourceKind, String),
}

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub spec: ContainerSpec,
    pub running: bool,
    pub ports: BTreeMap<String, u16>,
    pub archives: Vec<Bytes>,
}

#[derive(Debug, Clone)]
struct FakeObject {
    name: String,
    labels: BTreeMap<String, String>,
}

#[derive(Default)]
struct State {
    images: BTreeMap<String, LocalImage>,
    pullable: bool,
    containers: BTreeMap<String, FakeContainer>,
    networks: BTreeMap<String, FakeObject>,
    volumes: BTreeMap<String, FakeObject>,
    calls: Vec<EngineCall>,
    failures: HashMap<Operation, (String, bool)>,
    output: Vec<OutputChunk>,
    exec_result: ExecResult,
    next_id: u64,
    next_port: u16,
    create_latency: Duration,
}

/// In-memory engine.
pub struct FakeEngine {
    state: Mutex<State>,
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeEngine {
    /// An empty engine from which any image can be pulled.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                pullable: true,
                next_port: FIRST_RANDOM_PORT,
                ..Default::default()
            }),
        }
    }

    /// Seed a locally cached image.
    pub fn with_image(self, reference: &str) -> Self {
        {
            let mut state = self.lock();
            let id = format!("sha256:{:x}", state.images.len() + 1);
            state.images.insert(
                reference.to_string(),
                LocalImage {
                    id,
                    repo_tags: vec![reference.to_string()],
                },
            );
        }
        self
    }

    /// Pulls of unknown images fail with not-found.
    pub fn offline(self) -> Self {
        self.lock().pullable = false;
        self
    }

    /// Stdout emitted by every container once output is followed.
    pub fn with_output(self, text: &str) -> Self {
        self.lock().output.push(OutputChunk {
            stream: OutputStream::Stdout,
            bytes: Bytes::from(text.to_string()),
        });
        self
    }

    /// Delay every container creation reply; the container exists on the
    /// engine before the reply arrives.
    pub fn with_create_latency(self, latency: Duration) -> Self {
        self.lock().create_latency = latency;
        self
    }

    pub fn with_exec_result(self, result: ExecResult) -> Self {
        self.lock().exec_result = result;
        self
    }

    /// Make `operation` fail until [`FakeEngine::clear_failure`].
    pub fn fail(&self, operation: Operation, reason: &str) {
        self.lock()
            .failures
            .insert(operation, (reason.to_string(), false));
    }

    /// Make the next `operation` fail.
    pub fn fail_once(&self, operation: Operation, reason: &str) {
        self.lock()
            .failures
            .insert(operation, (reason.to_string(), true));
    }

    pub fn clear_failure(&self, operation: Operation) {
        self.lock().failures.remove(&operation);
    }

    /// Every mutating call so far, in order.
    pub fn calls(&self) -> Vec<EngineCall> {
        self.lock().calls.clone()
    }

    pub fn has_container(&self, id: &str) -> bool {
        self.lock().containers.contains_key(id)
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.lock().containers.get(id).is_some_and(|c| c.running)
    }

    pub fn container(&self, id: &str) -> Option<FakeContainer> {
        self.lock().containers.get(id).cloned()
    }

    pub fn container_ids(&self) -> Vec<String> {
        self.lock().containers.keys().cloned().collect()
    }

    pub fn network_names(&self) -> Vec<String> {
        self.lock().networks.values().map(|n| n.name.clone()).collect()
    }

    pub fn volume_names(&self) -> Vec<String> {
        self.lock().volumes.keys().cloned().collect()
    }

    pub fn has_image(&self, reference: &str) -> bool {
        self.lock().images.contains_key(reference)
    }

    /// True when nothing but cached images is left.
    pub fn is_empty(&self) -> bool {
        let state = self.lock();
        state.containers.is_empty() && state.networks.is_empty() && state.volumes.is_empty()
    }

    fn insert_container(&self, spec: &ContainerSpec) -> Result<(String, Duration), EngineError> {
        let mut state = self.lock();
        state.calls.push(EngineCall::CreateContainer(spec.image.clone()));
        Self::check(&mut state, Operation::CreateContainer)?;
        if !state.images.contains_key(&spec.image) {
            return Err(Self::not_found(ResourceKind::Image, &spec.image));
        }

        let mut ports = BTreeMap::new();
        for (port, host) in &spec.port_bindings {
            let host = match host {
                Some(host) => *host,
                None => {
                    let port = state.next_port;
                    state.next_port += 1;
                    port
                }
            };
            ports.insert(port.clone(), host);
        }

        let id = Self::next_id(&mut state, "container");
        state.containers.insert(
            id.clone(),
            FakeContainer {
                spec: spec.clone(),
                running: false,
                ports,
                archives: Vec::new(),
            },
        );
        Ok((id, state.create_latency))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check(state: &mut State, operation: Operation) -> Result<(), EngineError> {
        let Some((reason, once)) = state.failures.get(&operation).cloned() else {
            return Ok(());
        };
        if once {
            state.failures.remove(&operation);
        }
        Err(EngineError::Api {
            status: 500,
            reason,
        })
    }

    fn next_id(state: &mut State, prefix: &str) -> String {
        state.next_id += 1;
        format!("{}-{}", prefix, state.next_id)
    }

    fn not_found(kind: ResourceKind, id: &str) -> EngineError {
        EngineError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    fn container_mut<'a>(
        state: &'a mut State,
        id: &str,
    ) -> Result<&'a mut FakeContainer, EngineError> {
        state
            .containers
            .get_mut(id)
            .ok_or_else(|| Self::not_found(ResourceKind::Container, id))
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn ping(&self) -> Result<(), EngineError> {
        Self::check(&mut self.lock(), Operation::Ping)
    }

    async fn inspect_image(&self, reference: &str) -> Result<Option<LocalImage>, EngineError> {
        let mut state = self.lock();
        Self::check(&mut state, Operation::InspectImage)?;
        Ok(state.images.get(reference).cloned())
    }

    async fn pull_image(&self, reference: &str) -> Result<(), EngineError> {
        let mut state = self.lock();
        state.calls.push(EngineCall::PullImage(reference.to_string()));
        Self::check(&mut state, Operation::PullImage)?;
        if !state.pullable && !state.images.contains_key(reference) {
            return Err(Self::not_found(ResourceKind::Image, reference));
        }
        let id = format!("sha256:{:x}", state.images.len() + 1);
        state
            .images
            .entry(reference.to_string())
            .or_insert_with(|| LocalImage {
                id,
                repo_tags: vec![reference.to_string()],
            });
        Ok(())
    }

    async fn remove_image(&self, reference: &str) -> Result<(), EngineError> {
        let mut state = self.lock();
        state
            .calls
            .push(EngineCall::Remove(ResourceKind::Image, reference.to_string()));
        Self::check(&mut state, Operation::RemoveImage)?;
        state
            .images
            .remove(reference)
            .map(|_| ())
            .ok_or_else(|| Self::not_found(ResourceKind::Image, reference))
    }

    async fn find_network(&self, name: &str) -> Result<Option<String>, EngineError> {
        Ok(self
            .lock()
            .networks
            .iter()
            .find(|(_, n)| n.name == name)
            .map(|(id, _)| id.clone()))
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<String, EngineError> {
        let mut state = self.lock();
        state.calls.push(EngineCall::CreateNetwork(spec.name.clone()));
        Self::check(&mut state, Operation::CreateNetwork)?;
        if state.networks.values().any(|n| n.name == spec.name) {
            return Err(EngineError::Api {
                status: 409,
                reason: format!("network with name {} already exists", spec.name),
            });
        }
        let id = Self::next_id(&mut state, "network");
        state.networks.insert(
            id.clone(),
            FakeObject {
                name: spec.name.clone(),
                labels: spec.labels.clone(),
            },
        );
        Ok(id)
    }

    async fn remove_network(&self, id: &str) -> Result<(), EngineError> {
        let mut state = self.lock();
        state
            .calls
            .push(EngineCall::Remove(ResourceKind::Network, id.to_string()));
        Self::check(&mut state, Operation::RemoveNetwork)?;
        state
            .networks
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Self::not_found(ResourceKind::Network, id))
    }

    async fn create_volume(&self, spec: &VolumeSpec) -> Result<String, EngineError> {
        let mut state = self.lock();
        state.calls.push(EngineCall::CreateVolume(spec.name.clone()));
        Self::check(&mut state, Operation::CreateVolume)?;
        state.volumes.insert(
            spec.name.clone(),
            FakeObject {
                name: spec.name.clone(),
                labels: spec.labels.clone(),
            },
        );
        Ok(spec.name.clone())
    }

    async fn remove_volume(&self, name: &str) -> Result<(), EngineError> {
        let mut state = self.lock();
        state
            .calls
            .push(EngineCall::Remove(ResourceKind::Volume, name.to_string()));
        Self::check(&mut state, Operation::RemoveVolume)?;
        state
            .volumes
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Self::not_found(ResourceKind::Volume, name))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        let (id, latency) = self.insert_container(spec)?;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        Ok(id)
    }

    async fn upload_archive(&self, id: &str, archive: Bytes) -> Result<(), EngineError> {
        let mut state = self.lock();
        state.calls.push(EngineCall::UploadArchive(id.to_string()));
        Self::check(&mut state, Operation::UploadArchive)?;
        Self::container_mut(&mut state, id)?.archives.push(archive);
        Ok(())
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        let mut state = self.lock();
        state.calls.push(EngineCall::StartContainer(id.to_string()));
        Self::check(&mut state, Operation::StartContainer)?;
        Self::container_mut(&mut state, id)?.running = true;
        Ok(())
    }

    async fn stop_container(&self, id: &str, _grace: Duration) -> Result<(), EngineError> {
        let mut state = self.lock();
        state.calls.push(EngineCall::StopContainer(id.to_string()));
        Self::check(&mut state, Operation::StopContainer)?;
        Self::container_mut(&mut state, id)?.running = false;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        let mut state = self.lock();
        state
            .calls
            .push(EngineCall::Remove(ResourceKind::Container, id.to_string()));
        Self::check(&mut state, Operation::RemoveContainer)?;
        state
            .containers
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Self::not_found(ResourceKind::Container, id))
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerStatus, EngineError> {
        let mut state = self.lock();
        Self::check(&mut state, Operation::InspectContainer)?;
        let container = Self::container_mut(&mut state, id)?;
        Ok(ContainerStatus {
            running: container.running,
            exit_code: (!container.running).then_some(0),
            ports: container.ports.clone(),
        })
    }

    async fn exec(&self, id: &str, command: &[String]) -> Result<ExecResult, EngineError> {
        let mut state = self.lock();
        state
            .calls
            .push(EngineCall::Exec(id.to_string(), command.to_vec()));
        Self::check(&mut state, Operation::Exec)?;
        Self::container_mut(&mut state, id)?;
        Ok(state.exec_result.clone())
    }

    async fn follow_output(
        &self,
        id: &str,
        sink: mpsc::UnboundedSender<OutputChunk>,
    ) -> Result<(), EngineError> {
        let mut state = self.lock();
        state.calls.push(EngineCall::FollowOutput(id.to_string()));
        Self::check(&mut state, Operation::FollowOutput)?;
        Self::container_mut(&mut state, id)?;
        for chunk in &state.output {
            let _ = sink.send(chunk.clone());
        }
        Ok(())
    }

    async fn list_labelled(
        &self,
        kind: ResourceKind,
        key: &str,
        value: &str,
    ) -> Result<Vec<String>, EngineError> {
        let mut state = self.lock();
        Self::check(&mut state, Operation::List)?;
        let matches = |labels: &BTreeMap<String, String>| labels.get(key).is_some_and(|v| v == value);
        let ids = match kind {
            ResourceKind::Container => state
                .containers
                .iter()
                .filter(|(_, c)| matches(&c.spec.labels))
                .map(|(id, _)| id.clone())
                .collect(),
            ResourceKind::Network => state
                .networks
                .iter()
                .filter(|(_, n)| matches(&n.labels))
                .map(|(id, _)| id.clone())
                .collect(),
            ResourceKind::Volume => state
                .volumes
                .iter()
                .filter(|(_, v)| matches(&v.labels))
                .map(|(id, _)| id.clone())
                .collect(),
            ResourceKind::Image => Vec::new(),
        };
        Ok(ids)
    }
}
