//! Scoped handles over realized resources.
//!
//! Disposal is idempotent and never fails: every problem is recorded in the
//! returned [`DisposalReport`]. Dropping the last clone of a handle that was
//! not disposed spawns a best-effort disposal on the current runtime; the
//! reaper covers whatever that misses.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::OnceCell;

use crate::builder::Definition;
use crate::cancel::CancelToken;
use crate::configuration::ContainerConfiguration;
use crate::configuration::container::normalize_port;
use crate::engine::{ContainerEngine, ExecResult};
use crate::error::{EngineError, Error, Result};
use crate::orchestrator::bring_up;
use crate::orchestrator::output::OutputBuffer;
use crate::resource::{Resource, ResourceKind, ResourceState};
use crate::wait::{PollPolicy, ProbeError, WaitTarget};

/// Whether the reaper backs this handle's session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "reason")]
pub enum ReaperStatus {
    /// A live reaper session watches the session label.
    Covered,
    /// Turned off by configuration.
    Disabled,
    /// The reaper could not be reached; cleanup relies on disposal only.
    Degraded(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisposalFailure {
    pub kind: ResourceKind,
    pub id: String,
    pub reason: String,
}

/// Outcome of disposing a handle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DisposalReport {
    /// Objects removed, in removal order.
    pub removed: Vec<(ResourceKind, String)>,
    pub failures: Vec<DisposalFailure>,
}

impl DisposalReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, kind: ResourceKind, id: &str, result: std::result::Result<(), EngineError>) {
        match result {
            Ok(()) => self.removed.push((kind, id.to_string())),
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                tracing::warn!("Failed to remove {} {}: {}", kind, id, e);
                self.failures.push(DisposalFailure {
                    kind,
                    id: id.to_string(),
                    reason: e.to_string(),
                });
            }
        }
    }
}

/// An engine object created on behalf of a container, removed with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct OwnedResource {
    pub kind: ResourceKind,
    pub id: String,
}

/// Stop and remove a container, then its owned resources in reverse order.
async fn dispose_container(
    engine: &dyn ContainerEngine,
    id: &str,
    stop_timeout: Duration,
    owned: &[OwnedResource],
) -> DisposalReport {
    let mut report = DisposalReport::default();

    match engine.stop_container(id, stop_timeout).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {}
        Err(e) => tracing::debug!("Stop of {} failed, removing anyway: {}", id, e),
    }
    report.record(ResourceKind::Container, id, engine.remove_container(id).await);

    for resource in owned.iter().rev() {
        let result = engine.remove(resource.kind, &resource.id).await;
        report.record(resource.kind, &resource.id, result);
    }
    report
}

fn lock(resource: &Mutex<Resource>) -> std::sync::MutexGuard<'_, Resource> {
    resource.lock().unwrap_or_else(|e| e.into_inner())
}

/// Record the end of a resource's life; `Error` stays `Error`.
fn finish(resource: &Mutex<Resource>, report: &DisposalReport) {
    let mut resource = lock(resource);
    if resource.state == ResourceState::Error {
        return;
    }
    if matches!(resource.state, ResourceState::Started | ResourceState::Ready) {
        let _ = resource.transition_to(ResourceState::Stopped, None);
    }
    let reason = (!report.is_clean()).then(|| format!("{} failure(s)", report.failures.len()));
    let _ = resource.transition_to(ResourceState::Removed, reason);
}

/// What a created container still needs to come up.
pub(crate) struct Startup {
    pub(crate) definition: Definition<ContainerConfiguration>,
    pub(crate) wait: PollPolicy,
}

pub(crate) struct ContainerInner {
    pub(crate) engine: Arc<dyn ContainerEngine>,
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) host: String,
    pub(crate) stop_timeout: Duration,
    pub(crate) resource: Mutex<Resource>,
    pub(crate) ports: Mutex<BTreeMap<String, u16>>,
    pub(crate) output: OutputBuffer,
    pub(crate) owned: Vec<OwnedResource>,
    pub(crate) reaper: ReaperStatus,
    /// Taken by the first `start`.
    pub(crate) startup: Mutex<Option<Startup>>,
    pub(crate) disposal: OnceCell<DisposalReport>,
}

impl Drop for ContainerInner {
    fn drop(&mut self) {
        if self.disposal.initialized() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                tracing::debug!("Container {} dropped without dispose, cleaning up", self.name);
                let engine = self.engine.clone();
                let id = std::mem::take(&mut self.id);
                let owned = std::mem::take(&mut self.owned);
                let stop_timeout = self.stop_timeout;
                runtime.spawn(async move {
                    dispose_container(engine.as_ref(), &id, stop_timeout, &owned).await;
                });
            }
            Err(_) => tracing::warn!(
                "Container {} dropped outside a runtime; leaving it to the reaper",
                self.name
            ),
        }
    }
}

/// A realized container. Clones share the same container.
#[derive(Clone)]
pub struct ContainerHandle {
    pub(crate) inner: Arc<ContainerInner>,
}

impl std::fmt::Debug for ContainerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerHandle")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

impl ContainerHandle {
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Host on which mapped ports are reachable.
    pub fn host(&self) -> &str {
        &self.inner.host
    }

    pub fn state(&self) -> ResourceState {
        lock(&self.inner.resource).state
    }

    /// Snapshot including the transition history.
    pub fn resource(&self) -> Resource {
        lock(&self.inner.resource).clone()
    }

    pub fn reaper_status(&self) -> &ReaperStatus {
        &self.inner.reaper
    }

    /// Combined output captured so far.
    pub fn output(&self) -> String {
        self.inner.output.contents()
    }

    /// Host port bound to a TCP container port.
    pub async fn mapped_port(&self, container_port: u16) -> Result<u16> {
        self.mapped_port_for(&container_port.to_string()).await
    }

    /// Host port bound to a container port, e.g. `"53/udp"`.
    pub async fn mapped_port_for(&self, container_port: &str) -> Result<u16> {
        let key = normalize_port(container_port);
        if let Some(port) = self.cached_port(&key) {
            return Ok(port);
        }

        let status = self.inner.engine.inspect_container(&self.inner.id).await?;
        let port = status.ports.get(&key).copied();
        *self.inner.ports.lock().unwrap_or_else(|e| e.into_inner()) = status.ports;
        port.ok_or_else(|| {
            EngineError::NotFound {
                kind: ResourceKind::Container,
                id: format!("{} port {}", self.inner.name, key),
            }
            .into()
        })
    }

    fn cached_port(&self, key: &str) -> Option<u16> {
        self.inner
            .ports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .copied()
    }

    /// Run a command inside the container.
    pub async fn exec<I, S>(&self, command: I) -> Result<ExecResult>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let command: Vec<String> = command.into_iter().map(Into::into).collect();
        Ok(self.inner.engine.exec(&self.inner.id, &command).await?)
    }

    /// Copy resource mappings, attach output, start, wait for readiness and
    /// run startup callbacks.
    ///
    /// Only a `Created` container can be started, once. A failure rolls the
    /// container back: it is disposed, its state stays `Error`, and the
    /// original error is returned.
    pub async fn start(&self, cancel: &CancelToken) -> Result<()> {
        self.check_transition(ResourceState::Started)?;
        let startup = self
            .inner
            .startup
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(startup) = startup else {
            return Err(self.invalid_transition(ResourceState::Started));
        };

        if let Err(e) = bring_up(self, &startup.definition, &startup.wait, cancel).await {
            tracing::warn!("Container {} failed to come up, rolling back: {}", self.name(), e);
            self.mark_failed(e.to_string());
            let report = self.dispose().await;
            if !report.is_clean() {
                tracing::warn!(
                    "Rollback of {} left {} object(s) behind",
                    self.name(),
                    report.failures.len()
                );
            }
            return Err(e);
        }

        tracing::info!("Container {} is ready", self.name());
        Ok(())
    }

    /// Stop the container, keeping it on the engine until disposal.
    ///
    /// States only move forward, so a stopped container cannot be started
    /// again.
    pub async fn stop(&self) -> Result<()> {
        self.check_transition(ResourceState::Stopped)?;
        self.inner
            .engine
            .stop_container(&self.inner.id, self.inner.stop_timeout)
            .await?;
        self.transition(ResourceState::Stopped, None);
        tracing::debug!("Stopped container {}", self.inner.name);
        Ok(())
    }

    fn check_transition(&self, to: ResourceState) -> Result<()> {
        if self.is_disposed() || !self.state().can_transition_to(to) {
            return Err(self.invalid_transition(to));
        }
        Ok(())
    }

    fn invalid_transition(&self, to: ResourceState) -> Error {
        Error::InvalidTransition {
            kind: ResourceKind::Container,
            name: self.inner.name.clone(),
            from: self.state(),
            to,
        }
    }

    /// Stop and remove the container and anything created for it.
    ///
    /// Safe to call repeatedly and concurrently; every caller gets the report
    /// of the single disposal that ran.
    pub async fn dispose(&self) -> DisposalReport {
        self.inner
            .disposal
            .get_or_init(|| async {
                tracing::debug!("Disposing container {}", self.inner.name);
                let report = dispose_container(
                    self.inner.engine.as_ref(),
                    &self.inner.id,
                    self.inner.stop_timeout,
                    &self.inner.owned,
                )
                .await;
                finish(&self.inner.resource, &report);
                report
            })
            .await
            .clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposal.initialized()
    }

    pub(crate) fn transition(&self, state: ResourceState, reason: Option<String>) {
        if let Err(e) = lock(&self.inner.resource).transition_to(state, reason) {
            tracing::debug!("{}", e);
        }
    }

    pub(crate) fn mark_failed(&self, reason: impl Into<String>) {
        lock(&self.inner.resource).mark_failed(reason);
    }

    /// Hand the container over to its own lifecycle; dispose becomes a no-op.
    pub(crate) fn detach(&self) {
        let _ = self.inner.disposal.set(DisposalReport::default());
    }
}

#[async_trait]
impl WaitTarget for ContainerHandle {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn host(&self) -> &str {
        &self.inner.host
    }

    async fn mapped_port(&self, container_port: &str) -> std::result::Result<u16, ProbeError> {
        self.mapped_port_for(container_port)
            .await
            .map_err(|e| ProbeError(e.to_string()))
    }

    async fn exec(&self, command: &[String]) -> std::result::Result<ExecResult, ProbeError> {
        Ok(self.inner.engine.exec(&self.inner.id, command).await?)
    }

    fn output(&self) -> String {
        self.inner.output.contents()
    }
}

pub(crate) struct ResourceInner {
    pub(crate) engine: Arc<dyn ContainerEngine>,
    pub(crate) kind: ResourceKind,
    pub(crate) id: String,
    pub(crate) name: String,
    /// Images resolved without `remove_on_dispose` are left in place.
    pub(crate) remove_on_dispose: bool,
    pub(crate) resource: Mutex<Resource>,
    pub(crate) reaper: ReaperStatus,
    pub(crate) disposal: OnceCell<DisposalReport>,
}

impl Drop for ResourceInner {
    fn drop(&mut self) {
        if self.disposal.initialized() || !self.remove_on_dispose {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let engine = self.engine.clone();
                let (kind, id) = (self.kind, std::mem::take(&mut self.id));
                runtime.spawn(async move {
                    if let Err(e) = engine.remove(kind, &id).await
                        && !e.is_not_found()
                    {
                        tracing::warn!("Failed to remove dropped {} {}: {}", kind, id, e);
                    }
                });
            }
            Err(_) => tracing::warn!(
                "{} {} dropped outside a runtime; leaving it to the reaper",
                self.kind,
                self.name
            ),
        }
    }
}

/// A realized network, volume, or image.
#[derive(Clone)]
pub struct ResourceHandle {
    pub(crate) inner: Arc<ResourceInner>,
}

pub type NetworkHandle = ResourceHandle;
pub type VolumeHandle = ResourceHandle;
pub type ImageHandle = ResourceHandle;

impl std::fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("kind", &self.inner.kind)
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish()
    }
}

impl ResourceHandle {
    pub fn kind(&self) -> ResourceKind {
        self.inner.kind
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> ResourceState {
        lock(&self.inner.resource).state
    }

    pub fn resource(&self) -> Resource {
        lock(&self.inner.resource).clone()
    }

    pub fn reaper_status(&self) -> &ReaperStatus {
        &self.inner.reaper
    }

    /// Remove the object. Idempotent; never fails.
    ///
    /// An image resolved without `remove_on_dispose` is only released: it
    /// stays on the engine and its state is left as it was.
    pub async fn dispose(&self) -> DisposalReport {
        self.inner
            .disposal
            .get_or_init(|| async {
                let mut report = DisposalReport::default();
                if !self.inner.remove_on_dispose {
                    tracing::debug!(
                        "Releasing {} {} without removing it",
                        self.inner.kind,
                        self.inner.name
                    );
                    return report;
                }
                let result = self.inner.engine.remove(self.inner.kind, &self.inner.id).await;
                report.record(self.inner.kind, &self.inner.id, result);
                finish(&self.inner.resource, &report);
                report
            })
            .await
            .clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposal.initialized()
    }
}
