//! Realizes validated definitions on a container engine.
//!
//! Every object an [`Orchestrator`] creates carries the session labels. The
//! first realization lazily links the session to a reaper (an explicit
//! address, or a sidecar started on demand); when that fails the session
//! runs degraded and relies on disposal alone. The link belongs to the
//! session: every orchestrator of one session in this process shares it,
//! and it closes when the last of them is dropped.
//!
//! Starting a container walks the steps below. A failure at any step rolls
//! back what was created so far and surfaces the original error.
//!
//! 1. Create missing networks, pull the image per its policy.
//! 2. Create the container with the session labels.
//! 3. Copy resource mappings into it.
//! 4. Attach output consumers, then start it.
//! 5. Run wait strategies in order.
//! 6. Run startup callbacks in order.
//!
//! [`Orchestrator::create_container`] stops after step 2; the returned
//! handle's [`ContainerHandle::start`] runs the rest.

mod handle;
pub mod output;

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use bytes::Bytes;
use tokio::sync::{OnceCell, mpsc};

pub use handle::{
    ContainerHandle, DisposalFailure, DisposalReport, ImageHandle, NetworkHandle, ReaperStatus,
    ResourceHandle, VolumeHandle,
};

use crate::builder::Definition;
use crate::cancel::CancelToken;
use crate::config::DockyardConfig;
use crate::configuration::{
    ContainerConfiguration, ImageConfiguration, NetworkConfiguration, NetworkDriver,
    ResourceMapping, VolumeConfiguration,
};
use crate::engine::{ContainerEngine, ContainerSpec, DockerEngine, NetworkSpec, VolumeSpec};
use crate::error::{Error, Result};
use crate::orchestrator::handle::{ContainerInner, OwnedResource, ResourceInner, Startup};
use crate::orchestrator::output::{OutputBuffer, OutputConsumer, TracingConsumer};
use crate::reaper::ReaperSession;
use crate::reaper::sidecar::{REAPER_PORT, reaper_container};
use crate::resource::{Resource, ResourceKind, ResourceState};
use crate::session::Session;
use crate::wait::{PollPolicy, wait_for_all};

struct ReaperLink {
    status: ReaperStatus,
    session: Option<ReaperSession>,
    sidecar: Option<ContainerHandle>,
}

type SharedLink = Arc<OnceCell<ReaperLink>>;

/// The reaper link of `session`, shared with every live orchestrator of it.
fn session_link(session: Session) -> SharedLink {
    static LINKS: OnceLock<Mutex<HashMap<Session, Weak<OnceCell<ReaperLink>>>>> =
        OnceLock::new();

    let mut links = LINKS
        .get_or_init(Default::default)
        .lock()
        .unwrap_or_else(|e| e.into_inner());
    links.retain(|_, link| link.strong_count() > 0);
    if let Some(link) = links.get(&session).and_then(Weak::upgrade) {
        return link;
    }
    let link = Arc::new(OnceCell::new());
    links.insert(session, Arc::downgrade(&link));
    link
}

struct OrchestratorInner {
    engine: Arc<dyn ContainerEngine>,
    session: Session,
    config: DockyardConfig,
    reaper: SharedLink,
}

/// Entry point for realizing definitions. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("session", &self.inner.session)
            .field("host", &self.inner.config.host)
            .finish()
    }
}

/// Who a container is realized for.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Scope {
    /// A regular container carrying the session labels.
    Session,
    /// The reaper sidecar: no session labels, no reaper link.
    Reaper,
}

impl Orchestrator {
    /// An orchestrator for the process-wide session.
    pub fn new(engine: Arc<dyn ContainerEngine>, config: DockyardConfig) -> Self {
        Self::with_session(engine, config, Session::current())
    }

    pub fn with_session(
        engine: Arc<dyn ContainerEngine>,
        config: DockyardConfig,
        session: Session,
    ) -> Self {
        Self {
            inner: Arc::new(OrchestratorInner {
                engine,
                session,
                config,
                reaper: session_link(session),
            }),
        }
    }

    /// Connect to the local Docker daemon with settings from the environment.
    pub async fn connect() -> Result<Self> {
        let config = DockyardConfig::from_env()?;
        let engine = DockerEngine::connect().await?;
        engine.ping().await?;
        Ok(Self::new(Arc::new(engine), config))
    }

    pub fn session(&self) -> Session {
        self.inner.session
    }

    pub fn config(&self) -> &DockyardConfig {
        &self.inner.config
    }

    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.inner.engine
    }

    /// Reaper coverage for this session, linking it on first use.
    ///
    /// The first orchestrator of a session to link decides how: its reaper
    /// settings are used, later orchestrators join the existing link.
    pub async fn reaper_status(&self) -> ReaperStatus {
        self.reaper().await.status.clone()
    }

    async fn reaper(&self) -> &ReaperLink {
        self.inner.reaper.get_or_init(|| self.link_reaper()).await
    }

    async fn link_reaper(&self) -> ReaperLink {
        let settings = &self.inner.config.reaper;
        if settings.disabled {
            tracing::info!("Reaper disabled; resources are only removed on dispose");
            return ReaperLink {
                status: ReaperStatus::Disabled,
                session: None,
                sidecar: None,
            };
        }

        match self.connect_reaper().await {
            Ok((session, sidecar)) => ReaperLink {
                status: ReaperStatus::Covered,
                session: Some(session),
                sidecar,
            },
            Err(e) => {
                tracing::warn!(
                    "Reaper unavailable, session {} is not crash-safe: {}",
                    self.inner.session,
                    e
                );
                ReaperLink {
                    status: ReaperStatus::Degraded(e.to_string()),
                    session: None,
                    sidecar: None,
                }
            }
        }
    }

    async fn connect_reaper(&self) -> Result<(ReaperSession, Option<ContainerHandle>)> {
        let settings = &self.inner.config.reaper;
        let (addr, sidecar) = match &settings.addr {
            Some(addr) => (addr.clone(), None),
            None => {
                let definition = reaper_container(settings, &self.inner.session).build()?;
                let sidecar = self
                    .realize_container(
                        &definition,
                        &CancelToken::never(),
                        Scope::Reaper,
                        ReaperStatus::Disabled,
                    )
                    .await?;
                // The sidecar outlives this process and removes itself.
                sidecar.detach();
                let port = sidecar.mapped_port(REAPER_PORT).await?;
                (format!("{}:{}", sidecar.host(), port), Some(sidecar))
            }
        };

        let session = ReaperSession::connect(
            &addr,
            &[self.inner.session.filter()],
            settings.connect_timeout,
        )
        .await?;
        Ok((session, sidecar))
    }

    /// Gracefully end the session's reaper link, for every orchestrator of
    /// the session. The reaper prunes nothing after a graceful close; objects
    /// not yet disposed stay behind.
    pub async fn close(&self) -> Result<()> {
        if let Some(link) = self.inner.reaper.get()
            && let Some(session) = &link.session
        {
            session.shutdown().await?;
            if let Some(sidecar) = &link.sidecar {
                tracing::debug!("Reaper sidecar {} will exit on its own", sidecar.name());
            }
        }
        Ok(())
    }

    fn labels(&self, user: &BTreeMap<String, String>, scope: Scope) -> BTreeMap<String, String> {
        let mut labels = user.clone();
        if scope == Scope::Session {
            labels.extend(self.inner.session.labels());
        }
        labels
    }

    /// Create a network.
    pub async fn create_network(
        &self,
        definition: &Definition<NetworkConfiguration>,
    ) -> Result<NetworkHandle> {
        let reaper = self.reaper_status().await;
        let name = definition.name.clone().unwrap_or_default();
        let spec = NetworkSpec {
            name: name.clone(),
            driver: definition
                .driver
                .as_ref()
                .unwrap_or(&NetworkDriver::Bridge)
                .as_str()
                .to_string(),
            options: definition.options.clone(),
            labels: self.labels(&definition.labels, Scope::Session),
        };

        let mut resource = Resource::unrealized(ResourceKind::Network, &name, spec.labels.clone());
        let id = self
            .inner
            .engine
            .create_network(&spec)
            .await
            .map_err(|e| Error::CreateResource {
                kind: ResourceKind::Network,
                name: name.clone(),
                reason: e.to_string(),
            })?;
        let _ = resource.mark_created(&id);
        tracing::debug!("Created network {} ({})", name, id);

        Ok(self.resource_handle(ResourceKind::Network, id, name, true, resource, reaper))
    }

    /// Create a named volume.
    pub async fn create_volume(
        &self,
        definition: &Definition<VolumeConfiguration>,
    ) -> Result<VolumeHandle> {
        let reaper = self.reaper_status().await;
        let name = definition.name.clone().unwrap_or_default();
        let spec = VolumeSpec {
            name: name.clone(),
            driver: definition.driver.clone(),
            driver_options: definition.driver_options.clone(),
            labels: self.labels(&definition.labels, Scope::Session),
        };

        let mut resource = Resource::unrealized(ResourceKind::Volume, &name, spec.labels.clone());
        let id = self
            .inner
            .engine
            .create_volume(&spec)
            .await
            .map_err(|e| Error::CreateResource {
                kind: ResourceKind::Volume,
                name: name.clone(),
                reason: e.to_string(),
            })?;
        let _ = resource.mark_created(&id);
        tracing::debug!("Created volume {}", name);

        Ok(self.resource_handle(ResourceKind::Volume, id, name, true, resource, reaper))
    }

    /// Make an image available locally according to its pull policy.
    pub async fn resolve_image(
        &self,
        definition: &Definition<ImageConfiguration>,
    ) -> Result<ImageHandle> {
        let reaper = self.reaper_status().await;
        let reference = definition.reference.clone().unwrap_or_default();
        let mut resource =
            Resource::unrealized(ResourceKind::Image, &reference, definition.labels.clone());

        let policy = definition.pull_policy.clone().unwrap_or_default();
        self.ensure_image(&reference, &policy).await?;

        let image = self
            .inner
            .engine
            .inspect_image(&reference)
            .await?
            .ok_or_else(|| Error::CreateResource {
                kind: ResourceKind::Image,
                name: reference.clone(),
                reason: format!("not present locally and {:?} forbids pulling", policy),
            })?;
        let _ = resource.mark_created(&image.id);

        Ok(self.resource_handle(
            ResourceKind::Image,
            reference.clone(),
            reference,
            definition.remove_on_dispose,
            resource,
            reaper,
        ))
    }

    fn resource_handle(
        &self,
        kind: ResourceKind,
        id: String,
        name: String,
        remove_on_dispose: bool,
        resource: Resource,
        reaper: ReaperStatus,
    ) -> ResourceHandle {
        ResourceHandle {
            inner: Arc::new(ResourceInner {
                engine: self.inner.engine.clone(),
                kind,
                id,
                name,
                remove_on_dispose,
                resource: Mutex::new(resource),
                reaper,
                disposal: OnceCell::new(),
            }),
        }
    }

    async fn ensure_image(
        &self,
        reference: &str,
        policy: &crate::configuration::PullPolicy,
    ) -> Result<()> {
        let image_error = |e: crate::error::EngineError| Error::CreateResource {
            kind: ResourceKind::Image,
            name: reference.to_string(),
            reason: e.to_string(),
        };

        let cached = self
            .inner
            .engine
            .inspect_image(reference)
            .await
            .map_err(image_error)?;
        if policy.should_pull(cached.as_ref()) {
            tracing::info!("Pulling image {}", reference);
            self.inner
                .engine
                .pull_image(reference)
                .await
                .map_err(image_error)?;
        }
        Ok(())
    }

    /// Realize a container definition. See the module docs for the steps.
    pub async fn start_container(
        &self,
        definition: &Definition<ContainerConfiguration>,
        cancel: &CancelToken,
    ) -> Result<ContainerHandle> {
        let reaper = self.reaper_status().await;
        self.realize_container(definition, cancel, Scope::Session, reaper)
            .await
    }

    /// Create a container without starting it; the handle is `Created`.
    pub async fn create_container(
        &self,
        definition: &Definition<ContainerConfiguration>,
        cancel: &CancelToken,
    ) -> Result<ContainerHandle> {
        let reaper = self.reaper_status().await;
        self.create_handle(definition, cancel, Scope::Session, reaper)
            .await
    }

    async fn realize_container(
        &self,
        definition: &Definition<ContainerConfiguration>,
        cancel: &CancelToken,
        scope: Scope,
        reaper: ReaperStatus,
    ) -> Result<ContainerHandle> {
        let handle = self.create_handle(definition, cancel, scope, reaper).await?;
        handle.start(cancel).await?;
        Ok(handle)
    }

    async fn create_handle(
        &self,
        definition: &Definition<ContainerConfiguration>,
        cancel: &CancelToken,
        scope: Scope,
        reaper: ReaperStatus,
    ) -> Result<ContainerHandle> {
        let configuration: &ContainerConfiguration = definition;
        let image = configuration.image.clone().unwrap_or_default();
        let mut owned = Vec::new();

        let spec = match self
            .prepare(configuration, &image, scope, cancel, &mut owned)
            .await
        {
            Ok(spec) => spec,
            Err(e) => {
                self.remove_owned(&owned).await;
                return Err(e);
            }
        };

        // Creation is never abandoned halfway: a dropped request could leave
        // a container behind whose id nobody knows.
        let created = self
            .inner
            .engine
            .create_container(&spec)
            .await
            .map_err(|e| Error::CreateResource {
                kind: ResourceKind::Container,
                name: spec.name.clone().unwrap_or_else(|| image.clone()),
                reason: e.to_string(),
            });
        let id = match created {
            Ok(id) => id,
            Err(e) => {
                self.remove_owned(&owned).await;
                return Err(e);
            }
        };
        if cancel.is_cancelled() {
            tracing::debug!("Cancelled while creating {}, removing it", id);
            if let Err(e) = self.inner.engine.remove_container(&id).await
                && !e.is_not_found()
            {
                tracing::warn!("Failed to roll back container {}: {}", id, e);
            }
            self.remove_owned(&owned).await;
            return Err(Error::Cancelled {
                during: "creating the container".to_string(),
            });
        }

        let name = configuration
            .name
            .clone()
            .unwrap_or_else(|| id.chars().take(12).collect());
        let mut resource = Resource::unrealized(
            ResourceKind::Container,
            &name,
            self.labels(&configuration.labels, scope),
        );
        let _ = resource.mark_created(&id);
        tracing::debug!("Created container {} ({}) from {}", name, id, image);

        Ok(ContainerHandle {
            inner: Arc::new(ContainerInner {
                engine: self.inner.engine.clone(),
                id,
                name,
                host: self.inner.config.host.clone(),
                stop_timeout: self.inner.config.stop_timeout,
                resource: Mutex::new(resource),
                ports: Mutex::new(BTreeMap::new()),
                output: OutputBuffer::new(),
                owned,
                reaper,
                startup: Mutex::new(Some(Startup {
                    definition: definition.clone(),
                    wait: self.inner.config.wait,
                })),
                disposal: OnceCell::new(),
            }),
        })
    }

    /// Networks and image; returns the assembled creation spec.
    async fn prepare(
        &self,
        configuration: &ContainerConfiguration,
        image: &str,
        scope: Scope,
        cancel: &CancelToken,
        owned: &mut Vec<OwnedResource>,
    ) -> Result<ContainerSpec> {
        for network in &configuration.networks {
            let existing = cancellable(cancel, "resolving networks", async {
                self.inner
                    .engine
                    .find_network(network)
                    .await
                    .map_err(Error::from)
            })
            .await?;
            if existing.is_some() {
                continue;
            }

            let spec = NetworkSpec {
                name: network.clone(),
                driver: NetworkDriver::Bridge.as_str().to_string(),
                options: BTreeMap::new(),
                labels: self.labels(&BTreeMap::new(), scope),
            };
            let id = self
                .inner
                .engine
                .create_network(&spec)
                .await
                .map_err(|e| Error::CreateResource {
                    kind: ResourceKind::Network,
                    name: network.clone(),
                    reason: e.to_string(),
                })?;
            tracing::debug!("Created network {} for container", network);
            owned.push(OwnedResource {
                kind: ResourceKind::Network,
                id,
            });
        }

        let policy = configuration.pull_policy.clone().unwrap_or_default();
        cancellable(cancel, "pulling the image", self.ensure_image(image, &policy)).await?;

        Ok(ContainerSpec {
            name: configuration.name.clone(),
            image: image.to_string(),
            hostname: configuration.hostname.clone(),
            mac_address: configuration.mac_address.clone(),
            working_dir: configuration.working_dir.clone(),
            entrypoint: configuration.entrypoint.clone(),
            command: configuration.command.clone(),
            env: configuration
                .env
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect(),
            exposed_ports: configuration.exposed_ports.keys().cloned().collect(),
            port_bindings: configuration
                .port_bindings
                .iter()
                .map(|(port, host)| (port.clone(), host.parse().ok()))
                .collect(),
            mounts: configuration.mounts.clone(),
            labels: self.labels(&configuration.labels, scope),
            networks: configuration.networks.clone(),
            network_aliases: configuration.network_aliases.clone(),
            privileged: configuration.privileged,
            auto_remove: configuration.auto_remove,
        })
    }

    async fn remove_owned(&self, owned: &[OwnedResource]) {
        for resource in owned.iter().rev() {
            if let Err(e) = self.inner.engine.remove(resource.kind, &resource.id).await
                && !e.is_not_found()
            {
                tracing::warn!("Failed to roll back {} {}: {}", resource.kind, resource.id, e);
            }
        }
    }
}

/// Steps after creation: copy, attach, start, wait, callbacks.
async fn bring_up(
    handle: &ContainerHandle,
    configuration: &ContainerConfiguration,
    wait: &PollPolicy,
    cancel: &CancelToken,
) -> Result<()> {
    let engine = &handle.inner.engine;
    let start_error = |reason: String| Error::Start {
        name: handle.name().to_string(),
        reason,
    };

    if !configuration.resource_mappings.is_empty() {
        let archive = mapping_archive(&configuration.resource_mappings).map_err(|e| {
            Error::CreateResource {
                kind: ResourceKind::Container,
                name: handle.name().to_string(),
                reason: format!("failed to pack resource mappings: {}", e),
            }
        })?;
        cancellable(cancel, "copying resource mappings", async {
            engine
                .upload_archive(handle.id(), archive)
                .await
                .map_err(|e| Error::CreateResource {
                    kind: ResourceKind::Container,
                    name: handle.name().to_string(),
                    reason: format!("failed to copy resource mappings: {}", e),
                })
        })
        .await?;
    }

    let (tx, rx) = mpsc::unbounded_channel();
    engine
        .follow_output(handle.id(), tx)
        .await
        .map_err(|e| start_error(format!("failed to attach output: {}", e)))?;
    let mut consumers: Vec<Arc<dyn OutputConsumer>> = vec![
        Arc::new(handle.inner.output.clone()),
        Arc::new(TracingConsumer::new(handle.name())),
    ];
    consumers.extend(configuration.output_consumers.iter().cloned());
    tokio::spawn(forward_output(rx, consumers));

    cancellable(cancel, "starting the container", async {
        engine
            .start_container(handle.id())
            .await
            .map_err(|e| start_error(e.to_string()))
    })
    .await?;
    handle.transition(ResourceState::Started, None);

    wait_for_all(&configuration.wait_strategies, wait, handle, cancel).await?;
    handle.transition(ResourceState::Ready, None);

    for callback in configuration.startup_callbacks.iter() {
        cancellable(cancel, "running startup callbacks", async {
            callback(handle.clone())
                .await
                .map_err(|e| start_error(format!("startup callback failed: {:#}", e)))
        })
        .await?;
    }
    Ok(())
}

/// Race `future` against cancellation.
async fn cancellable<T>(
    cancel: &CancelToken,
    during: &str,
    future: impl Future<Output = Result<T>>,
) -> Result<T> {
    let cancelled = || Error::Cancelled {
        during: during.to_string(),
    };
    if cancel.is_cancelled() {
        return Err(cancelled());
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(cancelled()),
        result = future => result,
    }
}

async fn forward_output(
    mut rx: mpsc::UnboundedReceiver<crate::engine::OutputChunk>,
    consumers: Vec<Arc<dyn OutputConsumer>>,
) {
    while let Some(chunk) = rx.recv().await {
        for consumer in &consumers {
            consumer.consume(&chunk);
        }
    }
}

/// Pack resource mappings into a tar archive rooted at `/`.
fn mapping_archive(mappings: &BTreeMap<String, ResourceMapping>) -> std::io::Result<Bytes> {
    let mut archive = tar::Builder::new(Vec::new());
    for (target, mapping) in mappings {
        let mut header = tar::Header::new_gnu();
        header.set_size(mapping.contents.len() as u64);
        header.set_mode(mapping.mode);
        header.set_mtime(0);
        header.set_cksum();
        archive.append_data(
            &mut header,
            target.trim_start_matches('/'),
            mapping.contents.as_ref(),
        )?;
    }
    Ok(Bytes::from(archive.into_inner()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_mapping_archive_strips_leading_slash_and_keeps_mode() {
        let mappings = BTreeMap::from([(
            "/etc/app/config.toml".to_string(),
            ResourceMapping::from_bytes("port = 1").with_mode(0o600),
        )]);
        let bytes = mapping_archive(&mappings).unwrap();

        let mut archive = tar::Archive::new(bytes.as_ref());
        let mut entries = archive.entries().unwrap();
        let mut entry = entries.next().unwrap().unwrap();
        assert_eq!(entry.path().unwrap().to_str(), Some("etc/app/config.toml"));
        assert_eq!(entry.header().mode().unwrap(), 0o600);
        let mut contents = String::new();
        entry.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "port = 1");
        assert!(entries.next().is_none());
    }

    #[test]
    fn test_orchestrators_of_one_session_share_the_link() {
        let engine: Arc<dyn ContainerEngine> = Arc::new(crate::testing::FakeEngine::new());
        let session = Session::new();
        let a = Orchestrator::with_session(engine.clone(), DockyardConfig::default(), session);
        let b = Orchestrator::with_session(engine.clone(), DockyardConfig::default(), session);
        let other =
            Orchestrator::with_session(engine.clone(), DockyardConfig::default(), Session::new());

        assert!(Arc::ptr_eq(&a.inner.reaper, &b.inner.reaper));
        assert!(!Arc::ptr_eq(&a.inner.reaper, &other.inner.reaper));

        drop((a, b));
        let c = Orchestrator::with_session(engine, DockyardConfig::default(), session);
        assert!(!c.inner.reaper.initialized());
    }

    #[tokio::test]
    async fn test_cancellable_checks_before_running() {
        let source = crate::cancel::CancelSource::new();
        source.cancel();
        let err = cancellable(&source.token(), "pulling", async { Ok(1) })
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(err.to_string().contains("pulling"));
    }
}
