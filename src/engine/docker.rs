//! bollard-backed engine.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    InspectContainerOptions, ListContainersOptions, LogOutput, NetworkingConfig,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
    UploadToContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::{CreateImageOptions, ListImagesOptions, RemoveImageOptions};
use bollard::models::{EndpointSettings, HostConfig, MountTypeEnum, PortBinding};
use bollard::network::{CreateNetworkOptions, ListNetworksOptions};
use bollard::volume::{CreateVolumeOptions, ListVolumesOptions, RemoveVolumeOptions};
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;

use crate::configuration::MountSource;
use crate::engine::{
    ContainerEngine, ContainerSpec, ContainerStatus, ExecResult, LocalImage, NetworkSpec,
    OutputChunk, OutputStream, VolumeSpec,
};
use crate::error::EngineError;
use crate::resource::ResourceKind;

/// Connect to the Docker daemon.
///
/// Tries `DOCKER_HOST` / the platform default first, then the Docker
/// Desktop socket under `~/.docker/run` and the rootless socket under
/// `/run/user/$UID`.
pub async fn connect_docker() -> Result<Docker, EngineError> {
    let mut last_error = String::from("no docker socket found");

    match Docker::connect_with_local_defaults() {
        Ok(docker) => match docker.ping().await {
            Ok(_) => return Ok(docker),
            Err(e) => last_error = e.to_string(),
        },
        Err(e) => last_error = e.to_string(),
    }

    for socket in fallback_sockets() {
        if !socket.exists() {
            continue;
        }
        let path = socket.to_string_lossy();
        if let Ok(docker) = Docker::connect_with_socket(&path, 120, bollard::API_DEFAULT_VERSION)
            && docker.ping().await.is_ok()
        {
            tracing::debug!("Connected to docker through {}", path);
            return Ok(docker);
        }
    }

    Err(EngineError::Unavailable { reason: last_error })
}

fn fallback_sockets() -> Vec<PathBuf> {
    let mut sockets = Vec::new();
    if let Some(home) = std::env::var_os("HOME") {
        sockets.push(PathBuf::from(home).join(".docker/run/docker.sock"));
    }
    if let Ok(uid) = std::env::var("UID") {
        sockets.push(PathBuf::from(format!("/run/user/{}/docker.sock", uid)));
    }
    sockets
}

fn engine_error(kind: ResourceKind, id: &str, e: BollardError) -> EngineError {
    match e {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => EngineError::NotFound {
            kind,
            id: id.to_string(),
        },
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => EngineError::Api {
            status: status_code,
            reason: message,
        },
        other => EngineError::Api {
            status: 0,
            reason: other.to_string(),
        },
    }
}

/// Append `:latest` when a reference carries neither tag nor digest.
fn with_default_tag(reference: &str) -> String {
    let last = reference.rsplit('/').next().unwrap_or(reference);
    if last.contains(':') || last.contains('@') {
        reference.to_string()
    } else {
        format!("{}:latest", reference)
    }
}

fn label_filter(key: &str, value: &str) -> HashMap<String, Vec<String>> {
    HashMap::from([("label".to_string(), vec![format!("{}={}", key, value)])])
}

/// [`ContainerEngine`] over a bollard client.
#[derive(Debug, Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// Connect with [`connect_docker`].
    pub async fn connect() -> Result<Self, EngineError> {
        Ok(Self::new(connect_docker().await?))
    }

    pub fn docker(&self) -> &Docker {
        &self.docker
    }

    fn container_config(spec: &ContainerSpec) -> Config<String> {
        let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = spec
            .port_bindings
            .iter()
            .map(|(port, host_port)| {
                (
                    port.clone(),
                    Some(vec![PortBinding {
                        host_ip: None,
                        host_port: host_port.map(|p| p.to_string()),
                    }]),
                )
            })
            .collect();

        let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
            .exposed_ports
            .iter()
            .chain(spec.port_bindings.keys())
            .map(|port| (port.clone(), HashMap::new()))
            .collect();

        let mounts: Vec<bollard::models::Mount> = spec
            .mounts
            .iter()
            .map(|mount| {
                let (typ, source) = match &mount.source {
                    MountSource::Bind(path) => {
                        (MountTypeEnum::BIND, Some(path.to_string_lossy().into_owned()))
                    }
                    MountSource::Volume(name) => (MountTypeEnum::VOLUME, Some(name.clone())),
                    MountSource::Tmpfs => (MountTypeEnum::TMPFS, None),
                };
                bollard::models::Mount {
                    target: Some(mount.target.clone()),
                    source,
                    typ: Some(typ),
                    read_only: Some(mount.read_only),
                    ..Default::default()
                }
            })
            .collect();

        let aliases = (!spec.network_aliases.is_empty()).then(|| spec.network_aliases.clone());
        let networking_config = (!spec.networks.is_empty()).then(|| NetworkingConfig {
            endpoints_config: spec
                .networks
                .iter()
                .map(|network| {
                    (
                        network.clone(),
                        EndpointSettings {
                            aliases: aliases.clone(),
                            ..Default::default()
                        },
                    )
                })
                .collect(),
        });

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            mounts: (!mounts.is_empty()).then_some(mounts),
            network_mode: spec.networks.first().cloned(),
            privileged: Some(spec.privileged),
            auto_remove: Some(spec.auto_remove),
            ..Default::default()
        };

        Config {
            image: Some(spec.image.clone()),
            hostname: spec.hostname.clone(),
            mac_address: spec.mac_address.clone(),
            working_dir: spec.working_dir.clone(),
            env: (!spec.env.is_empty()).then(|| spec.env.clone()),
            entrypoint: (!spec.entrypoint.is_empty()).then(|| spec.entrypoint.clone()),
            cmd: (!spec.command.is_empty()).then(|| spec.command.clone()),
            exposed_ports: Some(exposed_ports),
            labels: Some(spec.labels.clone().into_iter().collect()),
            host_config: Some(host_config),
            networking_config,
            ..Default::default()
        }
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn ping(&self) -> Result<(), EngineError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| EngineError::Unavailable {
                reason: e.to_string(),
            })
    }

    async fn inspect_image(&self, reference: &str) -> Result<Option<LocalImage>, EngineError> {
        match self.docker.inspect_image(reference).await {
            Ok(image) => Ok(Some(LocalImage {
                id: image.id.unwrap_or_default(),
                repo_tags: image.repo_tags.unwrap_or_default(),
            })),
            Err(e) => match engine_error(ResourceKind::Image, reference, e) {
                EngineError::NotFound { .. } => Ok(None),
                other => Err(other),
            },
        }
    }

    async fn pull_image(&self, reference: &str) -> Result<(), EngineError> {
        let reference = with_default_tag(reference);
        tracing::info!("Pulling image: {}", reference);

        let options = CreateImageOptions {
            from_image: reference.clone(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        tracing::trace!("Pull status: {}", status);
                    }
                }
                Err(e) => return Err(engine_error(ResourceKind::Image, &reference, e)),
            }
        }

        tracing::info!("Pulled image: {}", reference);
        Ok(())
    }

    async fn remove_image(&self, reference: &str) -> Result<(), EngineError> {
        let options = RemoveImageOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_image(reference, Some(options), None)
            .await
            .map(|_| ())
            .map_err(|e| engine_error(ResourceKind::Image, reference, e))
    }

    async fn find_network(&self, name: &str) -> Result<Option<String>, EngineError> {
        let options = ListNetworksOptions {
            filters: HashMap::from([("name".to_string(), vec![name.to_string()])]),
        };
        let networks = self
            .docker
            .list_networks(Some(options))
            .await
            .map_err(|e| engine_error(ResourceKind::Network, name, e))?;

        // The name filter matches substrings.
        Ok(networks
            .into_iter()
            .find(|n| n.name.as_deref() == Some(name))
            .and_then(|n| n.id))
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<String, EngineError> {
        let options = CreateNetworkOptions {
            name: spec.name.clone(),
            driver: spec.driver.clone(),
            options: spec.options.clone().into_iter().collect(),
            labels: spec.labels.clone().into_iter().collect(),
            ..Default::default()
        };
        self.docker
            .create_network(options)
            .await
            .map_err(|e| engine_error(ResourceKind::Network, &spec.name, e))?;

        Ok(self
            .find_network(&spec.name)
            .await?
            .unwrap_or_else(|| spec.name.clone()))
    }

    async fn remove_network(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .remove_network(id)
            .await
            .map_err(|e| engine_error(ResourceKind::Network, id, e))
    }

    async fn create_volume(&self, spec: &VolumeSpec) -> Result<String, EngineError> {
        let options = CreateVolumeOptions {
            name: spec.name.clone(),
            driver: spec.driver.clone().unwrap_or_else(|| "local".to_string()),
            driver_opts: spec.driver_options.clone().into_iter().collect(),
            labels: spec.labels.clone().into_iter().collect(),
            ..Default::default()
        };
        self.docker
            .create_volume(options)
            .await
            .map(|volume| volume.name)
            .map_err(|e| engine_error(ResourceKind::Volume, &spec.name, e))
    }

    async fn remove_volume(&self, name: &str) -> Result<(), EngineError> {
        self.docker
            .remove_volume(name, Some(RemoveVolumeOptions { force: true }))
            .await
            .map_err(|e| engine_error(ResourceKind::Volume, name, e))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        let label = spec.name.clone().unwrap_or_else(|| spec.image.clone());
        let options = spec.name.clone().map(|name| CreateContainerOptions {
            name,
            ..Default::default()
        });
        let response = self
            .docker
            .create_container(options, Self::container_config(spec))
            .await
            .map_err(|e| engine_error(ResourceKind::Container, &label, e))?;

        for warning in &response.warnings {
            tracing::warn!("Engine warning for {}: {}", label, warning);
        }
        Ok(response.id)
    }

    async fn upload_archive(&self, id: &str, archive: Bytes) -> Result<(), EngineError> {
        let options = UploadToContainerOptions {
            path: "/".to_string(),
            ..Default::default()
        };
        self.docker
            .upload_to_container(id, Some(options), archive)
            .await
            .map_err(|e| engine_error(ResourceKind::Container, id, e))
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| engine_error(ResourceKind::Container, id, e))
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), EngineError> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(engine_error(ResourceKind::Container, id, e)),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| engine_error(ResourceKind::Container, id, e))
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerStatus, EngineError> {
        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| engine_error(ResourceKind::Container, id, e))?;

        let state = info.state.unwrap_or_default();
        let ports = info
            .network_settings
            .and_then(|settings| settings.ports)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(port, bindings)| {
                let host_port = bindings?
                    .into_iter()
                    .find_map(|b| b.host_port.and_then(|p| p.parse::<u16>().ok()))?;
                Some((port, host_port))
            })
            .collect();

        Ok(ContainerStatus {
            running: state.running.unwrap_or(false),
            exit_code: state.exit_code,
            ports,
        })
    }

    async fn exec(&self, id: &str, command: &[String]) -> Result<ExecResult, EngineError> {
        let options = CreateExecOptions {
            cmd: Some(command.to_vec()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let exec = self
            .docker
            .create_exec(id, options)
            .await
            .map_err(|e| engine_error(ResourceKind::Container, id, e))?;
        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| engine_error(ResourceKind::Container, id, e))?;

        let mut result = ExecResult::default();
        if let StartExecResults::Attached { mut output, .. } = started {
            while let Some(frame) = output.next().await {
                match frame.map_err(|e| engine_error(ResourceKind::Container, id, e))? {
                    LogOutput::StdOut { message } => {
                        result.stdout.push_str(&String::from_utf8_lossy(&message))
                    }
                    LogOutput::StdErr { message } => {
                        result.stderr.push_str(&String::from_utf8_lossy(&message))
                    }
                    _ => {}
                }
            }
        }

        let inspected = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| engine_error(ResourceKind::Container, id, e))?;
        result.exit_code = inspected.exit_code.unwrap_or(-1);
        Ok(result)
    }

    async fn follow_output(
        &self,
        id: &str,
        sink: mpsc::UnboundedSender<OutputChunk>,
    ) -> Result<(), EngineError> {
        let options = AttachContainerOptions::<String> {
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            logs: Some(true),
            ..Default::default()
        };
        let AttachContainerResults { mut output, .. } = self
            .docker
            .attach_container(id, Some(options))
            .await
            .map_err(|e| engine_error(ResourceKind::Container, id, e))?;

        let id = id.to_string();
        tokio::spawn(async move {
            while let Some(frame) = output.next().await {
                let chunk = match frame {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                        OutputChunk {
                            stream: OutputStream::Stdout,
                            bytes: message,
                        }
                    }
                    Ok(LogOutput::StdErr { message }) => OutputChunk {
                        stream: OutputStream::Stderr,
                        bytes: message,
                    },
                    Ok(LogOutput::StdIn { .. }) => continue,
                    Err(e) => {
                        tracing::debug!("Output stream of {} ended: {}", id, e);
                        break;
                    }
                };
                if sink.send(chunk).is_err() {
                    break;
                }
            }
        });
        Ok(())
    }

    async fn list_labelled(
        &self,
        kind: ResourceKind,
        key: &str,
        value: &str,
    ) -> Result<Vec<String>, EngineError> {
        let filters = label_filter(key, value);
        let filter_text = format!("{}={}", key, value);
        let map_err = |e| engine_error(kind, &filter_text, e);

        let ids = match kind {
            ResourceKind::Container => self
                .docker
                .list_containers(Some(ListContainersOptions {
                    all: true,
                    filters,
                    ..Default::default()
                }))
                .await
                .map_err(map_err)?
                .into_iter()
                .filter_map(|c| c.id)
                .collect(),
            ResourceKind::Network => self
                .docker
                .list_networks(Some(ListNetworksOptions { filters }))
                .await
                .map_err(map_err)?
                .into_iter()
                .filter_map(|n| n.id)
                .collect(),
            ResourceKind::Volume => self
                .docker
                .list_volumes(Some(ListVolumesOptions { filters }))
                .await
                .map_err(map_err)?
                .volumes
                .unwrap_or_default()
                .into_iter()
                .map(|v| v.name)
                .collect(),
            ResourceKind::Image => self
                .docker
                .list_images(Some(ListImagesOptions {
                    filters,
                    ..Default::default()
                }))
                .await
                .map_err(map_err)?
                .into_iter()
                .map(|i| i.id)
                .collect(),
        };
        Ok(ids)
    }
}
