//! Typed client for a Docker-compatible daemon reached through a host
//! transport.
//!
//! The reconciler only talks to the [`Runtime`] trait, so tests substitute an
//! in-memory daemon and production code wires [`DockerProvider`].

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use async_trait::async_trait;
use bollard::models::{
    ContainerCreateBody, HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum,
};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, CreateImageOptionsBuilder, DownloadFromContainerOptionsBuilder,
    InspectContainerOptions, RemoveContainerOptionsBuilder, RestartContainerOptionsBuilder,
    StartContainerOptions, StopContainerOptionsBuilder, UploadToContainerOptionsBuilder,
};
use bollard::Docker;
use futures::TryStreamExt;
use snafu::{ResultExt, Snafu};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::container::{ContainerSpec, File, FileMap};
use crate::host::{self, Host};

/// Timeout for daemon requests, in seconds.
const CLIENT_TIMEOUT: u64 = 120;
/// Grace period before a container is killed on stop, in seconds.
const STOP_TIMEOUT: i32 = 30;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("transport failed: {source}"))]
    Transport { source: host::Error },

    #[snafu(display("creating runtime client failed: {source}"))]
    Client { source: bollard::errors::Error },

    #[snafu(display("inspecting container {name:?} failed: {source}"))]
    Inspect {
        name: String,
        source: bollard::errors::Error,
    },

    #[snafu(display("pulling image {image:?} failed: {source}"))]
    Pull {
        image: String,
        source: bollard::errors::Error,
    },

    #[snafu(display("creating container {name:?} failed: {source}"))]
    Create {
        name: String,
        source: bollard::errors::Error,
    },

    #[snafu(display("starting container {id:?} failed: {source}"))]
    Start {
        id: String,
        source: bollard::errors::Error,
    },

    #[snafu(display("stopping container {id:?} failed: {source}"))]
    Stop {
        id: String,
        source: bollard::errors::Error,
    },

    #[snafu(display("restarting container {id:?} failed: {source}"))]
    Restart {
        id: String,
        source: bollard::errors::Error,
    },

    #[snafu(display("removing container {id:?} failed: {source}"))]
    Remove {
        id: String,
        source: bollard::errors::Error,
    },

    #[snafu(display("copying files into container {id:?} failed: {source}"))]
    CopyFiles {
        id: String,
        source: bollard::errors::Error,
    },

    #[snafu(display("reading files from container {id:?} failed: {source}"))]
    ReadFiles {
        id: String,
        source: bollard::errors::Error,
    },

    #[snafu(display("building file archive failed: {source}"))]
    Archive { source: std::io::Error },

    #[snafu(display("action cancelled"))]
    Cancelled,
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether retrying the same call could succeed: connection losses,
    /// timeouts and daemon-side failures are transient, validation and
    /// conflict responses are terminal.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Transport { .. } | Error::Client { .. } | Error::Cancelled => true,
            Error::Archive { .. } => false,
            Error::Inspect { source, .. }
            | Error::Pull { source, .. }
            | Error::Create { source, .. }
            | Error::Start { source, .. }
            | Error::Stop { source, .. }
            | Error::Restart { source, .. }
            | Error::Remove { source, .. }
            | Error::CopyFiles { source, .. }
            | Error::ReadFiles { source, .. } => transient(source),
        }
    }
}

fn transient(err: &bollard::errors::Error) -> bool {
    match err {
        bollard::errors::Error::DockerResponseServerError { status_code, .. } => {
            *status_code >= 500
        }
        bollard::errors::Error::JsonDataError { .. }
        | bollard::errors::Error::JsonSerdeError { .. } => false,
        _ => true,
    }
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// Runtime-observed status of a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerStatus {
    pub id: String,
    pub name: String,
    pub running: bool,
}

/// The daemon operations the reconciler needs.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Looks a container up by name or id. `Ok(None)` means it is gone.
    async fn inspect(&self, name: &str) -> Result<Option<ContainerStatus>>;

    /// Creates a container and returns its runtime id.
    async fn create(&self, name: &str, spec: &ContainerSpec) -> Result<String>;

    async fn start(&self, id: &str) -> Result<()>;

    async fn stop(&self, id: &str) -> Result<()>;

    async fn remove(&self, id: &str) -> Result<()>;

    async fn restart(&self, id: &str) -> Result<()> {
        self.stop(id).await?;
        self.start(id).await
    }

    /// Writes files into the container filesystem.
    async fn copy_files(&self, id: &str, files: &FileMap) -> Result<()>;

    /// Reads the given paths back from the container filesystem. Missing
    /// paths are left out of the result.
    async fn read_files(&self, id: &str, paths: &[String]) -> Result<FileMap>;
}

/// Hands out a [`Runtime`] for a host.
#[async_trait]
pub trait RuntimeProvider: Send + Sync {
    async fn runtime(&self, host: &Host) -> Result<Arc<dyn Runtime>>;
}

/// Production provider: opens the host transport and speaks to the Docker
/// daemon over the resulting local socket.
pub struct DockerProvider {
    cancel: CancellationToken,
}

impl DockerProvider {
    pub fn new(cancel: CancellationToken) -> Self {
        DockerProvider { cancel }
    }
}

#[async_trait]
impl RuntimeProvider for DockerProvider {
    async fn runtime(&self, host: &Host) -> Result<Arc<dyn Runtime>> {
        let connection = host.connect(&self.cancel).await.context(TransportSnafu)?;

        let client = Docker::connect_with_unix(
            &connection.socket_path().to_string_lossy(),
            CLIENT_TIMEOUT,
            bollard::API_DEFAULT_VERSION,
        )
        .context(ClientSnafu)?;

        Ok(Arc::new(DockerRuntime {
            client,
            _connection: connection,
        }))
    }
}

/// Bollard-backed [`Runtime`]. Owns the transport connection so the tunnel
/// outlives every request made through it.
pub struct DockerRuntime {
    client: Docker,
    _connection: host::Connection,
}

#[async_trait]
impl Runtime for DockerRuntime {
    async fn inspect(&self, name: &str) -> Result<Option<ContainerStatus>> {
        let response = match self
            .client
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(response) => response,
            Err(err) if is_not_found(&err) => return Ok(None),
            Err(source) => return Err(source).context(InspectSnafu { name }),
        };

        Ok(Some(ContainerStatus {
            id: response.id.unwrap_or_default(),
            name: response
                .name
                .unwrap_or_default()
                .trim_start_matches('/')
                .to_owned(),
            running: response.state.and_then(|state| state.running).unwrap_or(false),
        }))
    }

    async fn create(&self, name: &str, spec: &ContainerSpec) -> Result<String> {
        let options = CreateContainerOptionsBuilder::new().name(name).build();

        let created = match self
            .client
            .create_container(Some(options.clone()), create_body(spec))
            .await
        {
            Err(err) if is_not_found(&err) => {
                self.pull(&spec.image).await?;
                self.client
                    .create_container(Some(options), create_body(spec))
                    .await
            }
            other => other,
        };

        Ok(created.context(CreateSnafu { name })?.id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.client
            .start_container(id, None::<StartContainerOptions>)
            .await
            .context(StartSnafu { id })
    }

    async fn stop(&self, id: &str) -> Result<()> {
        let options = StopContainerOptionsBuilder::new().t(STOP_TIMEOUT).build();

        self.client
            .stop_container(id, Some(options))
            .await
            .context(StopSnafu { id })
    }

    async fn restart(&self, id: &str) -> Result<()> {
        let options = RestartContainerOptionsBuilder::new().t(STOP_TIMEOUT).build();

        self.client
            .restart_container(id, Some(options))
            .await
            .context(RestartSnafu { id })
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptionsBuilder::new().v(true).build();

        self.client
            .remove_container(id, Some(options))
            .await
            .context(RemoveSnafu { id })
    }

    async fn copy_files(&self, id: &str, files: &FileMap) -> Result<()> {
        let archive = archive(files).context(ArchiveSnafu)?;
        let options = UploadToContainerOptionsBuilder::new().path("/").build();

        self.client
            .upload_to_container(id, Some(options), bollard::body_full(archive.into()))
            .await
            .context(CopyFilesSnafu { id })
    }

    async fn read_files(&self, id: &str, paths: &[String]) -> Result<FileMap> {
        let mut files = FileMap::new();

        for path in paths {
            let options = DownloadFromContainerOptionsBuilder::new().path(path).build();

            let bytes: Vec<u8> = match self
                .client
                .download_from_container(id, Some(options))
                .map_ok(|chunk| chunk.to_vec())
                .try_concat()
                .await
            {
                Ok(bytes) => bytes,
                Err(err) if is_not_found(&err) => continue,
                Err(source) => return Err(source).context(ReadFilesSnafu { id }),
            };

            let mut archive = tar::Archive::new(bytes.as_slice());
            for entry in archive.entries().context(ArchiveSnafu)? {
                let mut entry = entry.context(ArchiveSnafu)?;
                if !entry.header().entry_type().is_file() {
                    continue;
                }

                let mode = entry.header().mode().unwrap_or(0o644);
                let mut content = String::new();
                entry
                    .read_to_string(&mut content)
                    .context(ArchiveSnafu)?;

                files.insert(path.clone(), File::with_mode(content, mode & 0o7777));
            }
        }

        Ok(files)
    }
}

impl DockerRuntime {
    async fn pull(&self, image: &str) -> Result<()> {
        debug!(%image, "Pulling image");

        let options = CreateImageOptionsBuilder::new().from_image(image).build();

        self.client
            .create_image(Some(options), None, None)
            .try_collect::<Vec<_>>()
            .await
            .context(PullSnafu { image })?;

        Ok(())
    }
}

fn create_body(spec: &ContainerSpec) -> ContainerCreateBody {
    let env: Vec<String> = spec
        .env
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect();

    let binds: Vec<String> = spec.mounts.iter().map(crate::container::Mount::to_bind).collect();

    let mut exposed_ports = HashMap::new();
    let mut port_bindings = HashMap::new();
    for port in &spec.ports {
        exposed_ports.insert(port.daemon_port(), HashMap::new());
        port_bindings.insert(
            port.daemon_port(),
            Some(vec![PortBinding {
                host_ip: port.host_ip.clone(),
                host_port: Some(port.host_port.unwrap_or(port.port).to_string()),
            }]),
        );
    }

    ContainerCreateBody {
        image: Some(spec.image.clone()),
        entrypoint: (!spec.command.is_empty()).then(|| spec.command.clone()),
        cmd: (!spec.args.is_empty()).then(|| spec.args.clone()),
        env: (!env.is_empty()).then_some(env),
        user: spec.user.clone(),
        labels: (!spec.labels.is_empty())
            .then(|| spec.labels.clone().into_iter().collect()),
        exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
        host_config: Some(HostConfig {
            binds: (!binds.is_empty()).then_some(binds),
            network_mode: spec.network_mode.clone(),
            privileged: Some(spec.privileged),
            port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
            restart_policy: spec.restart_policy.as_deref().map(restart_policy),
            ..HostConfig::default()
        }),
        ..ContainerCreateBody::default()
    }
}

fn restart_policy(name: &str) -> RestartPolicy {
    let name = match name {
        "always" => RestartPolicyNameEnum::ALWAYS,
        "unless-stopped" => RestartPolicyNameEnum::UNLESS_STOPPED,
        "on-failure" => RestartPolicyNameEnum::ON_FAILURE,
        "no" => RestartPolicyNameEnum::NO,
        _ => RestartPolicyNameEnum::EMPTY,
    };

    RestartPolicy {
        name: Some(name),
        maximum_retry_count: None,
    }
}

fn archive(files: &FileMap) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());

    for (path, file) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(file.content.len() as u64);
        header.set_mode(file.mode());
        header.set_cksum();

        builder.append_data(
            &mut header,
            path.trim_start_matches('/'),
            file.content.as_bytes(),
        )?;
    }

    builder.into_inner()
}
