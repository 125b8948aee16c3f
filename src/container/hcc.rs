//! A container specification bound to one host, plus the per-container
//! lifecycle operations the reconciler composes.

use chrono::Utc;

use crate::container::{ContainerInstance, ContainerSpec, FileMap};
use crate::docker::{self, Runtime};
use crate::host::Host;

/// Desired state of one container on one host.
///
/// The identity of the container inside a set is the caller-assigned key,
/// which doubles as the daemon-side container name.
#[derive(Debug, Clone)]
pub struct HostConfiguredContainer {
    pub host: Host,
    pub container: ContainerSpec,
    pub config_files: FileMap,
}

impl HostConfiguredContainer {
    pub fn new(host: Host, container: ContainerSpec) -> Self {
        HostConfiguredContainer {
            host,
            container,
            config_files: FileMap::new(),
        }
    }

    pub fn with_files(host: Host, container: ContainerSpec, config_files: FileMap) -> Self {
        HostConfiguredContainer {
            host,
            container,
            config_files,
        }
    }

    /// Creates the container, injects files, then starts it. Files must land
    /// before start so processes observe them on first boot.
    pub(crate) async fn create_and_start(
        &self,
        runtime: &dyn Runtime,
        name: &str,
    ) -> docker::Result<ContainerInstance> {
        let id = runtime.create(name, &self.container).await?;

        if !self.config_files.is_empty() {
            runtime.copy_files(&id, &self.config_files).await?;
        }

        runtime.start(&id).await?;

        Ok(ContainerInstance {
            host: self.host.clone(),
            container: self.container.clone(),
            config_files: self.config_files.clone(),
            id: Some(id),
            running: true,
            checked_at: Some(Utc::now()),
        })
    }

    /// Re-injects the configured files and restarts the container so it picks
    /// them up.
    pub(crate) async fn update_files(&self, runtime: &dyn Runtime, id: &str) -> docker::Result<()> {
        runtime.copy_files(id, &self.config_files).await?;
        runtime.restart(id).await
    }
}

/// Stops and removes a container whose key left the desired state.
pub(crate) async fn destroy(runtime: &dyn Runtime, id: &str) -> docker::Result<()> {
    runtime.stop(id).await?;
    runtime.remove(id).await
}

/// Refreshes a previous-state record against the daemon.
///
/// When the recorded id no longer resolves, or resolves to a container with
/// a different name, the record is cleared so the planner treats the key as
/// absent.
pub(crate) async fn check(
    runtime: &dyn Runtime,
    key: &str,
    instance: &mut ContainerInstance,
) -> docker::Result<()> {
    let Some(id) = instance.id.clone() else {
        return Ok(());
    };

    match runtime.inspect(&id).await? {
        Some(status) if status.name == key => {
            instance.running = status.running;
            instance.checked_at = Some(Utc::now());
        }
        _ => {
            instance.id = None;
            instance.running = false;
        }
    }

    Ok(())
}
