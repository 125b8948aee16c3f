//! Container specifications, their runtime-observed counterparts and the
//! set-level reconciler.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::host::Host;

mod hcc;
mod set;

pub use hcc::HostConfiguredContainer;
pub use set::{ContainersSet, ContainersState, Error as SetError};

/// A single file placed into the container filesystem before start.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct File {
    pub content: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
}

impl File {
    pub fn new(content: impl Into<String>) -> Self {
        File {
            content: content.into(),
            mode: None,
        }
    }

    pub fn with_mode(content: impl Into<String>, mode: u32) -> Self {
        File {
            content: content.into(),
            mode: Some(mode),
        }
    }

    pub fn mode(&self) -> u32 {
        self.mode.unwrap_or(0o644)
    }
}

/// Files to inject, keyed by absolute path inside the container.
pub type FileMap = BTreeMap<String, File>;

/// Compares two file sets by path, mode and content.
pub(crate) fn files_equal(desired: &FileMap, observed: &FileMap) -> bool {
    desired.len() == observed.len()
        && desired.iter().all(|(path, file)| {
            observed.get(path).is_some_and(|other| {
                other.content == file.content && other.mode() & 0o7777 == file.mode() & 0o7777
            })
        })
}

/// A bind mount from the host filesystem into the container.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Mount {
    pub source: String,
    pub target: String,

    #[serde(default)]
    pub read_only: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub propagation: Option<String>,
}

impl Mount {
    pub(crate) fn to_bind(&self) -> String {
        let mut options = Vec::new();
        if self.read_only {
            options.push("ro".to_owned());
        }
        if let Some(propagation) = &self.propagation {
            options.push(propagation.clone());
        }

        if options.is_empty() {
            format!("{}:{}", self.source, self.target)
        } else {
            format!("{}:{}:{}", self.source, self.target, options.join(","))
        }
    }
}

/// A published container port.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PortMap {
    pub port: u16,

    /// Defaults to `tcp`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,

    /// Defaults to the container port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u16>,
}

impl PortMap {
    pub(crate) fn daemon_port(&self) -> String {
        format!(
            "{}/{}",
            self.port,
            self.protocol.as_deref().unwrap_or("tcp")
        )
    }
}

/// Desired shape of one container.
///
/// Equality is semantic: the environment compares as a set of `key=value`
/// pairs and mounts as an ordered list, so two specs compare equal exactly
/// when the reconciler considers them interchangeable.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ContainerSpec {
    pub image: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortMap>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<Mount>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<String>,

    #[serde(default)]
    pub privileged: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// Runtime-observed counterpart of one desired container: the spec as last
/// applied plus the runtime identity and status.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ContainerInstance {
    pub host: Host,

    pub container: ContainerSpec,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config_files: FileMap,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default)]
    pub running: bool,

    /// Time of the last successful inspection. Not persisted, so an
    /// action-free pass leaves the state record untouched.
    #[serde(skip)]
    pub checked_at: Option<DateTime<Utc>>,
}

// The inspection timestamp is ephemeral and excluded from equality, which
// compares what the state record persists.
impl PartialEq for ContainerInstance {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host
            && self.container == other.container
            && self.config_files == other.config_files
            && self.id == other.id
            && self.running == other.running
    }
}

impl Eq for ContainerInstance {}
