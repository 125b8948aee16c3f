//! Host endpoint descriptors and the transports used to reach the container
//! runtime socket on each host.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tokio_util::sync::CancellationToken;

pub mod direct;
pub mod ssh;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("exactly one of direct or ssh transport must be configured"))]
    AmbiguousTransport,

    #[snafu(display("invalid direct transport configuration: {source}"))]
    Direct { source: direct::Error },

    #[snafu(display("invalid ssh transport configuration: {source}"))]
    Ssh { source: ssh::Error },

    #[snafu(display("establishing ssh tunnel failed: {source}"))]
    SshConnect { source: ssh::Error },
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Where a container runtime can be reached.
///
/// Exactly one transport must be set. The descriptor doubles as the identity
/// of a host inside a containers set: actions targeting equal descriptors are
/// serialized onto the same daemon.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Host {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direct: Option<direct::Config>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh: Option<ssh::Config>,
}

impl Host {
    /// Builds an effective host from an optional member-level configuration
    /// and pool-level ssh defaults.
    ///
    /// A host configured with a direct transport ignores the ssh defaults.
    pub fn build(config: Option<&Host>, ssh_defaults: Option<&ssh::Config>) -> Host {
        let config = config.cloned().unwrap_or_default();
        if config.direct.is_some() {
            return config;
        }

        Host {
            direct: None,
            ssh: Some(ssh::Config::build(config.ssh.as_ref(), ssh_defaults)),
        }
    }

    pub fn validate(&self) -> Result<()> {
        match (&self.direct, &self.ssh) {
            (Some(direct), None) => direct.validate().context(DirectSnafu),
            (None, Some(ssh)) => ssh.validate().context(SshSnafu),
            _ => AmbiguousTransportSnafu.fail(),
        }
    }

    /// Opens the transport and returns a connection exposing a local socket
    /// path for the runtime endpoint.
    ///
    /// Cancelling the token aborts the ssh retry loop promptly.
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<Connection> {
        match (&self.direct, &self.ssh) {
            (Some(direct), None) => Ok(Connection {
                socket_path: PathBuf::from(direct.socket_path()),
                tunnel: None,
            }),
            (None, Some(ssh)) => {
                let tunnel = ssh
                    .connect(direct::DEFAULT_SOCKET, cancel)
                    .await
                    .context(SshConnectSnafu)?;

                Ok(Connection {
                    socket_path: tunnel.socket_path().to_owned(),
                    tunnel: Some(tunnel),
                })
            }
            _ => AmbiguousTransportSnafu.fail(),
        }
    }
}

/// An established transport.
///
/// Dropping the connection tears down any background forwarder.
pub struct Connection {
    socket_path: PathBuf,
    #[allow(dead_code)]
    tunnel: Option<ssh::Tunnel>,
}

impl Connection {
    /// Local socket path the container runtime is reachable on.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}
