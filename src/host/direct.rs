//! Direct transport: the container runtime socket is reachable as a local
//! path, without tunneling.

use serde::{Deserialize, Serialize};
use snafu::{ensure, Snafu};

/// Socket path used when none is configured.
pub const DEFAULT_SOCKET: &str = "/var/run/docker.sock";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("socket path must be absolute, got {path:?}"))]
    RelativeSocketPath { path: String },
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    /// Path to the runtime socket. Defaults to the Docker socket.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket: Option<String>,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if let Some(socket) = &self.socket {
            ensure!(
                socket.starts_with('/'),
                RelativeSocketPathSnafu { path: socket.clone() }
            );
        }

        Ok(())
    }

    pub fn socket_path(&self) -> String {
        self.socket
            .clone()
            .unwrap_or_else(|| DEFAULT_SOCKET.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_default_socket() {
        let config = Config::default();

        assert!(config.validate().is_ok());
        assert_eq!(config.socket_path(), DEFAULT_SOCKET);
    }

    #[test]
    fn relative_socket_path_is_rejected() {
        let config = Config {
            socket: Some("run/docker.sock".to_owned()),
        };

        assert!(config.validate().is_err());
    }
}
