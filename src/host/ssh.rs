//! SSH tunnel transport.
//!
//! Establishes an SSH session to the remote host and forwards an ephemeral
//! local Unix socket to the container runtime socket on the remote end. The
//! local socket is handed to the runtime client, which stays unaware of the
//! tunnel.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use russh::client;
use russh::keys::agent::client::AgentClient;
use russh::keys::{decode_secret_key, PrivateKeyWithHashAlg};
use serde::{Deserialize, Serialize};
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use tokio::net::UnixListener;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::util;

/// Default SSH port.
pub const PORT: u16 = 22;
/// Default SSH user.
pub const USER: &str = "root";
/// Default timeout for a single connection attempt, in seconds.
pub const CONNECTION_TIMEOUT: u64 = 30;
/// Default total time budget for connection retries, in seconds.
pub const RETRY_TIMEOUT: u64 = 60;
/// Default pause between connection attempts, in seconds.
pub const RETRY_INTERVAL: u64 = 1;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("address must be set"))]
    NoAddress,

    #[snafu(display("parsing private key failed: {source}"))]
    ParsePrivateKey { source: russh::keys::Error },

    #[snafu(display("connecting to {address}:{port} failed: {source}"))]
    Connect {
        address: String,
        port: u16,
        source: russh::Error,
    },

    #[snafu(display("connection attempt to {address}:{port} timed out after {seconds}s"))]
    ConnectTimeout {
        address: String,
        port: u16,
        seconds: u64,
    },

    #[snafu(display("{address} refused authentication for user {user:?}"))]
    AuthRefused { address: String, user: String },

    #[snafu(display("ssh-agent authentication failed: {message}"))]
    Agent { message: String },

    #[snafu(display("creating local forward socket failed: {source}"))]
    LocalSocket { source: std::io::Error },

    #[snafu(display("connection cancelled"))]
    Cancelled,
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// PEM-encoded private key. When unset, the ssh-agent pointed to by
    /// `SSH_AUTH_SOCK` is used instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,

    /// Timeout for a single connection attempt, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_timeout: Option<u64>,

    /// Total time budget for the retry loop, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_timeout: Option<u64>,

    /// Pause between connection attempts, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_interval: Option<u64>,
}

impl Config {
    /// Builds an effective configuration.
    ///
    /// Field-wise: `config` wins, then `defaults`, then library defaults.
    pub fn build(config: Option<&Config>, defaults: Option<&Config>) -> Config {
        let empty = Config::default();
        let c = config.unwrap_or(&empty);
        let d = defaults.unwrap_or(&empty);

        Config {
            address: util::pick([c.address.clone(), d.address.clone()]),
            port: Some(util::pick_or([c.port, d.port], PORT)),
            user: Some(util::pick_or(
                [c.user.clone(), d.user.clone()],
                USER.to_owned(),
            )),
            private_key: util::pick([c.private_key.clone(), d.private_key.clone()]),
            connection_timeout: Some(util::pick_or(
                [c.connection_timeout, d.connection_timeout],
                CONNECTION_TIMEOUT,
            )),
            retry_timeout: Some(util::pick_or(
                [c.retry_timeout, d.retry_timeout],
                RETRY_TIMEOUT,
            )),
            retry_interval: Some(util::pick_or(
                [c.retry_interval, d.retry_interval],
                RETRY_INTERVAL,
            )),
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.address.as_deref().is_some_and(|a| !a.is_empty()),
            NoAddressSnafu
        );

        if let Some(key) = self.private_key.as_deref().filter(|k| !k.is_empty()) {
            decode_secret_key(key, None).context(ParsePrivateKeySnafu)?;
        }

        Ok(())
    }

    /// Connects with retries and starts forwarding a fresh local socket to
    /// `remote_socket` on the remote host.
    pub(super) async fn connect(
        &self,
        remote_socket: &str,
        cancel: &CancellationToken,
    ) -> Result<Tunnel> {
        let address = self.address.clone().context(NoAddressSnafu)?;
        let port = self.port.unwrap_or(PORT);
        let connection_timeout = self.connection_timeout.unwrap_or(CONNECTION_TIMEOUT);
        let retry_interval = Duration::from_secs(self.retry_interval.unwrap_or(RETRY_INTERVAL));
        let deadline =
            Instant::now() + Duration::from_secs(self.retry_timeout.unwrap_or(RETRY_TIMEOUT));

        let handle = loop {
            let attempt = timeout(
                Duration::from_secs(connection_timeout),
                self.session(&address, port),
            );

            let result = tokio::select! {
                () = cancel.cancelled() => return CancelledSnafu.fail(),
                result = attempt => result,
            };

            let err = match result {
                Ok(Ok(handle)) => break handle,
                Ok(Err(err)) => err,
                Err(_elapsed) => ConnectTimeoutSnafu {
                    address: address.clone(),
                    port,
                    seconds: connection_timeout,
                }
                .build(),
            };

            if Instant::now() + retry_interval >= deadline {
                return Err(err);
            }

            trace!(%address, error = %err, "Connection attempt failed, retrying");

            tokio::select! {
                () = cancel.cancelled() => return CancelledSnafu.fail(),
                () = sleep(retry_interval) => {}
            }
        };

        let dir = tempfile::tempdir().context(LocalSocketSnafu)?;
        let socket_path = dir.path().join("runtime.sock");
        let listener = UnixListener::bind(&socket_path).context(LocalSocketSnafu)?;

        debug!(%address, socket = %socket_path.display(), "Forwarding local socket");

        let remote_socket = remote_socket.to_owned();
        let task = tokio::spawn(async move {
            loop {
                let (mut local, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(error = %err, "Accepting forward connection failed");
                        break;
                    }
                };

                match handle.channel_open_direct_streamlocal(&remote_socket).await {
                    Ok(channel) => {
                        tokio::spawn(async move {
                            let mut remote = channel.into_stream();
                            if let Err(err) =
                                tokio::io::copy_bidirectional(&mut local, &mut remote).await
                            {
                                trace!(error = %err, "Forwarded connection closed");
                            }
                        });
                    }
                    Err(err) => warn!(error = %err, "Opening forward channel failed"),
                }
            }
        });

        Ok(Tunnel {
            socket_path,
            _dir: dir,
            task,
        })
    }

    async fn session(&self, address: &str, port: u16) -> Result<client::Handle<Client>> {
        let user = self.user.clone().unwrap_or_else(|| USER.to_owned());
        let config = Arc::new(client::Config::default());

        let mut handle = client::connect(config, (address, port), Client)
            .await
            .context(ConnectSnafu { address, port })?;

        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .context(ConnectSnafu { address, port })?
            .flatten();

        let authenticated = match self.private_key.as_deref().filter(|k| !k.is_empty()) {
            Some(pem) => {
                let key = decode_secret_key(pem, None).context(ParsePrivateKeySnafu)?;
                handle
                    .authenticate_publickey(
                        &user,
                        PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
                    )
                    .await
                    .context(ConnectSnafu { address, port })?
                    .success()
            }
            None => {
                let mut agent = AgentClient::connect_env().await.map_err(|err| {
                    AgentSnafu {
                        message: err.to_string(),
                    }
                    .build()
                })?;

                let identities = agent.request_identities().await.map_err(|err| {
                    AgentSnafu {
                        message: err.to_string(),
                    }
                    .build()
                })?;

                let mut authenticated = false;
                for key in identities {
                    let result = handle
                        .authenticate_publickey_with(&user, key, hash_alg, &mut agent)
                        .await
                        .map_err(|err| {
                            AgentSnafu {
                                message: err.to_string(),
                            }
                            .build()
                        })?;

                    if result.success() {
                        authenticated = true;
                        break;
                    }
                }

                authenticated
            }
        };

        ensure!(authenticated, AuthRefusedSnafu { address, user });

        Ok(handle)
    }
}

// Hosts are addressed by operator-written configuration; server keys are not
// pinned.
struct Client;

impl client::Handler for Client {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// A live SSH forward. Dropping it stops the forwarder and closes the
/// session.
#[derive(Debug)]
pub struct Tunnel {
    socket_path: PathBuf,
    _dir: tempfile::TempDir,
    task: tokio::task::JoinHandle<()>,
}

impl Tunnel {
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn built(config: Option<&Config>, defaults: Option<&Config>) -> Config {
        Config::build(config, defaults)
    }

    #[test]
    fn build_all_defaults() {
        let config = built(None, None);

        assert_eq!(
            config,
            Config {
                address: None,
                port: Some(PORT),
                user: Some(USER.to_owned()),
                private_key: None,
                connection_timeout: Some(CONNECTION_TIMEOUT),
                retry_timeout: Some(RETRY_TIMEOUT),
                retry_interval: Some(RETRY_INTERVAL),
            }
        );
    }

    #[test]
    fn build_private_key_config_wins_over_defaults() {
        let config = Config {
            private_key: Some("foo".to_owned()),
            ..Config::default()
        };
        let defaults = Config {
            private_key: Some("bar".to_owned()),
            ..Config::default()
        };

        assert_eq!(
            built(Some(&config), Some(&defaults)).private_key.as_deref(),
            Some("foo")
        );
        assert_eq!(
            built(None, Some(&defaults)).private_key.as_deref(),
            Some("bar")
        );
        assert_eq!(
            built(Some(&config), None).private_key.as_deref(),
            Some("foo")
        );
    }

    #[test]
    fn build_user_config_wins_over_defaults() {
        let config = Config {
            user: Some("core".to_owned()),
            ..Config::default()
        };
        let defaults = Config {
            user: Some("admin".to_owned()),
            ..Config::default()
        };

        assert_eq!(
            built(Some(&config), Some(&defaults)).user.as_deref(),
            Some("core")
        );
        assert_eq!(built(None, Some(&defaults)).user.as_deref(), Some("admin"));
        assert_eq!(built(None, None).user.as_deref(), Some(USER));
    }

    #[test]
    fn build_port_config_wins_over_defaults() {
        let config = Config {
            port: Some(33),
            ..Config::default()
        };
        let defaults = Config {
            port: Some(44),
            ..Config::default()
        };

        assert_eq!(built(Some(&config), Some(&defaults)).port, Some(33));
        assert_eq!(built(None, Some(&defaults)).port, Some(44));
        assert_eq!(built(None, None).port, Some(PORT));
    }

    #[test]
    fn build_timeouts_config_wins_over_defaults() {
        let config = Config {
            connection_timeout: Some(10),
            retry_timeout: Some(20),
            retry_interval: Some(5),
            ..Config::default()
        };
        let defaults = Config {
            connection_timeout: Some(15),
            retry_timeout: Some(40),
            retry_interval: Some(10),
            ..Config::default()
        };

        let merged = built(Some(&config), Some(&defaults));
        assert_eq!(merged.connection_timeout, Some(10));
        assert_eq!(merged.retry_timeout, Some(20));
        assert_eq!(merged.retry_interval, Some(5));

        let fallback = built(None, Some(&defaults));
        assert_eq!(fallback.connection_timeout, Some(15));
        assert_eq!(fallback.retry_timeout, Some(40));
        assert_eq!(fallback.retry_interval, Some(10));
    }

    #[test]
    fn validate_requires_address() {
        assert!(Config::default().validate().is_err());
        assert!(built(None, None).validate().is_err());

        let config = Config {
            address: Some("example.com".to_owned()),
            ..Config::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_garbage_private_key() {
        let config = Config {
            address: Some("example.com".to_owned()),
            private_key: Some("not a pem".to_owned()),
            ..Config::default()
        };

        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn connect_respects_cancellation() {
        let config = Config::build(
            Some(&Config {
                address: Some("192.0.2.1".to_owned()),
                retry_timeout: Some(600),
                ..Config::default()
            }),
            None,
        );

        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = config
            .connect(crate::host::direct::DEFAULT_SOCKET, &cancel)
            .await
            .expect_err("cancelled connect must fail");

        assert!(matches!(err, Error::Cancelled));
    }
}
