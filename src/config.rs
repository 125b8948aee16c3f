//! Top-level configuration and state: file loading, projection of resources
//! and persistence of the observed state record.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::container::ContainersState;
use crate::docker::RuntimeProvider;
use crate::kubeconfig;
use crate::pki::{self, Pki};
use crate::resource::{self, controlplane, etcd, kubelet, loadbalancer, Resource};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("reading {} failed: {source}", path.display()))]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("parsing {} failed: {source}", path.display()))]
    ParseFile {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[snafu(display("{what} management not enabled in the configuration"))]
    NotConfigured { what: String },

    #[snafu(display("invalid etcd configuration: {source}"))]
    Etcd { source: etcd::Error },

    #[snafu(display("invalid controlplane configuration: {source}"))]
    Controlplane { source: controlplane::Error },

    #[snafu(display("invalid kubelet pool {name:?}: {source}"))]
    KubeletPool {
        name: String,
        source: kubelet::Error,
    },

    #[snafu(display("invalid API load balancer pool {name:?}: {source}"))]
    LoadBalancerPool {
        name: String,
        source: loadbalancer::Error,
    },

    #[snafu(display("execution failed: {source}"))]
    Execution { source: resource::Error },

    #[snafu(display("generating PKI failed: {source}"))]
    GeneratePki { source: pki::Error },

    #[snafu(display("serializing state failed: {source}"))]
    SerializeState { source: serde_yaml::Error },

    #[snafu(display("writing new state to {} failed: {source}", path.display()))]
    WriteState {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("PKI management not enabled"))]
    NoPkiState,

    #[snafu(display("Kubernetes PKI management not enabled"))]
    NoKubernetesPkiState,

    #[snafu(display("Kubernetes admin certificate not available in PKI"))]
    NoAdminCertificate,

    #[snafu(display("Kubernetes controlplane management not enabled"))]
    NoControlplane,

    #[snafu(display("Kubernetes controlplane has no API server address set"))]
    NoApiServerAddress,

    #[snafu(display("generating kubeconfig failed: {source}"))]
    Kubeconfig { source: kubeconfig::Error },
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Content of `config.yaml`. Unknown keys are rejected.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd: Option<etcd::Cluster>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controlplane: Option<controlplane::Controlplane>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pki: Option<Pki>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub kubelet_pools: BTreeMap<String, kubelet::Pool>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub api_load_balancer_pools: BTreeMap<String, loadbalancer::Pool>,
}

/// Content of `state.yaml`.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StateFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ResourceState>,
}

/// Observed state for every managed resource plus the PKI tree.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ResourceState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd: Option<ContainersState>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controlplane: Option<ContainersState>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub kubelet_pools: BTreeMap<String, ContainersState>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub api_load_balancer_pools: BTreeMap<String, ContainersState>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pki: Option<Pki>,
}

impl ResourceState {
    fn is_empty(&self) -> bool {
        self.etcd.is_none()
            && self.controlplane.is_none()
            && self.kubelet_pools.is_empty()
            && self.api_load_balancer_pools.is_empty()
            && self.pki.is_none()
    }
}

/// A loaded configuration and state pair, bound to the files they came from.
#[derive(Debug)]
pub struct Deployment {
    config: Config,
    state: ResourceState,
    state_path: PathBuf,
}

impl Deployment {
    /// Reads `config.yaml` and `state.yaml`. Missing files read as empty
    /// documents.
    pub async fn load(config_path: &Path, state_path: &Path) -> Result<Self> {
        info!(
            config = %config_path.display(),
            state = %state_path.display(),
            "Reading configuration and state"
        );

        let config: Config = read_yaml(config_path).await?.unwrap_or_default();
        let state: StateFile = read_yaml(state_path).await?.unwrap_or_default();

        Ok(Deployment {
            config,
            state: state.state.unwrap_or_default(),
            state_path: state_path.to_owned(),
        })
    }

    pub fn state(&self) -> &ResourceState {
        &self.state
    }

    /// Deploys the configured etcd cluster.
    pub async fn run_etcd(
        &mut self,
        provider: &dyn RuntimeProvider,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let cluster = self
            .config
            .etcd
            .clone()
            .context(NotConfiguredSnafu { what: "etcd" })?;

        let resource = cluster
            .build(self.state.etcd.clone(), self.state.pki.as_ref())
            .context(EtcdSnafu)?;

        self.run(resource, provider, cancel, |state, resource| {
            state.etcd = Some(resource.state().clone());
        })
        .await
    }

    /// Deploys the configured static controlplane.
    pub async fn run_controlplane(
        &mut self,
        provider: &dyn RuntimeProvider,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let controlplane = self
            .config
            .controlplane
            .clone()
            .context(NotConfiguredSnafu {
                what: "controlplane",
            })?;

        let resource = controlplane
            .build(self.state.controlplane.clone(), self.state.pki.as_ref())
            .context(ControlplaneSnafu)?;

        self.run(resource, provider, cancel, |state, resource| {
            state.controlplane = Some(resource.state().clone());
        })
        .await
    }

    /// Deploys the named kubelet pool.
    pub async fn run_kubelet_pool(
        &mut self,
        name: &str,
        provider: &dyn RuntimeProvider,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let pool = self
            .config
            .kubelet_pools
            .get(name)
            .cloned()
            .context(NotConfiguredSnafu {
                what: format!("kubelet pool {name:?}"),
            })?;

        let resource = pool
            .build(
                self.state.kubelet_pools.get(name).cloned(),
                self.state.pki.as_ref(),
            )
            .context(KubeletPoolSnafu { name })?;

        let name = name.to_owned();
        self.run(resource, provider, cancel, move |state, resource| {
            state
                .kubelet_pools
                .insert(name, resource.state().clone());
        })
        .await
    }

    /// Deploys the named API load balancer pool.
    pub async fn run_api_load_balancer_pool(
        &mut self,
        name: &str,
        provider: &dyn RuntimeProvider,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let pool = self
            .config
            .api_load_balancer_pools
            .get(name)
            .cloned()
            .context(NotConfiguredSnafu {
                what: format!("API load balancer pool {name:?}"),
            })?;

        let resource = pool
            .build(self.state.api_load_balancer_pools.get(name).cloned())
            .context(LoadBalancerPoolSnafu { name })?;

        let name = name.to_owned();
        self.run(resource, provider, cancel, move |state, resource| {
            state
                .api_load_balancer_pools
                .insert(name, resource.state().clone());
        })
        .await
    }

    /// Generates the configured PKI, layering the configuration under any
    /// PKI already recorded in the state.
    pub async fn run_pki(&mut self) -> Result<()> {
        let config = self
            .config
            .pki
            .clone()
            .context(NotConfiguredSnafu { what: "PKI" })?;

        if self.state.pki.is_some() {
            info!("Loading existing PKI from the state file");
        }

        let mut pki = Pki::layered(self.state.pki.take(), Some(config)).unwrap_or_default();

        info!("Generating PKI");
        let result = pki.generate();

        self.state.pki = Some(pki);

        self.persist(result.err().map(|source| Error::GeneratePki { source }))
            .await
    }

    /// Renders the admin kubeconfig from the state's PKI and the configured
    /// controlplane address.
    pub fn kubeconfig(&self) -> Result<String> {
        let pki = self.state.pki.as_ref().context(NoPkiStateSnafu)?;
        let kubernetes = pki.kubernetes.as_ref().context(NoKubernetesPkiStateSnafu)?;
        let admin = kubernetes
            .admin_certificate
            .as_ref()
            .context(NoAdminCertificateSnafu)?;

        let controlplane = self.config.controlplane.as_ref().context(NoControlplaneSnafu)?;
        let address = controlplane
            .api_server_address
            .as_deref()
            .filter(|address| !address.is_empty())
            .context(NoApiServerAddressSnafu)?;
        let port = controlplane
            .api_server_port
            .unwrap_or(controlplane::DEFAULT_SECURE_PORT);

        kubeconfig::Config {
            server: Some(format!("https://{address}:{port}")),
            ca_certificate: kubernetes
                .ca
                .as_ref()
                .and_then(|ca| ca.x509_certificate.clone()),
            client_certificate: admin.x509_certificate.clone(),
            client_key: admin.private_key.clone(),
            token: None,
        }
        .to_yaml("admin")
        .context(KubeconfigSnafu)
    }

    /// Checks state, deploys, saves the observed state and persists it.
    ///
    /// The state file is written even when the deploy failed; the deploy
    /// error stays the primary one.
    async fn run(
        &mut self,
        mut resource: Resource,
        provider: &dyn RuntimeProvider,
        cancel: &CancellationToken,
        save: impl FnOnce(&mut ResourceState, &Resource),
    ) -> Result<()> {
        info!("Checking current state");
        resource
            .check_current_state(provider)
            .await
            .context(ExecutionSnafu)?;

        info!("Deploying");
        let result = resource.deploy(provider, cancel).await;

        save(&mut self.state, &resource);

        self.persist(result.err().map(|source| Error::Execution { source }))
            .await
    }

    /// Writes the state record to disk. An empty record truncates the file
    /// to zero bytes.
    async fn persist(&self, action_error: Option<Error>) -> Result<()> {
        let document = StateFile {
            state: (!self.state.is_empty()).then(|| self.state.clone()),
        };

        let serialized = serde_yaml::to_string(&document).context(SerializeStateSnafu)?;
        let bytes = if serialized == "{}\n" {
            Vec::new()
        } else {
            serialized.into_bytes()
        };

        if let Err(err) = write_private(&self.state_path, &bytes) {
            if action_error.is_none() {
                return Err(err).context(WriteStateSnafu {
                    path: self.state_path.clone(),
                });
            }

            warn!(
                path = %self.state_path.display(),
                error = %err,
                "Failed to write state file"
            );
        }

        if let Some(err) = action_error {
            return Err(err);
        }

        info!("Action complete");

        Ok(())
    }
}

async fn read_yaml<T>(path: &Path) -> Result<Option<T>>
where
    T: serde::de::DeserializeOwned,
{
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(source).context(ReadFileSnafu { path }),
    };

    if content.trim().is_empty() {
        return Ok(None);
    }

    serde_yaml::from_str(&content)
        .map(Some)
        .context(ParseFileSnafu { path })
}

/// Atomic replace with mode 0600.
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let directory = path.parent().filter(|p| !p.as_os_str().is_empty());
    let mut file = tempfile::NamedTempFile::new_in(directory.unwrap_or_else(|| Path::new(".")))?;

    file.write_all(bytes)?;
    file.as_file()
        .set_permissions(std::fs::Permissions::from_mode(0o600))?;
    file.persist(path).map_err(|err| err.error)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::fake::FakeProvider;
    use crate::host::direct;

    fn config_yaml() -> &'static str {
        r#"
etcd:
  members:
    member-0:
      peerAddress: 10.0.0.1
      host:
        direct: {}
pki:
  etcd:
    peers:
      member-0: 10.0.0.1
    clients:
    - root
    - kube-apiserver
  kubernetes: {}
"#
    }

    async fn deployment(dir: &Path) -> Deployment {
        let config_path = dir.join("config.yaml");
        let state_path = dir.join("state.yaml");
        tokio::fs::write(&config_path, config_yaml()).await.unwrap();

        Deployment::load(&config_path, &state_path).await.unwrap()
    }

    #[tokio::test]
    async fn cold_start_deploys_one_member_and_records_state() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FakeProvider::default();
        let cancel = CancellationToken::new();

        let mut deployment = deployment(dir.path()).await;
        deployment.run_pki().await.expect("pki generation succeeds");
        deployment
            .run_etcd(&provider, &cancel)
            .await
            .expect("etcd deploy succeeds");

        let etcd_state = deployment.state().etcd.as_ref().unwrap();
        assert_eq!(etcd_state.len(), 1);
        assert!(etcd_state["member-0"].running);

        // The observed state survives a reload through the state file.
        let reloaded = Deployment::load(
            &dir.path().join("config.yaml"),
            &dir.path().join("state.yaml"),
        )
        .await
        .unwrap();
        assert_eq!(reloaded.state(), deployment.state());

        let host = crate::host::Host {
            direct: Some(direct::Config::default()),
            ssh: None,
        };
        assert!(provider.daemon(&host).by_name("member-0").unwrap().running);
    }

    #[tokio::test]
    async fn noop_run_leaves_state_file_bytes_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FakeProvider::default();
        let cancel = CancellationToken::new();

        let mut deployment = deployment(dir.path()).await;
        deployment.run_pki().await.unwrap();
        deployment.run_etcd(&provider, &cancel).await.unwrap();

        let state_path = dir.path().join("state.yaml");
        let before = tokio::fs::read(&state_path).await.unwrap();

        let mut second = Deployment::load(&dir.path().join("config.yaml"), &state_path)
            .await
            .unwrap();
        second.run_etcd(&provider, &cancel).await.unwrap();

        let after = tokio::fs::read(&state_path).await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn empty_state_serializes_to_zero_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let state_path = dir.path().join("state.yaml");

        let deployment = Deployment {
            config: Config::default(),
            state: ResourceState::default(),
            state_path: state_path.clone(),
        };

        deployment.persist(None).await.unwrap();

        let written = tokio::fs::read(&state_path).await.unwrap();
        assert!(written.is_empty());
    }

    #[tokio::test]
    async fn state_file_is_written_with_owner_only_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let provider = FakeProvider::default();
        let cancel = CancellationToken::new();

        let mut deployment = deployment(dir.path()).await;
        deployment.run_pki().await.unwrap();
        deployment.run_etcd(&provider, &cancel).await.unwrap();

        let metadata = tokio::fs::metadata(dir.path().join("state.yaml"))
            .await
            .unwrap();
        assert_eq!(metadata.permissions().mode() & 0o777, 0o600);
    }

    #[tokio::test]
    async fn unknown_configuration_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.yaml");
        tokio::fs::write(&config_path, "bogus: true\n").await.unwrap();

        let err = Deployment::load(&config_path, &dir.path().join("state.yaml"))
            .await
            .expect_err("unknown keys must be rejected");
        assert!(matches!(err, Error::ParseFile { .. }));
    }

    #[tokio::test]
    async fn resources_must_be_enabled_in_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FakeProvider::default();
        let cancel = CancellationToken::new();

        let config_path = dir.path().join("config.yaml");
        tokio::fs::write(&config_path, "").await.unwrap();
        let mut deployment = Deployment::load(&config_path, &dir.path().join("state.yaml"))
            .await
            .unwrap();

        assert!(matches!(
            deployment.run_etcd(&provider, &cancel).await.unwrap_err(),
            Error::NotConfigured { .. }
        ));
        assert!(matches!(
            deployment
                .run_kubelet_pool("workers", &provider, &cancel)
                .await
                .unwrap_err(),
            Error::NotConfigured { .. }
        ));
    }

    #[tokio::test]
    async fn kubeconfig_requires_pki_and_controlplane() {
        let dir = tempfile::tempdir().unwrap();
        let mut deployment = deployment(dir.path()).await;

        assert!(matches!(
            deployment.kubeconfig().unwrap_err(),
            Error::NoPkiState
        ));

        deployment.run_pki().await.unwrap();
        assert!(matches!(
            deployment.kubeconfig().unwrap_err(),
            Error::NoControlplane
        ));

        deployment.config.controlplane = Some(controlplane::Controlplane {
            api_server_address: Some("10.0.0.10".to_owned()),
            ..controlplane::Controlplane::default()
        });

        let rendered = deployment.kubeconfig().expect("kubeconfig renders");
        let parsed: serde_yaml::Value = serde_yaml::from_str(&rendered).unwrap();
        assert_eq!(
            parsed["clusters"][0]["cluster"]["server"],
            "https://10.0.0.10:6443"
        );
    }

    #[tokio::test]
    async fn partial_failure_keeps_deploy_error_but_writes_state() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FakeProvider::default();
        let cancel = CancellationToken::new();

        let config_path = dir.path().join("config.yaml");
        let config = r#"
etcd:
  members:
    member-0:
      peerAddress: 10.0.0.1
      host:
        direct: {}
    member-1:
      peerAddress: 10.0.0.2
      host:
        direct:
          socket: /run/unreachable.sock
pki:
  etcd:
    peers:
      member-0: 10.0.0.1
      member-1: 10.0.0.2
    clients:
    - root
  kubernetes: {}
"#;
        tokio::fs::write(&config_path, config).await.unwrap();

        let state_path = dir.path().join("state.yaml");
        let mut deployment = Deployment::load(&config_path, &state_path).await.unwrap();
        deployment.run_pki().await.unwrap();

        let unreachable = crate::host::Host {
            direct: Some(direct::Config {
                socket: Some("/run/unreachable.sock".to_owned()),
            }),
            ssh: None,
        };
        provider.set_unreachable(&unreachable);

        let err = deployment
            .run_etcd(&provider, &cancel)
            .await
            .expect_err("unreachable member must fail the run");
        assert!(matches!(err, Error::Execution { .. }));

        // State was still persisted, holding the member that converged.
        let reloaded = Deployment::load(&config_path, &state_path).await.unwrap();
        let etcd_state = reloaded.state().etcd.as_ref().unwrap();
        assert!(etcd_state.contains_key("member-0"));
        assert!(!etcd_state.contains_key("member-1"));
    }
}
