//! Kubelet pool facade: one kubelet container per host, each bootstrapped
//! with a token kubeconfig. Labels the kubelet may not self-assign are
//! applied through the API server after the pool converges.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use tracing::debug;

use crate::container::{
    ContainerSpec, ContainersSet, ContainersState, File, FileMap, HostConfiguredContainer, Mount,
};
use crate::host::{self, ssh, Host};
use crate::kubeconfig;
use crate::pki::{self, Pki};
use crate::resource::Resource;
use crate::util;

/// Image used when the pool does not override it.
pub const DEFAULT_IMAGE: &str = "quay.io/keel/kubelet:v1.31.1";
/// Default volume plugin directory.
pub const DEFAULT_VOLUME_PLUGIN_DIR: &str =
    "/usr/libexec/kubernetes/kubelet-plugins/volume/exec";

const CONFIG_DIR: &str = "/etc/kubernetes/kubelet";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("at least one kubelet must be configured"))]
    NoKubelets,

    #[snafu(display("kubelet at index {index} has no name"))]
    NoName { index: usize },

    #[snafu(display("kubelet name {name:?} is used more than once"))]
    DuplicateName { name: String },

    #[snafu(display("bootstrap kubeconfig must be configured"))]
    NoBootstrapConfig,

    #[snafu(display("bootstrap kubeconfig is invalid: {source}"))]
    InvalidBootstrapConfig { source: kubeconfig::Error },

    #[snafu(display("kubernetes CA certificate is not available"))]
    NoCa,

    #[snafu(display("kubernetes CA certificate is invalid: {source}"))]
    InvalidCa { source: pki::Error },

    #[snafu(display("kubelet {name:?} has an invalid host: {source}"))]
    InvalidHost { name: String, source: host::Error },

    #[snafu(display("privileged labels require an admin kubeconfig"))]
    NoAdminConfig,

    #[snafu(display("admin kubeconfig is invalid: {source}"))]
    InvalidAdminConfig { source: kubeconfig::Error },

    #[snafu(display("rendering kubelet configuration failed: {source}"))]
    RenderConfig { source: serde_yaml::Error },

    #[snafu(display("rendering bootstrap kubeconfig failed: {source}"))]
    Kubeconfig { source: kubeconfig::Error },

    #[snafu(display("building API client failed: {source}"))]
    Client { source: reqwest::Error },

    #[snafu(display("labelling node {node:?} failed: {source}"))]
    LabelNode { node: String, source: reqwest::Error },
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Kubelet {
    /// Node name. Required.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<Host>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// `key` to `value:Effect` pairs passed to `--register-with-taints`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub taints: BTreeMap<String, String>,

    /// Labels outside the kubelet's self-labelling policy, applied through
    /// the API server after registration.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub privileged_labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_mounts: Vec<Mount>,
}

/// User-facing kubelet pool configuration.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Pool {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// SSH defaults applied to every kubelet host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh: Option<ssh::Config>,

    /// Token kubeconfig used for TLS bootstrapping. The cluster CA is
    /// attached from the PKI when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_config: Option<kubeconfig::Config>,

    /// Admin kubeconfig, required only when privileged labels are used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_config: Option<kubeconfig::Config>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cluster_dns_ips: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_plugin_dir: Option<String>,

    /// Pool-level defaults merged under each kubelet's own values.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub taints: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub privileged_labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_mounts: Vec<Mount>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kubelets: Vec<Kubelet>,
}

impl Pool {
    pub fn validate(&self, pki: Option<&Pki>) -> Result<()> {
        ensure!(!self.kubelets.is_empty(), NoKubeletsSnafu);

        let mut names = BTreeSet::new();
        for (index, kubelet) in self.kubelets.iter().enumerate() {
            let name = kubelet
                .name
                .as_deref()
                .filter(|name| !name.is_empty())
                .context(NoNameSnafu { index })?;
            ensure!(
                names.insert(name.to_owned()),
                DuplicateNameSnafu { name: name.to_owned() }
            );

            Host::build(kubelet.host.as_ref(), self.ssh.as_ref())
                .validate()
                .context(InvalidHostSnafu { name: name.to_owned() })?;
        }

        let ca = self.ca_certificate(pki).context(NoCaSnafu)?;
        pki::validate_certificate("kubernetes CA", &ca).context(InvalidCaSnafu)?;

        self.bootstrap_config(pki)?
            .validate()
            .context(InvalidBootstrapConfigSnafu)?;

        if self
            .kubelets
            .iter()
            .any(|kubelet| !kubelet.privileged_labels.is_empty())
            || !self.privileged_labels.is_empty()
        {
            let admin = self.admin_config.as_ref().context(NoAdminConfigSnafu)?;
            admin.validate().context(InvalidAdminConfigSnafu)?;
        }

        Ok(())
    }

    /// Validates and builds the pool resource with the previous state
    /// attached.
    pub fn build(
        &self,
        previous: Option<ContainersState>,
        pki: Option<&Pki>,
    ) -> Result<Resource> {
        self.validate(pki)?;

        let bootstrap = self
            .bootstrap_config(pki)?
            .to_yaml("bootstrap")
            .context(KubeconfigSnafu)?;
        let ca = self.ca_certificate(pki).context(NoCaSnafu)?;

        let mut desired = BTreeMap::new();
        let mut create_order = Vec::new();
        let mut privileged: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();

        for kubelet in &self.kubelets {
            let name = kubelet.name.clone().unwrap_or_default();
            let container = self.kubelet_container(kubelet, &bootstrap, &ca)?;

            let node_labels = merged(&self.privileged_labels, &kubelet.privileged_labels);
            if !node_labels.is_empty() {
                privileged.insert(name.clone(), node_labels);
            }

            create_order.push(name.clone());
            desired.insert(name, container);
        }

        let labels = if privileged.is_empty() {
            None
        } else {
            Some(PrivilegedLabels {
                admin: self.admin_config.clone().unwrap_or_default(),
                nodes: privileged,
            })
        };

        Ok(Resource::KubeletPool {
            set: ContainersSet::new(desired, previous, create_order),
            labels,
        })
    }

    fn kubelet_container(
        &self,
        kubelet: &Kubelet,
        bootstrap: &str,
        ca: &str,
    ) -> Result<HostConfiguredContainer> {
        let name = kubelet.name.clone().unwrap_or_default();
        let labels = merged(&self.labels, &kubelet.labels);
        let taints = merged(&self.taints, &kubelet.taints);

        let mut args = vec![
            "kubelet".to_owned(),
            format!("--hostname-override={name}"),
            format!("--bootstrap-kubeconfig={CONFIG_DIR}/bootstrap-kubeconfig"),
            format!("--kubeconfig={CONFIG_DIR}/kubeconfig"),
            format!("--config={CONFIG_DIR}/config.yaml"),
            format!(
                "--volume-plugin-dir={}",
                self.volume_plugin_dir
                    .clone()
                    .unwrap_or_else(|| DEFAULT_VOLUME_PLUGIN_DIR.to_owned())
            ),
        ];
        if !labels.is_empty() {
            args.push(format!("--node-labels={}", util::join_sorted(&labels, "=", ",")));
        }
        if !taints.is_empty() {
            args.push(format!(
                "--register-with-taints={}",
                util::join_sorted(&taints, "=", ",")
            ));
        }

        let mut mounts = vec![
            Mount {
                source: "/var/lib/kubelet".to_owned(),
                target: "/var/lib/kubelet".to_owned(),
                propagation: Some("rshared".to_owned()),
                ..Mount::default()
            },
            Mount {
                source: "/run".to_owned(),
                target: "/run".to_owned(),
                ..Mount::default()
            },
            Mount {
                source: "/dev".to_owned(),
                target: "/dev".to_owned(),
                ..Mount::default()
            },
            Mount {
                source: "/sys".to_owned(),
                target: "/sys".to_owned(),
                ..Mount::default()
            },
            Mount {
                source: "/etc/cni".to_owned(),
                target: "/etc/cni".to_owned(),
                ..Mount::default()
            },
            Mount {
                source: "/opt/cni".to_owned(),
                target: "/opt/cni".to_owned(),
                ..Mount::default()
            },
        ];
        mounts.extend(self.extra_mounts.iter().cloned());
        mounts.extend(kubelet.extra_mounts.iter().cloned());

        let spec = ContainerSpec {
            image: self
                .image
                .clone()
                .unwrap_or_else(|| DEFAULT_IMAGE.to_owned()),
            args,
            mounts,
            privileged: true,
            network_mode: Some("host".to_owned()),
            restart_policy: Some("always".to_owned()),
            ..ContainerSpec::default()
        };

        let config = KubeletConfiguration {
            kind: "KubeletConfiguration",
            api_version: "kubelet.config.k8s.io/v1beta1",
            cluster_dns: self.cluster_dns_ips.clone(),
            authentication: Authentication {
                x509: X509 {
                    client_ca_file: format!("{CONFIG_DIR}/ca.crt"),
                },
            },
        };
        let config = serde_yaml::to_string(&config).context(RenderConfigSnafu)?;

        let files = FileMap::from([
            (
                format!("{CONFIG_DIR}/bootstrap-kubeconfig"),
                File::with_mode(bootstrap.to_owned(), 0o600),
            ),
            (format!("{CONFIG_DIR}/config.yaml"), File::new(config)),
            (format!("{CONFIG_DIR}/ca.crt"), File::new(ca.to_owned())),
        ]);

        let host = Host::build(kubelet.host.as_ref(), self.ssh.as_ref());

        Ok(HostConfiguredContainer::with_files(host, spec, files))
    }

    /// Bootstrap kubeconfig with the cluster CA attached from the PKI when
    /// the user left it out.
    fn bootstrap_config(&self, pki: Option<&Pki>) -> Result<kubeconfig::Config> {
        let mut bootstrap = self
            .bootstrap_config
            .clone()
            .context(NoBootstrapConfigSnafu)?;

        if bootstrap.ca_certificate.is_none() {
            bootstrap.ca_certificate = self.ca_certificate(pki);
        }

        Ok(bootstrap)
    }

    fn ca_certificate(&self, pki: Option<&Pki>) -> Option<String> {
        pki.and_then(|pki| pki.kubernetes.as_ref())
            .and_then(|kubernetes| kubernetes.ca.as_ref())
            .and_then(|ca| ca.x509_certificate.clone())
            .or_else(|| {
                self.bootstrap_config
                    .as_ref()
                    .and_then(|bootstrap| bootstrap.ca_certificate.clone())
            })
    }
}

fn merged(
    defaults: &BTreeMap<String, String>,
    overrides: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = defaults.clone();
    merged.extend(overrides.clone());
    merged
}

#[derive(Serialize)]
struct KubeletConfiguration {
    kind: &'static str,
    #[serde(rename = "apiVersion")]
    api_version: &'static str,
    #[serde(rename = "clusterDNS", skip_serializing_if = "Vec::is_empty")]
    cluster_dns: Vec<String>,
    authentication: Authentication,
}

#[derive(Serialize)]
struct Authentication {
    x509: X509,
}

#[derive(Serialize)]
struct X509 {
    #[serde(rename = "clientCAFile")]
    client_ca_file: String,
}

/// Labels applied through the API server with the admin credentials once the
/// kubelets registered.
pub struct PrivilegedLabels {
    admin: kubeconfig::Config,
    nodes: BTreeMap<String, BTreeMap<String, String>>,
}

impl PrivilegedLabels {
    pub(crate) async fn apply(&self) -> Result<()> {
        let server = self.admin.server.clone().unwrap_or_default();
        let server = if server.starts_with("https://") {
            server
        } else {
            format!("https://{server}")
        };

        let mut builder = reqwest::Client::builder().use_rustls_tls();
        if let Some(ca) = &self.admin.ca_certificate {
            let ca = reqwest::Certificate::from_pem(ca.as_bytes()).context(ClientSnafu)?;
            builder = builder.add_root_certificate(ca);
        }
        if let (Some(cert), Some(key)) = (&self.admin.client_certificate, &self.admin.client_key)
        {
            let identity = reqwest::Identity::from_pem(format!("{cert}{key}").as_bytes())
                .context(ClientSnafu)?;
            builder = builder.identity(identity);
        }
        let client = builder.build().context(ClientSnafu)?;

        for (node, labels) in &self.nodes {
            debug!(node, "Applying privileged labels");

            let patch = serde_json::json!({ "metadata": { "labels": labels } });
            let response = client
                .patch(format!("{server}/api/v1/nodes/{node}"))
                .header(
                    reqwest::header::CONTENT_TYPE,
                    "application/strategic-merge-patch+json",
                )
                .json(&patch)
                .send()
                .await
                .context(LabelNodeSnafu { node: node.clone() })?;

            response
                .error_for_status()
                .context(LabelNodeSnafu { node: node.clone() })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::direct;
    use crate::pki::KubernetesPki;

    fn generated_pki() -> Pki {
        let mut pki = Pki {
            kubernetes: Some(KubernetesPki::default()),
            ..Pki::default()
        };
        pki.generate().expect("PKI generation succeeds");
        pki
    }

    fn pool_of(names: &[&str]) -> Pool {
        Pool {
            bootstrap_config: Some(kubeconfig::Config {
                server: Some("https://10.0.0.10:6443".to_owned()),
                token: Some("07401b.f395accd246ae52d".to_owned()),
                ..kubeconfig::Config::default()
            }),
            kubelets: names
                .iter()
                .map(|name| Kubelet {
                    name: Some((*name).to_owned()),
                    host: Some(Host {
                        direct: Some(direct::Config::default()),
                        ssh: None,
                    }),
                    ..Kubelet::default()
                })
                .collect(),
            ..Pool::default()
        }
    }

    #[test]
    fn projection_injects_bootstrap_credentials() {
        let pki = generated_pki();
        let pool = pool_of(&["node-1", "node-2"]);

        let Resource::KubeletPool { set, labels } =
            pool.build(None, Some(&pki)).expect("build succeeds")
        else {
            panic!("expected a kubelet pool resource");
        };

        assert!(labels.is_none());
        let keys: Vec<&str> = set.desired_keys().collect();
        assert_eq!(keys, ["node-1", "node-2"]);

        let kubelet = set.desired("node-1").unwrap();
        assert!(kubelet.container.privileged);
        assert!(kubelet
            .container
            .args
            .contains(&"--hostname-override=node-1".to_owned()));
        assert_eq!(
            kubelet.config_files[&format!("{CONFIG_DIR}/bootstrap-kubeconfig")].mode(),
            0o600
        );
        assert!(kubelet.config_files[&format!("{CONFIG_DIR}/bootstrap-kubeconfig")]
            .content
            .contains("07401b.f395accd246ae52d"));
        assert!(kubelet
            .config_files
            .contains_key(&format!("{CONFIG_DIR}/config.yaml")));
    }

    #[test]
    fn labels_and_taints_become_arguments() {
        let pki = generated_pki();
        let mut pool = pool_of(&["node-1"]);
        pool.labels = BTreeMap::from([("pool".to_owned(), "a".to_owned())]);
        pool.kubelets[0].labels =
            BTreeMap::from([("node-role.kubernetes.io/worker".to_owned(), String::new())]);
        pool.kubelets[0].taints =
            BTreeMap::from([("dedicated".to_owned(), "etcd:NoSchedule".to_owned())]);

        let Resource::KubeletPool { set, .. } = pool.build(None, Some(&pki)).unwrap() else {
            panic!("expected a kubelet pool resource");
        };

        let args = &set.desired("node-1").unwrap().container.args;
        assert!(args.contains(&"--node-labels=node-role.kubernetes.io/worker=,pool=a".to_owned()));
        assert!(args.contains(&"--register-with-taints=dedicated=etcd:NoSchedule".to_owned()));
    }

    #[test]
    fn extra_mounts_are_included() {
        let pki = generated_pki();
        let mut pool = pool_of(&["node-1"]);
        let extra = Mount {
            source: "/tmp".to_owned(),
            target: "/foo".to_owned(),
            ..Mount::default()
        };
        pool.kubelets[0].extra_mounts = vec![extra.clone()];

        let Resource::KubeletPool { set, .. } = pool.build(None, Some(&pki)).unwrap() else {
            panic!("expected a kubelet pool resource");
        };

        assert!(set
            .desired("node-1")
            .unwrap()
            .container
            .mounts
            .contains(&extra));
    }

    #[test]
    fn validation_requires_names_and_ca() {
        let pki = generated_pki();

        assert!(matches!(
            Pool::default().validate(Some(&pki)).unwrap_err(),
            Error::NoKubelets
        ));

        let mut unnamed = pool_of(&["node-1"]);
        unnamed.kubelets[0].name = None;
        assert!(matches!(
            unnamed.validate(Some(&pki)).unwrap_err(),
            Error::NoName { index: 0 }
        ));

        // Neither PKI nor the bootstrap config carry a CA.
        let pool = pool_of(&["node-1"]);
        assert!(matches!(pool.validate(None).unwrap_err(), Error::NoCa));

        let mut bad_ca = pool_of(&["node-1"]);
        if let Some(bootstrap) = &mut bad_ca.bootstrap_config {
            bootstrap.ca_certificate = Some("doh".to_owned());
        }
        assert!(matches!(
            bad_ca.validate(None).unwrap_err(),
            Error::InvalidCa { .. }
        ));
    }

    #[test]
    fn privileged_labels_require_admin_config() {
        let pki = generated_pki();
        let mut pool = pool_of(&["node-1"]);
        pool.kubelets[0].privileged_labels =
            BTreeMap::from([("node-role.kubernetes.io/master".to_owned(), String::new())]);

        assert!(matches!(
            pool.validate(Some(&pki)).unwrap_err(),
            Error::NoAdminConfig
        ));

        let admin = pki
            .kubernetes
            .as_ref()
            .unwrap()
            .admin_certificate
            .clone()
            .unwrap();
        pool.admin_config = Some(kubeconfig::Config {
            server: Some("https://10.0.0.10:6443".to_owned()),
            ca_certificate: pool.ca_certificate(Some(&pki)),
            client_certificate: admin.x509_certificate,
            client_key: admin.private_key,
            token: None,
        });

        pool.validate(Some(&pki)).expect("admin config satisfies validation");

        let Resource::KubeletPool { labels, .. } = pool.build(None, Some(&pki)).unwrap() else {
            panic!("expected a kubelet pool resource");
        };
        assert!(labels.is_some());
    }
}
