//! Static controlplane facade: kube-apiserver, kube-controller-manager and
//! kube-scheduler containers bound to a single host.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use snafu::{ensure, OptionExt, ResultExt, Snafu};

use crate::container::{
    ContainerSpec, ContainersSet, ContainersState, File, FileMap, HostConfiguredContainer,
};
use crate::host::{self, ssh, Host};
use crate::kubeconfig;
use crate::pki::{Certificate, Pki};
use crate::resource::Resource;

/// Default API server image.
pub const DEFAULT_API_SERVER_IMAGE: &str = "registry.k8s.io/kube-apiserver:v1.31.1";
/// Default controller manager image.
pub const DEFAULT_CONTROLLER_MANAGER_IMAGE: &str =
    "registry.k8s.io/kube-controller-manager:v1.31.1";
/// Default scheduler image.
pub const DEFAULT_SCHEDULER_IMAGE: &str = "registry.k8s.io/kube-scheduler:v1.31.1";

/// Default API server secure port.
pub const DEFAULT_SECURE_PORT: u16 = 6443;
/// Default service cluster IP range.
pub const DEFAULT_SERVICE_CIDR: &str = "10.96.0.0/12";

const PKI_DIR: &str = "/etc/kubernetes/pki";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("API server address must be set"))]
    NoApiServerAddress,

    #[snafu(display("kubeAPIServer must be configured with at least one etcd server"))]
    NoEtcdServers,

    #[snafu(display("invalid controlplane host: {source}"))]
    InvalidHost { source: host::Error },

    #[snafu(display("PKI does not carry {what}; run the pki command first"))]
    MissingPkiMaterial { what: &'static str },

    #[snafu(display("building component kubeconfig failed: {source}"))]
    Kubeconfig { source: kubeconfig::Error },
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct KubeApiServer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Client URLs of the etcd cluster, e.g. `https://10.0.0.1:2379`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub etcd_servers: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_cidr: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_address: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct KubeControllerManager {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct KubeScheduler {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// User-facing controlplane configuration.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Controlplane {
    /// Address clients and components reach the API server on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_server_address: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_server_port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<Host>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh: Option<ssh::Config>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_api_server: Option<KubeApiServer>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_controller_manager: Option<KubeControllerManager>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_scheduler: Option<KubeScheduler>,
}

/// References into the PKI tree needed by the three components.
struct Material<'a> {
    ca: &'a Certificate,
    api_server: &'a Certificate,
    kubelet_client: &'a Certificate,
    front_proxy_ca: &'a Certificate,
    front_proxy_client: &'a Certificate,
    service_account: &'a Certificate,
    admin: &'a Certificate,
    etcd_ca: &'a Certificate,
    etcd_client: &'a Certificate,
}

fn populated<'a>(
    cert: Option<&'a Certificate>,
    what: &'static str,
) -> Result<&'a Certificate> {
    let cert = cert.context(MissingPkiMaterialSnafu { what })?;
    ensure!(
        cert.x509_certificate.is_some() && cert.private_key.is_some(),
        MissingPkiMaterialSnafu { what }
    );
    Ok(cert)
}

fn material(pki: Option<&Pki>) -> Result<Material<'_>> {
    let kubernetes = pki
        .and_then(|pki| pki.kubernetes.as_ref())
        .context(MissingPkiMaterialSnafu {
            what: "a kubernetes subtree",
        })?;
    let api_server = kubernetes
        .kube_api_server
        .as_ref()
        .context(MissingPkiMaterialSnafu {
            what: "kube-apiserver certificates",
        })?;
    let etcd = pki
        .and_then(|pki| pki.etcd.as_ref())
        .context(MissingPkiMaterialSnafu { what: "an etcd subtree" })?;

    Ok(Material {
        ca: populated(kubernetes.ca.as_ref(), "the kubernetes CA")?,
        api_server: populated(
            api_server.server_certificate.as_ref(),
            "the API server certificate",
        )?,
        kubelet_client: populated(
            api_server.kubelet_certificate.as_ref(),
            "the kubelet client certificate",
        )?,
        front_proxy_ca: populated(kubernetes.front_proxy_ca.as_ref(), "the front proxy CA")?,
        front_proxy_client: populated(
            api_server.front_proxy_client_certificate.as_ref(),
            "the front proxy client certificate",
        )?,
        service_account: {
            let cert = kubernetes
                .service_account_certificate
                .as_ref()
                .context(MissingPkiMaterialSnafu {
                    what: "the service account keypair",
                })?;
            ensure!(
                cert.private_key.is_some(),
                MissingPkiMaterialSnafu {
                    what: "the service account keypair",
                }
            );
            cert
        },
        admin: populated(
            kubernetes.admin_certificate.as_ref(),
            "the admin certificate",
        )?,
        etcd_ca: populated(etcd.ca.as_ref(), "the etcd CA")?,
        etcd_client: populated(
            etcd.client_certificates.get("kube-apiserver"),
            "an etcd client certificate for kube-apiserver",
        )?,
    })
}

impl Controlplane {
    pub fn validate(&self, pki: Option<&Pki>) -> Result<()> {
        ensure!(
            self.api_server_address
                .as_deref()
                .is_some_and(|a| !a.is_empty()),
            NoApiServerAddressSnafu
        );

        let api_server = self.kube_api_server.as_ref().context(NoEtcdServersSnafu)?;
        ensure!(!api_server.etcd_servers.is_empty(), NoEtcdServersSnafu);

        Host::build(self.host.as_ref(), self.ssh.as_ref())
            .validate()
            .context(InvalidHostSnafu)?;

        material(pki)?;

        Ok(())
    }

    /// Validates and builds the controlplane resource: three containers on
    /// the controlplane host.
    pub fn build(
        &self,
        previous: Option<ContainersState>,
        pki: Option<&Pki>,
    ) -> Result<Resource> {
        self.validate(pki)?;

        let material = material(pki)?;
        let host = Host::build(self.host.as_ref(), self.ssh.as_ref());
        let address = self.api_server_address.clone().unwrap_or_default();
        let port = self.api_server_port.unwrap_or(DEFAULT_SECURE_PORT);

        let component_kubeconfig = kubeconfig::Config {
            server: Some(format!("https://{address}:{port}")),
            ca_certificate: material.ca.x509_certificate.clone(),
            client_certificate: material.admin.x509_certificate.clone(),
            client_key: material.admin.private_key.clone(),
            token: None,
        }
        .to_yaml("local")
        .context(KubeconfigSnafu)?;

        let mut desired = BTreeMap::new();
        desired.insert(
            "kube-apiserver".to_owned(),
            self.api_server_container(&material, &host, &address, port),
        );
        desired.insert(
            "kube-controller-manager".to_owned(),
            self.controller_manager_container(&material, &host, &component_kubeconfig),
        );
        desired.insert(
            "kube-scheduler".to_owned(),
            self.scheduler_container(&host, &component_kubeconfig),
        );

        let create_order = vec![
            "kube-apiserver".to_owned(),
            "kube-controller-manager".to_owned(),
            "kube-scheduler".to_owned(),
        ];

        Ok(Resource::Controlplane {
            set: ContainersSet::new(desired, previous, create_order),
        })
    }

    fn api_server_container(
        &self,
        material: &Material<'_>,
        host: &Host,
        address: &str,
        port: u16,
    ) -> HostConfiguredContainer {
        let options = self.kube_api_server.clone().unwrap_or_default();
        let bind_address = options.bind_address.unwrap_or_else(|| "0.0.0.0".to_owned());
        let service_cidr = options
            .service_cidr
            .unwrap_or_else(|| DEFAULT_SERVICE_CIDR.to_owned());

        let spec = ContainerSpec {
            image: options
                .image
                .unwrap_or_else(|| DEFAULT_API_SERVER_IMAGE.to_owned()),
            args: vec![
                "kube-apiserver".to_owned(),
                format!("--advertise-address={address}"),
                format!("--bind-address={bind_address}"),
                format!("--secure-port={port}"),
                format!("--etcd-servers={}", options.etcd_servers.join(",")),
                format!("--etcd-cafile={PKI_DIR}/etcd/ca.crt"),
                format!("--etcd-certfile={PKI_DIR}/etcd/client.crt"),
                format!("--etcd-keyfile={PKI_DIR}/etcd/client.key"),
                format!("--client-ca-file={PKI_DIR}/ca.crt"),
                format!("--tls-cert-file={PKI_DIR}/apiserver.crt"),
                format!("--tls-private-key-file={PKI_DIR}/apiserver.key"),
                format!("--service-account-key-file={PKI_DIR}/sa.key"),
                format!("--service-account-signing-key-file={PKI_DIR}/sa.key"),
                format!("--service-account-issuer=https://{address}:{port}"),
                format!("--service-cluster-ip-range={service_cidr}"),
                format!("--kubelet-client-certificate={PKI_DIR}/kubelet-client.crt"),
                format!("--kubelet-client-key={PKI_DIR}/kubelet-client.key"),
                "--kubelet-preferred-address-types=InternalIP,Hostname".to_owned(),
                format!("--requestheader-client-ca-file={PKI_DIR}/front-proxy-ca.crt"),
                format!("--proxy-client-cert-file={PKI_DIR}/front-proxy-client.crt"),
                format!("--proxy-client-key-file={PKI_DIR}/front-proxy-client.key"),
                "--authorization-mode=Node,RBAC".to_owned(),
                "--allow-privileged=true".to_owned(),
            ],
            network_mode: Some("host".to_owned()),
            restart_policy: Some("always".to_owned()),
            ..ContainerSpec::default()
        };

        let mut files = FileMap::new();
        insert_cert(&mut files, &format!("{PKI_DIR}/ca.crt"), material.ca);
        insert_pair(
            &mut files,
            &format!("{PKI_DIR}/apiserver"),
            material.api_server,
        );
        insert_pair(
            &mut files,
            &format!("{PKI_DIR}/kubelet-client"),
            material.kubelet_client,
        );
        insert_cert(
            &mut files,
            &format!("{PKI_DIR}/front-proxy-ca.crt"),
            material.front_proxy_ca,
        );
        insert_pair(
            &mut files,
            &format!("{PKI_DIR}/front-proxy-client"),
            material.front_proxy_client,
        );
        insert_key(
            &mut files,
            &format!("{PKI_DIR}/sa.key"),
            material.service_account,
        );
        insert_cert(
            &mut files,
            &format!("{PKI_DIR}/etcd/ca.crt"),
            material.etcd_ca,
        );
        insert_pair(
            &mut files,
            &format!("{PKI_DIR}/etcd/client"),
            material.etcd_client,
        );

        HostConfiguredContainer::with_files(host.clone(), spec, files)
    }

    fn controller_manager_container(
        &self,
        material: &Material<'_>,
        host: &Host,
        component_kubeconfig: &str,
    ) -> HostConfiguredContainer {
        let options = self.kube_controller_manager.clone().unwrap_or_default();

        let spec = ContainerSpec {
            image: options
                .image
                .unwrap_or_else(|| DEFAULT_CONTROLLER_MANAGER_IMAGE.to_owned()),
            args: vec![
                "kube-controller-manager".to_owned(),
                "--kubeconfig=/etc/kubernetes/kubeconfig".to_owned(),
                format!("--root-ca-file={PKI_DIR}/ca.crt"),
                format!("--cluster-signing-cert-file={PKI_DIR}/ca.crt"),
                format!("--cluster-signing-key-file={PKI_DIR}/ca.key"),
                format!("--service-account-private-key-file={PKI_DIR}/sa.key"),
                "--use-service-account-credentials=true".to_owned(),
            ],
            network_mode: Some("host".to_owned()),
            restart_policy: Some("always".to_owned()),
            ..ContainerSpec::default()
        };

        let mut files = FileMap::new();
        files.insert(
            "/etc/kubernetes/kubeconfig".to_owned(),
            File::with_mode(component_kubeconfig.to_owned(), 0o600),
        );
        insert_cert(&mut files, &format!("{PKI_DIR}/ca.crt"), material.ca);
        insert_key(&mut files, &format!("{PKI_DIR}/ca.key"), material.ca);
        insert_key(
            &mut files,
            &format!("{PKI_DIR}/sa.key"),
            material.service_account,
        );

        HostConfiguredContainer::with_files(host.clone(), spec, files)
    }

    fn scheduler_container(
        &self,
        host: &Host,
        component_kubeconfig: &str,
    ) -> HostConfiguredContainer {
        let options = self.kube_scheduler.clone().unwrap_or_default();

        let spec = ContainerSpec {
            image: options
                .image
                .unwrap_or_else(|| DEFAULT_SCHEDULER_IMAGE.to_owned()),
            args: vec![
                "kube-scheduler".to_owned(),
                "--kubeconfig=/etc/kubernetes/kubeconfig".to_owned(),
            ],
            network_mode: Some("host".to_owned()),
            restart_policy: Some("always".to_owned()),
            ..ContainerSpec::default()
        };

        let files = FileMap::from([(
            "/etc/kubernetes/kubeconfig".to_owned(),
            File::with_mode(component_kubeconfig.to_owned(), 0o600),
        )]);

        HostConfiguredContainer::with_files(host.clone(), spec, files)
    }
}

fn insert_cert(files: &mut FileMap, path: &str, cert: &Certificate) {
    if let Some(pem) = &cert.x509_certificate {
        files.insert(path.to_owned(), File::new(pem.clone()));
    }
}

fn insert_key(files: &mut FileMap, path: &str, cert: &Certificate) {
    if let Some(key) = &cert.private_key {
        files.insert(path.to_owned(), File::with_mode(key.clone(), 0o600));
    }
}

fn insert_pair(files: &mut FileMap, prefix: &str, cert: &Certificate) {
    insert_cert(files, &format!("{prefix}.crt"), cert);
    insert_key(files, &format!("{prefix}.key"), cert);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::direct;
    use crate::pki::{EtcdPki, KubeApiServerPki, KubernetesPki};

    fn generated_pki() -> Pki {
        let mut pki = Pki {
            etcd: Some(EtcdPki {
                peers: BTreeMap::from([("member-0".to_owned(), "10.0.0.1".to_owned())]),
                clients: vec!["root".to_owned(), "kube-apiserver".to_owned()],
                ..EtcdPki::default()
            }),
            kubernetes: Some(KubernetesPki {
                kube_api_server: Some(KubeApiServerPki {
                    server_ips: vec!["10.0.0.10".to_owned()],
                    ..KubeApiServerPki::default()
                }),
                ..KubernetesPki::default()
            }),
            ..Pki::default()
        };
        pki.generate().expect("PKI generation succeeds");
        pki
    }

    fn configured() -> Controlplane {
        Controlplane {
            api_server_address: Some("10.0.0.10".to_owned()),
            host: Some(Host {
                direct: Some(direct::Config::default()),
                ssh: None,
            }),
            kube_api_server: Some(KubeApiServer {
                etcd_servers: vec!["https://10.0.0.1:2379".to_owned()],
                ..KubeApiServer::default()
            }),
            ..Controlplane::default()
        }
    }

    #[test]
    fn builds_three_components_on_one_host() {
        let pki = generated_pki();
        let Resource::Controlplane { set } =
            configured().build(None, Some(&pki)).expect("build succeeds")
        else {
            panic!("expected a controlplane resource");
        };

        let keys: Vec<&str> = set.desired_keys().collect();
        assert_eq!(
            keys,
            ["kube-apiserver", "kube-controller-manager", "kube-scheduler"]
        );

        let api_server = set.desired("kube-apiserver").unwrap();
        assert!(api_server
            .container
            .args
            .contains(&"--etcd-servers=https://10.0.0.1:2379".to_owned()));
        assert!(api_server
            .container
            .args
            .contains(&"--secure-port=6443".to_owned()));
        assert!(api_server
            .config_files
            .contains_key("/etc/kubernetes/pki/apiserver.key"));
        assert_eq!(
            api_server.config_files["/etc/kubernetes/pki/apiserver.key"].mode(),
            0o600
        );

        let scheduler = set.desired("kube-scheduler").unwrap();
        assert!(scheduler
            .config_files
            .contains_key("/etc/kubernetes/kubeconfig"));
        assert_eq!(api_server.host, scheduler.host);
    }

    #[test]
    fn validation_requires_address_and_etcd_servers() {
        let pki = generated_pki();

        let mut no_address = configured();
        no_address.api_server_address = None;
        assert!(matches!(
            no_address.validate(Some(&pki)).unwrap_err(),
            Error::NoApiServerAddress
        ));

        let mut no_etcd = configured();
        no_etcd.kube_api_server = Some(KubeApiServer::default());
        assert!(matches!(
            no_etcd.validate(Some(&pki)).unwrap_err(),
            Error::NoEtcdServers
        ));
    }

    #[test]
    fn validation_requires_kubelet_client_certificate() {
        let mut pki = generated_pki();
        if let Some(api_server) = pki
            .kubernetes
            .as_mut()
            .and_then(|k| k.kube_api_server.as_mut())
        {
            api_server.kubelet_certificate = None;
        }

        let err = configured().validate(Some(&pki)).unwrap_err();
        assert!(matches!(
            err,
            Error::MissingPkiMaterial {
                what: "the kubelet client certificate"
            }
        ));
    }

    #[test]
    fn validation_requires_generated_pki() {
        assert!(configured().validate(None).is_err());
    }
}
