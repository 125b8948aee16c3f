//! Cluster PKI: a tree of CAs and leaf certificates generated in dependency
//! order.
//!
//! Every node carries optional generation parameters plus the materialized
//! PEM pair. Nodes that already hold both a certificate and a private key
//! are preserved byte-for-byte; nodes holding only a key get a certificate
//! re-issued for that key; empty nodes get both generated.

use std::collections::BTreeMap;
use std::net::IpAddr;

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    Ia5String, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt, Snafu};

use crate::util;

/// RSA key size used when none is configured.
pub const DEFAULT_RSA_BITS: u32 = 2048;
/// Certificate validity used when none is configured, in hours.
pub const DEFAULT_VALIDITY_HOURS: u64 = 8760;

const ROOT_CA_CN: &str = "root-ca";
const ETCD_CA_CN: &str = "etcd-ca";
const KUBERNETES_CA_CN: &str = "kubernetes-ca";
const FRONT_PROXY_CA_CN: &str = "front-proxy-ca";
const ADMIN_CN: &str = "kubernetes-admin";
const ADMIN_ORGANIZATION: &str = "system:masters";
const API_SERVER_CN: &str = "kube-apiserver";
const KUBELET_CLIENT_CN: &str = "kube-apiserver-kubelet-client";
const FRONT_PROXY_CLIENT_CN: &str = "front-proxy-client";
const SERVICE_ACCOUNT_CN: &str = "service-account";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("generating RSA key for {path} failed: {source}"))]
    GenerateKey { path: String, source: rsa::Error },

    #[snafu(display("encoding private key for {path} failed: {source}"))]
    EncodeKey {
        path: String,
        source: rsa::pkcs8::Error,
    },

    #[snafu(display("parsing private key of {path} failed: {source}"))]
    ParseKey { path: String, source: rcgen::Error },

    #[snafu(display("parsing CA certificate of {path} failed: {source}"))]
    ParseCa { path: String, source: rcgen::Error },

    #[snafu(display("issuing certificate for {path} failed: {source}"))]
    IssueCertificate { path: String, source: rcgen::Error },

    #[snafu(display("invalid IP address {address:?} on {path}: {source}"))]
    InvalidIpAddress {
        path: String,
        address: String,
        source: std::net::AddrParseError,
    },

    #[snafu(display("invalid DNS name {name:?} on {path}: {source}"))]
    InvalidDnsName {
        path: String,
        name: String,
        source: rcgen::Error,
    },

    #[snafu(display("unknown key usage {value:?} on {path}"))]
    InvalidKeyUsage { path: String, value: String },

    #[snafu(display("{what} is not valid PEM: {source}"))]
    InvalidPem {
        what: String,
        source: pem::PemError,
    },

    #[snafu(display("{what} is not a {expected} PEM block, got {tag:?}"))]
    WrongPemTag {
        what: String,
        expected: &'static str,
        tag: String,
    },
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// One node of the PKI tree: generation parameters plus the materialized
/// PEM pair.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Certificate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub common_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rsa_bits: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validity_hours: Option<u64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_names: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_addresses: Vec<String>,

    /// `server_auth`, `client_auth`, or both. Empty means the node's
    /// position in the tree decides.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_usage: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x509_certificate: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
}

impl Certificate {
    fn populated(&self) -> bool {
        self.x509_certificate.is_some() && self.private_key.is_some()
    }

    /// Field-wise layering: `state` wins, `config` fills the gaps.
    fn layered(state: Option<Certificate>, config: Option<Certificate>) -> Option<Certificate> {
        match (state, config) {
            (None, None) => None,
            (Some(state), None) => Some(state),
            (None, Some(config)) => Some(config),
            (Some(state), Some(config)) => Some(Certificate {
                common_name: state.common_name.or(config.common_name),
                organization: state.organization.or(config.organization),
                rsa_bits: state.rsa_bits.or(config.rsa_bits),
                validity_hours: state.validity_hours.or(config.validity_hours),
                dns_names: util::pick(
                    [state.dns_names, config.dns_names]
                        .into_iter()
                        .map(|v| (!v.is_empty()).then_some(v)),
                )
                .unwrap_or_default(),
                ip_addresses: util::pick(
                    [state.ip_addresses, config.ip_addresses]
                        .into_iter()
                        .map(|v| (!v.is_empty()).then_some(v)),
                )
                .unwrap_or_default(),
                key_usage: util::pick(
                    [state.key_usage, config.key_usage]
                        .into_iter()
                        .map(|v| (!v.is_empty()).then_some(v)),
                )
                .unwrap_or_default(),
                x509_certificate: state.x509_certificate.or(config.x509_certificate),
                private_key: state.private_key.or(config.private_key),
            }),
        }
    }
}

/// etcd subtree: a CA plus per-member peer certificates and per-CN client
/// certificates.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EtcdPki {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<Certificate>,

    /// Peer name to peer address.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub peers: BTreeMap<String, String>,

    /// Client common names, e.g. `root` or `kube-apiserver`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clients: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub peer_certificates: BTreeMap<String, Certificate>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub client_certificates: BTreeMap<String, Certificate>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct KubernetesPki {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<Certificate>,

    #[serde(default, rename = "frontProxyCA", skip_serializing_if = "Option::is_none")]
    pub front_proxy_ca: Option<Certificate>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_certificate: Option<Certificate>,

    /// Keypair consumed by the API server and controller manager for
    /// service-account token signing. Only the key material is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_certificate: Option<Certificate>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_api_server: Option<KubeApiServerPki>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct KubeApiServerPki {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_certificate: Option<Certificate>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubelet_certificate: Option<Certificate>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub front_proxy_client_certificate: Option<Certificate>,

    /// Extra IP addresses placed on the server certificate.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub server_ips: Vec<String>,

    /// Extra DNS names placed on the server certificate.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub server_dns_names: Vec<String>,
}

/// The full PKI tree.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Pki {
    /// Defaults inherited by every generated node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<Certificate>,

    #[serde(default, rename = "rootCA", skip_serializing_if = "Option::is_none")]
    pub root_ca: Option<Certificate>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd: Option<EtcdPki>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes: Option<KubernetesPki>,
}

/// How a node is used, deciding CA flags and extended key usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Ca,
    Server,
    Client,
    Peer,
    KeyOnly,
}

/// Where a generated node is written back into the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot {
    RootCa,
    EtcdCa,
    EtcdPeer(String),
    EtcdClient(String),
    KubernetesCa,
    FrontProxyCa,
    Admin,
    ServiceAccount,
    ApiServer,
    KubeletClient,
    FrontProxyClient,
}

/// One entry of the flat generation arena. Parents always precede their
/// children, so signing walks indices in order without back-references.
#[derive(Debug)]
struct Node {
    path: String,
    parent: Option<usize>,
    role: Role,
    slot: Slot,
    cert: Certificate,
}

impl Pki {
    /// Layers `config` under `state`: state values win field-wise, so
    /// already materialized certificates are never regenerated.
    pub fn layered(state: Option<Pki>, config: Option<Pki>) -> Option<Pki> {
        match (state, config) {
            (None, None) => None,
            (Some(state), None) => Some(state),
            (None, Some(config)) => Some(config),
            (Some(state), Some(config)) => Some(Pki {
                certificate: Certificate::layered(state.certificate, config.certificate),
                root_ca: Certificate::layered(state.root_ca, config.root_ca),
                etcd: match (state.etcd, config.etcd) {
                    (None, None) => None,
                    (Some(state), None) => Some(state),
                    (None, Some(config)) => Some(config),
                    (Some(state), Some(config)) => Some(EtcdPki {
                        ca: Certificate::layered(state.ca, config.ca),
                        peers: if state.peers.is_empty() {
                            config.peers
                        } else {
                            state.peers
                        },
                        clients: if state.clients.is_empty() {
                            config.clients
                        } else {
                            state.clients
                        },
                        peer_certificates: layered_map(
                            state.peer_certificates,
                            config.peer_certificates,
                        ),
                        client_certificates: layered_map(
                            state.client_certificates,
                            config.client_certificates,
                        ),
                    }),
                },
                kubernetes: match (state.kubernetes, config.kubernetes) {
                    (None, None) => None,
                    (Some(state), None) => Some(state),
                    (None, Some(config)) => Some(config),
                    (Some(state), Some(config)) => Some(KubernetesPki {
                        ca: Certificate::layered(state.ca, config.ca),
                        front_proxy_ca: Certificate::layered(
                            state.front_proxy_ca,
                            config.front_proxy_ca,
                        ),
                        admin_certificate: Certificate::layered(
                            state.admin_certificate,
                            config.admin_certificate,
                        ),
                        service_account_certificate: Certificate::layered(
                            state.service_account_certificate,
                            config.service_account_certificate,
                        ),
                        kube_api_server: match (state.kube_api_server, config.kube_api_server) {
                            (None, None) => None,
                            (Some(state), None) => Some(state),
                            (None, Some(config)) => Some(config),
                            (Some(state), Some(config)) => Some(KubeApiServerPki {
                                server_certificate: Certificate::layered(
                                    state.server_certificate,
                                    config.server_certificate,
                                ),
                                kubelet_certificate: Certificate::layered(
                                    state.kubelet_certificate,
                                    config.kubelet_certificate,
                                ),
                                front_proxy_client_certificate: Certificate::layered(
                                    state.front_proxy_client_certificate,
                                    config.front_proxy_client_certificate,
                                ),
                                server_ips: if state.server_ips.is_empty() {
                                    config.server_ips
                                } else {
                                    state.server_ips
                                },
                                server_dns_names: if state.server_dns_names.is_empty() {
                                    config.server_dns_names
                                } else {
                                    state.server_dns_names
                                },
                            }),
                        },
                    }),
                },
            }),
        }
    }

    /// Generates every missing key and certificate, preserving populated
    /// nodes verbatim.
    pub fn generate(&mut self) -> Result<()> {
        let defaults = self.certificate.clone().unwrap_or_default();
        let mut nodes = self.arena();

        for index in 0..nodes.len() {
            let (resolved, rest) = nodes.split_at_mut(index);
            let node = &mut rest[0];
            let parent = node.parent.map(|parent| &resolved[parent]);
            ensure_node(node, parent, &defaults)?;
        }

        for node in nodes {
            self.store(node.slot, node.cert);
        }

        Ok(())
    }

    /// Builds the flat generation arena in dependency order.
    fn arena(&mut self) -> Vec<Node> {
        let mut nodes = Vec::new();

        let mut root = self.root_ca.take().unwrap_or_default();
        root.common_name.get_or_insert_with(|| ROOT_CA_CN.to_owned());
        nodes.push(Node {
            path: "rootCA".to_owned(),
            parent: None,
            role: Role::Ca,
            slot: Slot::RootCa,
            cert: root,
        });
        let root_index = 0;

        if let Some(etcd) = &mut self.etcd {
            let mut ca = etcd.ca.take().unwrap_or_default();
            ca.common_name.get_or_insert_with(|| ETCD_CA_CN.to_owned());
            nodes.push(Node {
                path: "etcd/ca".to_owned(),
                parent: Some(root_index),
                role: Role::Ca,
                slot: Slot::EtcdCa,
                cert: ca,
            });
            let ca_index = nodes.len() - 1;

            for (name, address) in &etcd.peers {
                let mut cert = etcd.peer_certificates.remove(name).unwrap_or_default();
                cert.common_name.get_or_insert_with(|| format!("etcd-{name}"));
                if cert.dns_names.is_empty() {
                    cert.dns_names = vec![name.clone(), "localhost".to_owned()];
                }
                if cert.ip_addresses.is_empty() {
                    cert.ip_addresses = vec![address.clone(), "127.0.0.1".to_owned()];
                }

                nodes.push(Node {
                    path: format!("etcd/peerCertificates/{name}"),
                    parent: Some(ca_index),
                    role: Role::Peer,
                    slot: Slot::EtcdPeer(name.clone()),
                    cert,
                });
            }

            for name in &etcd.clients {
                let mut cert = etcd.client_certificates.remove(name).unwrap_or_default();
                cert.common_name.get_or_insert_with(|| name.clone());

                nodes.push(Node {
                    path: format!("etcd/clientCertificates/{name}"),
                    parent: Some(ca_index),
                    role: Role::Client,
                    slot: Slot::EtcdClient(name.clone()),
                    cert,
                });
            }
        }

        if let Some(kubernetes) = &mut self.kubernetes {
            let mut ca = kubernetes.ca.take().unwrap_or_default();
            ca.common_name
                .get_or_insert_with(|| KUBERNETES_CA_CN.to_owned());
            nodes.push(Node {
                path: "kubernetes/ca".to_owned(),
                parent: Some(root_index),
                role: Role::Ca,
                slot: Slot::KubernetesCa,
                cert: ca,
            });
            let ca_index = nodes.len() - 1;

            let mut admin = kubernetes.admin_certificate.take().unwrap_or_default();
            admin.common_name.get_or_insert_with(|| ADMIN_CN.to_owned());
            admin
                .organization
                .get_or_insert_with(|| ADMIN_ORGANIZATION.to_owned());
            nodes.push(Node {
                path: "kubernetes/adminCertificate".to_owned(),
                parent: Some(ca_index),
                role: Role::Client,
                slot: Slot::Admin,
                cert: admin,
            });

            if let Some(api_server) = &mut kubernetes.kube_api_server {
                let mut front_proxy_ca = kubernetes.front_proxy_ca.take().unwrap_or_default();
                front_proxy_ca
                    .common_name
                    .get_or_insert_with(|| FRONT_PROXY_CA_CN.to_owned());
                nodes.push(Node {
                    path: "kubernetes/frontProxyCA".to_owned(),
                    parent: Some(root_index),
                    role: Role::Ca,
                    slot: Slot::FrontProxyCa,
                    cert: front_proxy_ca,
                });
                let front_proxy_index = nodes.len() - 1;

                let mut service_account = kubernetes
                    .service_account_certificate
                    .take()
                    .unwrap_or_default();
                service_account
                    .common_name
                    .get_or_insert_with(|| SERVICE_ACCOUNT_CN.to_owned());
                nodes.push(Node {
                    path: "kubernetes/serviceAccountCertificate".to_owned(),
                    parent: Some(ca_index),
                    role: Role::KeyOnly,
                    slot: Slot::ServiceAccount,
                    cert: service_account,
                });

                let mut server = api_server.server_certificate.take().unwrap_or_default();
                server
                    .common_name
                    .get_or_insert_with(|| API_SERVER_CN.to_owned());
                if server.dns_names.is_empty() {
                    server.dns_names = vec![
                        "kubernetes".to_owned(),
                        "kubernetes.default".to_owned(),
                        "kubernetes.default.svc".to_owned(),
                        "kubernetes.default.svc.cluster.local".to_owned(),
                        "localhost".to_owned(),
                    ];
                    server.dns_names.extend(api_server.server_dns_names.clone());
                }
                if server.ip_addresses.is_empty() {
                    server.ip_addresses = vec!["127.0.0.1".to_owned()];
                    server.ip_addresses.extend(api_server.server_ips.clone());
                }
                nodes.push(Node {
                    path: "kubernetes/kubeAPIServer/serverCertificate".to_owned(),
                    parent: Some(ca_index),
                    role: Role::Server,
                    slot: Slot::ApiServer,
                    cert: server,
                });

                let mut kubelet_client = api_server.kubelet_certificate.take().unwrap_or_default();
                kubelet_client
                    .common_name
                    .get_or_insert_with(|| KUBELET_CLIENT_CN.to_owned());
                kubelet_client
                    .organization
                    .get_or_insert_with(|| ADMIN_ORGANIZATION.to_owned());
                nodes.push(Node {
                    path: "kubernetes/kubeAPIServer/kubeletCertificate".to_owned(),
                    parent: Some(ca_index),
                    role: Role::Client,
                    slot: Slot::KubeletClient,
                    cert: kubelet_client,
                });

                let mut front_proxy_client = api_server
                    .front_proxy_client_certificate
                    .take()
                    .unwrap_or_default();
                front_proxy_client
                    .common_name
                    .get_or_insert_with(|| FRONT_PROXY_CLIENT_CN.to_owned());
                nodes.push(Node {
                    path: "kubernetes/kubeAPIServer/frontProxyClientCertificate".to_owned(),
                    parent: Some(front_proxy_index),
                    role: Role::Client,
                    slot: Slot::FrontProxyClient,
                    cert: front_proxy_client,
                });
            }
        }

        nodes
    }

    fn store(&mut self, slot: Slot, cert: Certificate) {
        match slot {
            Slot::RootCa => self.root_ca = Some(cert),
            Slot::EtcdCa => {
                if let Some(etcd) = &mut self.etcd {
                    etcd.ca = Some(cert);
                }
            }
            Slot::EtcdPeer(name) => {
                if let Some(etcd) = &mut self.etcd {
                    etcd.peer_certificates.insert(name, cert);
                }
            }
            Slot::EtcdClient(name) => {
                if let Some(etcd) = &mut self.etcd {
                    etcd.client_certificates.insert(name, cert);
                }
            }
            Slot::KubernetesCa => {
                if let Some(kubernetes) = &mut self.kubernetes {
                    kubernetes.ca = Some(cert);
                }
            }
            Slot::FrontProxyCa => {
                if let Some(kubernetes) = &mut self.kubernetes {
                    kubernetes.front_proxy_ca = Some(cert);
                }
            }
            Slot::Admin => {
                if let Some(kubernetes) = &mut self.kubernetes {
                    kubernetes.admin_certificate = Some(cert);
                }
            }
            Slot::ServiceAccount => {
                if let Some(kubernetes) = &mut self.kubernetes {
                    kubernetes.service_account_certificate = Some(cert);
                }
            }
            Slot::ApiServer => {
                if let Some(api_server) = self
                    .kubernetes
                    .as_mut()
                    .and_then(|k| k.kube_api_server.as_mut())
                {
                    api_server.server_certificate = Some(cert);
                }
            }
            Slot::KubeletClient => {
                if let Some(api_server) = self
                    .kubernetes
                    .as_mut()
                    .and_then(|k| k.kube_api_server.as_mut())
                {
                    api_server.kubelet_certificate = Some(cert);
                }
            }
            Slot::FrontProxyClient => {
                if let Some(api_server) = self
                    .kubernetes
                    .as_mut()
                    .and_then(|k| k.kube_api_server.as_mut())
                {
                    api_server.front_proxy_client_certificate = Some(cert);
                }
            }
        }
    }
}

fn layered_map(
    state: BTreeMap<String, Certificate>,
    mut config: BTreeMap<String, Certificate>,
) -> BTreeMap<String, Certificate> {
    let mut merged = BTreeMap::new();
    for (name, cert) in state {
        let layered = Certificate::layered(Some(cert), config.remove(&name));
        if let Some(layered) = layered {
            merged.insert(name, layered);
        }
    }
    merged.extend(config);
    merged
}

/// Fills the node's missing material, signing with the parent when present.
fn ensure_node(node: &mut Node, parent: Option<&Node>, defaults: &Certificate) -> Result<()> {
    if node.cert.populated() {
        return Ok(());
    }

    let path = node.path.clone();
    let bits = util::pick_or([node.cert.rsa_bits, defaults.rsa_bits], DEFAULT_RSA_BITS);

    if node.cert.private_key.is_none() {
        node.cert.private_key = Some(generate_rsa_key(&path, bits)?);
    }

    if node.role == Role::KeyOnly {
        return Ok(());
    }

    let key_pem = node
        .cert
        .private_key
        .clone()
        .unwrap_or_default();
    let key = KeyPair::from_pem(&key_pem).context(ParseKeySnafu { path: path.clone() })?;

    let params = certificate_params(&node.cert, node.role, defaults, &path)?;

    let issued = match parent {
        None => params
            .self_signed(&key)
            .context(IssueCertificateSnafu { path: path.clone() })?,
        Some(parent) => {
            let ca_cert_pem = parent.cert.x509_certificate.clone().unwrap_or_default();
            let ca_key_pem = parent.cert.private_key.clone().unwrap_or_default();

            let ca_key = KeyPair::from_pem(&ca_key_pem).context(ParseKeySnafu {
                path: parent.path.clone(),
            })?;
            let ca_params = CertificateParams::from_ca_cert_pem(&ca_cert_pem).context(
                ParseCaSnafu {
                    path: parent.path.clone(),
                },
            )?;
            let issuer = ca_params.self_signed(&ca_key).context(ParseCaSnafu {
                path: parent.path.clone(),
            })?;

            params
                .signed_by(&key, &issuer, &ca_key)
                .context(IssueCertificateSnafu { path: path.clone() })?
        }
    };

    node.cert.x509_certificate = Some(issued.pem());

    Ok(())
}

fn certificate_params(
    cert: &Certificate,
    role: Role,
    defaults: &Certificate,
    path: &str,
) -> Result<CertificateParams> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    if let Some(common_name) = &cert.common_name {
        dn.push(DnType::CommonName, common_name.clone());
    }
    if let Some(organization) = cert
        .organization
        .clone()
        .or_else(|| defaults.organization.clone())
    {
        dn.push(DnType::OrganizationName, organization);
    }
    params.distinguished_name = dn;

    let validity = util::pick_or(
        [cert.validity_hours, defaults.validity_hours],
        DEFAULT_VALIDITY_HOURS,
    );
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::hours(i64::try_from(validity).unwrap_or(i64::MAX));

    for name in &cert.dns_names {
        let name_value = Ia5String::try_from(name.as_str()).context(InvalidDnsNameSnafu {
            path,
            name: name.clone(),
        })?;
        params.subject_alt_names.push(SanType::DnsName(name_value));
    }
    for address in &cert.ip_addresses {
        let parsed: IpAddr = address.parse().context(InvalidIpAddressSnafu {
            path,
            address: address.clone(),
        })?;
        params.subject_alt_names.push(SanType::IpAddress(parsed));
    }

    match role {
        Role::Ca => {
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            params.key_usages = vec![
                KeyUsagePurpose::KeyCertSign,
                KeyUsagePurpose::CrlSign,
                KeyUsagePurpose::DigitalSignature,
            ];
        }
        Role::Server | Role::Client | Role::Peer => {
            params.key_usages = vec![
                KeyUsagePurpose::DigitalSignature,
                KeyUsagePurpose::KeyEncipherment,
            ];
            params.extended_key_usages = extended_usages(cert, role, path)?;
        }
        Role::KeyOnly => {}
    }

    Ok(params)
}

fn extended_usages(
    cert: &Certificate,
    role: Role,
    path: &str,
) -> Result<Vec<ExtendedKeyUsagePurpose>> {
    if cert.key_usage.is_empty() {
        return Ok(match role {
            Role::Server => vec![ExtendedKeyUsagePurpose::ServerAuth],
            Role::Client => vec![ExtendedKeyUsagePurpose::ClientAuth],
            Role::Peer => vec![
                ExtendedKeyUsagePurpose::ServerAuth,
                ExtendedKeyUsagePurpose::ClientAuth,
            ],
            Role::Ca | Role::KeyOnly => Vec::new(),
        });
    }

    let mut usages = Vec::new();
    for value in &cert.key_usage {
        match value.as_str() {
            "server_auth" => usages.push(ExtendedKeyUsagePurpose::ServerAuth),
            "client_auth" => usages.push(ExtendedKeyUsagePurpose::ClientAuth),
            other => {
                return InvalidKeyUsageSnafu {
                    path,
                    value: other.to_owned(),
                }
                .fail()
            }
        }
    }

    Ok(usages)
}

fn generate_rsa_key(path: &str, bits: u32) -> Result<String> {
    let mut rng = rand::rngs::OsRng;
    let key =
        RsaPrivateKey::new(&mut rng, bits as usize).context(GenerateKeySnafu { path })?;
    let pem = key
        .to_pkcs8_pem(LineEnding::LF)
        .context(EncodeKeySnafu { path })?;

    Ok(pem.to_string())
}

/// Checks that `value` is a PEM-encoded certificate.
pub fn validate_certificate(what: &str, value: &str) -> Result<()> {
    validate_pem(what, value, "CERTIFICATE")
}

/// Checks that `value` is a PEM-encoded private key.
pub fn validate_private_key(what: &str, value: &str) -> Result<()> {
    let block = pem::parse(value).context(InvalidPemSnafu { what })?;
    ensure!(
        block.tag().ends_with("PRIVATE KEY"),
        WrongPemTagSnafu {
            what,
            expected: "PRIVATE KEY",
            tag: block.tag().to_owned(),
        }
    );

    Ok(())
}

fn validate_pem(what: &str, value: &str, expected: &'static str) -> Result<()> {
    let block = pem::parse(value).context(InvalidPemSnafu { what })?;
    ensure!(
        block.tag() == expected,
        WrongPemTagSnafu {
            what,
            expected,
            tag: block.tag().to_owned(),
        }
    );

    Ok(())
}
