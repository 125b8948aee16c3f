//! etcd cluster facade: projects member configuration onto one container
//! per member, wiring peer and client TLS material from the PKI tree.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use snafu::{ensure, OptionExt, ResultExt, Snafu};

use crate::container::{
    ContainerSpec, ContainersSet, ContainersState, File, FileMap, HostConfiguredContainer, Mount,
};
use crate::host::{self, ssh, Host};
use crate::pki::Pki;
use crate::resource::Resource;
use crate::util;

/// Image used when neither the cluster nor a member overrides it.
pub const DEFAULT_IMAGE: &str = "quay.io/coreos/etcd:v3.5.13";

const CA_PATH: &str = "/etc/kubernetes/etcd/ca.crt";
const PEER_CERT_PATH: &str = "/etc/kubernetes/etcd/peer.crt";
const PEER_KEY_PATH: &str = "/etc/kubernetes/etcd/peer.key";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("at least one member must be configured"))]
    NoMembers,

    #[snafu(display("member {name:?} has no peer address"))]
    NoPeerAddress { name: String },

    #[snafu(display("member {name:?} has an invalid host: {source}"))]
    InvalidHost { name: String, source: host::Error },

    #[snafu(display("PKI does not carry an etcd CA; run the pki command first"))]
    NoCa,

    #[snafu(display("PKI does not carry a peer certificate for member {name:?}"))]
    NoPeerCertificate { name: String },
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Member {
    /// Address peers reach this member on. Required.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_address: Option<String>,

    /// Address clients reach this member on. Defaults to the peer address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_address: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<Host>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// User-facing etcd cluster configuration.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Cluster {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// SSH defaults applied to every member host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh: Option<ssh::Config>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub members: BTreeMap<String, Member>,
}

impl Cluster {
    pub fn validate(&self, pki: Option<&Pki>) -> Result<()> {
        ensure!(!self.members.is_empty(), NoMembersSnafu);

        let etcd_pki = pki.and_then(|pki| pki.etcd.as_ref());
        ensure!(
            etcd_pki.and_then(|etcd| etcd.ca.as_ref()).is_some(),
            NoCaSnafu
        );

        for (name, member) in &self.members {
            ensure!(
                member.peer_address.as_deref().is_some_and(|a| !a.is_empty()),
                NoPeerAddressSnafu { name: name.clone() }
            );

            let host = Host::build(member.host.as_ref(), self.ssh.as_ref());
            host.validate().context(InvalidHostSnafu { name: name.clone() })?;

            ensure!(
                etcd_pki.is_some_and(|etcd| {
                    etcd.peer_certificates
                        .get(name)
                        .is_some_and(|cert| cert.x509_certificate.is_some())
                }),
                NoPeerCertificateSnafu { name: name.clone() }
            );
        }

        Ok(())
    }

    /// Validates and builds the cluster resource with the previous state
    /// attached.
    pub fn build(
        &self,
        previous: Option<ContainersState>,
        pki: Option<&Pki>,
    ) -> Result<Resource> {
        self.validate(pki)?;

        let etcd_pki = pki
            .and_then(|pki| pki.etcd.as_ref())
            .context(NoCaSnafu)?;
        let ca = etcd_pki.ca.as_ref().context(NoCaSnafu)?;
        let initial_cluster = self.initial_cluster();

        let mut desired = BTreeMap::new();
        for (name, member) in &self.members {
            let peer_cert = etcd_pki
                .peer_certificates
                .get(name)
                .context(NoPeerCertificateSnafu { name: name.clone() })?;

            let peer_address = member.peer_address.clone().unwrap_or_default();
            let server_address = member
                .server_address
                .clone()
                .unwrap_or_else(|| peer_address.clone());

            let spec = ContainerSpec {
                image: util::pick(
                    [member.image.clone(), self.image.clone()],
                )
                .unwrap_or_else(|| DEFAULT_IMAGE.to_owned()),
                args: vec![
                    "etcd".to_owned(),
                    format!("--name={name}"),
                    "--data-dir=/var/lib/etcd".to_owned(),
                    format!("--initial-advertise-peer-urls=https://{peer_address}:2380"),
                    format!("--listen-peer-urls=https://{peer_address}:2380"),
                    format!("--listen-client-urls=https://{server_address}:2379"),
                    format!("--advertise-client-urls=https://{server_address}:2379"),
                    format!("--initial-cluster={initial_cluster}"),
                    format!("--trusted-ca-file={CA_PATH}"),
                    format!("--peer-trusted-ca-file={CA_PATH}"),
                    format!("--cert-file={PEER_CERT_PATH}"),
                    format!("--key-file={PEER_KEY_PATH}"),
                    format!("--peer-cert-file={PEER_CERT_PATH}"),
                    format!("--peer-key-file={PEER_KEY_PATH}"),
                    "--client-cert-auth".to_owned(),
                    "--peer-client-cert-auth".to_owned(),
                ],
                mounts: vec![Mount {
                    source: format!("/var/lib/etcd-{name}"),
                    target: "/var/lib/etcd".to_owned(),
                    ..Mount::default()
                }],
                network_mode: Some("host".to_owned()),
                restart_policy: Some("always".to_owned()),
                ..ContainerSpec::default()
            };

            let mut files = FileMap::new();
            if let Some(ca_pem) = &ca.x509_certificate {
                files.insert(CA_PATH.to_owned(), File::new(ca_pem.clone()));
            }
            if let Some(cert) = &peer_cert.x509_certificate {
                files.insert(PEER_CERT_PATH.to_owned(), File::new(cert.clone()));
            }
            if let Some(key) = &peer_cert.private_key {
                files.insert(PEER_KEY_PATH.to_owned(), File::with_mode(key.clone(), 0o600));
            }

            let host = Host::build(member.host.as_ref(), self.ssh.as_ref());
            desired.insert(
                name.clone(),
                HostConfiguredContainer::with_files(host, spec, files),
            );
        }

        let create_order: Vec<String> = self.members.keys().cloned().collect();

        Ok(Resource::Etcd {
            set: ContainersSet::new(desired, previous, create_order),
        })
    }

    /// `name=https://address:2380` pairs for every member, sorted by name.
    fn initial_cluster(&self) -> String {
        let peers: BTreeMap<String, String> = self
            .members
            .iter()
            .map(|(name, member)| {
                (
                    name.clone(),
                    format!(
                        "https://{}:2380",
                        member.peer_address.clone().unwrap_or_default()
                    ),
                )
            })
            .collect();

        util::join_sorted(&peers, "=", ",")
    }

    /// Peer name to address pairs, feeding the PKI peer certificate list.
    pub fn peers(&self) -> BTreeMap<String, String> {
        self.members
            .iter()
            .map(|(name, member)| {
                (
                    name.clone(),
                    member.peer_address.clone().unwrap_or_default(),
                )
            })
            .collect()
    }
}
