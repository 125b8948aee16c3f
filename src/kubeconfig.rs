//! Kubernetes client configuration: validation plus the kubeconfig YAML
//! emitter used for the admin config and kubelet bootstrap configs.

use base64::prelude::{Engine, BASE64_STANDARD};
use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt, Snafu};

use crate::pki;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("server address must be set"))]
    NoServer,

    #[snafu(display("CA certificate is invalid: {source}"))]
    InvalidCa { source: pki::Error },

    #[snafu(display("client certificate is invalid: {source}"))]
    InvalidClientCertificate { source: pki::Error },

    #[snafu(display("client key is invalid: {source}"))]
    InvalidClientKey { source: pki::Error },

    #[snafu(display("either a client certificate and key or a token must be set"))]
    NoCredentials,

    #[snafu(display("serializing kubeconfig failed: {source}"))]
    Serialize { source: serde_yaml::Error },
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything needed to reach one cluster as one identity.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    /// `https://<address>:<port>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,

    /// PEM-encoded cluster CA certificate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_certificate: Option<String>,

    /// PEM-encoded client certificate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_certificate: Option<String>,

    /// PEM-encoded client key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key: Option<String>,

    /// Bearer token, used by kubelet bootstrap credentials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.server.as_deref().is_some_and(|s| !s.is_empty()),
            NoServerSnafu
        );

        if let Some(ca) = &self.ca_certificate {
            pki::validate_certificate("CA certificate", ca).context(InvalidCaSnafu)?;
        }

        match (&self.client_certificate, &self.client_key, &self.token) {
            (Some(cert), Some(key), _) => {
                pki::validate_certificate("client certificate", cert)
                    .context(InvalidClientCertificateSnafu)?;
                pki::validate_private_key("client key", key).context(InvalidClientKeySnafu)?;
                Ok(())
            }
            (None, None, Some(_)) => Ok(()),
            _ => NoCredentialsSnafu.fail(),
        }
    }

    /// Renders a standard kubeconfig document with embedded credentials:
    /// one cluster, one user, one context binding them.
    pub fn to_yaml(&self, name: &str) -> Result<String> {
        self.validate()?;

        let server = self.server.clone().unwrap_or_default();
        let server = if server.starts_with("https://") {
            server
        } else {
            format!("https://{server}")
        };

        let kubeconfig = Kubeconfig {
            api_version: "v1",
            kind: "Config",
            clusters: vec![NamedCluster {
                name: name.to_owned(),
                cluster: Cluster {
                    server,
                    certificate_authority_data: self.ca_certificate.as_deref().map(embed),
                },
            }],
            users: vec![NamedUser {
                name: name.to_owned(),
                user: User {
                    client_certificate_data: self.client_certificate.as_deref().map(embed),
                    client_key_data: self.client_key.as_deref().map(embed),
                    token: self.token.clone(),
                },
            }],
            contexts: vec![NamedContext {
                name: name.to_owned(),
                context: Context {
                    cluster: name.to_owned(),
                    user: name.to_owned(),
                },
            }],
            current_context: name.to_owned(),
        };

        serde_yaml::to_string(&kubeconfig).context(SerializeSnafu)
    }
}

fn embed(pem: &str) -> String {
    BASE64_STANDARD.encode(pem)
}

#[derive(Serialize)]
struct Kubeconfig {
    #[serde(rename = "apiVersion")]
    api_version: &'static str,
    kind: &'static str,
    clusters: Vec<NamedCluster>,
    users: Vec<NamedUser>,
    contexts: Vec<NamedContext>,
    #[serde(rename = "current-context")]
    current_context: String,
}

#[derive(Serialize)]
struct NamedCluster {
    name: String,
    cluster: Cluster,
}

#[derive(Serialize)]
struct Cluster {
    server: String,
    #[serde(
        rename = "certificate-authority-data",
        skip_serializing_if = "Option::is_none"
    )]
    certificate_authority_data: Option<String>,
}

#[derive(Serialize)]
struct NamedUser {
    name: String,
    user: User,
}

#[derive(Serialize)]
struct User {
    #[serde(
        rename = "client-certificate-data",
        skip_serializing_if = "Option::is_none"
    )]
    client_certificate_data: Option<String>,
    #[serde(rename = "client-key-data", skip_serializing_if = "Option::is_none")]
    client_key_data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<String>,
}

#[derive(Serialize)]
struct NamedContext {
    name: String,
    context: Context,
}

#[derive(Serialize)]
struct Context {
    cluster: String,
    user: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::{KubernetesPki, Pki};

    fn generated() -> (String, String, String) {
        let mut pki = Pki {
            kubernetes: Some(KubernetesPki::default()),
            ..Pki::default()
        };
        pki.generate().expect("generation succeeds");

        let kubernetes = pki.kubernetes.unwrap();
        let ca = kubernetes.ca.unwrap().x509_certificate.unwrap();
        let admin = kubernetes.admin_certificate.unwrap();

        (
            ca,
            admin.x509_certificate.unwrap(),
            admin.private_key.unwrap(),
        )
    }

    #[test]
    fn emitted_kubeconfig_embeds_exact_pems() {
        let (ca, cert, key) = generated();

        let config = Config {
            server: Some("10.0.0.10:6443".to_owned()),
            ca_certificate: Some(ca.clone()),
            client_certificate: Some(cert.clone()),
            client_key: Some(key.clone()),
            token: None,
        };

        let yaml = config.to_yaml("admin").expect("kubeconfig renders");
        let parsed: serde_yaml::Value = serde_yaml::from_str(&yaml).expect("kubeconfig parses");

        assert_eq!(parsed["kind"], "Config");
        assert_eq!(
            parsed["clusters"][0]["cluster"]["server"],
            "https://10.0.0.10:6443"
        );
        assert_eq!(parsed["current-context"], "admin");

        let embedded_ca = parsed["clusters"][0]["cluster"]["certificate-authority-data"]
            .as_str()
            .unwrap();
        assert_eq!(
            BASE64_STANDARD.decode(embedded_ca).unwrap(),
            ca.as_bytes()
        );

        let embedded_key = parsed["users"][0]["user"]["client-key-data"]
            .as_str()
            .unwrap();
        assert_eq!(
            BASE64_STANDARD.decode(embedded_key).unwrap(),
            key.as_bytes()
        );

        let embedded_cert = parsed["users"][0]["user"]["client-certificate-data"]
            .as_str()
            .unwrap();
        assert_eq!(
            BASE64_STANDARD.decode(embedded_cert).unwrap(),
            cert.as_bytes()
        );
    }

    #[test]
    fn token_config_needs_no_client_certificate() {
        let (ca, _, _) = generated();

        let config = Config {
            server: Some("https://10.0.0.10:6443".to_owned()),
            ca_certificate: Some(ca),
            token: Some("bootstrap-token".to_owned()),
            ..Config::default()
        };

        assert!(config.validate().is_ok());

        let yaml = config.to_yaml("bootstrap").unwrap();
        let parsed: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed["users"][0]["user"]["token"], "bootstrap-token");
    }

    #[test]
    fn validation_rejects_incomplete_configs() {
        assert!(Config::default().validate().is_err());

        let no_credentials = Config {
            server: Some("https://example:6443".to_owned()),
            ..Config::default()
        };
        assert!(no_credentials.validate().is_err());

        let bad_ca = Config {
            server: Some("https://example:6443".to_owned()),
            ca_certificate: Some("doh".to_owned()),
            token: Some("t".to_owned()),
            ..Config::default()
        };
        assert!(bad_ca.validate().is_err());
    }

    #[test]
    fn round_trips_through_serde() {
        let config = Config {
            server: Some("https://example:6443".to_owned()),
            token: Some("t".to_owned()),
            ..Config::default()
        };

        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(config, parsed);
    }
}
