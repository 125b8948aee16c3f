//! API load balancer pool facade: HAProxy containers fronting the API
//! servers with plain TCP forwarding.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt, Snafu};

use crate::container::{
    ContainerSpec, ContainersSet, ContainersState, File, FileMap, HostConfiguredContainer,
};
use crate::host::{self, ssh, Host};
use crate::resource::Resource;

/// Image used when the pool does not override it.
pub const DEFAULT_IMAGE: &str = "haproxy:2.9-alpine";
/// Frontend bind address used when none is configured.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:7443";

const CONFIG_PATH: &str = "/usr/local/etc/haproxy/haproxy.cfg";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("at least one load balancer must be configured"))]
    NoLoadBalancers,

    #[snafu(display("at least one API server must be configured"))]
    NoServers,

    #[snafu(display("load balancer {name:?} has an invalid host: {source}"))]
    InvalidHost { name: String, source: host::Error },
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LoadBalancer {
    /// Defaults to `api-loadbalancer-<index>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<Host>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_address: Option<String>,
}

/// User-facing API load balancer pool configuration.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Pool {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// SSH defaults applied to every load balancer host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh: Option<ssh::Config>,

    /// `address:port` of every API server instance to front.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_address: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub load_balancers: Vec<LoadBalancer>,
}

impl Pool {
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.load_balancers.is_empty(), NoLoadBalancersSnafu);
        ensure!(!self.servers.is_empty(), NoServersSnafu);

        for (index, balancer) in self.load_balancers.iter().enumerate() {
            let name = key(balancer, index);
            Host::build(balancer.host.as_ref(), self.ssh.as_ref())
                .validate()
                .context(InvalidHostSnafu { name })?;
        }

        Ok(())
    }

    /// Validates and builds the pool resource with the previous state
    /// attached.
    pub fn build(&self, previous: Option<ContainersState>) -> Result<Resource> {
        self.validate()?;

        let mut desired = BTreeMap::new();
        let mut create_order = Vec::new();

        for (index, balancer) in self.load_balancers.iter().enumerate() {
            let name = key(balancer, index);
            let bind_address = balancer
                .bind_address
                .clone()
                .or_else(|| self.bind_address.clone())
                .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_owned());

            let spec = ContainerSpec {
                image: self
                    .image
                    .clone()
                    .unwrap_or_else(|| DEFAULT_IMAGE.to_owned()),
                network_mode: Some("host".to_owned()),
                restart_policy: Some("always".to_owned()),
                ..ContainerSpec::default()
            };

            let files = FileMap::from([(
                CONFIG_PATH.to_owned(),
                File::new(self.haproxy_config(&bind_address)),
            )]);

            let host = Host::build(balancer.host.as_ref(), self.ssh.as_ref());
            create_order.push(name.clone());
            desired.insert(
                name,
                HostConfiguredContainer::with_files(host, spec, files),
            );
        }

        Ok(Resource::LoadBalancerPool {
            set: ContainersSet::new(desired, previous, create_order),
        })
    }

    fn haproxy_config(&self, bind_address: &str) -> String {
        let mut config = String::from(
            "defaults\n  mode tcp\n  timeout connect 5000ms\n  timeout client 50000ms\n  timeout server 50000ms\n\n",
        );

        config.push_str(&format!(
            "frontend kube-apiserver\n  bind {bind_address}\n  default_backend kube-apiserver\n\n"
        ));

        config.push_str("backend kube-apiserver\n  option tcp-check\n");
        for (index, server) in self.servers.iter().enumerate() {
            config.push_str(&format!("  server apiserver-{index} {server} check\n"));
        }

        config
    }
}

fn key(balancer: &LoadBalancer, index: usize) -> String {
    balancer
        .name
        .clone()
        .unwrap_or_else(|| format!("api-loadbalancer-{index}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::direct;

    fn pool() -> Pool {
        Pool {
            servers: vec!["10.0.0.10:6443".to_owned(), "10.0.0.11:6443".to_owned()],
            load_balancers: vec![LoadBalancer {
                host: Some(Host {
                    direct: Some(direct::Config::default()),
                    ssh: None,
                }),
                ..LoadBalancer::default()
            }],
            ..Pool::default()
        }
    }

    #[test]
    fn renders_one_backend_line_per_server() {
        let Resource::LoadBalancerPool { set } = pool().build(None).expect("build succeeds")
        else {
            panic!("expected a load balancer pool resource");
        };

        let keys: Vec<&str> = set.desired_keys().collect();
        assert_eq!(keys, ["api-loadbalancer-0"]);

        let balancer = set.desired("api-loadbalancer-0").unwrap();
        let config = &balancer.config_files[CONFIG_PATH].content;

        assert!(config.contains(&format!("bind {DEFAULT_BIND_ADDRESS}")));
        assert!(config.contains("server apiserver-0 10.0.0.10:6443 check"));
        assert!(config.contains("server apiserver-1 10.0.0.11:6443 check"));
        assert_eq!(balancer.container.image, DEFAULT_IMAGE);
    }

    #[test]
    fn balancer_bind_address_overrides_pool() {
        let mut pool = pool();
        pool.bind_address = Some("0.0.0.0:8443".to_owned());
        pool.load_balancers[0].bind_address = Some("127.0.0.1:9443".to_owned());

        let Resource::LoadBalancerPool { set } = pool.build(None).unwrap() else {
            panic!("expected a load balancer pool resource");
        };

        let config = &set.desired("api-loadbalancer-0").unwrap().config_files[CONFIG_PATH].content;
        assert!(config.contains("bind 127.0.0.1:9443"));
    }

    #[test]
    fn validation_requires_servers_and_balancers() {
        assert!(matches!(
            Pool::default().validate().unwrap_err(),
            Error::NoLoadBalancers
        ));

        let mut no_servers = pool();
        no_servers.servers.clear();
        assert!(matches!(
            no_servers.validate().unwrap_err(),
            Error::NoServers
        ));
    }
}
