//! Typed resource facades: each projects a slice of the cluster
//! configuration onto a containers set and carries any follow-up work the
//! resource needs after its containers converge.

use snafu::{ResultExt, Snafu};
use tokio_util::sync::CancellationToken;

use crate::container::{ContainersSet, ContainersState, SetError};
use crate::docker::RuntimeProvider;

pub mod controlplane;
pub mod etcd;
pub mod kubelet;
pub mod loadbalancer;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("invalid etcd configuration: {source}"))]
    Etcd { source: etcd::Error },

    #[snafu(display("invalid controlplane configuration: {source}"))]
    Controlplane { source: controlplane::Error },

    #[snafu(display("invalid kubelet pool configuration: {source}"))]
    KubeletPool { source: kubelet::Error },

    #[snafu(display("invalid API load balancer pool configuration: {source}"))]
    LoadBalancerPool { source: loadbalancer::Error },

    #[snafu(display("checking current state failed: {source}"))]
    CheckState { source: SetError },

    #[snafu(display("deploying containers failed: {source}"))]
    Deploy { source: SetError },

    #[snafu(display("applying privileged node labels failed: {source}"))]
    Labels { source: kubelet::Error },
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A built resource, ready to reconcile.
///
/// Every variant wraps a containers set; the kubelet pool additionally
/// labels its nodes through the API server once the containers converge.
pub enum Resource {
    Etcd {
        set: ContainersSet,
    },
    Controlplane {
        set: ContainersSet,
    },
    KubeletPool {
        set: ContainersSet,
        labels: Option<kubelet::PrivilegedLabels>,
    },
    LoadBalancerPool {
        set: ContainersSet,
    },
}

impl Resource {
    /// Refreshes the previous state of the underlying set against the
    /// daemons.
    pub async fn check_current_state(&mut self, provider: &dyn RuntimeProvider) -> Result<()> {
        self.set_mut()
            .check_current_state(provider)
            .await
            .context(CheckStateSnafu)
    }

    /// Reconciles the set, then runs the resource's follow-up work.
    pub async fn deploy(
        &mut self,
        provider: &dyn RuntimeProvider,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.set_mut()
            .deploy(provider, cancel)
            .await
            .context(DeploySnafu)?;

        if let Resource::KubeletPool {
            labels: Some(labels),
            ..
        } = self
        {
            labels.apply().await.context(LabelsSnafu)?;
        }

        Ok(())
    }

    /// Observed state to persist for this resource.
    pub fn state(&self) -> &ContainersState {
        self.set().previous_state()
    }

    pub fn set(&self) -> &ContainersSet {
        match self {
            Resource::Etcd { set }
            | Resource::Controlplane { set }
            | Resource::KubeletPool { set, .. }
            | Resource::LoadBalancerPool { set } => set,
        }
    }

    fn set_mut(&mut self) -> &mut ContainersSet {
        match self {
            Resource::Etcd { set }
            | Resource::Controlplane { set }
            | Resource::KubeletPool { set, .. }
            | Resource::LoadBalancerPool { set } => set,
        }
    }
}
