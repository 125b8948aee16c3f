#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
pub mod config;
pub mod container;
pub mod docker;
pub mod host;
pub mod kubeconfig;
pub mod pki;
pub mod resource;
mod util;

pub use config::{Config, Deployment, ResourceState, StateFile};
pub use container::{
    ContainerInstance, ContainerSpec, ContainersSet, ContainersState, HostConfiguredContainer,
};
pub use pki::Pki;
