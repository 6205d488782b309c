//! Cluster API and service catalog access
//!
//! This crate provides:
//! - `CapiClient` for reading and rewriting the CAPI objects of a managed
//!   cluster (Cluster endpoint, KubeadmControlPlane, MachineDeployment, Machines)
//! - `InfraProvisioner` for requesting infrastructure through service catalog
//!   `ServiceInstance` objects
//! - Parameter payloads rendered into those requests

pub mod client;
pub mod parameters;
pub mod provisioner;

pub use client::{
    partition_machines, CapiClient, CapiClientImpl, MachineRollout, MachineSummary, PoolKind,
    PoolObject,
};

#[cfg(test)]
pub use client::MockCapiClient;

pub use parameters::{
    cluster_parameters, merge_parameters, provider_parameters, vsphere_upgrade_parameters,
    template_name,
};

pub use provisioner::{
    instance_name, upgrade_instance_name, InfraProvisioner, InstanceKind, InstanceRequest,
    InstanceState, ServiceCatalogProvisioner,
};

#[cfg(test)]
pub use provisioner::MockInfraProvisioner;
