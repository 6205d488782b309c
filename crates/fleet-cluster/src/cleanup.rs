//! Teardown of everything created on behalf of a deleted record
//!
//! Integration objects are removed first, then the infrastructure
//! instances. The finalizer is only released once the provisioner reports
//! no instances left, so a cluster is never orphaned in the broker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::info;

#[cfg(test)]
use mockall::automock;

use fleet_capi::InfraProvisioner;
use fleet_common::crd::ManagedCluster;
use fleet_common::Error;

use crate::integrations::{GatewayRegistrar, GitOpsRegistrar, IngressRegistrar};
use crate::phases::REQUEUE_PROPAGATION;

/// Result of a cleanup pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// Nothing left, the finalizer can be released
    Complete,
    /// Deletions still in flight, check again after the delay
    Pending(Duration),
}

/// Trait for tearing down a record's external objects
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CleanupHandler: Send + Sync {
    /// Delete everything owned by the record; safe to call repeatedly
    async fn cleanup(&self, cluster: &ManagedCluster) -> Result<CleanupOutcome, Error>;
}

/// CleanupHandler that reverses the provisioning pipeline
pub struct PipelineCleanup {
    gitops: Arc<dyn GitOpsRegistrar>,
    gateway: Arc<dyn GatewayRegistrar>,
    ingress: Arc<dyn IngressRegistrar>,
    provisioner: Arc<dyn InfraProvisioner>,
}

impl PipelineCleanup {
    /// Create a cleanup handler over the same integrations the pipeline uses
    pub fn new(
        gitops: Arc<dyn GitOpsRegistrar>,
        gateway: Arc<dyn GatewayRegistrar>,
        ingress: Arc<dyn IngressRegistrar>,
        provisioner: Arc<dyn InfraProvisioner>,
    ) -> Self {
        Self {
            gitops,
            gateway,
            ingress,
            provisioner,
        }
    }
}

#[async_trait]
impl CleanupHandler for PipelineCleanup {
    async fn cleanup(&self, cluster: &ManagedCluster) -> Result<CleanupOutcome, Error> {
        let name = cluster.name_any();

        self.ingress.remove(cluster).await?;
        self.gateway.remove(cluster).await?;
        self.gitops.remove(cluster).await?;

        let remaining = self
            .provisioner
            .delete_instances(&cluster.namespace_or_default(), &name)
            .await?;
        if remaining > 0 {
            info!(cluster = %name, remaining, "waiting for infrastructure instances to go away");
            return Ok(CleanupOutcome::Pending(REQUEUE_PROPAGATION));
        }

        info!(cluster = %name, "cleanup complete");
        Ok(CleanupOutcome::Complete)
    }
}
