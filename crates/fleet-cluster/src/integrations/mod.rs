//! Platform integrations wired up for every managed cluster
//!
//! One narrow trait per external system. Every `ensure_*` operation is
//! create-if-absent by deterministic name so a phase can be replayed after a
//! crash without duplicating work.

mod keycloak;
pub mod presets;
mod resources;

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};

#[cfg(test)]
use mockall::automock;

use fleet_common::crd::ManagedCluster;
use fleet_common::kube_utils::Ensured;
use fleet_common::{
    Error, CLUSTER_NAMESPACE_LABEL_KEY, CLUSTER_NAME_LABEL_KEY, MANAGED_BY_LABEL_KEY,
    MANAGED_BY_LABEL_VALUE,
};

use crate::remote::RemoteKubeconfig;
use presets::{ClientPreset, ClientRolePreset, ClientScopePreset, GroupPreset, ProtocolMapperPreset};

pub use keycloak::KeycloakRegistrar;
pub use resources::{
    application_name, argo_cluster_secret_name, KubeGatewayRegistrar, KubeGitOpsRegistrar,
    KubeIngressRegistrar,
};

/// Argo CD registration of a managed cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait GitOpsRegistrar: Send + Sync {
    /// Host of the Argo CD server ingress, None when not exposed
    async fn application_host(&self) -> Result<Option<String>, Error>;

    /// Create the Argo CD cluster secret pointing at the remote API server
    async fn ensure_cluster_secret(
        &self,
        cluster: &ManagedCluster,
        kubeconfig: &RemoteKubeconfig,
        bearer_token: &str,
    ) -> Result<Ensured, Error>;

    /// Create the Application syncing platform components to the cluster
    async fn ensure_application(&self, cluster: &ManagedCluster) -> Result<Ensured, Error>;

    /// Delete everything registered for the cluster
    async fn remove(&self, cluster: &ManagedCluster) -> Result<(), Error>;
}

/// Local exposure of the remote API gateway
#[cfg_attr(test, automock)]
#[async_trait]
pub trait GatewayRegistrar: Send + Sync {
    /// Create the ExternalName service pointing at the remote gateway
    async fn ensure_gateway_service(
        &self,
        cluster: &ManagedCluster,
        external_name: &str,
    ) -> Result<Ensured, Error>;

    /// Delete resources replaced by the gateway service
    async fn delete_deprecated(&self, cluster: &ManagedCluster) -> Result<(), Error>;

    /// Delete the gateway service
    async fn remove(&self, cluster: &ManagedCluster) -> Result<(), Error>;
}

/// TLS and ingress routing for the cluster's API path
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IngressRegistrar: Send + Sync {
    /// cert-manager Certificate for the ingress host
    async fn ensure_certificate(
        &self,
        cluster: &ManagedCluster,
        domain: &str,
    ) -> Result<Ensured, Error>;

    /// Traefik Middleware stripping the cluster path prefix
    async fn ensure_middleware(&self, cluster: &ManagedCluster) -> Result<Ensured, Error>;

    /// Local copy of the remote service-account token secret
    async fn ensure_token_secret(
        &self,
        cluster: &ManagedCluster,
        remote_secret: &Secret,
    ) -> Result<Ensured, Error>;

    /// Ingress routing the cluster path to the gateway service
    async fn ensure_ingress(&self, cluster: &ManagedCluster, domain: &str)
        -> Result<Ensured, Error>;

    /// Delete everything created for the cluster
    async fn remove(&self, cluster: &ManagedCluster) -> Result<(), Error>;
}

/// Identity provider admin operations
///
/// Every create treats "already exists" as success.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IdentityRegistrar: Send + Sync {
    /// Admin password from the local password secret, None when absent
    async fn admin_password(&self) -> Result<Option<String>, Error>;

    /// Exchange the admin password for an access token
    async fn login(&self, password: &str) -> Result<String, Error>;

    /// Register a client
    async fn create_client(&self, token: &str, client: &ClientPreset) -> Result<(), Error>;

    /// Attach a protocol mapper to a client
    async fn create_protocol_mapper(
        &self,
        token: &str,
        mapper: &ProtocolMapperPreset,
    ) -> Result<(), Error>;

    /// Create a client-level role
    async fn create_client_role(&self, token: &str, role: &ClientRolePreset)
        -> Result<(), Error>;

    /// Grant a client-level role to a user
    async fn add_client_role_to_user(
        &self,
        token: &str,
        role: &ClientRolePreset,
        user: &str,
    ) -> Result<(), Error>;

    /// Attach a client scope to a client as default scope
    async fn add_client_scope(&self, token: &str, scope: &ClientScopePreset)
        -> Result<(), Error>;

    /// Create a group
    async fn create_group(&self, token: &str, group: &GroupPreset) -> Result<(), Error>;

    /// Add a user to a group
    async fn add_user_to_group(
        &self,
        token: &str,
        group: &GroupPreset,
        user: &str,
    ) -> Result<(), Error>;
}

/// Labels carried by every resource created on behalf of a cluster
pub fn owned_labels(cluster: &ManagedCluster) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            MANAGED_BY_LABEL_KEY.to_string(),
            MANAGED_BY_LABEL_VALUE.to_string(),
        ),
        (CLUSTER_NAME_LABEL_KEY.to_string(), cluster.name_any()),
        (
            CLUSTER_NAMESPACE_LABEL_KEY.to_string(),
            cluster.namespace_or_default(),
        ),
    ])
}

/// Metadata for a resource in the cluster's own namespace, owned by the record
pub fn owned_metadata(cluster: &ManagedCluster, name: String) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: cluster.namespace(),
        labels: Some(owned_labels(cluster)),
        owner_references: cluster.controller_owner_ref(&()).map(|r| vec![r]),
        ..Default::default()
    }
}

/// Label selector matching resources created for a cluster
pub fn owned_selector(cluster: &ManagedCluster) -> String {
    format!(
        "{}={},{}={}",
        CLUSTER_NAME_LABEL_KEY,
        cluster.name_any(),
        CLUSTER_NAMESPACE_LABEL_KEY,
        cluster.namespace_or_default()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sample_cluster;

    #[test]
    fn owned_metadata_links_back_to_the_record() {
        let cluster = sample_cluster("edge");
        let meta = owned_metadata(&cluster, "edge-gateway-service".to_string());
        assert_eq!(meta.namespace.as_deref(), Some("team-a"));
        let labels = meta.labels.unwrap();
        assert_eq!(labels[CLUSTER_NAME_LABEL_KEY], "edge");
        assert_eq!(labels[MANAGED_BY_LABEL_KEY], MANAGED_BY_LABEL_VALUE);
        let owner = &meta.owner_references.unwrap()[0];
        assert_eq!(owner.kind, "ManagedCluster");
        assert_eq!(owner.controller, Some(true));
    }

    #[test]
    fn selector_matches_name_and_namespace() {
        let cluster = sample_cluster("edge");
        assert_eq!(
            owned_selector(&cluster),
            "fleet.dev/cluster-name=edge,fleet.dev/cluster-namespace=team-a"
        );
    }
}
