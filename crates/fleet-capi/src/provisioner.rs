//! Infrastructure requests through the service catalog
//!
//! A managed cluster is instantiated by creating a `ServiceInstance`
//! (`servicecatalog.k8s.io/v1beta1`) whose broker renders the CAPI objects.
//! Instances are labelled with the owning ManagedCluster and the suffix
//! they were created with, so a suffix lost to a crash between "create"
//! and "record" can be recovered from the instance itself.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DynamicObject, ListParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use fleet_common::crd::ProviderKind;
use fleet_common::kube_utils::{
    build_api_resource, create_if_absent, delete_if_present, string_at, Ensured,
};
use fleet_common::{
    Error, CLUSTER_NAMESPACE_LABEL_KEY, CLUSTER_NAME_LABEL_KEY, MANAGED_BY_LABEL_KEY,
    MANAGED_BY_LABEL_VALUE,
};

/// apiVersion of service catalog instances
pub const SERVICE_INSTANCE_API_VERSION: &str = "servicecatalog.k8s.io/v1beta1";
/// Kind of service catalog instances
pub const SERVICE_INSTANCE_KIND: &str = "ServiceInstance";
/// `status.provisionStatus` of an instance whose broker finished
pub const PROVISION_STATUS_PROVISIONED: &str = "Provisioned";

/// Label carrying the suffix an instance was created with
pub const SUFFIX_LABEL_KEY: &str = "fleet.dev/suffix";
/// Label telling cluster instances from upgrade artifacts
pub const INSTANCE_KIND_LABEL_KEY: &str = "fleet.dev/instance-kind";

/// `<cluster>-<suffix>`
pub fn instance_name(cluster: &str, suffix: &str) -> String {
    format!("{}-{}", cluster, suffix)
}

/// `<cluster>-<suffix>-<version>`
pub fn upgrade_instance_name(cluster: &str, suffix: &str, version: &str) -> String {
    format!("{}-{}-{}", cluster, suffix, version)
}

/// What an instance provisions
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstanceKind {
    /// The cluster itself
    Cluster,
    /// Machine templates for a new Kubernetes version
    Upgrade,
}

impl InstanceKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Cluster => "cluster",
            Self::Upgrade => "upgrade",
        }
    }
}

/// Broker class serving a request
pub fn service_class(kind: InstanceKind, provider: ProviderKind) -> Result<&'static str, Error> {
    match (kind, provider) {
        (InstanceKind::Cluster, ProviderKind::Aws) => Ok("capi-aws-template"),
        (InstanceKind::Cluster, ProviderKind::Vsphere) => Ok("capi-vsphere-template"),
        (InstanceKind::Upgrade, ProviderKind::Vsphere) => Ok("capi-vsphere-upgrade-template"),
        (kind, provider) => Err(Error::contract(
            "service_class",
            format!("no {} service class for provider {}", kind.as_str(), provider),
        )),
    }
}

/// A request for one ServiceInstance
#[derive(Clone, Debug, PartialEq)]
pub struct InstanceRequest {
    /// Instance name
    pub name: String,
    /// Owning ManagedCluster name
    pub cluster: String,
    /// Owning ManagedCluster namespace
    pub namespace: String,
    /// Suffix recorded on the instance
    pub suffix: String,
    /// Cluster or upgrade artifact
    pub kind: InstanceKind,
    /// Provider selecting the broker class
    pub provider: ProviderKind,
    /// Merged parameter payload
    pub parameters: serde_json::Value,
    /// Controller reference to the ManagedCluster, when known
    pub owner: Option<OwnerReference>,
}

/// Observed state of a ServiceInstance
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InstanceState {
    /// The broker reported `Provisioned`
    pub provisioned: bool,
    /// The instance is being deleted
    pub terminating: bool,
}

impl InstanceState {
    /// Read the state of an untyped ServiceInstance
    pub fn from_dynamic(obj: &DynamicObject) -> Self {
        Self {
            provisioned: string_at(obj, &["status", "provisionStatus"])
                == Some(PROVISION_STATUS_PROVISIONED),
            terminating: obj.metadata.deletion_timestamp.is_some(),
        }
    }
}

/// Render the ServiceInstance for a request
pub fn build_instance(request: &InstanceRequest) -> Result<DynamicObject, Error> {
    let class = service_class(request.kind, request.provider)?;
    let labels = BTreeMap::from([
        (MANAGED_BY_LABEL_KEY.to_string(), MANAGED_BY_LABEL_VALUE.to_string()),
        (CLUSTER_NAME_LABEL_KEY.to_string(), request.cluster.clone()),
        (CLUSTER_NAMESPACE_LABEL_KEY.to_string(), request.namespace.clone()),
        (SUFFIX_LABEL_KEY.to_string(), request.suffix.clone()),
        (INSTANCE_KIND_LABEL_KEY.to_string(), request.kind.as_str().to_string()),
    ]);

    let mut metadata = serde_json::json!({
        "name": request.name,
        "namespace": request.namespace,
        "labels": labels,
    });
    if let Some(owner) = &request.owner {
        metadata["ownerReferences"] = serde_json::json!([owner]);
    }

    serde_json::from_value(serde_json::json!({
        "apiVersion": SERVICE_INSTANCE_API_VERSION,
        "kind": SERVICE_INSTANCE_KIND,
        "metadata": metadata,
        "spec": {
            "clusterServiceClassExternalName": class,
            "clusterServicePlanExternalName": format!("{}-plan-default", class),
            "parameters": request.parameters,
        }
    }))
    .map_err(|e| Error::serialization_for_kind(SERVICE_INSTANCE_KIND, e.to_string()))
}

/// Trait abstracting infrastructure requests
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InfraProvisioner: Send + Sync {
    /// Suffix of an existing cluster instance labelled for this record
    async fn find_instance_suffix(
        &self,
        namespace: &str,
        cluster: &str,
    ) -> Result<Option<String>, Error>;

    /// State of an instance, None when it does not exist
    async fn get_instance(&self, namespace: &str, name: &str)
        -> Result<Option<InstanceState>, Error>;

    /// Create an instance unless one with the same name exists
    async fn create_instance(&self, request: &InstanceRequest) -> Result<Ensured, Error>;

    /// Delete every instance labelled for this record
    ///
    /// Returns how many instances still existed when called.
    async fn delete_instances(&self, namespace: &str, cluster: &str) -> Result<usize, Error>;
}

/// InfraProvisioner backed by the service catalog API
pub struct ServiceCatalogProvisioner {
    client: Client,
}

impl ServiceCatalogProvisioner {
    /// Create a new provisioner
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        let ar = build_api_resource(SERVICE_INSTANCE_API_VERSION, SERVICE_INSTANCE_KIND);
        Api::namespaced_with(self.client.clone(), namespace, &ar)
    }

    async fn list_for_cluster(
        &self,
        namespace: &str,
        cluster: &str,
        kind: Option<InstanceKind>,
    ) -> Result<Vec<DynamicObject>, Error> {
        let mut selector = format!(
            "{}={},{}={}",
            CLUSTER_NAME_LABEL_KEY, cluster, CLUSTER_NAMESPACE_LABEL_KEY, namespace
        );
        if let Some(kind) = kind {
            selector.push_str(&format!(",{}={}", INSTANCE_KIND_LABEL_KEY, kind.as_str()));
        }
        let list = self
            .api(namespace)
            .list(&ListParams::default().labels(&selector))
            .await?;
        Ok(list.items)
    }
}

#[async_trait]
impl InfraProvisioner for ServiceCatalogProvisioner {
    async fn find_instance_suffix(
        &self,
        namespace: &str,
        cluster: &str,
    ) -> Result<Option<String>, Error> {
        let instances = self
            .list_for_cluster(namespace, cluster, Some(InstanceKind::Cluster))
            .await?;
        let suffix = instances
            .iter()
            .filter(|i| i.metadata.deletion_timestamp.is_none())
            .find_map(|i| i.labels().get(SUFFIX_LABEL_KEY).cloned())
            .filter(|s| !s.is_empty());
        debug!(cluster = %cluster, suffix = ?suffix, "looked up existing instance");
        Ok(suffix)
    }

    async fn get_instance(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<InstanceState>, Error> {
        Ok(self
            .api(namespace)
            .get_opt(name)
            .await?
            .map(|obj| InstanceState::from_dynamic(&obj)))
    }

    async fn create_instance(&self, request: &InstanceRequest) -> Result<Ensured, Error> {
        let obj = build_instance(request)?;
        let outcome = create_if_absent(&self.api(&request.namespace), &obj).await?;
        info!(
            cluster = %request.cluster,
            instance = %request.name,
            outcome = ?outcome,
            "requested service instance"
        );
        Ok(outcome)
    }

    async fn delete_instances(&self, namespace: &str, cluster: &str) -> Result<usize, Error> {
        let instances = self.list_for_cluster(namespace, cluster, None).await?;
        let api = self.api(namespace);
        for instance in instances.iter().filter(|i| i.metadata.deletion_timestamp.is_none()) {
            delete_if_present(&api, &instance.name_any()).await?;
        }
        Ok(instances.len())
    }
}
