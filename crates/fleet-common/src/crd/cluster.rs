//! ManagedCluster Custom Resource Definition
//!
//! A ManagedCluster is the single desired/observed state record for one
//! remotely provisioned (or registered) Kubernetes cluster.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{AwsSpec, ClusterPhase, ClusterType, ProviderKind, VsphereSpec};

/// Finalizer that blocks deletion until downstream cleanup completes
pub const CLUSTER_FINALIZER: &str = "fleet.dev/finalizer";

/// Annotation: generated instantiation suffix
pub const ANNOTATION_SUFFIX: &str = "fleet.dev/suffix";
/// Annotation: discovered API server endpoint
pub const ANNOTATION_APISERVER: &str = "fleet.dev/apiserver";
/// Annotation: discovered gateway endpoint
pub const ANNOTATION_GATEWAY: &str = "fleet.dev/gateway";
/// Annotation: identity of the owning user
pub const ANNOTATION_OWNER: &str = "fleet.dev/owner";
/// Annotation: tenant domain used for ingress hosts
pub const ANNOTATION_DOMAIN: &str = "fleet.dev/domain";

/// Label: how the cluster came under management (created | registered)
pub const LABEL_CLUSTER_TYPE: &str = "fleet.dev/cluster-type";
/// Label written by older controllers, migrated into [`LABEL_CLUSTER_TYPE`]
pub const LABEL_CLUSTER_TYPE_DEPRECATED: &str = "type";

/// Specification for a ManagedCluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "fleet.dev",
    version = "v1alpha1",
    kind = "ManagedCluster",
    plural = "managedclusters",
    shortname = "mc",
    status = "ManagedClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Provider","type":"string","jsonPath":".status.provider"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".status.version"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterSpec {
    /// Infrastructure provider ("AWS" or "vSphere")
    #[serde(default)]
    pub provider: String,

    /// Target Kubernetes version (e.g. "v1.29.4")
    #[serde(default)]
    pub version: String,

    /// Desired number of control plane nodes
    #[serde(default)]
    pub master_num: u32,

    /// Desired number of worker nodes
    #[serde(default)]
    pub worker_num: u32,

    /// AWS provisioning parameters (created AWS clusters only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws: Option<AwsSpec>,

    /// vSphere provisioning parameters (created vSphere clusters only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vsphere: Option<VsphereSpec>,
}

impl ManagedClusterSpec {
    /// Provider parsed from the free-form spec field
    pub fn provider_kind(&self) -> ProviderKind {
        ProviderKind::parse(&self.provider)
    }

    /// Validate a spec that this operator is expected to provision
    ///
    /// Registered clusters are not validated: their spec is overwritten by
    /// what the remote inventory reports.
    pub fn validate_for_provisioning(&self, cluster: &str) -> Result<(), crate::Error> {
        if self.version.is_empty() {
            return Err(crate::Error::validation_for_field(
                cluster,
                "spec.version",
                "version cannot be empty",
            ));
        }
        if self.master_num == 0 {
            return Err(crate::Error::validation_for_field(
                cluster,
                "spec.masterNum",
                "at least one control plane node is required",
            ));
        }
        match self.provider_kind() {
            ProviderKind::Aws if self.aws.is_none() => Err(crate::Error::validation_for_field(
                cluster,
                "spec.aws",
                "AWS clusters require the aws section",
            )),
            ProviderKind::Vsphere if self.vsphere.is_none() => {
                Err(crate::Error::validation_for_field(
                    cluster,
                    "spec.vsphere",
                    "vSphere clusters require the vsphere section",
                ))
            }
            ProviderKind::Unknown => Err(crate::Error::validation_for_field(
                cluster,
                "spec.provider",
                format!("unsupported provider '{}'", self.provider),
            )),
            _ => Ok(()),
        }
    }
}

/// Observed state of a ManagedCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterStatus {
    /// Provider detected on the live cluster
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub provider: String,

    /// Kubernetes version observed on the live cluster
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,

    /// Remote API server answered its readiness probe
    #[serde(default)]
    pub ready: bool,

    /// Control plane is reachable and healthy
    #[serde(default)]
    pub control_plane_ready: bool,

    /// Cluster is registered with GitOps
    #[serde(default)]
    pub argo_ready: bool,

    /// Gateway exposure is in place
    #[serde(default)]
    pub gateway_ready: bool,

    /// One-shot marker for the prometheusReady to gatewayReady migration
    #[serde(default)]
    pub gateway_ready_migration: bool,

    /// Identity provider clients are registered
    #[serde(default)]
    pub auth_client_ready: bool,

    /// Ingress and TLS resources are in place
    #[serde(default)]
    pub traefik_ready: bool,

    /// Legacy flag, read only by the gateway migration
    #[serde(default)]
    pub prometheus_ready: bool,

    /// Ready control plane nodes
    #[serde(default)]
    pub master_run: u32,

    /// Ready worker nodes
    #[serde(default)]
    pub worker_run: u32,

    /// Control plane replica count the live cluster has converged to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_num: Option<u32>,

    /// Worker replica count the live cluster has converged to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_num: Option<u32>,

    /// Current phase of the cluster lifecycle
    #[serde(default)]
    pub phase: ClusterPhase,

    /// Published control plane host
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub control_plane_endpoint: String,

    /// Link to the cluster's GitOps applications
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub application_link: String,
}

impl ManagedCluster {
    /// Namespace of the record (empty for malformed objects)
    pub fn namespace_or_default(&self) -> String {
        self.namespace().unwrap_or_default()
    }

    /// `<namespace>/<name>` key used in logs and failure tracking
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace_or_default(), self.name_any())
    }

    /// `<namespace>-<name>`, the prefix for resources named after this cluster
    /// in shared namespaces
    pub fn namespaced_prefix(&self) -> String {
        format!("{}-{}", self.namespace_or_default(), self.name_any())
    }

    /// How this cluster came under management
    pub fn cluster_type(&self) -> ClusterType {
        ClusterType::from_label(self.labels().get(LABEL_CLUSTER_TYPE).map(String::as_str))
    }

    /// Read a non-empty annotation
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations()
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Set an annotation
    pub fn set_annotation(&mut self, key: &str, value: impl Into<String>) {
        self.annotations_mut().insert(key.to_string(), value.into());
    }

    /// Instantiation suffix, once assigned
    pub fn suffix(&self) -> Option<&str> {
        self.annotation(ANNOTATION_SUFFIX)
    }

    /// Identity of the owning user (empty when unset)
    pub fn owner(&self) -> &str {
        self.annotation(ANNOTATION_OWNER).unwrap_or_default()
    }

    /// Observed status, defaulted when absent
    pub fn status_or_default(&self) -> ManagedClusterStatus {
        self.status.clone().unwrap_or_default()
    }

    /// Mutable observed status, created on first access
    pub fn status_mut(&mut self) -> &mut ManagedClusterStatus {
        self.status.get_or_insert_with(ManagedClusterStatus::default)
    }

    /// Current phase, `Processing` when status is absent
    pub fn phase(&self) -> ClusterPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Whether the deletion finalizer is present
    pub fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == CLUSTER_FINALIZER)
    }
}
