//! Supporting types for the ManagedCluster CRD

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Cluster lifecycle phase
///
/// The current pipeline only writes `Processing`, `Sync Needed`, `Ready`,
/// `Scaling`, `Upgrading` and `Deleting`. The remaining variants exist so
/// records written by older controllers still deserialize; they are
/// normalized to `Processing` on the next tick.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ClusterPhase {
    /// Cluster is being provisioned or registered
    #[default]
    Processing,
    /// Control plane and GitOps are wired, platform integrations pending
    #[serde(rename = "Sync Needed")]
    SyncNeeded,
    /// Every integration is in place
    Ready,
    /// Replica counts are being reconciled
    Scaling,
    /// Kubernetes version is being rolled out
    Upgrading,
    /// Deletion requested, cleanup in progress
    Deleting,
    /// Legacy: waiting to be provisioned
    Pending,
    /// Legacy: infrastructure being created
    Provisioning,
    /// Legacy: registration in progress
    Registering,
    /// Legacy: infrastructure created
    Provisioned,
    /// Legacy: registration done
    Registered,
    /// Legacy: terminal failure
    Failed,
    /// Legacy: unknown state
    Unknown,
}

impl ClusterPhase {
    /// Returns true for values only older controllers wrote
    pub fn is_legacy(&self) -> bool {
        matches!(
            self,
            Self::Pending
                | Self::Provisioning
                | Self::Registering
                | Self::Provisioned
                | Self::Registered
                | Self::Failed
                | Self::Unknown
        )
    }
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Processing => "Processing",
            Self::SyncNeeded => "Sync Needed",
            Self::Ready => "Ready",
            Self::Scaling => "Scaling",
            Self::Upgrading => "Upgrading",
            Self::Deleting => "Deleting",
            Self::Pending => "Pending",
            Self::Provisioning => "Provisioning",
            Self::Registering => "Registering",
            Self::Provisioned => "Provisioned",
            Self::Registered => "Registered",
            Self::Failed => "Failed",
            Self::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// How the cluster came under management
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ClusterType {
    /// Provisioned by this operator through the infrastructure provisioner
    #[default]
    Created,
    /// Pre-existing cluster that only published a kubeconfig
    Registered,
}

impl ClusterType {
    /// Label value for this type
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Registered => "registered",
        }
    }

    /// Parse a label value, defaulting to `Created`
    pub fn from_label(value: Option<&str>) -> Self {
        match value.map(str::to_ascii_lowercase).as_deref() {
            Some("registered") => Self::Registered,
            _ => Self::Created,
        }
    }
}

/// Infrastructure provider a cluster runs on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderKind {
    /// Amazon Web Services
    Aws,
    /// VMware vSphere (on-premises virtualization)
    Vsphere,
    /// Anything we cannot recognize
    Unknown,
}

impl ProviderKind {
    /// Sentinel written when no provider signal could be recognized
    pub const UNKNOWN: &'static str = "Unknown";

    /// Parse a provider string case-insensitively
    ///
    /// Accepts canonical names as well as the scheme prefixes nodes publish
    /// in `spec.providerID` (`aws://...`, `vsphere://...`).
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        let scheme = value.split_once("://").map_or(value, |(scheme, _)| scheme);
        match scheme.to_ascii_lowercase().as_str() {
            "aws" => Self::Aws,
            "vsphere" => Self::Vsphere,
            _ => Self::Unknown,
        }
    }

    /// Canonical display name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aws => "AWS",
            Self::Vsphere => "vSphere",
            Self::Unknown => Self::UNKNOWN,
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// AWS-specific provisioning parameters
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AwsSpec {
    /// Region to provision in (e.g. "ap-northeast-2")
    pub region: String,
    /// Name of the EC2 key pair installed on nodes
    pub ssh_key: String,
    /// Instance type for control plane nodes
    pub master_type: String,
    /// Instance type for worker nodes
    pub worker_type: String,
    /// Root volume size for control plane nodes in GiB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_disk_size: Option<u32>,
    /// Root volume size for worker nodes in GiB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_disk_size: Option<u32>,
}

/// vSphere-specific provisioning parameters
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VsphereSpec {
    /// Pod network CIDR
    pub pod_cidr: String,
    /// vCenter address
    pub vcenter_ip: String,
    /// vCenter user
    pub vcenter_id: String,
    /// vCenter password
    pub vcenter_password: String,
    /// TLS thumbprint of the vCenter server
    pub vcenter_thumbprint: String,
    /// VM network name
    pub vcenter_network: String,
    /// Datacenter name
    pub vcenter_data_center: String,
    /// Datastore name
    pub vcenter_data_store: String,
    /// VM folder
    pub vcenter_folder: String,
    /// Resource pool
    pub vcenter_resource_pool: String,
    /// Virtual IP for the control plane endpoint
    pub vcenter_kcp_ip: String,
    /// vCPUs per node
    pub vcenter_cpu_num: u32,
    /// Memory per node in MiB
    pub vcenter_mem_size: u32,
    /// Disk per node in GiB
    pub vcenter_disk_size: u32,
    /// VM template the nodes are cloned from
    pub vcenter_template: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_needed_uses_spaced_wire_name() {
        let json = serde_json::to_string(&ClusterPhase::SyncNeeded).unwrap();
        assert_eq!(json, "\"Sync Needed\"");
        let parsed: ClusterPhase = serde_json::from_str("\"Sync Needed\"").unwrap();
        assert_eq!(parsed, ClusterPhase::SyncNeeded);
    }

    #[test]
    fn legacy_phases_still_deserialize() {
        for legacy in ["Pending", "Provisioned", "Registered", "Failed", "Unknown"] {
            let phase: ClusterPhase = serde_json::from_str(&format!("\"{legacy}\"")).unwrap();
            assert!(phase.is_legacy(), "{legacy} should be legacy");
        }
        assert!(!ClusterPhase::Ready.is_legacy());
        assert!(!ClusterPhase::Deleting.is_legacy());
    }

    #[test]
    fn provider_parsing_is_case_insensitive() {
        assert_eq!(ProviderKind::parse("aws"), ProviderKind::Aws);
        assert_eq!(ProviderKind::parse("AWS"), ProviderKind::Aws);
        assert_eq!(ProviderKind::parse("vSphere"), ProviderKind::Vsphere);
        assert_eq!(ProviderKind::parse(" vsphere "), ProviderKind::Vsphere);
        assert_eq!(ProviderKind::parse("aws:///ap-northeast-2a/i-0abc"), ProviderKind::Aws);
        assert_eq!(ProviderKind::parse("vsphere://4210c2a1"), ProviderKind::Vsphere);
        assert_eq!(ProviderKind::parse("gce"), ProviderKind::Unknown);
        assert_eq!(ProviderKind::parse(""), ProviderKind::Unknown);
        assert_eq!(ProviderKind::Vsphere.to_string(), "vSphere");
    }

    #[test]
    fn cluster_type_defaults_to_created() {
        assert_eq!(ClusterType::from_label(None), ClusterType::Created);
        assert_eq!(ClusterType::from_label(Some("bogus")), ClusterType::Created);
        assert_eq!(
            ClusterType::from_label(Some("Registered")),
            ClusterType::Registered
        );
    }
}
