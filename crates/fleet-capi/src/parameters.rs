//! Parameter payloads for infrastructure requests
//!
//! The service broker renders CAPI manifests from a flat JSON object. We
//! build it from a common part shared by every provider and a provider
//! part, then merge the two. A key present in both parts is a programming
//! error, not something to resolve by precedence.

use kube::ResourceExt;
use serde::Serialize;

use fleet_common::crd::{ManagedCluster, ProviderKind};
use fleet_common::Error;

/// Fields every provisioning request carries
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterParameters {
    /// Namespace of the ManagedCluster
    pub namespace: String,
    /// Name of the ManagedCluster
    pub cluster_name: String,
    /// Owning user identity
    pub owner: String,
    /// Kubernetes version to install
    pub k8s_version: String,
    /// Control plane replicas
    pub master_num: u32,
    /// Worker replicas
    pub worker_num: u32,
}

/// AWS machine and placement settings
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AwsParameters {
    /// Region to provision in
    pub region: String,
    /// EC2 key pair name
    pub ssh_key: String,
    /// Control plane instance type
    pub master_type: String,
    /// Worker instance type
    pub worker_type: String,
    /// Control plane root volume in GiB
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_disk_size: Option<u32>,
    /// Worker root volume in GiB
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_disk_size: Option<u32>,
}

/// vSphere placement and sizing settings
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VsphereParameters {
    pub pod_cidr: String,
    pub vcenter_ip: String,
    pub vcenter_id: String,
    pub vcenter_password: String,
    pub vcenter_thumbprint: String,
    pub vcenter_network: String,
    pub vcenter_data_center: String,
    pub vcenter_data_store: String,
    pub vcenter_folder: String,
    pub vcenter_resource_pool: String,
    pub vcenter_kcp_ip: String,
    pub vcenter_cpu_num: u32,
    pub vcenter_mem_size: u32,
    pub vcenter_disk_size: u32,
    pub vcenter_template: String,
}

/// Payload of the vSphere upgrade artifact request
///
/// The broker renders a new VSphereMachineTemplate named
/// `<cluster>-<version>` from it; the pools are then pointed at that template.
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VsphereUpgradeParameters {
    pub namespace: String,
    pub cluster_name: String,
    pub k8s_version: String,
    pub vcenter_ip: String,
    pub vcenter_thumbprint: String,
    pub vcenter_network: String,
    pub vcenter_data_center: String,
    pub vcenter_data_store: String,
    pub vcenter_folder: String,
    pub vcenter_resource_pool: String,
    pub vcenter_cpu_num: u32,
    pub vcenter_mem_size: u32,
    pub vcenter_disk_size: u32,
    pub vcenter_template: String,
}

fn to_object<T: Serialize>(value: &T) -> Result<serde_json::Value, Error> {
    serde_json::to_value(value)
        .map_err(|e| Error::serialization_for_kind("ServiceInstance", e.to_string()))
}

/// Common part of every provisioning payload
pub fn cluster_parameters(cluster: &ManagedCluster) -> Result<serde_json::Value, Error> {
    to_object(&ClusterParameters {
        namespace: cluster.namespace_or_default(),
        cluster_name: cluster.name_any(),
        owner: cluster.owner().to_string(),
        k8s_version: cluster.spec.version.clone(),
        master_num: cluster.spec.master_num,
        worker_num: cluster.spec.worker_num,
    })
}

/// Provider part of the provisioning payload
///
/// Fails with a validation error when the provider section is missing, and
/// for providers we cannot provision.
pub fn provider_parameters(cluster: &ManagedCluster) -> Result<serde_json::Value, Error> {
    let name = cluster.name_any();
    match cluster.spec.provider_kind() {
        ProviderKind::Aws => {
            let aws = cluster.spec.aws.as_ref().ok_or_else(|| {
                Error::validation_for_field(&name, "spec.aws", "AWS clusters require the aws section")
            })?;
            to_object(&AwsParameters {
                region: aws.region.clone(),
                ssh_key: aws.ssh_key.clone(),
                master_type: aws.master_type.clone(),
                worker_type: aws.worker_type.clone(),
                master_disk_size: aws.master_disk_size,
                worker_disk_size: aws.worker_disk_size,
            })
        }
        ProviderKind::Vsphere => {
            let vs = cluster.spec.vsphere.as_ref().ok_or_else(|| {
                Error::validation_for_field(
                    &name,
                    "spec.vsphere",
                    "vSphere clusters require the vsphere section",
                )
            })?;
            to_object(&VsphereParameters {
                pod_cidr: vs.pod_cidr.clone(),
                vcenter_ip: vs.vcenter_ip.clone(),
                vcenter_id: vs.vcenter_id.clone(),
                vcenter_password: vs.vcenter_password.clone(),
                vcenter_thumbprint: vs.vcenter_thumbprint.clone(),
                vcenter_network: vs.vcenter_network.clone(),
                vcenter_data_center: vs.vcenter_data_center.clone(),
                vcenter_data_store: vs.vcenter_data_store.clone(),
                vcenter_folder: vs.vcenter_folder.clone(),
                vcenter_resource_pool: vs.vcenter_resource_pool.clone(),
                vcenter_kcp_ip: vs.vcenter_kcp_ip.clone(),
                vcenter_cpu_num: vs.vcenter_cpu_num,
                vcenter_mem_size: vs.vcenter_mem_size,
                vcenter_disk_size: vs.vcenter_disk_size,
                vcenter_template: vs.vcenter_template.clone(),
            })
        }
        ProviderKind::Unknown => Err(Error::validation_for_field(
            &name,
            "spec.provider",
            format!("unsupported provider '{}'", cluster.spec.provider),
        )),
    }
}

/// Payload for the vSphere upgrade artifact of `spec.version`
pub fn vsphere_upgrade_parameters(cluster: &ManagedCluster) -> Result<serde_json::Value, Error> {
    let name = cluster.name_any();
    let vs = cluster.spec.vsphere.as_ref().ok_or_else(|| {
        Error::validation_for_field(
            &name,
            "spec.vsphere",
            "vSphere upgrades require the vsphere section",
        )
    })?;
    to_object(&VsphereUpgradeParameters {
        namespace: cluster.namespace_or_default(),
        cluster_name: name.clone(),
        k8s_version: cluster.spec.version.clone(),
        vcenter_ip: vs.vcenter_ip.clone(),
        vcenter_thumbprint: vs.vcenter_thumbprint.clone(),
        vcenter_network: vs.vcenter_network.clone(),
        vcenter_data_center: vs.vcenter_data_center.clone(),
        vcenter_data_store: vs.vcenter_data_store.clone(),
        vcenter_folder: vs.vcenter_folder.clone(),
        vcenter_resource_pool: vs.vcenter_resource_pool.clone(),
        vcenter_cpu_num: vs.vcenter_cpu_num,
        vcenter_mem_size: vs.vcenter_mem_size,
        vcenter_disk_size: vs.vcenter_disk_size,
        vcenter_template: vs.vcenter_template.clone(),
    })
}

/// Shallow union of two JSON objects
///
/// Both inputs must be objects and must not share a key.
pub fn merge_parameters(
    base: serde_json::Value,
    extra: serde_json::Value,
) -> Result<serde_json::Value, Error> {
    let (serde_json::Value::Object(mut merged), serde_json::Value::Object(extra)) = (base, extra)
    else {
        return Err(Error::contract(
            "merge_parameters",
            "parameter payloads must be JSON objects",
        ));
    };

    for (key, value) in extra {
        if merged.contains_key(&key) {
            return Err(Error::contract(
                "merge_parameters",
                format!("key '{}' defined by both payloads", key),
            ));
        }
        merged.insert(key, value);
    }
    Ok(serde_json::Value::Object(merged))
}

/// Name of the infrastructure template for a version (`<cluster>-<version>`)
pub fn template_name(cluster: &str, version: &str) -> String {
    format!("{}-{}", cluster, version)
}
