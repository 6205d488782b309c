//! CAPI (Cluster API) client for the objects backing a managed cluster
//!
//! The service broker renders one CAPI `Cluster` per managed cluster plus a
//! `<cluster>-control-plane` KubeadmControlPlane and a `<cluster>-md-0`
//! MachineDeployment. Scaling and upgrades rewrite those two pool objects;
//! everything else about them belongs to the broker.

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, ListParams, Patch, PatchParams};
use kube::Client;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use fleet_common::kube_utils::{build_api_resource_with_discovery, string_at, u32_at};
use fleet_common::{Error, FIELD_MANAGER};

const CAPI_GROUP: &str = "cluster.x-k8s.io";
const CONTROL_PLANE_GROUP: &str = "controlplane.cluster.x-k8s.io";

/// Label CAPI puts on every Machine of a cluster
const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";
/// Label CAPI puts on control plane Machines
const CONTROL_PLANE_LABEL: &str = "cluster.x-k8s.io/control-plane";
/// Label CAPI puts on Machines owned by a MachineDeployment
const DEPLOYMENT_NAME_LABEL: &str = "cluster.x-k8s.io/deployment-name";

/// Machine phase that counts as upgraded once the version matches
pub const MACHINE_PHASE_RUNNING: &str = "Running";

/// The two node pools of a managed cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolKind {
    /// KubeadmControlPlane `<cluster>-control-plane`
    ControlPlane,
    /// MachineDeployment `<cluster>-md-0`
    Worker,
}

impl PoolKind {
    /// Name of the CAPI object backing this pool
    pub fn object_name(&self, cluster: &str) -> String {
        match self {
            Self::ControlPlane => format!("{}-control-plane", cluster),
            Self::Worker => format!("{}-md-0", cluster),
        }
    }

    /// Short label used in logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ControlPlane => "control-plane",
            Self::Worker => "worker",
        }
    }

    fn group(&self) -> &'static str {
        match self {
            Self::ControlPlane => CONTROL_PLANE_GROUP,
            Self::Worker => CAPI_GROUP,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::ControlPlane => "KubeadmControlPlane",
            Self::Worker => "MachineDeployment",
        }
    }

    fn version_path(&self) -> &'static [&'static str] {
        match self {
            Self::ControlPlane => &["spec", "version"],
            Self::Worker => &["spec", "template", "spec", "version"],
        }
    }

    /// Path of the infrastructure template reference
    ///
    /// Older KubeadmControlPlane versions carry `spec.infrastructureTemplate`;
    /// newer ones moved it under `spec.machineTemplate.infrastructureRef`.
    fn template_path(&self, obj: &DynamicObject) -> &'static [&'static str] {
        match self {
            Self::ControlPlane => {
                let legacy = obj
                    .data
                    .get("spec")
                    .and_then(|s| s.get("infrastructureTemplate"))
                    .is_some();
                if legacy {
                    &["spec", "infrastructureTemplate", "name"]
                } else {
                    &["spec", "machineTemplate", "infrastructureRef", "name"]
                }
            }
            Self::Worker => &["spec", "template", "spec", "infrastructureRef", "name"],
        }
    }

    fn machine_selector(&self, cluster: &str) -> String {
        match self {
            Self::ControlPlane => {
                format!("{}={},{}", CLUSTER_NAME_LABEL, cluster, CONTROL_PLANE_LABEL)
            }
            Self::Worker => format!("{}={}", DEPLOYMENT_NAME_LABEL, self.object_name(cluster)),
        }
    }
}

impl std::fmt::Display for PoolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The fields of a pool object scaling and upgrades care about
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolObject {
    /// Configured replicas (`spec.replicas`)
    pub replicas: Option<u32>,
    /// Ready replicas (`status.readyReplicas`, zero when unreported)
    pub ready_replicas: u32,
    /// Configured Kubernetes version
    pub version: Option<String>,
    /// Infrastructure template the pool's machines are cloned from
    pub template_ref: Option<String>,
}

impl PoolObject {
    /// Extract the pool fields from an untyped KubeadmControlPlane or MachineDeployment
    pub fn from_dynamic(kind: PoolKind, obj: &DynamicObject) -> Self {
        Self {
            replicas: u32_at(obj, &["spec", "replicas"]),
            ready_replicas: u32_at(obj, &["status", "readyReplicas"]).unwrap_or(0),
            version: string_at(obj, kind.version_path()).map(str::to_string),
            template_ref: string_at(obj, kind.template_path(obj)).map(str::to_string),
        }
    }

    /// Whether every configured replica reports ready
    pub fn is_rolled_out(&self) -> bool {
        self.ready_replicas == self.replicas.unwrap_or(0)
    }
}

/// One CAPI Machine, reduced to what upgrade tracking needs
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MachineSummary {
    /// Machine name
    pub name: String,
    /// Kubernetes version the machine was created with
    pub version: Option<String>,
    /// Machine lifecycle phase (`Pending`, `Provisioning`, `Running`, ...)
    pub phase: Option<String>,
}

impl MachineSummary {
    /// Extract a summary from an untyped Machine
    pub fn from_dynamic(obj: &DynamicObject) -> Self {
        Self {
            name: obj.metadata.name.clone().unwrap_or_default(),
            version: string_at(obj, &["spec", "version"]).map(str::to_string),
            phase: string_at(obj, &["status", "phase"]).map(str::to_string),
        }
    }

    /// Running at the given version
    pub fn is_upgraded_to(&self, version: &str) -> bool {
        self.version.as_deref() == Some(version)
            && self.phase.as_deref() == Some(MACHINE_PHASE_RUNNING)
    }
}

/// Machines of a pool split by upgrade progress
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MachineRollout {
    /// Names of machines running the target version
    pub upgraded: Vec<String>,
    /// Names of every other machine
    pub outdated: Vec<String>,
}

/// Split machines into those already running `version` and the rest
pub fn partition_machines(machines: &[MachineSummary], version: &str) -> MachineRollout {
    let (upgraded, outdated): (Vec<_>, Vec<_>) =
        machines.iter().partition(|m| m.is_upgraded_to(version));
    MachineRollout {
        upgraded: upgraded.into_iter().map(|m| m.name.clone()).collect(),
        outdated: outdated.into_iter().map(|m| m.name.clone()).collect(),
    }
}

/// Trait abstracting CAPI resource operations
///
/// This trait allows mocking CAPI operations in tests while using the
/// real Kubernetes client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CapiClient: Send + Sync {
    /// Control plane host published on the CAPI `Cluster`
    ///
    /// Returns None when the Cluster does not exist yet or has no host.
    async fn control_plane_endpoint(
        &self,
        namespace: &str,
        cluster: &str,
    ) -> Result<Option<String>, Error>;

    /// Read a pool object, None when it does not exist
    async fn get_pool(
        &self,
        namespace: &str,
        cluster: &str,
        pool: PoolKind,
    ) -> Result<Option<PoolObject>, Error>;

    /// Set the configured replicas of a pool
    async fn set_pool_replicas(
        &self,
        namespace: &str,
        cluster: &str,
        pool: PoolKind,
        replicas: u32,
    ) -> Result<(), Error>;

    /// Set the Kubernetes version of a pool, and its template reference when given
    ///
    /// Both fields are written in one patch.
    async fn set_pool_version(
        &self,
        namespace: &str,
        cluster: &str,
        pool: PoolKind,
        version: &str,
        template: Option<String>,
    ) -> Result<(), Error>;

    /// List the Machines belonging to a pool
    async fn list_pool_machines(
        &self,
        namespace: &str,
        cluster: &str,
        pool: PoolKind,
    ) -> Result<Vec<MachineSummary>, Error>;
}

/// Real CAPI client implementation using DynamicObject for untyped resources
pub struct CapiClientImpl {
    client: Client,
}

impl CapiClientImpl {
    /// Create a new CapiClientImpl
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn api(&self, namespace: &str, group: &str, kind: &str) -> Result<Api<DynamicObject>, Error> {
        let ar = build_api_resource_with_discovery(&self.client, group, kind).await?;
        Ok(Api::namespaced_with(self.client.clone(), namespace, &ar))
    }

    async fn pool_api(&self, namespace: &str, pool: PoolKind) -> Result<Api<DynamicObject>, Error> {
        self.api(namespace, pool.group(), pool.kind()).await
    }
}

/// Build the merge patch that rewrites a pool's version and template
pub(crate) fn version_patch(
    pool: PoolKind,
    template_path: &[&str],
    version: &str,
    template: Option<&str>,
) -> serde_json::Value {
    let mut patch = serde_json::json!({});
    set_at(&mut patch, pool.version_path(), serde_json::json!(version));
    if let Some(template) = template {
        set_at(&mut patch, template_path, serde_json::json!(template));
    }
    patch
}

fn set_at(root: &mut serde_json::Value, path: &[&str], value: serde_json::Value) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut current = root;
    for segment in parents {
        current = &mut current[*segment];
    }
    current[*last] = value;
}

#[async_trait]
impl CapiClient for CapiClientImpl {
    async fn control_plane_endpoint(
        &self,
        namespace: &str,
        cluster: &str,
    ) -> Result<Option<String>, Error> {
        let api = self.api(namespace, CAPI_GROUP, "Cluster").await?;
        let Some(obj) = api.get_opt(cluster).await? else {
            debug!(cluster = %cluster, "CAPI Cluster not found");
            return Ok(None);
        };
        Ok(string_at(&obj, &["spec", "controlPlaneEndpoint", "host"])
            .filter(|host| !host.is_empty())
            .map(str::to_string))
    }

    async fn get_pool(
        &self,
        namespace: &str,
        cluster: &str,
        pool: PoolKind,
    ) -> Result<Option<PoolObject>, Error> {
        let api = self.pool_api(namespace, pool).await?;
        let name = pool.object_name(cluster);
        match api.get_opt(&name).await? {
            Some(obj) => {
                let pool_obj = PoolObject::from_dynamic(pool, &obj);
                debug!(
                    cluster = %cluster,
                    pool = %pool,
                    replicas = ?pool_obj.replicas,
                    ready = pool_obj.ready_replicas,
                    "read pool object"
                );
                Ok(Some(pool_obj))
            }
            None => {
                debug!(cluster = %cluster, pool = %pool, object = %name, "pool object not found");
                Ok(None)
            }
        }
    }

    async fn set_pool_replicas(
        &self,
        namespace: &str,
        cluster: &str,
        pool: PoolKind,
        replicas: u32,
    ) -> Result<(), Error> {
        let api = self.pool_api(namespace, pool).await?;
        let patch = serde_json::json!({ "spec": { "replicas": replicas } });
        api.patch(
            &pool.object_name(cluster),
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;

        info!(cluster = %cluster, pool = %pool, replicas, "set pool replicas");
        Ok(())
    }

    async fn set_pool_version(
        &self,
        namespace: &str,
        cluster: &str,
        pool: PoolKind,
        version: &str,
        template: Option<String>,
    ) -> Result<(), Error> {
        let api = self.pool_api(namespace, pool).await?;
        let name = pool.object_name(cluster);

        // The template path depends on the served schema, so read first
        let current = api.get(&name).await?;
        let patch = version_patch(
            pool,
            pool.template_path(&current),
            version,
            template.as_deref(),
        );
        api.patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;

        info!(
            cluster = %cluster,
            pool = %pool,
            version = %version,
            template = ?template,
            "set pool version"
        );
        Ok(())
    }

    async fn list_pool_machines(
        &self,
        namespace: &str,
        cluster: &str,
        pool: PoolKind,
    ) -> Result<Vec<MachineSummary>, Error> {
        let api = self.api(namespace, CAPI_GROUP, "Machine").await?;
        let machines = api
            .list(&ListParams::default().labels(&pool.machine_selector(cluster)))
            .await?;
        Ok(machines.items.iter().map(MachineSummary::from_dynamic).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn dynamic(value: serde_json::Value) -> DynamicObject {
        serde_json::from_value(value).unwrap()
    }

    fn machine(name: &str, version: &str, phase: &str) -> MachineSummary {
        MachineSummary {
            name: name.to_string(),
            version: Some(version.to_string()),
            phase: Some(phase.to_string()),
        }
    }

    #[rstest]
    #[case(PoolKind::ControlPlane, "edge-control-plane")]
    #[case(PoolKind::Worker, "edge-md-0")]
    fn pool_objects_are_named_after_the_cluster(#[case] pool: PoolKind, #[case] expected: &str) {
        assert_eq!(pool.object_name("edge"), expected);
    }

    #[test]
    fn machine_selectors_match_capi_labels() {
        assert_eq!(
            PoolKind::ControlPlane.machine_selector("edge"),
            "cluster.x-k8s.io/cluster-name=edge,cluster.x-k8s.io/control-plane"
        );
        assert_eq!(
            PoolKind::Worker.machine_selector("edge"),
            "cluster.x-k8s.io/deployment-name=edge-md-0"
        );
    }

    #[test]
    fn control_plane_pool_reads_current_schema() {
        let obj = dynamic(serde_json::json!({
            "apiVersion": "controlplane.cluster.x-k8s.io/v1beta1",
            "kind": "KubeadmControlPlane",
            "metadata": { "name": "edge-control-plane" },
            "spec": {
                "replicas": 3,
                "version": "v1.28.9",
                "machineTemplate": { "infrastructureRef": { "name": "edge-v1.28.9" } }
            },
            "status": { "readyReplicas": 2 }
        }));

        let pool = PoolObject::from_dynamic(PoolKind::ControlPlane, &obj);
        assert_eq!(pool.replicas, Some(3));
        assert_eq!(pool.ready_replicas, 2);
        assert_eq!(pool.version.as_deref(), Some("v1.28.9"));
        assert_eq!(pool.template_ref.as_deref(), Some("edge-v1.28.9"));
        assert!(!pool.is_rolled_out());
    }

    #[test]
    fn control_plane_pool_reads_legacy_template_field() {
        let obj = dynamic(serde_json::json!({
            "apiVersion": "controlplane.cluster.x-k8s.io/v1alpha3",
            "kind": "KubeadmControlPlane",
            "metadata": { "name": "edge-control-plane" },
            "spec": {
                "replicas": 1,
                "version": "v1.22.2",
                "infrastructureTemplate": { "name": "edge-v1.22.2" }
            }
        }));

        let pool = PoolObject::from_dynamic(PoolKind::ControlPlane, &obj);
        assert_eq!(pool.template_ref.as_deref(), Some("edge-v1.22.2"));
        assert_eq!(
            PoolKind::ControlPlane.template_path(&obj),
            &["spec", "infrastructureTemplate", "name"]
        );
        // No status yet: nothing is ready
        assert_eq!(pool.ready_replicas, 0);
    }

    #[test]
    fn worker_pool_reads_template_spec() {
        let obj = dynamic(serde_json::json!({
            "apiVersion": "cluster.x-k8s.io/v1beta1",
            "kind": "MachineDeployment",
            "metadata": { "name": "edge-md-0" },
            "spec": {
                "replicas": 5,
                "template": { "spec": {
                    "version": "v1.29.4",
                    "infrastructureRef": { "name": "edge-v1.29.4" }
                } }
            },
            "status": { "readyReplicas": 5 }
        }));

        let pool = PoolObject::from_dynamic(PoolKind::Worker, &obj);
        assert_eq!(pool.version.as_deref(), Some("v1.29.4"));
        assert_eq!(pool.template_ref.as_deref(), Some("edge-v1.29.4"));
        assert!(pool.is_rolled_out());
    }

    #[test]
    fn version_patch_writes_template_only_when_given() {
        let patch = version_patch(
            PoolKind::Worker,
            &["spec", "template", "spec", "infrastructureRef", "name"],
            "v1.29.4",
            None,
        );
        assert_eq!(
            patch,
            serde_json::json!({ "spec": { "template": { "spec": { "version": "v1.29.4" } } } })
        );

        let patch = version_patch(
            PoolKind::ControlPlane,
            &["spec", "machineTemplate", "infrastructureRef", "name"],
            "v1.29.4",
            Some("edge-v1.29.4"),
        );
        assert_eq!(patch["spec"]["version"], "v1.29.4");
        assert_eq!(
            patch["spec"]["machineTemplate"]["infrastructureRef"]["name"],
            "edge-v1.29.4"
        );
    }

    /// Story: a five node worker pool halfway through an upgrade
    ///
    /// Two machines run the new version; three are still on the old one or
    /// have the new version but are not Running yet.
    #[test]
    fn story_rollout_counts_only_running_machines_at_target() {
        let machines = vec![
            machine("md-a", "v1.29.4", "Running"),
            machine("md-b", "v1.29.4", "Running"),
            machine("md-c", "v1.29.4", "Provisioning"),
            machine("md-d", "v1.28.9", "Running"),
            machine("md-e", "v1.28.9", "Running"),
        ];

        let rollout = partition_machines(&machines, "v1.29.4");
        assert_eq!(rollout.upgraded, vec!["md-a", "md-b"]);
        assert_eq!(rollout.outdated, vec!["md-c", "md-d", "md-e"]);
    }

    #[test]
    fn machine_summary_tolerates_missing_status() {
        let obj = dynamic(serde_json::json!({
            "apiVersion": "cluster.x-k8s.io/v1beta1",
            "kind": "Machine",
            "metadata": { "name": "edge-control-plane-x1" },
            "spec": { "version": "v1.29.4" }
        }));
        let summary = MachineSummary::from_dynamic(&obj);
        assert_eq!(summary.name, "edge-control-plane-x1");
        assert_eq!(summary.phase, None);
        assert!(!summary.is_upgraded_to("v1.29.4"));
    }
}
