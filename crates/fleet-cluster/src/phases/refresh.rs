//! Observed-state refresh from the remote cluster
//!
//! Runs until the control plane is first seen healthy. Reads the Kubernetes
//! version, node inventory and provider from the remote cluster, then
//! probes `/readyz`. For registered clusters the remote inventory also
//! replaces the declared counts, provider and version.

use std::sync::LazyLock;

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use regex::Regex;
use tracing::{debug, info, warn};

use fleet_common::crd::{
    ClusterType, ManagedCluster, ProviderKind, ANNOTATION_APISERVER, ANNOTATION_SUFFIX,
};
use fleet_common::Error;

use super::{generate_suffix, Transition, REQUEUE_DEPENDENCY, REQUEUE_HEALTH};
use crate::controller::Context;

const UNKNOWN_VERSION: &str = "unknown";
const MASTER_ROLE_LABEL: &str = "node-role.kubernetes.io/master";
const CONTROL_PLANE_ROLE_LABEL: &str = "node-role.kubernetes.io/control-plane";
const READY_CONDITION: &str = "Ready";
const READYZ_OK: &str = "ok";

static CLOUD_PROVIDER: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"cloud-provider: [a-zA-Z_ -]+").ok());

/// Node counts per role
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NodeInventory {
    /// Control plane nodes
    pub masters: u32,
    /// Control plane nodes whose latest condition is `Ready`
    pub masters_ready: u32,
    /// Worker nodes
    pub workers: u32,
    /// Worker nodes whose latest condition is `Ready`
    pub workers_ready: u32,
}

fn is_control_plane(node: &Node) -> bool {
    let labels = node.labels();
    labels.contains_key(MASTER_ROLE_LABEL) || labels.contains_key(CONTROL_PLANE_ROLE_LABEL)
}

/// A node counts as ready when its most recent condition has type `Ready`
fn is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|c| c.last())
        .is_some_and(|c| c.type_ == READY_CONDITION)
}

/// Partition nodes by role and count the ready ones
pub fn count_nodes(nodes: &[Node]) -> NodeInventory {
    nodes.iter().fold(NodeInventory::default(), |mut inv, node| {
        let ready = u32::from(is_ready(node));
        if is_control_plane(node) {
            inv.masters += 1;
            inv.masters_ready += ready;
        } else {
            inv.workers += 1;
            inv.workers_ready += ready;
        }
        inv
    })
}

/// `kubernetesVersion` from a kubeadm `ClusterConfiguration` blob
pub fn parse_kubernetes_version(cluster_configuration: &str) -> Option<String> {
    let doc: serde_yaml::Value = serde_yaml::from_str(cluster_configuration).ok()?;
    doc.get("kubernetesVersion")
        .and_then(serde_yaml::Value::as_str)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Provider from node provider IDs, then from the kubeadm configuration
///
/// The first node with a non-empty `providerID` decides. Without one, a
/// `cloud-provider: <name>` setting in the configuration blob is used.
pub fn detect_provider(nodes: &[Node], cluster_configuration: Option<&str>) -> ProviderKind {
    let from_nodes = nodes
        .iter()
        .filter_map(|n| n.spec.as_ref().and_then(|s| s.provider_id.as_deref()))
        .find(|id| !id.is_empty());
    if let Some(id) = from_nodes {
        return ProviderKind::parse(id);
    }

    let Some(blob) = cluster_configuration else {
        return ProviderKind::Unknown;
    };
    let Some(pattern) = CLOUD_PROVIDER.as_ref() else {
        return ProviderKind::Unknown;
    };
    pattern
        .find(blob)
        .and_then(|m| m.as_str().split_once(": ").map(|(_, name)| ProviderKind::parse(name)))
        .unwrap_or(ProviderKind::Unknown)
}

pub(super) async fn run(mut cluster: ManagedCluster, ctx: &Context) -> Result<Transition, Error> {
    if cluster.status_or_default().control_plane_ready {
        return Ok(Transition::proceed(cluster));
    }

    let name = cluster.name_any();
    let namespace = cluster.namespace_or_default();
    let cluster_type = cluster.cluster_type();

    let Some(kubeconfig) = ctx.remote.load_kubeconfig(&namespace, &name).await? else {
        return Ok(match cluster_type {
            ClusterType::Created => {
                debug!(cluster = %name, "kubeconfig not published yet");
                Transition::proceed(cluster)
            }
            ClusterType::Registered => {
                info!(cluster = %name, "waiting for registered cluster kubeconfig");
                Transition::requeue(cluster, REQUEUE_DEPENDENCY)
            }
        });
    };

    let configuration = ctx.remote.kubeadm_config(&kubeconfig).await?;
    match configuration.as_deref().and_then(parse_kubernetes_version) {
        Some(version) => {
            if cluster_type == ClusterType::Registered {
                cluster.spec.version = version.clone();
                cluster.status_mut().version = version;
            } else if cluster.status_or_default().version.is_empty() {
                cluster.status_mut().version = version;
            }
        }
        None => {
            warn!(cluster = %name, "could not read kubernetesVersion from kubeadm-config");
            let status = cluster.status_mut();
            if status.version.is_empty() {
                status.version = UNKNOWN_VERSION.to_string();
            }
        }
    }

    let nodes = ctx.remote.list_nodes(&kubeconfig).await?;
    let inventory = count_nodes(&nodes);
    {
        let status = cluster.status_mut();
        status.master_run = inventory.masters_ready;
        status.worker_run = inventory.workers_ready;
    }
    if cluster_type == ClusterType::Registered {
        cluster.spec.master_num = inventory.masters;
        cluster.spec.worker_num = inventory.workers;
        let status = cluster.status_mut();
        status.master_num = Some(inventory.masters);
        status.worker_num = Some(inventory.workers);
    }

    let provider = detect_provider(&nodes, configuration.as_deref());
    if provider == ProviderKind::Unknown {
        warn!(cluster = %name, "could not detect infrastructure provider");
    }
    match cluster_type {
        ClusterType::Registered => {
            cluster.spec.provider = provider.to_string();
            cluster.status_mut().provider = provider.to_string();
        }
        ClusterType::Created => {
            let observed = if provider == ProviderKind::Unknown {
                cluster.spec.provider_kind()
            } else {
                provider
            };
            cluster.status_mut().provider = observed.to_string();
        }
    }

    match ctx.remote.readyz(&kubeconfig).await {
        Ok(body) if body == READYZ_OK => {}
        Ok(body) => {
            info!(cluster = %name, body = %body, "remote control plane not ready");
            return Ok(Transition::requeue(cluster, REQUEUE_HEALTH));
        }
        Err(e) => {
            warn!(cluster = %name, error = %e, "remote readiness probe failed");
            return Ok(Transition::requeue(cluster, REQUEUE_HEALTH));
        }
    }

    {
        let status = cluster.status_mut();
        status.control_plane_ready = true;
        status.ready = true;
    }
    // Created clusters get their suffix from instantiation only
    if cluster_type == ClusterType::Registered && cluster.suffix().is_none() {
        cluster.set_annotation(ANNOTATION_SUFFIX, generate_suffix());
    }
    if cluster.annotation(ANNOTATION_APISERVER).is_none() {
        if let Some(host) = kubeconfig.server_host() {
            cluster.set_annotation(ANNOTATION_APISERVER, host.clone());
            cluster.status_mut().control_plane_endpoint = host;
        }
    }

    info!(
        cluster = %name,
        masters = inventory.masters_ready,
        workers = inventory.workers_ready,
        "remote control plane is ready"
    );
    Ok(Transition::proceed(cluster))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phases::Directive;
    use crate::remote::RemoteKubeconfig;
    use crate::test_support::{node, registered_cluster, sample_cluster, test_kubeconfig, Mocks};
    use rstest::rstest;

    const KUBEADM_VSPHERE: &str = "apiServer:\n  extraArgs:\n    cloud-provider: vsphere\nkubernetesVersion: v1.27.3\n";

    #[test]
    fn nodes_are_partitioned_by_role_label() {
        let nodes = vec![
            node("m1", Some(MASTER_ROLE_LABEL), &["MemoryPressure", "Ready"], None),
            node("m2", Some(CONTROL_PLANE_ROLE_LABEL), &["Ready", "DiskPressure"], None),
            node("w1", None, &["Ready"], None),
            node("w2", None, &[], None),
        ];
        assert_eq!(
            count_nodes(&nodes),
            NodeInventory {
                masters: 2,
                masters_ready: 1,
                workers: 2,
                workers_ready: 1,
            }
        );
    }

    #[rstest]
    #[case::aws_provider_id(Some("aws:///ap-northeast-2a/i-0abc"), None, ProviderKind::Aws)]
    #[case::vsphere_provider_id(Some("vsphere://4201-abcd"), None, ProviderKind::Vsphere)]
    #[case::kubeadm_fallback(None, Some(KUBEADM_VSPHERE), ProviderKind::Vsphere)]
    #[case::nothing(None, Some("kubernetesVersion: v1.27.3\n"), ProviderKind::Unknown)]
    #[case::no_configuration(None, None, ProviderKind::Unknown)]
    fn provider_detection(
        #[case] provider_id: Option<&str>,
        #[case] configuration: Option<&str>,
        #[case] expected: ProviderKind,
    ) {
        let nodes = vec![
            node("m1", Some(MASTER_ROLE_LABEL), &["Ready"], Some("")),
            node("w1", None, &["Ready"], provider_id),
        ];
        assert_eq!(detect_provider(&nodes, configuration), expected);
    }

    #[test]
    fn cloud_provider_pattern_compiles() {
        assert!(CLOUD_PROVIDER.is_some());
        for _ in 0..2 {
            assert_eq!(
                detect_provider(&[], Some("cloud-provider: aws\n")),
                ProviderKind::Aws
            );
        }
    }

    #[rstest]
    #[case(KUBEADM_VSPHERE, Some("v1.27.3"))]
    #[case("kubernetesVersion: \"\"\n", None)]
    #[case("not: [valid", None)]
    fn kubernetes_version_parsing(#[case] blob: &str, #[case] expected: Option<&str>) {
        assert_eq!(parse_kubernetes_version(blob).as_deref(), expected);
    }

    fn healthy_remote(mocks: &mut Mocks, readyz: &'static str) {
        mocks
            .remote
            .expect_load_kubeconfig()
            .returning(|_, _| Ok(Some(test_kubeconfig())));
        mocks
            .remote
            .expect_kubeadm_config()
            .returning(|_| Ok(Some(KUBEADM_VSPHERE.to_string())));
        mocks.remote.expect_list_nodes().returning(|_| {
            Ok(vec![
                node("m1", Some(MASTER_ROLE_LABEL), &["Ready"], None),
                node("w1", None, &["Ready"], None),
                node("w2", None, &["Ready"], None),
            ])
        });
        mocks
            .remote
            .expect_readyz()
            .returning(move |_| Ok(readyz.to_string()));
    }

    /// Story: a registered cluster whose API server answers `ok` adopts the
    /// remote inventory as its spec, gets a suffix and an API endpoint.
    #[tokio::test]
    async fn registered_cluster_adopts_remote_inventory() {
        let mut mocks = Mocks::default();
        healthy_remote(&mut mocks, "ok");
        let ctx = mocks.into_context();

        let transition = run(registered_cluster("edge"), &ctx).await.unwrap();
        assert_eq!(transition.directive, Directive::Proceed);

        let out = transition.cluster;
        assert_eq!(out.spec.version, "v1.27.3");
        assert_eq!(out.spec.provider, "vSphere");
        assert_eq!((out.spec.master_num, out.spec.worker_num), (1, 2));

        let status = out.status_or_default();
        assert!(status.control_plane_ready && status.ready);
        assert_eq!(status.provider, "vSphere");
        assert_eq!((status.master_run, status.worker_run), (1, 2));
        assert_eq!((status.master_num, status.worker_num), (Some(1), Some(2)));
        assert_eq!(out.suffix().map(str::len), Some(5));
        assert_eq!(out.annotation(ANNOTATION_APISERVER), Some("edge.example.com"));
        assert_eq!(status.control_plane_endpoint, "edge.example.com");
    }

    /// Story: a created cluster keeps its declared spec; only observed
    /// values are written.
    #[tokio::test]
    async fn created_cluster_keeps_declared_spec() {
        let mut mocks = Mocks::default();
        healthy_remote(&mut mocks, "ok");
        let ctx = mocks.into_context();

        let mut cluster = sample_cluster("edge");
        cluster.set_annotation(ANNOTATION_SUFFIX, "x7k2p");
        cluster.set_annotation(ANNOTATION_APISERVER, "10.0.0.1");
        cluster.status_mut().version = "v1.29.4".to_string();
        let spec = cluster.spec.clone();

        let out = run(cluster, &ctx).await.unwrap().cluster;
        assert_eq!(out.spec, spec);
        assert_eq!(out.suffix(), Some("x7k2p"));
        assert_eq!(out.annotation(ANNOTATION_APISERVER), Some("10.0.0.1"));
        let status = out.status_or_default();
        assert_eq!(status.version, "v1.29.4");
        assert_eq!(status.provider, "vSphere");
        assert_eq!(status.master_num, None);
        assert_eq!(status.worker_run, 2);
    }

    #[rstest]
    #[case::not_ready_body("not ready")]
    #[case::trailing_text("ok but degraded")]
    #[tokio::test]
    async fn unhealthy_control_plane_requeues_30s(#[case] body: &'static str) {
        let mut mocks = Mocks::default();
        healthy_remote(&mut mocks, body);
        let ctx = mocks.into_context();

        let transition = run(sample_cluster("edge"), &ctx).await.unwrap();
        assert_eq!(transition.directive, Directive::Requeue(REQUEUE_HEALTH));
        let status = transition.cluster.status_or_default();
        assert!(!status.control_plane_ready);
        assert_eq!(status.worker_run, 2);
    }

    #[tokio::test]
    async fn readyz_transport_error_requeues_30s() {
        let mut mocks = Mocks::default();
        mocks
            .remote
            .expect_load_kubeconfig()
            .returning(|_, _| Ok(Some(test_kubeconfig())));
        mocks.remote.expect_kubeadm_config().returning(|_| Ok(None));
        mocks.remote.expect_list_nodes().returning(|_| Ok(vec![]));
        mocks
            .remote
            .expect_readyz()
            .returning(|_| Err(Error::internal("connection refused")));
        let ctx = mocks.into_context();

        let transition = run(registered_cluster("edge"), &ctx).await.unwrap();
        assert_eq!(transition.directive, Directive::Requeue(REQUEUE_HEALTH));
        let out = transition.cluster;
        assert!(!out.status_or_default().control_plane_ready);
        assert_eq!(out.status_or_default().version, UNKNOWN_VERSION);
        assert_eq!(out.status_or_default().provider, ProviderKind::UNKNOWN);
    }

    #[rstest]
    #[case::created(false, Directive::Proceed)]
    #[case::registered(true, Directive::Requeue(REQUEUE_DEPENDENCY))]
    #[tokio::test]
    async fn missing_kubeconfig(#[case] registered: bool, #[case] expected: Directive) {
        let mut mocks = Mocks::default();
        mocks.remote.expect_load_kubeconfig().returning(|_, _| Ok(None));
        let ctx = mocks.into_context();

        let cluster = if registered {
            registered_cluster("edge")
        } else {
            sample_cluster("edge")
        };
        let transition = run(cluster.clone(), &ctx).await.unwrap();
        assert_eq!(transition.directive, expected);
        assert_eq!(transition.cluster.status, cluster.status);
    }

    #[tokio::test]
    async fn ready_control_plane_is_not_refreshed() {
        let ctx = Mocks::default().into_context();
        let mut cluster = sample_cluster("edge");
        cluster.status_mut().control_plane_ready = true;
        let out = run(cluster.clone(), &ctx).await.unwrap().cluster;
        assert_eq!(out.status, cluster.status);
    }

    #[test]
    fn kubeconfig_fixture_parses() {
        let kc: RemoteKubeconfig = test_kubeconfig();
        assert_eq!(kc.server_host().as_deref(), Some("edge.example.com"));
    }
}
