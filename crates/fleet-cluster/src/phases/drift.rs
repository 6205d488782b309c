//! Drift detection from `Ready` into `Upgrading` or `Scaling`
//!
//! Only created clusters with a healthy control plane drift. A version
//! change wins over a count change; scaling is picked up after the upgrade
//! returns the record to `Ready`.

use kube::ResourceExt;
use tracing::info;

use fleet_common::crd::{ClusterPhase, ClusterType, ManagedCluster};

use super::Transition;

const UNKNOWN_VERSION: &str = "unknown";

pub(super) fn run(mut cluster: ManagedCluster) -> Transition {
    let status = cluster.status_or_default();
    if status.phase != ClusterPhase::Ready
        || cluster.cluster_type() != ClusterType::Created
        || !status.control_plane_ready
    {
        return Transition::proceed(cluster);
    }

    let observed_version = status.version.as_str();
    let version_known = !observed_version.is_empty() && observed_version != UNKNOWN_VERSION;
    let next = if version_known
        && !cluster.spec.version.is_empty()
        && cluster.spec.version != observed_version
    {
        Some(ClusterPhase::Upgrading)
    } else if status.master_num != Some(cluster.spec.master_num)
        || status.worker_num != Some(cluster.spec.worker_num)
    {
        Some(ClusterPhase::Scaling)
    } else {
        None
    };

    if let Some(phase) = next {
        info!(
            cluster = %cluster.name_any(),
            from_version = %status.version,
            to_version = %cluster.spec.version,
            phase = %phase,
            "spec drifted from observed state"
        );
        cluster.status_mut().phase = phase;
    }
    Transition::proceed(cluster)
}
