//! Observed-state bootstrap
//!
//! Seeds `status.version`, `status.masterNum` and `status.workerNum` from the
//! spec when absent, so drift detection has a baseline to compare against.

use fleet_common::crd::ManagedCluster;

use super::Transition;

pub(super) fn run(mut cluster: ManagedCluster) -> Transition {
    let status = cluster.status_or_default();
    let needs_version = status.version.is_empty() && !cluster.spec.version.is_empty();
    if !needs_version && status.master_num.is_some() && status.worker_num.is_some() {
        return Transition::proceed(cluster);
    }

    let spec = cluster.spec.clone();
    let status = cluster.status_mut();
    if needs_version {
        status.version = spec.version;
    }
    status.master_num.get_or_insert(spec.master_num);
    status.worker_num.get_or_insert(spec.worker_num);
    Transition::proceed(cluster)
}
