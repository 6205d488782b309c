//! Replica count reconciliation while the record is `Scaling`
//!
//! Pools are handled one at a time, control plane first. A pool's desired
//! count is mirrored into status only once every configured replica reports
//! ready, so a half-finished scale is retried rather than recorded.

use kube::ResourceExt;
use tracing::{debug, info};

use fleet_capi::PoolKind;
use fleet_common::crd::{ClusterPhase, ManagedCluster, ManagedClusterStatus};
use fleet_common::Error;

use super::{Transition, REQUEUE_DEPENDENCY, REQUEUE_PROPAGATION, REQUEUE_ROLLOUT};
use crate::controller::Context;

fn desired(cluster: &ManagedCluster, pool: PoolKind) -> u32 {
    match pool {
        PoolKind::ControlPlane => cluster.spec.master_num,
        PoolKind::Worker => cluster.spec.worker_num,
    }
}

fn observed(status: &ManagedClusterStatus, pool: PoolKind) -> Option<u32> {
    match pool {
        PoolKind::ControlPlane => status.master_num,
        PoolKind::Worker => status.worker_num,
    }
}

fn record(status: &mut ManagedClusterStatus, pool: PoolKind, count: u32) {
    match pool {
        PoolKind::ControlPlane => status.master_num = Some(count),
        PoolKind::Worker => status.worker_num = Some(count),
    }
}

fn diverges(cluster: &ManagedCluster, status: &ManagedClusterStatus, pool: PoolKind) -> bool {
    observed(status, pool) != Some(desired(cluster, pool))
}

pub(super) async fn run(mut cluster: ManagedCluster, ctx: &Context) -> Result<Transition, Error> {
    if cluster.phase() != ClusterPhase::Scaling {
        return Ok(Transition::proceed(cluster));
    }

    let name = cluster.name_any();
    let namespace = cluster.namespace_or_default();
    let status = cluster.status_or_default();

    let Some(pool) = [PoolKind::ControlPlane, PoolKind::Worker]
        .into_iter()
        .find(|p| diverges(&cluster, &status, *p))
    else {
        info!(cluster = %name, "replica counts already match");
        cluster.status_mut().phase = ClusterPhase::Ready;
        return Ok(Transition::proceed(cluster));
    };
    let want = desired(&cluster, pool);

    let Some(object) = ctx.capi.get_pool(&namespace, &name, pool).await? else {
        debug!(cluster = %name, %pool, "pool object not found yet");
        return Ok(Transition::requeue(cluster, REQUEUE_PROPAGATION));
    };

    if object.replicas != Some(want) {
        info!(
            cluster = %name,
            %pool,
            from = ?object.replicas,
            to = want,
            "updating pool replicas"
        );
        ctx.capi
            .set_pool_replicas(&namespace, &name, pool, want)
            .await?;
        return Ok(Transition::requeue(cluster, REQUEUE_PROPAGATION));
    }

    if !object.is_rolled_out() {
        let direction = match observed(&status, pool) {
            Some(current) if want < current => "scale-in",
            _ => "scale-out",
        };
        info!(
            cluster = %name,
            %pool,
            direction,
            ready = object.ready_replicas,
            desired = want,
            "waiting for pool to converge"
        );
        return Ok(Transition::requeue(cluster, REQUEUE_ROLLOUT));
    }

    let status = cluster.status_mut();
    record(status, pool, want);
    let snapshot = status.clone();
    let remaining = [PoolKind::ControlPlane, PoolKind::Worker]
        .into_iter()
        .any(|p| diverges(&cluster, &snapshot, p));
    if remaining {
        info!(cluster = %name, %pool, replicas = want, "pool scaled, continuing with next pool");
        return Ok(Transition::requeue(cluster, REQUEUE_DEPENDENCY));
    }

    info!(cluster = %name, %pool, replicas = want, "scaling complete");
    cluster.status_mut().phase = ClusterPhase::Ready;
    Ok(Transition::proceed(cluster))
}
