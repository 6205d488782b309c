//! Kubernetes version rollout while the record is `Upgrading`
//!
//! vSphere pools clone machines from per-version templates, so the upgrade
//! artifact must be provisioned before any pool is touched. Each pool then
//! gets the target version (and template), and the phase waits until the
//! pool's machines running that version match the desired count.

use kube::{Resource, ResourceExt};
use tracing::{debug, info};

use fleet_capi::{
    partition_machines, template_name, upgrade_instance_name, vsphere_upgrade_parameters,
    InstanceKind, InstanceRequest, PoolKind,
};
use fleet_common::crd::{ClusterPhase, ManagedCluster, ProviderKind};
use fleet_common::Error;

use super::{Transition, REQUEUE_DEPENDENCY, REQUEUE_PROPAGATION, REQUEUE_ROLLOUT};
use crate::controller::Context;

/// Whether the vSphere template artifact is provisioned, requesting it when absent
async fn ensure_vsphere_artifact(
    cluster: &ManagedCluster,
    ctx: &Context,
) -> Result<bool, Error> {
    let name = cluster.name_any();
    let namespace = cluster.namespace_or_default();
    let Some(suffix) = cluster.suffix() else {
        return Err(Error::provisioning_permanent(
            &name,
            "vSphere upgrade requires the instantiation suffix",
        ));
    };
    let instance = upgrade_instance_name(&name, suffix, &cluster.spec.version);

    match ctx.provisioner.get_instance(&namespace, &instance).await? {
        Some(state) if state.provisioned => Ok(true),
        Some(_) => {
            debug!(cluster = %name, instance = %instance, "upgrade artifact provisioning");
            Ok(false)
        }
        None => {
            let request = InstanceRequest {
                name: instance.clone(),
                cluster: name.clone(),
                namespace,
                suffix: suffix.to_string(),
                kind: InstanceKind::Upgrade,
                provider: ProviderKind::Vsphere,
                parameters: vsphere_upgrade_parameters(cluster)?,
                owner: cluster.controller_owner_ref(&()),
            };
            ctx.provisioner.create_instance(&request).await?;
            info!(cluster = %name, instance = %instance, "upgrade artifact requested");
            Ok(false)
        }
    }
}

pub(super) async fn run(mut cluster: ManagedCluster, ctx: &Context) -> Result<Transition, Error> {
    if cluster.phase() != ClusterPhase::Upgrading {
        return Ok(Transition::proceed(cluster));
    }

    let name = cluster.name_any();
    let namespace = cluster.namespace_or_default();
    let target = cluster.spec.version.clone();
    let vsphere = cluster.spec.provider_kind() == ProviderKind::Vsphere;

    if vsphere && !ensure_vsphere_artifact(&cluster, ctx).await? {
        return Ok(Transition::requeue(cluster, REQUEUE_DEPENDENCY));
    }
    let template = vsphere.then(|| template_name(&name, &target));

    for (pool, desired) in [
        (PoolKind::ControlPlane, cluster.spec.master_num),
        (PoolKind::Worker, cluster.spec.worker_num),
    ] {
        let Some(object) = ctx.capi.get_pool(&namespace, &name, pool).await? else {
            if pool == PoolKind::Worker && desired == 0 {
                continue;
            }
            debug!(cluster = %name, %pool, "pool object not found yet");
            return Ok(Transition::requeue(cluster, REQUEUE_PROPAGATION));
        };

        if object.version.as_deref() != Some(target.as_str()) {
            info!(
                cluster = %name,
                %pool,
                from = ?object.version,
                to = %target,
                "rolling pool to new version"
            );
            ctx.capi
                .set_pool_version(&namespace, &name, pool, &target, template.clone())
                .await?;
            return Ok(Transition::requeue(cluster, REQUEUE_DEPENDENCY));
        }

        let machines = ctx.capi.list_pool_machines(&namespace, &name, pool).await?;
        let rollout = partition_machines(&machines, &target);
        if rollout.upgraded.len() != desired as usize {
            info!(
                cluster = %name,
                %pool,
                upgraded = rollout.upgraded.len(),
                desired,
                outdated = ?rollout.outdated,
                "waiting for machines to roll"
            );
            return Ok(Transition::requeue(cluster, REQUEUE_ROLLOUT));
        }
    }

    info!(cluster = %name, version = %target, "upgrade complete");
    let status = cluster.status_mut();
    status.version = target;
    status.phase = ClusterPhase::Ready;
    Ok(Transition::proceed(cluster))
}
