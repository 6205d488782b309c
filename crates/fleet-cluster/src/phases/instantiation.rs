//! Infrastructure instantiation request for created clusters
//!
//! The suffix annotation is the single proof that a cluster instance was
//! requested. An instance left behind by an earlier tick that crashed
//! before writing the annotation is adopted instead of duplicated.

use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::info;

use fleet_capi::{
    cluster_parameters, instance_name, merge_parameters, provider_parameters, InstanceKind,
    InstanceRequest,
};
use fleet_common::crd::{ClusterType, ManagedCluster, ANNOTATION_SUFFIX};
use fleet_common::events::{actions, reasons};
use fleet_common::Error;

use super::{generate_suffix, wait_if_terminating, Transition};
use crate::controller::Context;

pub(super) async fn run(mut cluster: ManagedCluster, ctx: &Context) -> Result<Transition, Error> {
    if cluster.suffix().is_some() || cluster.cluster_type() == ClusterType::Registered {
        return Ok(Transition::proceed(cluster));
    }

    let name = cluster.name_any();
    let namespace = cluster.namespace_or_default();

    if let Some(existing) = ctx.provisioner.find_instance_suffix(&namespace, &name).await? {
        info!(cluster = %name, suffix = %existing, "adopting existing cluster instance");
        cluster.set_annotation(ANNOTATION_SUFFIX, existing);
        return Ok(Transition::proceed(cluster));
    }

    let suffix = generate_suffix();
    let request = InstanceRequest {
        name: instance_name(&name, &suffix),
        cluster: name.clone(),
        namespace,
        suffix: suffix.clone(),
        kind: InstanceKind::Cluster,
        provider: cluster.spec.provider_kind(),
        parameters: merge_parameters(cluster_parameters(&cluster)?, provider_parameters(&cluster)?)?,
        owner: cluster.controller_owner_ref(&()),
    };

    let ensured = ctx.provisioner.create_instance(&request).await?;
    if let Some(after) = wait_if_terminating(ensured) {
        info!(cluster = %name, instance = %request.name, "previous instance still terminating");
        return Ok(Transition::requeue(cluster, after));
    }

    cluster.set_annotation(ANNOTATION_SUFFIX, suffix);
    info!(cluster = %name, instance = %request.name, "cluster instance requested");
    ctx.events
        .publish(
            &cluster.object_ref(&()),
            EventType::Normal,
            reasons::PROVISIONING_REQUESTED,
            actions::PROVISION,
            Some(format!("Requested {} instance {}", request.provider, request.name)),
        )
        .await;

    Ok(Transition::proceed(cluster))
}
