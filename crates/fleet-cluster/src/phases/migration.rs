//! Label and status migration for records written by older controllers

use kube::ResourceExt;
use tracing::{info, warn};

use fleet_common::crd::{
    ClusterPhase, ManagedCluster, LABEL_CLUSTER_TYPE, LABEL_CLUSTER_TYPE_DEPRECATED,
};
use fleet_common::Error;

use super::gitops::application_link;
use super::Transition;
use crate::controller::Context;
use crate::gates::ReadinessGate;

pub(super) async fn run(mut cluster: ManagedCluster, ctx: &Context) -> Result<Transition, Error> {
    migrate_type_label(&mut cluster);

    if cluster.phase().is_legacy() {
        info!(
            cluster = %cluster.name_any(),
            legacy_phase = %cluster.phase(),
            "normalizing legacy phase"
        );
        cluster.status_mut().phase = ClusterPhase::Processing;
    }

    if cluster.status_or_default().gateway_ready_migration {
        return Ok(Transition::proceed(cluster));
    }

    migrate_gateway_flag(&mut cluster);
    let status = cluster.status_or_default();
    if status.argo_ready && status.application_link.is_empty() {
        match ctx.gitops.application_host().await {
            Ok(Some(host)) => {
                cluster.status_mut().application_link =
                    application_link(&host, &ctx.config.base_domain, &cluster);
            }
            Ok(None) => warn!(cluster = %cluster.name_any(), "argo cd server ingress has no host"),
            Err(e) => {
                warn!(cluster = %cluster.name_any(), error = %e, "failed to look up argo cd ingress")
            }
        }
    }
    cluster.status_mut().gateway_ready_migration = true;

    Ok(Transition::proceed(cluster))
}

fn migrate_type_label(cluster: &mut ManagedCluster) {
    if cluster.labels().contains_key(LABEL_CLUSTER_TYPE) {
        return;
    }
    if let Some(value) = cluster.labels().get(LABEL_CLUSTER_TYPE_DEPRECATED).cloned() {
        cluster
            .labels_mut()
            .insert(LABEL_CLUSTER_TYPE.to_string(), value);
    }
}

/// Carry `prometheusReady` into `gatewayReady`
///
/// The legacy flag only counts once GitOps registration is done; otherwise
/// the gateway phase runs normally.
fn migrate_gateway_flag(cluster: &mut ManagedCluster) {
    let status = cluster.status_mut();
    if status.prometheus_ready && ReadinessGate::Argo.is_set(status) {
        status.gateway_ready = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{converged_cluster, sample_cluster, Mocks};
    use fleet_common::crd::ClusterType;

    #[tokio::test]
    async fn deprecated_type_label_is_copied() {
        let ctx = Mocks::default().into_context();
        let mut cluster = sample_cluster("edge");
        cluster
            .labels_mut()
            .insert(LABEL_CLUSTER_TYPE_DEPRECATED.to_string(), "registered".to_string());

        let out = run(cluster, &ctx).await.unwrap().cluster;
        assert_eq!(out.cluster_type(), ClusterType::Registered);
        assert_eq!(out.labels()[LABEL_CLUSTER_TYPE_DEPRECATED], "registered");
    }

    /// Story: a record from the older controller with GitOps registered
    /// and the legacy flag set keeps its gateway; the migration runs once.
    #[tokio::test]
    async fn gateway_flag_migrates_exactly_once() {
        let ctx = Mocks::default().into_context();
        let mut cluster = sample_cluster("edge");
        let status = cluster.status_mut();
        status.control_plane_ready = true;
        status.argo_ready = true;
        status.application_link = "https://argocd.tmaxcloud.org/applications/x".to_string();
        status.prometheus_ready = true;

        let first = run(cluster, &ctx).await.unwrap().cluster;
        let status = first.status_or_default();
        assert!(status.gateway_ready);
        assert!(status.gateway_ready_migration);

        // A later prometheusReady change no longer affects gatewayReady
        let mut replay = first.clone();
        replay.status_mut().prometheus_ready = false;
        let second = run(replay.clone(), &ctx).await.unwrap().cluster;
        assert_eq!(second.status, replay.status);
    }

    #[tokio::test]
    async fn legacy_flag_waits_for_gitops() {
        let ctx = Mocks::default().into_context();
        let mut cluster = sample_cluster("edge");
        let status = cluster.status_mut();
        status.control_plane_ready = true;
        status.prometheus_ready = true;

        let out = run(cluster, &ctx).await.unwrap().cluster;
        let status = out.status_or_default();
        assert!(!status.gateway_ready);
        assert!(status.gateway_ready_migration);
        assert_eq!(ctx.gates.violation(&status), None);
    }

    #[tokio::test]
    async fn legacy_phase_is_normalized() {
        let ctx = Mocks::default().into_context();
        let mut cluster = sample_cluster("edge");
        cluster.status_mut().phase = ClusterPhase::Provisioned;

        let out = run(cluster, &ctx).await.unwrap().cluster;
        assert_eq!(out.phase(), ClusterPhase::Processing);
    }

    #[tokio::test]
    async fn application_link_is_backfilled_for_registered_gitops() {
        let mut mocks = Mocks::default();
        mocks
            .gitops
            .expect_application_host()
            .times(1)
            .returning(|| Ok(Some("argocd.example.com".to_string())));
        let ctx = mocks.into_context();

        let mut cluster = converged_cluster("edge");
        let status = cluster.status_mut();
        status.application_link.clear();
        status.gateway_ready_migration = false;

        let out = run(cluster, &ctx).await.unwrap().cluster;
        assert_eq!(
            out.status_or_default().application_link,
            "https://argocd.tmaxcloud.org/applications/team-a-edge-applications"
        );
    }

    #[tokio::test]
    async fn application_link_lookup_failure_is_not_fatal() {
        let mut mocks = Mocks::default();
        mocks
            .gitops
            .expect_application_host()
            .returning(|| Err(Error::internal("ingress unavailable")));
        let ctx = mocks.into_context();

        let mut cluster = converged_cluster("edge");
        let status = cluster.status_mut();
        status.application_link.clear();
        status.gateway_ready_migration = false;

        let transition = run(cluster, &ctx).await.unwrap();
        assert!(transition.cluster.status_or_default().application_link.is_empty());
    }

    /// Story: once migrated, a record whose Argo CD ingress has no host is
    /// not looked up again on later ticks.
    #[tokio::test]
    async fn missing_application_host_is_looked_up_once() {
        let mut mocks = Mocks::default();
        mocks
            .gitops
            .expect_application_host()
            .times(1)
            .returning(|| Ok(None));
        let ctx = mocks.into_context();

        let mut cluster = converged_cluster("edge");
        let status = cluster.status_mut();
        status.application_link.clear();
        status.gateway_ready_migration = false;

        let first = run(cluster, &ctx).await.unwrap().cluster;
        assert!(first.status_or_default().gateway_ready_migration);
        let second = run(first.clone(), &ctx).await.unwrap().cluster;
        assert_eq!(second.status, first.status);
    }

    #[tokio::test]
    async fn migrated_record_is_left_untouched() {
        let ctx = Mocks::default().into_context();
        let cluster = converged_cluster("edge");
        let out = run(cluster.clone(), &ctx).await.unwrap().cluster;
        assert_eq!(out.status, cluster.status);
        assert_eq!(out.metadata, cluster.metadata);
    }
}
