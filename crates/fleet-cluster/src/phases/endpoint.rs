//! Control plane endpoint discovery from the CAPI `Cluster`

use kube::ResourceExt;
use tracing::{debug, info};

use fleet_common::crd::{ManagedCluster, ANNOTATION_APISERVER};
use fleet_common::Error;

use super::{Transition, REQUEUE_PROPAGATION};
use crate::controller::Context;

pub(super) async fn run(mut cluster: ManagedCluster, ctx: &Context) -> Result<Transition, Error> {
    if cluster.annotation(ANNOTATION_APISERVER).is_some() {
        return Ok(Transition::proceed(cluster));
    }

    let name = cluster.name_any();
    let Some(host) = ctx
        .capi
        .control_plane_endpoint(&cluster.namespace_or_default(), &name)
        .await?
    else {
        debug!(cluster = %name, "control plane endpoint not published yet");
        return Ok(Transition::requeue(cluster, REQUEUE_PROPAGATION));
    };

    info!(cluster = %name, endpoint = %host, "control plane endpoint discovered");
    cluster.set_annotation(ANNOTATION_APISERVER, host.clone());
    cluster.status_mut().control_plane_endpoint = host;
    Ok(Transition::proceed(cluster))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phases::Directive;
    use crate::test_support::{sample_cluster, Mocks};

    #[tokio::test]
    async fn published_host_is_recorded() {
        let mut mocks = Mocks::default();
        mocks
            .capi
            .expect_control_plane_endpoint()
            .withf(|ns, name| ns == "team-a" && name == "edge")
            .returning(|_, _| Ok(Some("10.20.0.5".to_string())));
        let ctx = mocks.into_context();

        let transition = run(sample_cluster("edge"), &ctx).await.unwrap();
        assert_eq!(transition.directive, Directive::Proceed);
        let out = transition.cluster;
        assert_eq!(out.annotation(ANNOTATION_APISERVER), Some("10.20.0.5"));
        assert_eq!(out.status_or_default().control_plane_endpoint, "10.20.0.5");
    }

    #[tokio::test]
    async fn unpublished_host_requeues_20s() {
        let mut mocks = Mocks::default();
        mocks
            .capi
            .expect_control_plane_endpoint()
            .returning(|_, _| Ok(None));
        let ctx = mocks.into_context();

        let transition = run(sample_cluster("edge"), &ctx).await.unwrap();
        assert_eq!(transition.directive, Directive::Requeue(REQUEUE_PROPAGATION));
        assert!(transition.cluster.annotation(ANNOTATION_APISERVER).is_none());
    }

    #[tokio::test]
    async fn known_endpoint_skips_lookup() {
        let ctx = Mocks::default().into_context();
        let mut cluster = sample_cluster("edge");
        cluster.set_annotation(ANNOTATION_APISERVER, "10.20.0.5");
        let out = run(cluster.clone(), &ctx).await.unwrap().cluster;
        assert_eq!(out.metadata, cluster.metadata);
    }
}
