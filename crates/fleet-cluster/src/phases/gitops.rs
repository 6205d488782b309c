//! Argo CD registration
//!
//! Argo CD authenticates to the remote cluster with the token of a service
//! account installed there by the provisioner. Once that token exists the
//! cluster secret and the per-cluster Application are created, and the
//! Application link is recorded for the console.

use kube::ResourceExt;
use tracing::{debug, info, warn};

use fleet_common::crd::ManagedCluster;
use fleet_common::Error;

use super::{wait_if_terminating, Transition, REQUEUE_DEPENDENCY};
use crate::controller::Context;
use crate::integrations::application_name;
use crate::remote::KUBE_SYSTEM_NAMESPACE;

/// Remote secret holding the Argo CD manager service account token
pub const ARGO_MANAGER_TOKEN_SECRET: &str = "argocd-manager-token";
const TOKEN_KEY: &str = "token";

/// Console link to a cluster's Argo CD Application
///
/// The first DNS label of the Argo CD server host is kept and re-rooted
/// under the platform domain.
pub fn application_link(host: &str, base_domain: &str, cluster: &ManagedCluster) -> String {
    let subdomain = host.split('.').next().unwrap_or(host);
    format!(
        "https://{}.{}/applications/{}",
        subdomain,
        base_domain,
        application_name(cluster)
    )
}

pub(super) async fn run(mut cluster: ManagedCluster, ctx: &Context) -> Result<Transition, Error> {
    let name = cluster.name_any();
    let namespace = cluster.namespace_or_default();

    let Some(kubeconfig) = ctx.remote.load_kubeconfig(&namespace, &name).await? else {
        debug!(cluster = %name, "kubeconfig not published yet");
        return Ok(Transition::requeue(cluster, REQUEUE_DEPENDENCY));
    };

    let token = ctx
        .remote
        .secret(&kubeconfig, KUBE_SYSTEM_NAMESPACE, ARGO_MANAGER_TOKEN_SECRET)
        .await?
        .and_then(|s| s.data)
        .and_then(|mut d| d.remove(TOKEN_KEY))
        .and_then(|v| String::from_utf8(v.0).ok())
        .filter(|t| !t.is_empty());
    let Some(token) = token else {
        debug!(cluster = %name, "argo cd manager token not issued yet");
        return Ok(Transition::requeue(cluster, REQUEUE_DEPENDENCY));
    };

    let ensured = ctx
        .gitops
        .ensure_cluster_secret(&cluster, &kubeconfig, &token)
        .await?;
    if let Some(after) = wait_if_terminating(ensured) {
        return Ok(Transition::requeue(cluster, after));
    }

    let ensured = ctx.gitops.ensure_application(&cluster).await?;
    if let Some(after) = wait_if_terminating(ensured) {
        return Ok(Transition::requeue(cluster, after));
    }

    match ctx.gitops.application_host().await {
        Ok(Some(host)) => {
            cluster.status_mut().application_link =
                application_link(&host, &ctx.config.base_domain, &cluster);
        }
        Ok(None) => warn!(cluster = %name, "argo cd server ingress has no host"),
        Err(e) => warn!(cluster = %name, error = %e, "failed to look up argo cd ingress"),
    }

    info!(cluster = %name, "registered with argo cd");
    Ok(Transition::proceed(cluster))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phases::Directive;
    use crate::test_support::{sample_cluster, secret_with, test_kubeconfig, Mocks};
    use fleet_common::kube_utils::Ensured;

    fn remote_with_token(mocks: &mut Mocks, token: &'static str) {
        mocks
            .remote
            .expect_load_kubeconfig()
            .returning(|_, _| Ok(Some(test_kubeconfig())));
        mocks
            .remote
            .expect_secret()
            .withf(|_, ns, name| ns == KUBE_SYSTEM_NAMESPACE && name == ARGO_MANAGER_TOKEN_SECRET)
            .returning(move |_, _, _| Ok(Some(secret_with(TOKEN_KEY, token))));
    }

    #[test]
    fn link_keeps_first_host_label() {
        let cluster = sample_cluster("edge");
        assert_eq!(
            application_link("argocd.mgmt.internal", "tmaxcloud.org", &cluster),
            "https://argocd.tmaxcloud.org/applications/team-a-edge-applications"
        );
        assert_eq!(
            application_link("argocd", "example.com", &cluster),
            "https://argocd.example.com/applications/team-a-edge-applications"
        );
    }

    /// Story: the remote token exists, so the cluster secret and the
    /// Application are created and the link is recorded.
    #[tokio::test]
    async fn registers_cluster_and_records_link() {
        let mut mocks = Mocks::default();
        remote_with_token(&mut mocks, "s3cr3t");
        mocks
            .gitops
            .expect_ensure_cluster_secret()
            .withf(|_, kc, token| token == "s3cr3t" && kc.server == "https://edge.example.com:6443")
            .times(1)
            .returning(|_, _, _| Ok(Ensured::Created));
        mocks
            .gitops
            .expect_ensure_application()
            .times(1)
            .returning(|_| Ok(Ensured::Existing));
        mocks
            .gitops
            .expect_application_host()
            .returning(|| Ok(Some("argocd.mgmt.internal".to_string())));
        let ctx = mocks.into_context();

        let transition = run(sample_cluster("edge"), &ctx).await.unwrap();
        assert_eq!(transition.directive, Directive::Proceed);
        assert_eq!(
            transition.cluster.status_or_default().application_link,
            "https://argocd.tmaxcloud.org/applications/team-a-edge-applications"
        );
    }

    #[tokio::test]
    async fn empty_token_requeues() {
        let mut mocks = Mocks::default();
        remote_with_token(&mut mocks, "");
        mocks.gitops.expect_ensure_cluster_secret().never();
        let ctx = mocks.into_context();

        let transition = run(sample_cluster("edge"), &ctx).await.unwrap();
        assert_eq!(transition.directive, Directive::Requeue(REQUEUE_DEPENDENCY));
    }

    #[tokio::test]
    async fn terminating_secret_requeues_before_application() {
        let mut mocks = Mocks::default();
        remote_with_token(&mut mocks, "s3cr3t");
        mocks
            .gitops
            .expect_ensure_cluster_secret()
            .returning(|_, _, _| Ok(Ensured::Terminating));
        mocks.gitops.expect_ensure_application().never();
        let ctx = mocks.into_context();

        let transition = run(sample_cluster("edge"), &ctx).await.unwrap();
        assert_eq!(transition.directive, Directive::Requeue(REQUEUE_DEPENDENCY));
    }

    #[tokio::test]
    async fn missing_link_host_still_proceeds() {
        let mut mocks = Mocks::default();
        remote_with_token(&mut mocks, "s3cr3t");
        mocks
            .gitops
            .expect_ensure_cluster_secret()
            .returning(|_, _, _| Ok(Ensured::Existing));
        mocks
            .gitops
            .expect_ensure_application()
            .returning(|_| Ok(Ensured::Existing));
        mocks.gitops.expect_application_host().returning(|| Ok(None));
        let ctx = mocks.into_context();

        let transition = run(sample_cluster("edge"), &ctx).await.unwrap();
        assert_eq!(transition.directive, Directive::Proceed);
        assert!(transition.cluster.status_or_default().application_link.is_empty());
    }

    #[tokio::test]
    async fn missing_kubeconfig_requeues() {
        let mut mocks = Mocks::default();
        mocks.remote.expect_load_kubeconfig().returning(|_, _| Ok(None));
        let ctx = mocks.into_context();

        let transition = run(sample_cluster("edge"), &ctx).await.unwrap();
        assert_eq!(transition.directive, Directive::Requeue(REQUEUE_DEPENDENCY));
    }
}
