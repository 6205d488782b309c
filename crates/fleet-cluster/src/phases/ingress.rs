//! Ingress and TLS exposure of the cluster API
//!
//! Routes `https://multicluster.<domain>/api/<namespace>/<cluster>` to the
//! gateway service: a cert-manager certificate, a prefix-stripping Traefik
//! middleware, a copy of the remote admin token for the gateway to forward,
//! and finally the Ingress itself.

use kube::ResourceExt;
use tracing::{debug, info};

use fleet_common::crd::{ManagedCluster, ANNOTATION_DOMAIN};
use fleet_common::Error;

use super::{wait_if_terminating, Transition, REQUEUE_DEPENDENCY};
use crate::controller::Context;
use crate::remote::KUBE_SYSTEM_NAMESPACE;

/// Remote secret holding the admin service account token forwarded by the gateway
pub const ADMIN_TOKEN_SECRET: &str = "fleet-admin-token";

pub(super) async fn run(cluster: ManagedCluster, ctx: &Context) -> Result<Transition, Error> {
    let name = cluster.name_any();
    let namespace = cluster.namespace_or_default();
    let domain = cluster
        .annotation(ANNOTATION_DOMAIN)
        .unwrap_or(&ctx.config.base_domain)
        .to_string();

    let ensured = ctx.ingress.ensure_certificate(&cluster, &domain).await?;
    if let Some(after) = wait_if_terminating(ensured) {
        return Ok(Transition::requeue(cluster, after));
    }
    let ensured = ctx.ingress.ensure_middleware(&cluster).await?;
    if let Some(after) = wait_if_terminating(ensured) {
        return Ok(Transition::requeue(cluster, after));
    }

    let Some(kubeconfig) = ctx.remote.load_kubeconfig(&namespace, &name).await? else {
        debug!(cluster = %name, "kubeconfig not published yet");
        return Ok(Transition::requeue(cluster, REQUEUE_DEPENDENCY));
    };
    let token = ctx
        .remote
        .secret(&kubeconfig, KUBE_SYSTEM_NAMESPACE, ADMIN_TOKEN_SECRET)
        .await?
        .filter(|s| s.data.as_ref().is_some_and(|d| !d.is_empty()));
    let Some(token) = token else {
        debug!(cluster = %name, "admin token not issued yet");
        return Ok(Transition::requeue(cluster, REQUEUE_DEPENDENCY));
    };

    let ensured = ctx.ingress.ensure_token_secret(&cluster, &token).await?;
    if let Some(after) = wait_if_terminating(ensured) {
        return Ok(Transition::requeue(cluster, after));
    }
    let ensured = ctx.ingress.ensure_ingress(&cluster, &domain).await?;
    if let Some(after) = wait_if_terminating(ensured) {
        return Ok(Transition::requeue(cluster, after));
    }

    info!(cluster = %name, domain = %domain, "cluster api exposed through ingress");
    Ok(Transition::proceed(cluster))
}
