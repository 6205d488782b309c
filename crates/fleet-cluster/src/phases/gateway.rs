//! Gateway exposure
//!
//! The remote cluster runs an API gateway service. Its externally reachable
//! address (load balancer hostname or IP, or the API server host for
//! NodePort gateways) is recorded and published on the management cluster
//! as an ExternalName service the ingress routes to.

use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use tracing::{debug, info};

use fleet_common::crd::{ManagedCluster, ANNOTATION_APISERVER, ANNOTATION_GATEWAY};
use fleet_common::Error;

use super::{
    wait_if_terminating, Transition, REQUEUE_DEPENDENCY, REQUEUE_PROPAGATION, REQUEUE_ROLLOUT,
};
use crate::controller::Context;

/// Namespace of the gateway service on the remote cluster
pub const GATEWAY_NAMESPACE: &str = "api-gateway-system";
/// Name of the gateway service on the remote cluster
pub const GATEWAY_SERVICE: &str = "gateway";
const NODE_PORT: &str = "NodePort";

/// Load balancer address of a service, hostname and IP concatenated
fn load_balancer_address(service: &Service) -> Option<String> {
    let ingress = service
        .status
        .as_ref()?
        .load_balancer
        .as_ref()?
        .ingress
        .as_ref()?
        .first()?;
    let address = format!(
        "{}{}",
        ingress.hostname.as_deref().unwrap_or_default(),
        ingress.ip.as_deref().unwrap_or_default()
    );
    (!address.is_empty()).then_some(address)
}

fn is_node_port(service: &Service) -> bool {
    service.spec.as_ref().and_then(|s| s.type_.as_deref()) == Some(NODE_PORT)
}

pub(super) async fn run(mut cluster: ManagedCluster, ctx: &Context) -> Result<Transition, Error> {
    let name = cluster.name_any();
    let namespace = cluster.namespace_or_default();

    let Some(kubeconfig) = ctx.remote.load_kubeconfig(&namespace, &name).await? else {
        debug!(cluster = %name, "kubeconfig not published yet");
        return Ok(Transition::requeue(cluster, REQUEUE_DEPENDENCY));
    };

    let Some(service) = ctx
        .remote
        .service(&kubeconfig, GATEWAY_NAMESPACE, GATEWAY_SERVICE)
        .await?
    else {
        debug!(cluster = %name, "gateway service not installed yet");
        return Ok(Transition::requeue(cluster, REQUEUE_ROLLOUT));
    };

    let address = if is_node_port(&service) {
        let Some(host) = cluster.annotation(ANNOTATION_APISERVER) else {
            debug!(cluster = %name, "waiting for api server host of nodeport gateway");
            return Ok(Transition::requeue(cluster, REQUEUE_PROPAGATION));
        };
        host.to_string()
    } else {
        let Some(address) = load_balancer_address(&service) else {
            debug!(cluster = %name, "gateway load balancer not provisioned yet");
            return Ok(Transition::requeue(cluster, REQUEUE_ROLLOUT));
        };
        cluster.set_annotation(ANNOTATION_GATEWAY, address.clone());
        address
    };

    let ensured = ctx.gateway.ensure_gateway_service(&cluster, &address).await?;
    if let Some(after) = wait_if_terminating(ensured) {
        return Ok(Transition::requeue(cluster, after));
    }
    ctx.gateway.delete_deprecated(&cluster).await?;

    info!(cluster = %name, address = %address, "gateway exposed");
    Ok(Transition::proceed(cluster))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phases::Directive;
    use crate::test_support::{sample_cluster, test_kubeconfig, Mocks};
    use fleet_common::kube_utils::Ensured;
    use k8s_openapi::api::core::v1::{
        LoadBalancerIngress, LoadBalancerStatus, ServiceSpec, ServiceStatus,
    };

    fn service(type_: &str, hostname: Option<&str>, ip: Option<&str>) -> Service {
        Service {
            spec: Some(ServiceSpec {
                type_: Some(type_.to_string()),
                ..Default::default()
            }),
            status: Some(ServiceStatus {
                load_balancer: Some(LoadBalancerStatus {
                    ingress: Some(vec![LoadBalancerIngress {
                        hostname: hostname.map(str::to_string),
                        ip: ip.map(str::to_string),
                        ..Default::default()
                    }]),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn remote_service(mocks: &mut Mocks, svc: Option<Service>) {
        mocks
            .remote
            .expect_load_kubeconfig()
            .returning(|_, _| Ok(Some(test_kubeconfig())));
        mocks
            .remote
            .expect_service()
            .withf(|_, ns, name| ns == GATEWAY_NAMESPACE && name == GATEWAY_SERVICE)
            .returning(move |_, _, _| Ok(svc.clone()));
    }

    #[test]
    fn load_balancer_address_joins_hostname_and_ip() {
        let svc = service("LoadBalancer", Some("gw.elb.amazonaws.com"), None);
        assert_eq!(
            load_balancer_address(&svc).as_deref(),
            Some("gw.elb.amazonaws.com")
        );
        let svc = service("LoadBalancer", None, Some("203.0.113.7"));
        assert_eq!(load_balancer_address(&svc).as_deref(), Some("203.0.113.7"));
        let svc = service("LoadBalancer", None, None);
        assert_eq!(load_balancer_address(&svc), None);
    }

    /// Story: an AWS gateway gets an ELB hostname; it is recorded and the
    /// ExternalName service is created while the old prometheus objects go.
    #[tokio::test]
    async fn load_balancer_gateway_is_exposed() {
        let mut mocks = Mocks::default();
        remote_service(
            &mut mocks,
            Some(service("LoadBalancer", Some("gw.elb.amazonaws.com"), None)),
        );
        mocks
            .gateway
            .expect_ensure_gateway_service()
            .withf(|_, external| external == "gw.elb.amazonaws.com")
            .times(1)
            .returning(|_, _| Ok(Ensured::Created));
        mocks
            .gateway
            .expect_delete_deprecated()
            .times(1)
            .returning(|_| Ok(()));
        let ctx = mocks.into_context();

        let transition = run(sample_cluster("edge"), &ctx).await.unwrap();
        assert_eq!(transition.directive, Directive::Proceed);
        assert_eq!(
            transition.cluster.annotation(ANNOTATION_GATEWAY),
            Some("gw.elb.amazonaws.com")
        );
    }

    #[tokio::test]
    async fn node_port_gateway_uses_api_server_host() {
        let mut mocks = Mocks::default();
        remote_service(&mut mocks, Some(service(NODE_PORT, None, None)));
        mocks
            .gateway
            .expect_ensure_gateway_service()
            .withf(|_, external| external == "10.20.0.5")
            .returning(|_, _| Ok(Ensured::Existing));
        mocks.gateway.expect_delete_deprecated().returning(|_| Ok(()));
        let ctx = mocks.into_context();

        let mut cluster = sample_cluster("edge");
        cluster.set_annotation(ANNOTATION_APISERVER, "10.20.0.5");
        let transition = run(cluster, &ctx).await.unwrap();
        assert_eq!(transition.directive, Directive::Proceed);
        assert!(transition.cluster.annotation(ANNOTATION_GATEWAY).is_none());
    }

    #[tokio::test]
    async fn node_port_gateway_without_api_server_host_requeues_20s() {
        let mut mocks = Mocks::default();
        remote_service(&mut mocks, Some(service(NODE_PORT, None, None)));
        let ctx = mocks.into_context();

        let transition = run(sample_cluster("edge"), &ctx).await.unwrap();
        assert_eq!(transition.directive, Directive::Requeue(REQUEUE_PROPAGATION));
    }

    #[tokio::test]
    async fn pending_load_balancer_requeues_60s() {
        let mut mocks = Mocks::default();
        remote_service(&mut mocks, Some(service("LoadBalancer", None, None)));
        mocks.gateway.expect_ensure_gateway_service().never();
        let ctx = mocks.into_context();

        let transition = run(sample_cluster("edge"), &ctx).await.unwrap();
        assert_eq!(transition.directive, Directive::Requeue(REQUEUE_ROLLOUT));
    }

    #[tokio::test]
    async fn missing_gateway_service_requeues_60s() {
        let mut mocks = Mocks::default();
        remote_service(&mut mocks, None);
        let ctx = mocks.into_context();

        let transition = run(sample_cluster("edge"), &ctx).await.unwrap();
        assert_eq!(transition.directive, Directive::Requeue(REQUEUE_ROLLOUT));
    }
}
