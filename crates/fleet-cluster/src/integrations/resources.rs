//! Integration resources created on the management cluster
//!
//! Argo CD cluster secrets and Applications, the gateway ExternalName
//! service, and the cert-manager/Traefik/Ingress objects that route
//! `/api/<namespace>/<cluster>` to it.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Secret, Service, ServicePort, ServiceSpec};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, DynamicObject};
use kube::discovery::ApiResource;
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::debug;

use fleet_common::crd::ManagedCluster;
use fleet_common::kube_utils::{build_api_resource, create_if_absent, delete_if_present, Ensured};
use fleet_common::Error;

use super::{owned_labels, owned_metadata, GatewayRegistrar, GitOpsRegistrar, IngressRegistrar};
use crate::config::{ControllerConfig, GitOpsSource};
use crate::remote::RemoteKubeconfig;

const ARGO_APPLICATION_API_VERSION: &str = "argoproj.io/v1alpha1";
const ARGO_SERVER_INGRESS: &str = "argocd-server-ingress";
const ARGO_SECRET_TYPE_LABEL: &str = "argocd.argoproj.io/secret-type";
const ARGO_MANAGED_BY_ANNOTATION: &str = "managed-by";
const CERT_MANAGER_API_VERSION: &str = "cert-manager.io/v1";
const TRAEFIK_API_VERSION: &str = "traefik.containo.us/v1alpha1";
const INGRESS_CLASS: &str = "tmax-cloud";
const HTTPS_PORT: i32 = 443;

/// Argo CD cluster secret name for a record
pub fn argo_cluster_secret_name(cluster: &ManagedCluster) -> String {
    format!("{}-cluster", cluster.namespaced_prefix())
}

/// Argo CD Application name for a record
pub fn application_name(cluster: &ManagedCluster) -> String {
    format!("{}-applications", cluster.namespaced_prefix())
}

fn gateway_service_name(cluster: &ManagedCluster) -> String {
    format!("{}-gateway-service", cluster.name_any())
}

fn certificate_name(cluster: &ManagedCluster) -> String {
    format!("{}-certificate", cluster.name_any())
}

fn certificate_secret_name(cluster: &ManagedCluster) -> String {
    format!("{}-service-cert", cluster.name_any())
}

fn middleware_name(cluster: &ManagedCluster) -> String {
    format!("{}-prefix", cluster.name_any())
}

fn token_secret_name(cluster: &ManagedCluster) -> String {
    format!("{}-token", cluster.name_any())
}

fn ingress_name(cluster: &ManagedCluster) -> String {
    format!("{}-ingress", cluster.name_any())
}

fn api_path(cluster: &ManagedCluster) -> String {
    format!("/api/{}/{}", cluster.namespace_or_default(), cluster.name_any())
}

fn ingress_host(domain: &str) -> String {
    format!("multicluster.{}", domain)
}

fn dynamic_object(
    ar: &ApiResource,
    cluster: &ManagedCluster,
    name: String,
    namespace: Option<String>,
    owned: bool,
) -> DynamicObject {
    let mut obj = DynamicObject::new(&name, ar);
    obj.metadata = if owned {
        owned_metadata(cluster, name)
    } else {
        ObjectMeta {
            name: Some(name),
            labels: Some(owned_labels(cluster)),
            ..Default::default()
        }
    };
    if namespace.is_some() {
        obj.metadata.namespace = namespace;
    }
    obj
}

fn build_argo_cluster_secret(
    cluster: &ManagedCluster,
    kubeconfig: &RemoteKubeconfig,
    bearer_token: &str,
    argo_namespace: &str,
) -> Result<Secret, Error> {
    let config = json!({
        "bearerToken": bearer_token,
        "tlsClientConfig": {
            "insecure": false,
            "caData": kubeconfig.ca_data,
        }
    });
    let config = serde_json::to_string(&config)
        .map_err(|e| Error::serialization_for_kind("Secret", e.to_string()))?;

    let mut labels = owned_labels(cluster);
    labels.insert(ARGO_SECRET_TYPE_LABEL.to_string(), "cluster".to_string());

    let mut annotations = BTreeMap::from([(
        ARGO_MANAGED_BY_ANNOTATION.to_string(),
        "argocd.argoproj.io".to_string(),
    )]);
    if !cluster.owner().is_empty() {
        annotations.insert(
            fleet_common::crd::ANNOTATION_OWNER.to_string(),
            cluster.owner().to_string(),
        );
    }

    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(argo_cluster_secret_name(cluster)),
            namespace: Some(argo_namespace.to_string()),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        string_data: Some(BTreeMap::from([
            ("name".to_string(), cluster.namespaced_prefix()),
            ("server".to_string(), kubeconfig.server.clone()),
            ("config".to_string(), config),
        ])),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    })
}

fn build_application(
    cluster: &ManagedCluster,
    source: &GitOpsSource,
    base_domain: &str,
    argo_namespace: &str,
) -> DynamicObject {
    let ar = build_api_resource(ARGO_APPLICATION_API_VERSION, "Application");
    let prefix = cluster.namespaced_prefix();
    dynamic_object(
        &ar,
        cluster,
        application_name(cluster),
        Some(argo_namespace.to_string()),
        false,
    )
    .data(json!({
        "spec": {
            "project": "default",
            "destination": {
                "name": prefix,
                "namespace": "default",
            },
            "source": {
                "repoURL": source.repo_url,
                "path": source.path,
                "targetRevision": source.revision,
                "helm": {
                    "parameters": [
                        { "name": "global.clusterName", "value": cluster.name_any() },
                        { "name": "global.clusterNamespace", "value": cluster.namespace_or_default() },
                        { "name": "global.domain", "value": base_domain },
                        { "name": "global.owner", "value": cluster.owner() },
                    ]
                }
            },
            "syncPolicy": {
                "automated": { "prune": true, "selfHeal": true }
            }
        }
    }))
}

fn build_gateway_service(cluster: &ManagedCluster, external_name: &str) -> Service {
    Service {
        metadata: owned_metadata(cluster, gateway_service_name(cluster)),
        spec: Some(ServiceSpec {
            type_: Some("ExternalName".to_string()),
            external_name: Some(external_name.to_string()),
            ports: Some(vec![ServicePort {
                name: Some("https".to_string()),
                port: HTTPS_PORT,
                protocol: Some("TCP".to_string()),
                target_port: Some(IntOrString::Int(HTTPS_PORT)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn build_certificate(cluster: &ManagedCluster, domain: &str, issuer: &str) -> DynamicObject {
    let ar = build_api_resource(CERT_MANAGER_API_VERSION, "Certificate");
    dynamic_object(&ar, cluster, certificate_name(cluster), None, true).data(json!({
        "spec": {
            "secretName": certificate_secret_name(cluster),
            "isCA": false,
            "usages": ["digital signature", "key encipherment", "server auth", "client auth"],
            "dnsNames": [ingress_host(domain)],
            "issuerRef": {
                "kind": "ClusterIssuer",
                "group": "cert-manager.io",
                "name": issuer,
            }
        }
    }))
}

fn build_middleware(cluster: &ManagedCluster) -> DynamicObject {
    let ar = build_api_resource(TRAEFIK_API_VERSION, "Middleware");
    dynamic_object(&ar, cluster, middleware_name(cluster), None, true).data(json!({
        "spec": {
            "stripPrefix": {
                "prefixes": [api_path(cluster)]
            }
        }
    }))
}

fn build_token_secret(cluster: &ManagedCluster, remote_secret: &Secret) -> Secret {
    Secret {
        metadata: owned_metadata(cluster, token_secret_name(cluster)),
        data: remote_secret.data.clone(),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    }
}

fn build_ingress(cluster: &ManagedCluster, domain: &str) -> Ingress {
    let host = ingress_host(domain);
    let mut metadata = owned_metadata(cluster, ingress_name(cluster));
    metadata.annotations = Some(BTreeMap::from([
        (
            "traefik.ingress.kubernetes.io/router.entrypoints".to_string(),
            "websecure".to_string(),
        ),
        (
            "traefik.ingress.kubernetes.io/router.middlewares".to_string(),
            format!(
                "{}-{}@kubernetescrd",
                cluster.namespace_or_default(),
                middleware_name(cluster)
            ),
        ),
    ]));

    Ingress {
        metadata,
        spec: Some(IngressSpec {
            ingress_class_name: Some(INGRESS_CLASS.to_string()),
            rules: Some(vec![IngressRule {
                host: Some(host.clone()),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some(api_path(cluster)),
                        path_type: "Prefix".to_string(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: gateway_service_name(cluster),
                                port: Some(ServiceBackendPort {
                                    number: Some(HTTPS_PORT),
                                    ..Default::default()
                                }),
                            }),
                            ..Default::default()
                        },
                    }],
                }),
            }]),
            tls: Some(vec![IngressTLS {
                hosts: Some(vec![host]),
                secret_name: Some(certificate_secret_name(cluster)),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// GitOpsRegistrar writing Argo CD resources
pub struct KubeGitOpsRegistrar {
    client: Client,
    argo_namespace: String,
    source: GitOpsSource,
    base_domain: String,
}

impl KubeGitOpsRegistrar {
    /// Create a registrar for the configured Argo CD installation
    pub fn new(client: Client, config: &ControllerConfig) -> Self {
        Self {
            client,
            argo_namespace: config.argo_namespace.clone(),
            source: config.gitops.clone(),
            base_domain: config.base_domain.clone(),
        }
    }

    fn application_api(&self) -> Api<DynamicObject> {
        let ar = build_api_resource(ARGO_APPLICATION_API_VERSION, "Application");
        Api::namespaced_with(self.client.clone(), &self.argo_namespace, &ar)
    }
}

#[async_trait]
impl GitOpsRegistrar for KubeGitOpsRegistrar {
    async fn application_host(&self) -> Result<Option<String>, Error> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), &self.argo_namespace);
        Ok(api.get_opt(ARGO_SERVER_INGRESS).await?.and_then(|ing| {
            ing.spec
                .and_then(|s| s.rules)
                .and_then(|rules| rules.into_iter().next())
                .and_then(|rule| rule.host)
        }))
    }

    async fn ensure_cluster_secret(
        &self,
        cluster: &ManagedCluster,
        kubeconfig: &RemoteKubeconfig,
        bearer_token: &str,
    ) -> Result<Ensured, Error> {
        let secret =
            build_argo_cluster_secret(cluster, kubeconfig, bearer_token, &self.argo_namespace)?;
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &self.argo_namespace);
        create_if_absent(&api, &secret).await
    }

    async fn ensure_application(&self, cluster: &ManagedCluster) -> Result<Ensured, Error> {
        let app = build_application(cluster, &self.source, &self.base_domain, &self.argo_namespace);
        create_if_absent(&self.application_api(), &app).await
    }

    async fn remove(&self, cluster: &ManagedCluster) -> Result<(), Error> {
        delete_if_present(&self.application_api(), &application_name(cluster)).await?;
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &self.argo_namespace);
        delete_if_present(&secrets, &argo_cluster_secret_name(cluster)).await?;
        debug!(cluster = %cluster.name_any(), "removed gitops registration");
        Ok(())
    }
}

/// GatewayRegistrar writing Services in the record's namespace
pub struct KubeGatewayRegistrar {
    client: Client,
}

impl KubeGatewayRegistrar {
    /// Create a new registrar
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl GatewayRegistrar for KubeGatewayRegistrar {
    async fn ensure_gateway_service(
        &self,
        cluster: &ManagedCluster,
        external_name: &str,
    ) -> Result<Ensured, Error> {
        let api: Api<Service> =
            Api::namespaced(self.client.clone(), &cluster.namespace_or_default());
        create_if_absent(&api, &build_gateway_service(cluster, external_name)).await
    }

    async fn delete_deprecated(&self, cluster: &ManagedCluster) -> Result<(), Error> {
        let namespace = cluster.namespace_or_default();
        let services: Api<Service> = Api::namespaced(self.client.clone(), &namespace);
        delete_if_present(&services, &format!("{}-prometheus-service", cluster.name_any()))
            .await?;
        let ingresses: Api<Ingress> = Api::namespaced(self.client.clone(), &namespace);
        delete_if_present(&ingresses, &format!("{}-prometheus-ingress", cluster.name_any()))
            .await?;
        Ok(())
    }

    async fn remove(&self, cluster: &ManagedCluster) -> Result<(), Error> {
        let api: Api<Service> =
            Api::namespaced(self.client.clone(), &cluster.namespace_or_default());
        delete_if_present(&api, &gateway_service_name(cluster)).await?;
        Ok(())
    }
}

/// IngressRegistrar writing cert-manager, Traefik and Ingress objects
pub struct KubeIngressRegistrar {
    client: Client,
    cluster_issuer: String,
}

impl KubeIngressRegistrar {
    /// Create a registrar issuing certificates from `config.cluster_issuer`
    pub fn new(client: Client, config: &ControllerConfig) -> Self {
        Self {
            client,
            cluster_issuer: config.cluster_issuer.clone(),
        }
    }

    fn dynamic_api(&self, namespace: &str, api_version: &str, kind: &str) -> Api<DynamicObject> {
        let ar = build_api_resource(api_version, kind);
        Api::namespaced_with(self.client.clone(), namespace, &ar)
    }
}

#[async_trait]
impl IngressRegistrar for KubeIngressRegistrar {
    async fn ensure_certificate(
        &self,
        cluster: &ManagedCluster,
        domain: &str,
    ) -> Result<Ensured, Error> {
        let api = self.dynamic_api(
            &cluster.namespace_or_default(),
            CERT_MANAGER_API_VERSION,
            "Certificate",
        );
        create_if_absent(&api, &build_certificate(cluster, domain, &self.cluster_issuer)).await
    }

    async fn ensure_middleware(&self, cluster: &ManagedCluster) -> Result<Ensured, Error> {
        let api = self.dynamic_api(
            &cluster.namespace_or_default(),
            TRAEFIK_API_VERSION,
            "Middleware",
        );
        create_if_absent(&api, &build_middleware(cluster)).await
    }

    async fn ensure_token_secret(
        &self,
        cluster: &ManagedCluster,
        remote_secret: &Secret,
    ) -> Result<Ensured, Error> {
        let api: Api<Secret> =
            Api::namespaced(self.client.clone(), &cluster.namespace_or_default());
        create_if_absent(&api, &build_token_secret(cluster, remote_secret)).await
    }

    async fn ensure_ingress(
        &self,
        cluster: &ManagedCluster,
        domain: &str,
    ) -> Result<Ensured, Error> {
        let api: Api<Ingress> =
            Api::namespaced(self.client.clone(), &cluster.namespace_or_default());
        create_if_absent(&api, &build_ingress(cluster, domain)).await
    }

    async fn remove(&self, cluster: &ManagedCluster) -> Result<(), Error> {
        let namespace = cluster.namespace_or_default();

        let ingresses: Api<Ingress> = Api::namespaced(self.client.clone(), &namespace);
        delete_if_present(&ingresses, &ingress_name(cluster)).await?;

        let middlewares = self.dynamic_api(&namespace, TRAEFIK_API_VERSION, "Middleware");
        delete_if_present(&middlewares, &middleware_name(cluster)).await?;

        let certificates = self.dynamic_api(&namespace, CERT_MANAGER_API_VERSION, "Certificate");
        delete_if_present(&certificates, &certificate_name(cluster)).await?;

        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        delete_if_present(&secrets, &token_secret_name(cluster)).await?;
        delete_if_present(&secrets, &certificate_secret_name(cluster)).await?;
        Ok(())
    }
}
