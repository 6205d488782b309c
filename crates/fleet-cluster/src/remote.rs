//! Read-only access to the managed (remote) cluster
//!
//! Every remote read goes through the kubeconfig the provisioner publishes
//! in the secret `<cluster>-kubeconfig` next to the record.

use async_trait::async_trait;
use base64::Engine;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Secret, Service};
use kube::api::{Api, ListParams};
use kube::config::Kubeconfig;
use kube::Client;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use fleet_common::kube_utils::client_from_kubeconfig;
use fleet_common::Error;

/// Suffix of the secret holding a cluster's kubeconfig
pub const KUBECONFIG_SECRET_SUFFIX: &str = "-kubeconfig";
/// Key of the kubeconfig inside that secret
pub const KUBECONFIG_SECRET_KEY: &str = "value";
/// Namespace of the kubeadm configuration on the remote cluster
pub const KUBE_SYSTEM_NAMESPACE: &str = "kube-system";
const KUBEADM_CONFIG_NAME: &str = "kubeadm-config";
const KUBEADM_CLUSTER_CONFIGURATION_KEY: &str = "ClusterConfiguration";

/// Name of the kubeconfig secret for a cluster
pub fn kubeconfig_secret_name(cluster: &str) -> String {
    format!("{}{}", cluster, KUBECONFIG_SECRET_SUFFIX)
}

/// Parsed remote kubeconfig plus the fields integrations need
#[derive(Clone, Debug)]
pub struct RemoteKubeconfig {
    /// Full kubeconfig, used to build remote clients
    pub raw: Kubeconfig,
    /// API server URL of the current context's cluster
    pub server: String,
    /// Base64 CA bundle of the current context's cluster
    pub ca_data: Option<String>,
}

impl RemoteKubeconfig {
    /// Parse a kubeconfig and resolve its current context
    ///
    /// Falls back to the first cluster entry when the current context does
    /// not resolve.
    pub fn parse(bytes: &[u8]) -> Result<Self, Error> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| Error::serialization_for_kind("kubeconfig", e.to_string()))?;
        let raw = Kubeconfig::from_yaml(text)
            .map_err(|e| Error::serialization_for_kind("kubeconfig", e.to_string()))?;

        let context_cluster = raw
            .current_context
            .as_deref()
            .and_then(|current| raw.contexts.iter().find(|c| c.name == current))
            .and_then(|c| c.context.as_ref())
            .map(|c| c.cluster.clone());

        let cluster = context_cluster
            .and_then(|name| raw.clusters.iter().find(|c| c.name == name))
            .or_else(|| raw.clusters.first())
            .and_then(|c| c.cluster.as_ref())
            .ok_or_else(|| Error::serialization_for_kind("kubeconfig", "no cluster entry"))?;

        let server = cluster
            .server
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::serialization_for_kind("kubeconfig", "cluster has no server"))?;

        let ca_data = cluster.certificate_authority_data.clone();
        if let Some(ca) = &ca_data {
            base64::engine::general_purpose::STANDARD
                .decode(ca)
                .map_err(|e| {
                    Error::serialization_for_kind(
                        "kubeconfig",
                        format!("certificate-authority-data is not base64: {}", e),
                    )
                })?;
        }

        Ok(Self {
            raw,
            server,
            ca_data,
        })
    }

    /// Host part of the API server URL
    pub fn server_host(&self) -> Option<String> {
        self.server
            .parse::<http::Uri>()
            .ok()
            .and_then(|uri| uri.host().map(str::to_string))
            .filter(|h| !h.is_empty())
    }
}

/// Trait abstracting remote cluster reads for testability
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteClusterReader: Send + Sync {
    /// Load the kubeconfig published for a cluster, None when not yet published
    async fn load_kubeconfig(
        &self,
        namespace: &str,
        cluster: &str,
    ) -> Result<Option<RemoteKubeconfig>, Error>;

    /// List every node of the remote cluster
    async fn list_nodes(&self, kubeconfig: &RemoteKubeconfig) -> Result<Vec<Node>, Error>;

    /// kubeadm `ClusterConfiguration` blob, None when the ConfigMap is absent
    async fn kubeadm_config(&self, kubeconfig: &RemoteKubeconfig)
        -> Result<Option<String>, Error>;

    /// Body returned by `GET /readyz`
    async fn readyz(&self, kubeconfig: &RemoteKubeconfig) -> Result<String, Error>;

    /// Read a remote secret, None when absent
    async fn secret(
        &self,
        kubeconfig: &RemoteKubeconfig,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Secret>, Error>;

    /// Read a remote service, None when absent
    async fn service(
        &self,
        kubeconfig: &RemoteKubeconfig,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Service>, Error>;
}

/// RemoteClusterReader backed by kube clients
pub struct KubeRemoteClusterReader {
    client: Client,
}

impl KubeRemoteClusterReader {
    /// Create a new reader; `client` talks to the management cluster
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn remote_client(&self, kubeconfig: &RemoteKubeconfig) -> Result<Client, Error> {
        client_from_kubeconfig(kubeconfig.raw.clone()).await
    }
}

#[async_trait]
impl RemoteClusterReader for KubeRemoteClusterReader {
    async fn load_kubeconfig(
        &self,
        namespace: &str,
        cluster: &str,
    ) -> Result<Option<RemoteKubeconfig>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let name = kubeconfig_secret_name(cluster);
        let Some(secret) = api.get_opt(&name).await? else {
            debug!(secret = %name, "kubeconfig secret not published yet");
            return Ok(None);
        };

        let Some(value) = secret
            .data
            .as_ref()
            .and_then(|d| d.get(KUBECONFIG_SECRET_KEY))
        else {
            debug!(secret = %name, "kubeconfig secret has no value yet");
            return Ok(None);
        };

        RemoteKubeconfig::parse(&value.0).map(Some)
    }

    async fn list_nodes(&self, kubeconfig: &RemoteKubeconfig) -> Result<Vec<Node>, Error> {
        let client = self.remote_client(kubeconfig).await?;
        let api: Api<Node> = Api::all(client);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn kubeadm_config(
        &self,
        kubeconfig: &RemoteKubeconfig,
    ) -> Result<Option<String>, Error> {
        let client = self.remote_client(kubeconfig).await?;
        let api: Api<ConfigMap> = Api::namespaced(client, KUBE_SYSTEM_NAMESPACE);
        Ok(api
            .get_opt(KUBEADM_CONFIG_NAME)
            .await?
            .and_then(|cm| cm.data)
            .and_then(|mut data| data.remove(KUBEADM_CLUSTER_CONFIGURATION_KEY)))
    }

    async fn readyz(&self, kubeconfig: &RemoteKubeconfig) -> Result<String, Error> {
        let client = self.remote_client(kubeconfig).await?;
        let request = http::Request::get("/readyz")
            .body(Vec::new())
            .map_err(|e| Error::internal_with_context("readyz", e.to_string()))?;
        Ok(client.request_text(request).await?)
    }

    async fn secret(
        &self,
        kubeconfig: &RemoteKubeconfig,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Secret>, Error> {
        let client = self.remote_client(kubeconfig).await?;
        let api: Api<Secret> = Api::namespaced(client, namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn service(
        &self,
        kubeconfig: &RemoteKubeconfig,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Service>, Error> {
        let client = self.remote_client(kubeconfig).await?;
        let api: Api<Service> = Api::namespaced(client, namespace);
        Ok(api.get_opt(name).await?)
    }
}
