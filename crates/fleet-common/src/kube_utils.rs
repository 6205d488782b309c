//! Shared Kubernetes utilities using kube-rs
//!
//! Client construction, untyped `ApiResource` building for CRDs we do not
//! own (CAPI, service catalog, cert-manager, Traefik, Argo CD), and the
//! create-if-absent primitive every integration phase is built on.

use std::fmt::Debug;
use std::path::Path;
use std::time::Duration;

use kube::api::{Api, DeleteParams, DynamicObject, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::ApiResource;
use kube::{Client, Config, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{is_conflict, is_not_found};
use crate::Error;

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from optional kubeconfig path with default timeouts
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    create_client_with_timeout(kubeconfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT).await
}

/// Create a kube client from optional kubeconfig path with custom timeouts
pub async fn create_client_with_timeout(
    kubeconfig: Option<&Path>,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig: {}", e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };
    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Create a client for a remote cluster from an in-memory kubeconfig
pub async fn client_from_kubeconfig(kubeconfig: Kubeconfig) -> Result<Client, Error> {
    let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| {
            Error::internal_with_context(
                "remote_client",
                format!("failed to load remote kubeconfig: {}", e),
            )
        })?;
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context(
            "remote_client",
            format!("failed to create remote client: {}", e),
        )
    })
}

/// Split an apiVersion into (group, version); core resources have an empty group
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Build an ApiResource from a known apiVersion and kind.
///
/// ```ignore
/// let ar = build_api_resource("cluster.x-k8s.io/v1beta1", "MachineDeployment");
/// let api: Api<DynamicObject> = Api::namespaced_with(client, "default", &ar);
/// ```
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Discover the served apiVersion of a kind within an API group
///
/// CAPI and service catalog installs differ in which version they serve
/// (`v1alpha3`, `v1alpha4`, `v1beta1`), so the version is looked up
/// rather than assumed.
pub async fn discover_api_version(
    client: &Client,
    group: &str,
    kind: &str,
) -> Result<String, Error> {
    use kube::discovery::Discovery;

    let discovery = Discovery::new(client.clone())
        .filter(&[group])
        .run()
        .await
        .map_err(|e| {
            Error::internal_with_context(
                "discover_api_version",
                format!("API discovery failed: {}", e),
            )
        })?;

    for api_group in discovery.groups() {
        if api_group.name() != group {
            continue;
        }
        for (ar, _caps) in api_group.resources_by_stability() {
            if ar.kind == kind {
                return Ok(ar.api_version.clone());
            }
        }
    }

    Err(Error::internal_with_context(
        "discover_api_version",
        format!("Resource {}/{} not found in API discovery", group, kind),
    ))
}

/// Build an ApiResource for a kind using the version the API server serves
pub async fn build_api_resource_with_discovery(
    client: &Client,
    group: &str,
    kind: &str,
) -> Result<ApiResource, Error> {
    let api_version = discover_api_version(client, group, kind).await?;
    Ok(build_api_resource(&api_version, kind))
}

/// Namespaced untyped API for the given apiVersion and kind
pub fn dynamic_api(
    client: &Client,
    namespace: &str,
    api_version: &str,
    kind: &str,
) -> Api<DynamicObject> {
    let ar = build_api_resource(api_version, kind);
    Api::namespaced_with(client.clone(), namespace, &ar)
}

/// Known kinds whose plural is not a simple suffix
const KIND_PLURALS: &[(&str, &str)] = &[
    ("ingress", "ingresses"),
    ("ingressroute", "ingressroutes"),
    ("kubeadmcontrolplane", "kubeadmcontrolplanes"),
    ("machinedeployment", "machinedeployments"),
    ("serviceinstance", "serviceinstances"),
    ("policy", "policies"),
];

/// Pluralize a Kubernetes resource kind
///
/// Uses a lookup table for known kinds, falling back to simple
/// pluralization rules for unknown types.
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();

    for (singular, plural) in KIND_PLURALS {
        if *singular == lower {
            return (*plural).to_string();
        }
    }

    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

/// Outcome of a create-if-absent call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ensured {
    /// The object did not exist and was created
    Created,
    /// An object with that name already existed
    Existing,
    /// An object with that name exists but is being deleted
    Terminating,
}

/// Look up an object by its name and create it only if it is absent
///
/// A 409 on create (lost race with another writer) counts as `Existing`.
/// Any other lookup or create error is propagated.
pub async fn create_if_absent<K>(api: &Api<K>, obj: &K) -> Result<Ensured, Error>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
{
    let name = obj.meta().name.clone().ok_or_else(|| {
        Error::contract("create_if_absent", "object to create must have a name")
    })?;

    if let Some(existing) = api.get_opt(&name).await? {
        if existing.meta().deletion_timestamp.is_some() {
            debug!(name = %name, "object is terminating");
            return Ok(Ensured::Terminating);
        }
        debug!(name = %name, "object already exists");
        return Ok(Ensured::Existing);
    }

    match api.create(&PostParams::default(), obj).await {
        Ok(created) => {
            info!(name = %created.name_any(), "created object");
            Ok(Ensured::Created)
        }
        Err(e) if is_conflict(&e) => Ok(Ensured::Existing),
        Err(e) => Err(e.into()),
    }
}

/// Delete an object by name, treating "not found" as success
///
/// Returns true when a delete was issued.
pub async fn delete_if_present<K>(api: &Api<K>, name: &str) -> Result<bool, Error>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    match api.delete(name, &DeleteParams::background()).await {
        Ok(_) => {
            info!(name = %name, "deleted object");
            Ok(true)
        }
        Err(e) if is_not_found(&e) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Read a nested string field from an untyped object
///
/// ```ignore
/// let host = string_at(&obj, &["spec", "controlPlaneEndpoint", "host"]);
/// ```
pub fn string_at<'a>(obj: &'a DynamicObject, path: &[&str]) -> Option<&'a str> {
    value_at(obj, path).and_then(|v| v.as_str())
}

/// Read a nested integer field from an untyped object as u32
pub fn u32_at(obj: &DynamicObject, path: &[&str]) -> Option<u32> {
    value_at(obj, path)
        .and_then(|v| v.as_i64())
        .and_then(|v| u32::try_from(v).ok())
}

fn value_at<'a>(obj: &'a DynamicObject, path: &[&str]) -> Option<&'a serde_json::Value> {
    let (first, rest) = path.split_first()?;
    let mut current = obj.data.get(*first)?;
    for segment in rest {
        current = current.get(*segment)?;
    }
    Some(current)
}
