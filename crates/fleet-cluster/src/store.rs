//! Persistence of ManagedCluster records
//!
//! Phases mutate an in-memory copy of the record; the controller commits the
//! difference once per tick. Metadata and spec go through a merge patch on
//! the main resource, status through the status subresource.

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde_json::{json, Map, Value};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use fleet_common::crd::{ManagedCluster, ManagedClusterStatus, CLUSTER_FINALIZER};
use fleet_common::{Error, FIELD_MANAGER};

/// Trait abstracting record writes for testability
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Merge-patch metadata and spec of a record
    async fn patch_record(&self, namespace: &str, name: &str, patch: &Value) -> Result<(), Error>;

    /// Replace the status of a record through the status subresource
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ManagedClusterStatus,
    ) -> Result<(), Error>;

    /// Add the deletion finalizer
    async fn add_finalizer(&self, cluster: &ManagedCluster) -> Result<(), Error>;

    /// Remove the deletion finalizer
    async fn remove_finalizer(&self, cluster: &ManagedCluster) -> Result<(), Error>;
}

/// ClusterStore backed by the Kubernetes API
pub struct KubeClusterStore {
    client: Client,
}

impl KubeClusterStore {
    /// Create a new store
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<ManagedCluster> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn write_finalizers(
        &self,
        cluster: &ManagedCluster,
        finalizers: Vec<String>,
    ) -> Result<(), Error> {
        let patch = json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        self.api(&cluster.namespace_or_default())
            .patch(
                &cluster.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ClusterStore for KubeClusterStore {
    async fn patch_record(&self, namespace: &str, name: &str, patch: &Value) -> Result<(), Error> {
        self.api(namespace)
            .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ManagedClusterStatus,
    ) -> Result<(), Error> {
        let status_patch = json!({
            "status": status
        });
        self.api(namespace)
            .patch_status(
                name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&status_patch),
            )
            .await?;
        Ok(())
    }

    async fn add_finalizer(&self, cluster: &ManagedCluster) -> Result<(), Error> {
        if cluster.has_finalizer() {
            return Ok(());
        }
        let mut finalizers = cluster.finalizers().to_vec();
        finalizers.push(CLUSTER_FINALIZER.to_string());
        self.write_finalizers(cluster, finalizers).await
    }

    async fn remove_finalizer(&self, cluster: &ManagedCluster) -> Result<(), Error> {
        let finalizers: Vec<String> = cluster
            .finalizers()
            .iter()
            .filter(|f| *f != CLUSTER_FINALIZER)
            .cloned()
            .collect();
        self.write_finalizers(cluster, finalizers).await
    }
}

/// Merge patch covering the metadata and spec changes between two copies
///
/// Returns None when labels, annotations and spec are unchanged.
pub fn record_patch(
    original: &ManagedCluster,
    updated: &ManagedCluster,
) -> Result<Option<Value>, Error> {
    let mut metadata = Map::new();
    if original.labels() != updated.labels() {
        metadata.insert("labels".to_string(), json!(updated.labels()));
    }
    if original.annotations() != updated.annotations() {
        metadata.insert("annotations".to_string(), json!(updated.annotations()));
    }

    let mut patch = Map::new();
    if !metadata.is_empty() {
        patch.insert("metadata".to_string(), Value::Object(metadata));
    }
    if original.spec != updated.spec {
        let spec = serde_json::to_value(&updated.spec)
            .map_err(|e| Error::serialization_for_kind("ManagedCluster", e.to_string()))?;
        patch.insert("spec".to_string(), spec);
    }

    Ok((!patch.is_empty()).then_some(Value::Object(patch)))
}

/// Persist whatever a tick changed
///
/// Metadata and spec are written before status so a crash between the two
/// never leaves a readiness flag recorded without the annotation it
/// depends on.
pub async fn commit(
    store: &dyn ClusterStore,
    original: &ManagedCluster,
    updated: &ManagedCluster,
) -> Result<(), Error> {
    let namespace = updated.namespace_or_default();
    let name = updated.name_any();

    if let Some(patch) = record_patch(original, updated)? {
        debug!(cluster = %name, "persisting record metadata/spec");
        store.patch_record(&namespace, &name, &patch).await?;
    }

    if original.status != updated.status {
        debug!(cluster = %name, phase = %updated.phase(), "persisting record status");
        store
            .patch_status(&namespace, &name, &updated.status_or_default())
            .await?;
    }

    Ok(())
}
