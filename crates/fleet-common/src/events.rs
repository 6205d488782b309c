//! Kubernetes Event recording for Fleet controllers.
//!
//! Provides a trait-based abstraction over `kube::runtime::events::Recorder`
//! so the cluster controller can emit standard Kubernetes Events visible via
//! `kubectl describe managedcluster`.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "ControlPlaneReady")
    /// * `action` - What action was taken (e.g. "Reconcile")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher for the given controller name.
    ///
    /// The controller name appears as the "reportingComponent" on Events.
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// No-op implementation for tests.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Well-known event reason strings.
///
/// These appear in `kubectl get events` under the REASON column.
pub mod reasons {
    /// Infrastructure instantiation was requested from the provisioner
    pub const PROVISIONING_REQUESTED: &str = "ProvisioningRequested";
    /// Remote control plane answered its readiness probe
    pub const CONTROL_PLANE_READY: &str = "ControlPlaneReady";
    /// Control plane and GitOps are wired, platform integrations pending
    pub const SYNC_NEEDED: &str = "SyncNeeded";
    /// Every integration is in place
    pub const CLUSTER_READY: &str = "ClusterReady";
    /// Desired replica counts diverged from the live cluster
    pub const SCALING_STARTED: &str = "ScalingStarted";
    /// Desired version diverged from the live cluster
    pub const UPGRADE_STARTED: &str = "UpgradeStarted";
    /// Cluster deletion initiated
    pub const DELETION_STARTED: &str = "DeletionStarted";
    /// Downstream resources removed, finalizer released
    pub const CLEANUP_COMPLETE: &str = "CleanupComplete";
    /// Spec validation failed
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
}

/// Well-known event action strings.
///
/// These appear in `kubectl get events` under the ACTION column.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Requesting infrastructure
    pub const PROVISION: &str = "Provision";
    /// Scaling node pools
    pub const SCALE: &str = "Scale";
    /// Rolling out a new Kubernetes version
    pub const UPGRADE: &str = "Upgrade";
    /// Deleting cluster resources
    pub const DELETE: &str = "Delete";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_publisher_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopEventPublisher>();
    }

    #[test]
    fn reason_constants_are_pascal_case() {
        assert_eq!(reasons::CONTROL_PLANE_READY, "ControlPlaneReady");
        assert_eq!(reasons::CLUSTER_READY, "ClusterReady");
        assert_eq!(actions::UPGRADE, "Upgrade");
    }

    #[tokio::test]
    async fn noop_publisher_does_not_panic() {
        let publisher = NoopEventPublisher;
        let obj_ref = ObjectReference::default();
        publisher
            .publish(
                &obj_ref,
                EventType::Normal,
                reasons::CLUSTER_READY,
                actions::RECONCILE,
                Some("test".to_string()),
            )
            .await;
    }
}
