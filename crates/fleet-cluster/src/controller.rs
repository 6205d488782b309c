//! ManagedCluster reconciliation controller
//!
//! Each reconcile handles deletion and the finalizer, validates records this
//! operator provisions, runs one phase engine tick under a deadline, then
//! persists whatever the tick changed. Errors are retried with a per-record
//! exponential backoff; errors that need a spec change wait for one.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use fleet_capi::{CapiClient, CapiClientImpl, InfraProvisioner, ServiceCatalogProvisioner};
use fleet_common::crd::{ClusterPhase, ClusterType, ManagedCluster};
use fleet_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use fleet_common::Error;

use crate::cleanup::{CleanupHandler, CleanupOutcome, PipelineCleanup};
use crate::config::ControllerConfig;
use crate::gates::GateGraph;
use crate::integrations::{
    GatewayRegistrar, GitOpsRegistrar, IdentityRegistrar, IngressRegistrar, KeycloakRegistrar,
    KubeGatewayRegistrar, KubeGitOpsRegistrar, KubeIngressRegistrar,
};
use crate::phases::{is_converged, run_tick, Directive, REQUEUE_ROLLOUT};
use crate::remote::{KubeRemoteClusterReader, RemoteClusterReader};
use crate::store::{commit, ClusterStore, KubeClusterStore};

/// Name reported on Kubernetes Events
pub const CONTROLLER_NAME: &str = "fleet-cluster-controller";

const FINALIZER_REQUEUE: Duration = Duration::from_secs(1);
const BACKOFF_BASE_SECS: u64 = 5;
const BACKOFF_MAX_SECS: u64 = 300;

/// Shared context for the ManagedCluster controller
///
/// Every external system sits behind a trait object so reconcile logic can
/// be exercised with mocks. Use [`ContextBuilder`] to construct instances:
///
/// ```text
/// let ctx = Context::builder(client)
///     .config(config)
///     .build()?;
/// ```
pub struct Context {
    /// Writes to ManagedCluster records
    pub store: Arc<dyn ClusterStore>,
    /// Reads from managed clusters
    pub remote: Arc<dyn RemoteClusterReader>,
    /// CAPI objects on the management cluster
    pub capi: Arc<dyn CapiClient>,
    /// Infrastructure instance requests
    pub provisioner: Arc<dyn InfraProvisioner>,
    /// Argo CD registration
    pub gitops: Arc<dyn GitOpsRegistrar>,
    /// Gateway exposure
    pub gateway: Arc<dyn GatewayRegistrar>,
    /// Identity provider registration
    pub identity: Arc<dyn IdentityRegistrar>,
    /// Ingress and TLS exposure
    pub ingress: Arc<dyn IngressRegistrar>,
    /// Teardown on deletion
    pub cleanup: Arc<dyn CleanupHandler>,
    /// Kubernetes Event publisher
    pub events: Arc<dyn EventPublisher>,
    /// Readiness gate dependencies
    pub gates: GateGraph,
    /// Controller configuration
    pub config: ControllerConfig,
    /// Consecutive failures per `<namespace>/<name>`, for backoff
    pub failures: DashMap<String, u32>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }
}

/// Builder for constructing [`Context`] instances
///
/// Anything not overridden is backed by the real Kubernetes client.
pub struct ContextBuilder {
    client: Client,
    config: ControllerConfig,
    store: Option<Arc<dyn ClusterStore>>,
    remote: Option<Arc<dyn RemoteClusterReader>>,
    capi: Option<Arc<dyn CapiClient>>,
    provisioner: Option<Arc<dyn InfraProvisioner>>,
    identity: Option<Arc<dyn IdentityRegistrar>>,
    events: Option<Arc<dyn EventPublisher>>,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            config: ControllerConfig::default(),
            store: None,
            remote: None,
            capi: None,
            provisioner: None,
            identity: None,
            events: None,
        }
    }

    /// Set the controller configuration
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the record store (primarily for testing)
    pub fn store(mut self, store: Arc<dyn ClusterStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Override the remote cluster reader (primarily for testing)
    pub fn remote(mut self, remote: Arc<dyn RemoteClusterReader>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Override the CAPI client (primarily for testing)
    pub fn capi_client(mut self, capi: Arc<dyn CapiClient>) -> Self {
        self.capi = Some(capi);
        self
    }

    /// Override the infrastructure provisioner
    pub fn provisioner(mut self, provisioner: Arc<dyn InfraProvisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    /// Override the identity registrar
    pub fn identity(mut self, identity: Arc<dyn IdentityRegistrar>) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Override the event publisher
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the Context
    ///
    /// Fails only when the identity provider HTTP client cannot be built.
    pub fn build(self) -> Result<Context, Error> {
        let client = self.client;
        let identity: Arc<dyn IdentityRegistrar> = match self.identity {
            Some(identity) => identity,
            None => Arc::new(KeycloakRegistrar::new(
                client.clone(),
                self.config.identity.clone(),
            )?),
        };
        let provisioner = self
            .provisioner
            .unwrap_or_else(|| Arc::new(ServiceCatalogProvisioner::new(client.clone())));
        let gitops: Arc<dyn GitOpsRegistrar> =
            Arc::new(KubeGitOpsRegistrar::new(client.clone(), &self.config));
        let gateway: Arc<dyn GatewayRegistrar> =
            Arc::new(KubeGatewayRegistrar::new(client.clone()));
        let ingress: Arc<dyn IngressRegistrar> =
            Arc::new(KubeIngressRegistrar::new(client.clone(), &self.config));
        let cleanup = Arc::new(PipelineCleanup::new(
            gitops.clone(),
            gateway.clone(),
            ingress.clone(),
            provisioner.clone(),
        ));

        Ok(Context {
            store: self
                .store
                .unwrap_or_else(|| Arc::new(KubeClusterStore::new(client.clone()))),
            remote: self
                .remote
                .unwrap_or_else(|| Arc::new(KubeRemoteClusterReader::new(client.clone()))),
            capi: self
                .capi
                .unwrap_or_else(|| Arc::new(CapiClientImpl::new(client.clone()))),
            provisioner,
            gitops,
            gateway,
            identity,
            ingress,
            cleanup,
            events: self
                .events
                .unwrap_or_else(|| Arc::new(KubeEventPublisher::new(client, CONTROLLER_NAME))),
            gates: GateGraph::chain(),
            config: self.config,
            failures: DashMap::new(),
        })
    }
}

/// Reconcile a ManagedCluster
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.name_any()))]
pub async fn reconcile(cluster: Arc<ManagedCluster>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = cluster.name_any();
    debug!("reconciling cluster");

    if cluster.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&cluster, &ctx).await;
    }

    if !cluster.has_finalizer() {
        info!("adding finalizer");
        ctx.store.add_finalizer(&cluster).await?;
        return Ok(Action::requeue(FINALIZER_REQUEUE));
    }

    // Records already instantiated are not re-validated
    if cluster.cluster_type() == ClusterType::Created && cluster.suffix().is_none() {
        if let Err(e) = cluster.spec.validate_for_provisioning(&name) {
            warn!(error = %e, "cluster validation failed");
            ctx.events
                .publish(
                    &cluster.object_ref(&()),
                    EventType::Warning,
                    reasons::VALIDATION_FAILED,
                    actions::RECONCILE,
                    Some(e.to_string()),
                )
                .await;
            return Err(e);
        }
    }

    let original = cluster.as_ref().clone();
    let outcome = tokio::time::timeout(ctx.config.tick_timeout, run_tick(original.clone(), &ctx))
        .await
        .map_err(|_| Error::timeout(&name, ctx.config.tick_timeout.as_secs()))?;

    commit(ctx.store.as_ref(), &original, &outcome.cluster).await?;
    publish_transitions(&original, &outcome.cluster, &ctx).await;

    let directive = outcome.result?;
    ctx.failures.remove(&cluster.key());

    Ok(match directive {
        Directive::Requeue(after) => Action::requeue(after),
        Directive::Proceed if is_converged(&outcome.cluster, &ctx.gates) => {
            debug!("cluster converged");
            Action::requeue(ctx.config.resync_interval)
        }
        Directive::Proceed => Action::requeue(REQUEUE_ROLLOUT),
    })
}

async fn handle_deletion(cluster: &ManagedCluster, ctx: &Context) -> Result<Action, Error> {
    if !cluster.has_finalizer() {
        return Ok(Action::await_change());
    }

    if cluster.phase() != ClusterPhase::Deleting {
        let mut status = cluster.status_or_default();
        status.phase = ClusterPhase::Deleting;
        ctx.store
            .patch_status(&cluster.namespace_or_default(), &cluster.name_any(), &status)
            .await?;
        ctx.events
            .publish(
                &cluster.object_ref(&()),
                EventType::Normal,
                reasons::DELETION_STARTED,
                actions::DELETE,
                None,
            )
            .await;
    }

    match ctx.cleanup.cleanup(cluster).await? {
        CleanupOutcome::Pending(after) => Ok(Action::requeue(after)),
        CleanupOutcome::Complete => {
            ctx.store.remove_finalizer(cluster).await?;
            ctx.failures.remove(&cluster.key());
            ctx.events
                .publish(
                    &cluster.object_ref(&()),
                    EventType::Normal,
                    reasons::CLEANUP_COMPLETE,
                    actions::DELETE,
                    None,
                )
                .await;
            info!("cleanup complete, finalizer removed");
            Ok(Action::await_change())
        }
    }
}

/// Publish Events for lifecycle changes a tick produced
async fn publish_transitions(before: &ManagedCluster, after: &ManagedCluster, ctx: &Context) {
    let object_ref = after.object_ref(&());
    let (was, now) = (before.status_or_default(), after.status_or_default());

    if !was.control_plane_ready && now.control_plane_ready {
        ctx.events
            .publish(
                &object_ref,
                EventType::Normal,
                reasons::CONTROL_PLANE_READY,
                actions::RECONCILE,
                None,
            )
            .await;
    }

    if was.phase == now.phase {
        return;
    }
    let (reason, action) = match now.phase {
        ClusterPhase::SyncNeeded => (reasons::SYNC_NEEDED, actions::RECONCILE),
        ClusterPhase::Ready => (reasons::CLUSTER_READY, actions::RECONCILE),
        ClusterPhase::Scaling => (reasons::SCALING_STARTED, actions::SCALE),
        ClusterPhase::Upgrading => (reasons::UPGRADE_STARTED, actions::UPGRADE),
        _ => return,
    };
    ctx.events
        .publish(
            &object_ref,
            EventType::Normal,
            reason,
            action,
            Some(format!("{} -> {}", was.phase, now.phase)),
        )
        .await;
}

/// Delay before the `attempt`-th retry: 5s doubling, capped at 5 minutes
pub fn backoff_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    Duration::from_secs((BACKOFF_BASE_SECS << exponent).min(BACKOFF_MAX_SECS))
}

/// Error policy for the controller
///
/// Retryable errors back off exponentially per record. Anything else needs
/// a spec change, so the record waits for one.
pub fn error_policy(cluster: Arc<ManagedCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = cluster.key();

    if !error.is_retryable() {
        error!(?error, cluster = %cluster.name_any(), "reconciliation failed, waiting for a spec change");
        ctx.failures.remove(&key);
        return Action::await_change();
    }

    let attempt = {
        let mut count = ctx.failures.entry(key).or_insert(0);
        *count += 1;
        *count
    };
    let delay = backoff_delay(attempt);
    warn!(
        ?error,
        cluster = %cluster.name_any(),
        attempt,
        retry_secs = delay.as_secs(),
        "reconciliation failed"
    );
    Action::requeue(delay)
}
