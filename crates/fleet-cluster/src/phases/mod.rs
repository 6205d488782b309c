//! Reconciliation phase engine
//!
//! A tick runs every phase of [`Phase::PIPELINE`] in order. Each phase
//! takes the record by value and hands it back, possibly mutated, with a
//! directive:
//!
//! - `Proceed`: continue with the next phase
//! - `Requeue(d)`: stop this tick, keep the mutations, retry after `d`
//!
//! An error stops the tick and discards the failing phase's mutations; the
//! controller backs off. Phases are idempotent: when their postcondition
//! already holds they return the record untouched without external calls.
//!
//! Integration phases own a [`ReadinessGate`]. The engine only runs them
//! when the gate graph reports them runnable, and sets the gate flag itself
//! when they proceed.

mod defaults;
mod drift;
mod endpoint;
mod gateway;
mod gitops;
mod identity;
mod ingress;
mod instantiation;
mod migration;
mod refresh;
mod scaling;
mod upgrade;

use std::time::Duration;

use kube::ResourceExt;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{debug, info, trace, warn};

use fleet_common::crd::{ClusterPhase, ManagedCluster};
use fleet_common::kube_utils::Ensured;
use fleet_common::Error;

use crate::controller::Context;
use crate::gates::{GateGraph, GateState, ReadinessGate};

pub use gitops::application_link;
pub use refresh::{detect_provider, parse_kubernetes_version};

/// Waiting on something another component is creating
pub const REQUEUE_DEPENDENCY: Duration = Duration::from_secs(10);
/// Waiting for a write to propagate to a controller we do not own
pub const REQUEUE_PROPAGATION: Duration = Duration::from_secs(20);
/// Waiting for the remote API server to report healthy
pub const REQUEUE_HEALTH: Duration = Duration::from_secs(30);
/// Waiting for machines or load balancers to roll out
pub const REQUEUE_ROLLOUT: Duration = Duration::from_secs(60);

const SUFFIX_LEN: usize = 5;

/// What the engine does after a phase
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Directive {
    /// Continue with the next phase
    Proceed,
    /// Stop the tick and retry after the given delay
    Requeue(Duration),
}

/// Record plus directive returned by a phase
#[derive(Clone, Debug)]
pub struct Transition {
    /// The record, possibly mutated
    pub cluster: ManagedCluster,
    /// What to do next
    pub directive: Directive,
}

impl Transition {
    /// Continue with the next phase
    pub fn proceed(cluster: ManagedCluster) -> Self {
        Self {
            cluster,
            directive: Directive::Proceed,
        }
    }

    /// Stop the tick and retry after `after`
    pub fn requeue(cluster: ManagedCluster, after: Duration) -> Self {
        Self {
            cluster,
            directive: Directive::Requeue(after),
        }
    }
}

/// One step of the provisioning pipeline
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Label and status migration from older controllers
    Migration,
    /// Observed-state bootstrap from the declared spec
    Defaults,
    /// Observed-state refresh from the remote cluster
    Refresh,
    /// Infrastructure instantiation request
    Instantiation,
    /// Control plane endpoint discovery
    Endpoint,
    /// Drift detection from `Ready` into scaling or upgrade
    Drift,
    /// Replica count reconciliation
    Scaling,
    /// Kubernetes version rollout
    Upgrade,
    /// Argo CD registration
    GitOps,
    /// Gateway exposure
    Gateway,
    /// Identity provider client registration
    Identity,
    /// Ingress and TLS exposure
    Ingress,
}

impl Phase {
    /// Fixed execution order
    pub const PIPELINE: [Phase; 12] = [
        Self::Migration,
        Self::Defaults,
        Self::Refresh,
        Self::Instantiation,
        Self::Endpoint,
        Self::Drift,
        Self::Scaling,
        Self::Upgrade,
        Self::GitOps,
        Self::Gateway,
        Self::Identity,
        Self::Ingress,
    ];

    /// Name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::Migration => "migration",
            Self::Defaults => "defaults",
            Self::Refresh => "refresh",
            Self::Instantiation => "instantiation",
            Self::Endpoint => "endpoint",
            Self::Drift => "drift",
            Self::Scaling => "scaling",
            Self::Upgrade => "upgrade",
            Self::GitOps => "gitops",
            Self::Gateway => "gateway",
            Self::Identity => "identity",
            Self::Ingress => "ingress",
        }
    }

    /// Readiness gate owned by this phase
    pub fn gate(&self) -> Option<ReadinessGate> {
        match self {
            Self::GitOps => Some(ReadinessGate::Argo),
            Self::Gateway => Some(ReadinessGate::Gateway),
            Self::Identity => Some(ReadinessGate::AuthClient),
            Self::Ingress => Some(ReadinessGate::Traefik),
            _ => None,
        }
    }

    async fn run(&self, cluster: ManagedCluster, ctx: &Context) -> Result<Transition, Error> {
        match self {
            Self::Migration => migration::run(cluster, ctx).await,
            Self::Defaults => Ok(defaults::run(cluster)),
            Self::Refresh => refresh::run(cluster, ctx).await,
            Self::Instantiation => instantiation::run(cluster, ctx).await,
            Self::Endpoint => endpoint::run(cluster, ctx).await,
            Self::Drift => Ok(drift::run(cluster)),
            Self::Scaling => scaling::run(cluster, ctx).await,
            Self::Upgrade => upgrade::run(cluster, ctx).await,
            Self::GitOps => gitops::run(cluster, ctx).await,
            Self::Gateway => gateway::run(cluster, ctx).await,
            Self::Identity => identity::run(cluster, ctx).await,
            Self::Ingress => ingress::run(cluster, ctx).await,
        }
    }
}

/// Result of one tick
#[derive(Debug)]
pub struct TickOutcome {
    /// Record to persist
    ///
    /// On error this is the record as it was before the failing phase.
    pub cluster: ManagedCluster,
    /// Directive of the tick, or the error that stopped it
    pub result: Result<Directive, Error>,
}

/// Run the pipeline once over a record
pub async fn run_tick(cluster: ManagedCluster, ctx: &Context) -> TickOutcome {
    let mut current = cluster;

    for phase in Phase::PIPELINE {
        if let Some(gate) = phase.gate() {
            match ctx.gates.evaluate(gate, &current.status_or_default()) {
                GateState::Runnable => {}
                state => {
                    trace!(phase = phase.name(), ?state, "skipping gated phase");
                    continue;
                }
            }
        }

        let checkpoint = current.clone();
        debug!(phase = phase.name(), "running phase");
        match phase.run(current, ctx).await {
            Ok(Transition {
                cluster,
                directive: Directive::Proceed,
            }) => {
                current = cluster;
                if let Some(gate) = phase.gate() {
                    gate.set(current.status_mut());
                    info!(cluster = %current.name_any(), gate = %gate, "readiness gate satisfied");
                }
            }
            Ok(Transition {
                mut cluster,
                directive: Directive::Requeue(after),
            }) => {
                debug!(phase = phase.name(), after_secs = after.as_secs(), "phase requested requeue");
                advance_phase(&mut cluster, &ctx.gates);
                return TickOutcome {
                    cluster,
                    result: Ok(Directive::Requeue(after)),
                };
            }
            Err(error) => {
                let mut cluster = checkpoint;
                advance_phase(&mut cluster, &ctx.gates);
                return TickOutcome {
                    cluster,
                    result: Err(error),
                };
            }
        }
    }

    advance_phase(&mut current, &ctx.gates);
    TickOutcome {
        cluster: current,
        result: Ok(Directive::Proceed),
    }
}

/// Move the lifecycle phase forward once its readiness conditions hold
///
/// `Processing → Sync Needed` once the control plane and GitOps gates are
/// set, `Sync Needed → Ready` once every gate is set. Both steps can happen
/// in the same call.
pub fn advance_phase(cluster: &mut ManagedCluster, gates: &GateGraph) {
    let name = cluster.name_any();
    let Some(status) = cluster.status.as_mut() else {
        return;
    };
    if let Some((gate, missing)) = gates.violation(status) {
        warn!(cluster = %name, %gate, %missing, "readiness gate set before its predecessor");
    }
    if status.phase == ClusterPhase::Processing
        && ReadinessGate::ControlPlane.is_set(status)
        && ReadinessGate::Argo.is_set(status)
    {
        status.phase = ClusterPhase::SyncNeeded;
    }
    if status.phase == ClusterPhase::SyncNeeded && gates.all_satisfied(status) {
        status.phase = ClusterPhase::Ready;
    }
}

/// Whether a record is fully converged: `Ready` with every gate set
pub fn is_converged(cluster: &ManagedCluster, gates: &GateGraph) -> bool {
    cluster.phase() == ClusterPhase::Ready && gates.all_satisfied(&cluster.status_or_default())
}

/// Random lowercase alphanumeric instantiation suffix
pub fn generate_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SUFFIX_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect()
}

/// Requeue directive for a create-if-absent that hit a terminating object
fn wait_if_terminating(ensured: Ensured) -> Option<Duration> {
    (ensured == Ensured::Terminating).then_some(REQUEUE_DEPENDENCY)
}
