//! Readiness gate graph
//!
//! Each integration phase owns one readiness flag on the record status. A
//! gate may only be worked on once every predecessor gate is satisfied, and
//! once satisfied it is never worked on again. The default graph is the
//! chain `ControlPlane → Argo → Gateway → AuthClient → Traefik`.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use fleet_common::crd::ManagedClusterStatus;
use fleet_common::Error;

/// A named readiness flag on the record status
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReadinessGate {
    /// `controlPlaneReady`
    ControlPlane,
    /// `argoReady`
    Argo,
    /// `gatewayReady`
    Gateway,
    /// `authClientReady`
    AuthClient,
    /// `traefikReady`
    Traefik,
}

impl ReadinessGate {
    /// Every gate, in chain order
    pub const ALL: [ReadinessGate; 5] = [
        Self::ControlPlane,
        Self::Argo,
        Self::Gateway,
        Self::AuthClient,
        Self::Traefik,
    ];

    /// Whether the flag is set on a status
    pub fn is_set(&self, status: &ManagedClusterStatus) -> bool {
        match self {
            Self::ControlPlane => status.control_plane_ready,
            Self::Argo => status.argo_ready,
            Self::Gateway => status.gateway_ready,
            Self::AuthClient => status.auth_client_ready,
            Self::Traefik => status.traefik_ready,
        }
    }

    /// Set the flag on a status; flags are never cleared
    pub fn set(&self, status: &mut ManagedClusterStatus) {
        match self {
            Self::ControlPlane => status.control_plane_ready = true,
            Self::Argo => status.argo_ready = true,
            Self::Gateway => status.gateway_ready = true,
            Self::AuthClient => status.auth_client_ready = true,
            Self::Traefik => status.traefik_ready = true,
        }
    }

    /// Status field name
    pub fn field(&self) -> &'static str {
        match self {
            Self::ControlPlane => "controlPlaneReady",
            Self::Argo => "argoReady",
            Self::Gateway => "gatewayReady",
            Self::AuthClient => "authClientReady",
            Self::Traefik => "traefikReady",
        }
    }
}

impl std::fmt::Display for ReadinessGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.field())
    }
}

/// Evaluation result for one gate
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateState {
    /// The flag is already set; the owning phase is a no-op
    Satisfied,
    /// A predecessor is not set yet
    Blocked(ReadinessGate),
    /// Predecessors satisfied, own flag unset: the owning phase may run
    Runnable,
}

/// Directed acyclic graph of gate dependencies
#[derive(Clone, Debug)]
pub struct GateGraph {
    predecessors: BTreeMap<ReadinessGate, BTreeSet<ReadinessGate>>,
}

impl Default for GateGraph {
    fn default() -> Self {
        Self::chain()
    }
}

impl GateGraph {
    /// The linear chain over [`ReadinessGate::ALL`]
    pub fn chain() -> Self {
        let edges: Vec<_> = ReadinessGate::ALL
            .windows(2)
            .map(|pair| (pair[0], pair[1]))
            .collect();
        let mut predecessors: BTreeMap<_, BTreeSet<_>> = BTreeMap::new();
        for (from, to) in edges {
            predecessors.entry(to).or_default().insert(from);
        }
        Self { predecessors }
    }

    /// Build a graph from `(predecessor, gate)` edges
    ///
    /// Rejects cycles.
    pub fn new(edges: &[(ReadinessGate, ReadinessGate)]) -> Result<Self, Error> {
        let mut predecessors: BTreeMap<_, BTreeSet<_>> = BTreeMap::new();
        for (from, to) in edges {
            if from == to {
                return Err(Error::contract(
                    "gate_graph",
                    format!("gate {} depends on itself", to),
                ));
            }
            predecessors.entry(*to).or_default().insert(*from);
        }
        let graph = Self { predecessors };
        graph.check_acyclic()?;
        Ok(graph)
    }

    fn check_acyclic(&self) -> Result<(), Error> {
        let mut in_degree: BTreeMap<ReadinessGate, usize> =
            ReadinessGate::ALL.iter().map(|g| (*g, 0)).collect();
        for (gate, preds) in &self.predecessors {
            in_degree.insert(*gate, preds.len());
        }

        let mut queue: VecDeque<_> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(g, _)| *g)
            .collect();
        let mut visited = 0;
        while let Some(gate) = queue.pop_front() {
            visited += 1;
            for (succ, preds) in &self.predecessors {
                if preds.contains(&gate) {
                    if let Some(d) = in_degree.get_mut(succ) {
                        *d -= 1;
                        if *d == 0 {
                            queue.push_back(*succ);
                        }
                    }
                }
            }
        }

        if visited != in_degree.len() {
            return Err(Error::contract("gate_graph", "gate dependencies form a cycle"));
        }
        Ok(())
    }

    /// Direct predecessors of a gate
    pub fn predecessors(&self, gate: ReadinessGate) -> impl Iterator<Item = ReadinessGate> + '_ {
        self.predecessors.get(&gate).into_iter().flatten().copied()
    }

    /// Evaluate one gate against a status
    pub fn evaluate(&self, gate: ReadinessGate, status: &ManagedClusterStatus) -> GateState {
        if gate.is_set(status) {
            return GateState::Satisfied;
        }
        match self.predecessors(gate).find(|p| !p.is_set(status)) {
            Some(blocker) => GateState::Blocked(blocker),
            None => GateState::Runnable,
        }
    }

    /// Whether every gate is set
    pub fn all_satisfied(&self, status: &ManagedClusterStatus) -> bool {
        ReadinessGate::ALL.iter().all(|g| g.is_set(status))
    }

    /// First gate that is set while one of its predecessors is not
    pub fn violation(&self, status: &ManagedClusterStatus) -> Option<(ReadinessGate, ReadinessGate)> {
        self.predecessors.iter().find_map(|(gate, preds)| {
            if !gate.is_set(status) {
                return None;
            }
            preds
                .iter()
                .find(|p| !p.is_set(status))
                .map(|p| (*gate, *p))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn status_with(gates: &[ReadinessGate]) -> ManagedClusterStatus {
        let mut status = ManagedClusterStatus::default();
        for g in gates {
            g.set(&mut status);
        }
        status
    }

    #[rstest]
    #[case::nothing_set(&[], ReadinessGate::Argo, GateState::Blocked(ReadinessGate::ControlPlane))]
    #[case::control_plane_ready(&[ReadinessGate::ControlPlane], ReadinessGate::Argo, GateState::Runnable)]
    #[case::already_set(
        &[ReadinessGate::ControlPlane, ReadinessGate::Argo],
        ReadinessGate::Argo,
        GateState::Satisfied
    )]
    #[case::skips_ahead(
        &[ReadinessGate::ControlPlane],
        ReadinessGate::Gateway,
        GateState::Blocked(ReadinessGate::Argo)
    )]
    #[case::root_gate(&[], ReadinessGate::ControlPlane, GateState::Runnable)]
    fn chain_evaluation(
        #[case] set: &[ReadinessGate],
        #[case] gate: ReadinessGate,
        #[case] expected: GateState,
    ) {
        let graph = GateGraph::chain();
        assert_eq!(graph.evaluate(gate, &status_with(set)), expected);
    }

    #[test]
    fn all_satisfied_requires_every_gate() {
        let graph = GateGraph::chain();
        let mut status = status_with(&ReadinessGate::ALL[..4]);
        assert!(!graph.all_satisfied(&status));
        ReadinessGate::Traefik.set(&mut status);
        assert!(graph.all_satisfied(&status));
    }

    #[test]
    fn violation_detects_flag_set_out_of_order() {
        let graph = GateGraph::chain();
        assert_eq!(graph.violation(&status_with(&ReadinessGate::ALL)), None);

        let status = status_with(&[ReadinessGate::ControlPlane, ReadinessGate::Gateway]);
        assert_eq!(
            graph.violation(&status),
            Some((ReadinessGate::Gateway, ReadinessGate::Argo))
        );
    }

    #[test]
    fn cycles_are_rejected() {
        let edges = [
            (ReadinessGate::Argo, ReadinessGate::Gateway),
            (ReadinessGate::Gateway, ReadinessGate::Argo),
        ];
        assert!(GateGraph::new(&edges).is_err());
        assert!(GateGraph::new(&[(ReadinessGate::Argo, ReadinessGate::Argo)]).is_err());
    }

    #[test]
    fn custom_graph_allows_parallel_gates() {
        let graph = GateGraph::new(&[
            (ReadinessGate::ControlPlane, ReadinessGate::Argo),
            (ReadinessGate::ControlPlane, ReadinessGate::Gateway),
        ])
        .unwrap();
        let status = status_with(&[ReadinessGate::ControlPlane]);
        assert_eq!(graph.evaluate(ReadinessGate::Gateway, &status), GateState::Runnable);
        assert_eq!(graph.evaluate(ReadinessGate::Argo, &status), GateState::Runnable);
    }
}
