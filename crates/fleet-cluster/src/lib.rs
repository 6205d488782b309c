//! ManagedCluster lifecycle management for Fleet
//!
//! This crate provides the Kubernetes controller for ManagedCluster records
//! and the phase engine it drives: provisioning or registration, endpoint
//! discovery, scaling, upgrades, and the platform integrations (GitOps,
//! gateway, identity, ingress) every cluster gets.
//!
//! Related crates:
//! - `fleet-common`: CRD, errors, events and Kubernetes utilities
//! - `fleet-capi`: Cluster API access and infrastructure requests

pub mod cleanup;
pub mod config;
pub mod controller;
pub mod gates;
pub mod integrations;
pub mod phases;
pub mod remote;
pub mod store;

pub use config::ControllerConfig;
pub use controller::{error_policy, reconcile, Context, ContextBuilder};

pub use fleet_common::{Error, Result};

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use async_trait::async_trait;
    use dashmap::DashMap;
    use k8s_openapi::api::core::v1::{Node, NodeCondition, NodeSpec, NodeStatus, Secret};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;
    use kube::config::Kubeconfig;
    use kube::ResourceExt;
    use mockall::mock;

    use fleet_capi::{
        CapiClient, InfraProvisioner, InstanceRequest, InstanceState, MachineSummary, PoolKind,
        PoolObject,
    };
    use fleet_common::crd::{
        AwsSpec, ClusterPhase, ManagedCluster, ManagedClusterSpec, ANNOTATION_APISERVER,
        ANNOTATION_OWNER, ANNOTATION_SUFFIX, LABEL_CLUSTER_TYPE,
    };
    use fleet_common::events::NoopEventPublisher;
    use fleet_common::kube_utils::Ensured;
    use fleet_common::Error;

    use crate::cleanup::MockCleanupHandler;
    use crate::config::ControllerConfig;
    use crate::controller::Context;
    use crate::gates::{GateGraph, ReadinessGate};
    use crate::integrations::{
        MockGatewayRegistrar, MockGitOpsRegistrar, MockIdentityRegistrar, MockIngressRegistrar,
    };
    use crate::remote::{MockRemoteClusterReader, RemoteKubeconfig};
    use crate::store::MockClusterStore;

    // Local mocks for fleet-capi traits: the generated mocks only exist
    // under that crate's own test configuration
    mock! {
        pub Capi {}

        #[async_trait]
        impl CapiClient for Capi {
            async fn control_plane_endpoint(
                &self,
                namespace: &str,
                cluster: &str,
            ) -> Result<Option<String>, Error>;
            async fn get_pool(
                &self,
                namespace: &str,
                cluster: &str,
                pool: PoolKind,
            ) -> Result<Option<PoolObject>, Error>;
            async fn set_pool_replicas(
                &self,
                namespace: &str,
                cluster: &str,
                pool: PoolKind,
                replicas: u32,
            ) -> Result<(), Error>;
            async fn set_pool_version(
                &self,
                namespace: &str,
                cluster: &str,
                pool: PoolKind,
                version: &str,
                template: Option<String>,
            ) -> Result<(), Error>;
            async fn list_pool_machines(
                &self,
                namespace: &str,
                cluster: &str,
                pool: PoolKind,
            ) -> Result<Vec<MachineSummary>, Error>;
        }
    }

    mock! {
        pub Provisioner {}

        #[async_trait]
        impl InfraProvisioner for Provisioner {
            async fn find_instance_suffix(
                &self,
                namespace: &str,
                cluster: &str,
            ) -> Result<Option<String>, Error>;
            async fn get_instance(
                &self,
                namespace: &str,
                name: &str,
            ) -> Result<Option<InstanceState>, Error>;
            async fn create_instance(&self, request: &InstanceRequest) -> Result<Ensured, Error>;
            async fn delete_instances(&self, namespace: &str, cluster: &str) -> Result<usize, Error>;
        }
    }

    /// Every collaborator of a [`Context`], as mocks with no expectations
    #[derive(Default)]
    pub struct Mocks {
        pub store: MockClusterStore,
        pub remote: MockRemoteClusterReader,
        pub capi: MockCapi,
        pub provisioner: MockProvisioner,
        pub gitops: MockGitOpsRegistrar,
        pub gateway: MockGatewayRegistrar,
        pub identity: MockIdentityRegistrar,
        pub ingress: MockIngressRegistrar,
        pub cleanup: MockCleanupHandler,
    }

    impl Mocks {
        pub fn into_context(self) -> Context {
            Context {
                store: Arc::new(self.store),
                remote: Arc::new(self.remote),
                capi: Arc::new(self.capi),
                provisioner: Arc::new(self.provisioner),
                gitops: Arc::new(self.gitops),
                gateway: Arc::new(self.gateway),
                identity: Arc::new(self.identity),
                ingress: Arc::new(self.ingress),
                cleanup: Arc::new(self.cleanup),
                events: Arc::new(NoopEventPublisher),
                gates: GateGraph::chain(),
                config: ControllerConfig::default(),
                failures: DashMap::new(),
            }
        }
    }

    /// A created AWS cluster as first submitted: no status, no finalizer
    pub fn sample_cluster(name: &str) -> ManagedCluster {
        ManagedCluster {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("team-a".to_string()),
                uid: Some(format!("uid-{}", name)),
                annotations: Some(BTreeMap::from([(
                    ANNOTATION_OWNER.to_string(),
                    "alice@example.com".to_string(),
                )])),
                ..Default::default()
            },
            spec: ManagedClusterSpec {
                provider: "AWS".to_string(),
                version: "v1.29.4".to_string(),
                master_num: 3,
                worker_num: 2,
                aws: Some(AwsSpec::default()),
                vsphere: None,
            },
            status: None,
        }
    }

    /// A registered cluster with an empty declared spec
    pub fn registered_cluster(name: &str) -> ManagedCluster {
        let mut cluster = sample_cluster(name);
        cluster.labels_mut().insert(
            LABEL_CLUSTER_TYPE.to_string(),
            "registered".to_string(),
        );
        cluster.spec = ManagedClusterSpec::default();
        cluster
    }

    /// A created cluster every phase considers done
    pub fn converged_cluster(name: &str) -> ManagedCluster {
        let mut cluster = sample_cluster(name);
        cluster.set_annotation(ANNOTATION_SUFFIX, "x7k2p");
        cluster.set_annotation(ANNOTATION_APISERVER, "10.20.0.5");
        let status = cluster.status_mut();
        for gate in ReadinessGate::ALL {
            gate.set(status);
        }
        status.ready = true;
        status.gateway_ready_migration = true;
        status.phase = ClusterPhase::Ready;
        status.version = "v1.29.4".to_string();
        status.provider = "AWS".to_string();
        status.master_num = Some(3);
        status.worker_num = Some(2);
        status.master_run = 3;
        status.worker_run = 2;
        status.control_plane_endpoint = "10.20.0.5".to_string();
        status.application_link =
            "https://argocd.tmaxcloud.org/applications/team-a-edge-applications".to_string();
        cluster
    }

    /// Parsed kubeconfig pointing at `https://edge.example.com:6443`
    pub fn test_kubeconfig() -> RemoteKubeconfig {
        RemoteKubeconfig {
            raw: Kubeconfig::default(),
            server: "https://edge.example.com:6443".to_string(),
            ca_data: Some("Y2EtYnVuZGxl".to_string()),
        }
    }

    /// A node with an optional role label, conditions in order, and provider ID
    pub fn node(
        name: &str,
        role_label: Option<&str>,
        conditions: &[&str],
        provider_id: Option<&str>,
    ) -> Node {
        let labels = role_label
            .map(|l| BTreeMap::from([(l.to_string(), String::new())]))
            .unwrap_or_default();
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                provider_id: provider_id.map(str::to_string),
                ..Default::default()
            }),
            status: Some(NodeStatus {
                conditions: Some(
                    conditions
                        .iter()
                        .map(|c| NodeCondition {
                            type_: c.to_string(),
                            status: "True".to_string(),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
        }
    }

    /// A secret with one data entry
    pub fn secret_with(key: &str, value: &str) -> Secret {
        Secret {
            data: Some(BTreeMap::from([(
                key.to_string(),
                ByteString(value.as_bytes().to_vec()),
            )])),
            ..Default::default()
        }
    }
}
