//! Custom Resource Definitions for Fleet

mod cluster;
mod types;

pub use cluster::{
    ManagedCluster, ManagedClusterSpec, ManagedClusterStatus, ANNOTATION_APISERVER,
    ANNOTATION_DOMAIN, ANNOTATION_GATEWAY, ANNOTATION_OWNER, ANNOTATION_SUFFIX,
    CLUSTER_FINALIZER, LABEL_CLUSTER_TYPE, LABEL_CLUSTER_TYPE_DEPRECATED,
};
pub use types::{AwsSpec, ClusterPhase, ClusterType, ProviderKind, VsphereSpec};
