//! Common types for Fleet: CRDs, errors, events and Kubernetes utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager name used for every write the operator performs
pub const FIELD_MANAGER: &str = "fleet-controller";

/// Label marking resources created and owned by the operator
pub const MANAGED_BY_LABEL_KEY: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY_LABEL_KEY`] on operator-owned resources
pub const MANAGED_BY_LABEL_VALUE: &str = "fleet";

/// Label carrying the name of the owning ManagedCluster on derived resources
pub const CLUSTER_NAME_LABEL_KEY: &str = "fleet.dev/cluster-name";

/// Label carrying the namespace of the owning ManagedCluster on derived resources
pub const CLUSTER_NAMESPACE_LABEL_KEY: &str = "fleet.dev/cluster-namespace";
