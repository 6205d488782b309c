//! Error types for the Fleet operator
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the context needed to tell which cluster and which
//! external system a failure belongs to.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Fleet operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for CRD specs
    #[error("validation error for {cluster}: {message}")]
    Validation {
        /// Name of the cluster with invalid configuration
        cluster: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.provider")
        field: Option<String>,
    },

    /// Infrastructure provisioning error (service broker or CAPI objects)
    #[error("provisioning error for {cluster}: {message}")]
    Provisioning {
        /// Name of the cluster being provisioned
        cluster: String,
        /// Description of what failed
        message: String,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// Error talking to an integrated platform service
    #[error("integration error [{system}] for {cluster}: {message}")]
    Integration {
        /// External system (gitops, gateway, identity, ingress, remote)
        system: String,
        /// Name of the cluster being wired up
        cluster: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// A programming contract was violated
    ///
    /// Never retried: the same input produces the same violation.
    #[error("contract violation [{context}]: {message}")]
    Contract {
        /// Description of the violated contract
        message: String,
        /// Where the violation was detected
        context: String,
    },

    /// A reconcile tick exceeded its deadline
    #[error("reconcile of {cluster} timed out after {seconds}s")]
    Timeout {
        /// Name of the cluster whose tick timed out
        cluster: String,
        /// Deadline that was exceeded
        seconds: u64,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "controller")
        context: String,
    },
}

impl Error {
    /// Create a validation error with cluster context and field path
    pub fn validation_for_field(
        cluster: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a non-retryable provisioning error (e.g., missing suffix)
    pub fn provisioning_permanent(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Provisioning {
            cluster: cluster.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create an integration error for an external system
    pub fn integration(
        system: impl Into<String>,
        cluster: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Integration {
            system: system.into(),
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a contract violation error
    pub fn contract(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Contract {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Create a tick timeout error
    pub fn timeout(cluster: impl Into<String>, seconds: u64) -> Self {
        Self::Timeout {
            cluster: cluster.into(),
            seconds,
        }
    }

    /// Create an internal error with the given message
    ///
    /// For simple internal errors without specific context.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation, serialization and contract errors need a spec or code
    /// change. Kubernetes errors are retried unless the API server rejected
    /// the request with a 4xx (other than conflicts and throttling).
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae)
                    if (400..500).contains(&ae.code) && ae.code != 409 && ae.code != 429
            ),
            Error::Validation { .. } => false,
            Error::Provisioning { retryable, .. } => *retryable,
            Error::Integration { .. } => true,
            Error::Serialization { .. } => false,
            Error::Contract { .. } => false,
            Error::Timeout { .. } => true,
            Error::Internal { .. } => true,
        }
    }

    /// Get the cluster name if this error is associated with a specific cluster
    pub fn cluster(&self) -> Option<&str> {
        match self {
            Error::Validation { cluster, .. } => Some(cluster),
            Error::Provisioning { cluster, .. } => Some(cluster),
            Error::Integration { cluster, .. } => Some(cluster),
            Error::Timeout { cluster, .. } => Some(cluster),
            Error::Kube { .. }
            | Error::Serialization { .. }
            | Error::Contract { .. }
            | Error::Internal { .. } => None,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Contract { context, .. } => Some(context),
            Error::Internal { context, .. } => Some(context),
            Error::Integration { system, .. } => Some(system),
            _ => None,
        }
    }
}

/// Returns true when the kube error is an API 404
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Returns true when the kube error is an API 409 (already exists / conflict)
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: "Test".to_string(),
            code,
        })
    }

    // ==========================================================================
    // Story Tests: how failures are classified for the controller
    // ==========================================================================

    /// Story: a user declares a provider we cannot provision
    ///
    /// Validation errors carry the cluster and field so the event on the
    /// ManagedCluster points at the exact spec path.
    #[test]
    fn story_validation_points_at_the_field() {
        let err = Error::validation_for_field("prod", "spec.provider", "unsupported provider");
        assert!(err.to_string().contains("validation error for prod"));
        match &err {
            Error::Validation { field, .. } => assert_eq!(field.as_deref(), Some("spec.provider")),
            _ => panic!("Expected Validation variant"),
        }
        assert!(!err.is_retryable());
        assert_eq!(err.cluster(), Some("prod"));
    }

    /// Story: two parameter payloads both define the same key
    ///
    /// That can only come from a code change, so the controller must stop
    /// retrying until the object changes.
    #[test]
    fn story_contract_violation_is_never_retried() {
        let err = Error::contract("parameters", "key 'namespace' defined twice");
        assert!(err.to_string().contains("contract violation [parameters]"));
        assert!(!err.is_retryable());
        assert_eq!(err.context(), Some("parameters"));
        assert_eq!(err.cluster(), None);
    }

    /// Story: the identity provider is briefly unavailable
    #[test]
    fn story_integration_errors_are_retryable() {
        let err = Error::integration("identity", "dev", "connection refused");
        assert!(err.is_retryable());
        assert_eq!(err.cluster(), Some("dev"));
        assert_eq!(err.context(), Some("identity"));
        assert!(err.to_string().contains("[identity]"));
    }

    /// Story: a tick hangs on an unreachable remote API server
    #[test]
    fn story_tick_timeout_is_retryable() {
        let err = Error::timeout("edge-1", 120);
        assert!(err.is_retryable());
        assert!(err.to_string().contains("120s"));
        assert_eq!(err.cluster(), Some("edge-1"));
    }

    #[test]
    fn provisioning_permanent_is_not_retryable() {
        let busy = Error::Provisioning {
            cluster: "c".to_string(),
            message: "broker busy".to_string(),
            retryable: true,
        };
        assert!(busy.is_retryable());
        assert!(!Error::provisioning_permanent("c", "suffix missing").is_retryable());
    }

    #[test]
    fn kube_conflicts_and_throttling_are_retryable() {
        assert!(Error::from(api_error(409)).is_retryable());
        assert!(Error::from(api_error(429)).is_retryable());
        assert!(Error::from(api_error(500)).is_retryable());
        assert!(!Error::from(api_error(403)).is_retryable());
        assert!(!Error::from(api_error(422)).is_retryable());
    }

    #[test]
    fn not_found_and_conflict_helpers() {
        assert!(is_not_found(&api_error(404)));
        assert!(!is_not_found(&api_error(409)));
        assert!(is_conflict(&api_error(409)));
        assert!(!is_conflict(&api_error(404)));
    }

    #[test]
    fn internal_error_default_context() {
        let err = Error::internal("unexpected state");
        assert_eq!(err.context(), Some(UNKNOWN_CONTEXT));
        assert!(err.to_string().contains("[unknown]"));
        assert!(err.is_retryable());
    }

    #[test]
    fn serialization_error_keeps_kind() {
        let err = Error::serialization_for_kind("ServiceInstance", "missing field 'spec'");
        match &err {
            Error::Serialization { kind, .. } => assert_eq!(kind.as_deref(), Some("ServiceInstance")),
            _ => panic!("Expected Serialization variant"),
        }
        assert!(!err.is_retryable());
    }
}
