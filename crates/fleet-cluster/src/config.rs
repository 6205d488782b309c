//! Controller configuration
//!
//! Built by the operator binary from CLI flags and environment, then carried
//! in [`crate::controller::Context`] for every phase to read.

use std::time::Duration;

/// Default namespace Argo CD runs in
pub const DEFAULT_ARGO_NAMESPACE: &str = "argocd";
/// Default identity provider realm
pub const DEFAULT_IDENTITY_REALM: &str = "tmax";
/// Default cert-manager issuer for cluster ingress certificates
pub const DEFAULT_CLUSTER_ISSUER: &str = "tmaxcloud-issuer";
/// Default interval between resyncs of converged clusters
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(300);
/// Default deadline for a single reconcile tick
pub const DEFAULT_TICK_TIMEOUT: Duration = Duration::from_secs(120);

/// Where per-cluster Argo CD Applications pull their manifests from
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GitOpsSource {
    /// Git repository URL
    pub repo_url: String,
    /// Helm chart path inside the repository
    pub path: String,
    /// Revision to track
    pub revision: String,
}

impl Default for GitOpsSource {
    fn default() -> Self {
        Self {
            repo_url: "https://github.com/tmax-cloud/argocd-installer".to_string(),
            path: "application/helm".to_string(),
            revision: "main".to_string(),
        }
    }
}

/// Identity provider admin API settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityConfig {
    /// Base URL of the identity provider, e.g. `https://auth.example.com/auth`
    pub url: String,
    /// Realm clients are registered in
    pub realm: String,
    /// Admin user for the password grant
    pub admin_user: String,
    /// Namespace of the secret holding the admin password
    pub password_secret_namespace: String,
    /// Name of the secret holding the admin password
    pub password_secret_name: String,
    /// Key inside the password secret
    pub password_secret_key: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            url: "https://hyperauth.hyperauth.svc/auth".to_string(),
            realm: DEFAULT_IDENTITY_REALM.to_string(),
            admin_user: "admin".to_string(),
            password_secret_namespace: "hyperauth".to_string(),
            password_secret_name: "passwords".to_string(),
            password_secret_key: "HYPERAUTH_PASSWORD".to_string(),
        }
    }
}

/// Configuration shared by every reconcile
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Platform domain used for links and ingress hosts
    pub base_domain: String,
    /// Namespace Argo CD cluster secrets and Applications live in
    pub argo_namespace: String,
    /// GitOps source for per-cluster Applications
    pub gitops: GitOpsSource,
    /// Identity provider settings
    pub identity: IdentityConfig,
    /// cert-manager ClusterIssuer for ingress certificates
    pub cluster_issuer: String,
    /// Requeue interval once a cluster is fully converged
    pub resync_interval: Duration,
    /// Deadline for one reconcile tick
    pub tick_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            base_domain: "tmaxcloud.org".to_string(),
            argo_namespace: DEFAULT_ARGO_NAMESPACE.to_string(),
            gitops: GitOpsSource::default(),
            identity: IdentityConfig::default(),
            cluster_issuer: DEFAULT_CLUSTER_ISSUER.to_string(),
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            tick_timeout: DEFAULT_TICK_TIMEOUT,
        }
    }
}
