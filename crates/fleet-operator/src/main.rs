//! Fleet Operator - ManagedCluster lifecycle management

mod controller_runner;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::{Api, Client, CustomResourceExt};

use fleet_cluster::config::{GitOpsSource, IdentityConfig};
use fleet_cluster::{Context, ControllerConfig};
use fleet_common::crd::ManagedCluster;
use fleet_common::kube_utils::create_client;
use fleet_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};

/// Fleet - operator that provisions, registers and integrates managed clusters
#[derive(Parser, Debug)]
#[command(name = "fleet-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Path to a kubeconfig; in-cluster or default config when unset
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Only watch ManagedClusters in this namespace
    #[arg(long, env = "FLEET_WATCH_NAMESPACE")]
    namespace: Option<String>,

    /// Platform domain used for links and ingress hosts
    #[arg(long, env = "FLEET_BASE_DOMAIN", default_value = "tmaxcloud.org")]
    base_domain: String,

    /// Identity provider base URL
    #[arg(
        long,
        env = "FLEET_IDENTITY_URL",
        default_value = "https://hyperauth.hyperauth.svc/auth"
    )]
    identity_url: String,

    /// Identity provider realm clients are registered in
    #[arg(long, env = "FLEET_IDENTITY_REALM", default_value = "tmax")]
    identity_realm: String,

    /// Namespace Argo CD runs in
    #[arg(long, env = "FLEET_ARGO_NAMESPACE", default_value = "argocd")]
    argo_namespace: String,

    /// Git repository per-cluster Applications pull from
    #[arg(
        long,
        env = "FLEET_GITOPS_REPO_URL",
        default_value = "https://github.com/tmax-cloud/argocd-installer"
    )]
    gitops_repo_url: String,

    /// Chart path inside the GitOps repository
    #[arg(long, env = "FLEET_GITOPS_REPO_PATH", default_value = "application/helm")]
    gitops_repo_path: String,

    /// Revision of the GitOps repository to track
    #[arg(long, env = "FLEET_GITOPS_REVISION", default_value = "main")]
    gitops_revision: String,

    /// cert-manager ClusterIssuer for cluster ingress certificates
    #[arg(long, env = "FLEET_CLUSTER_ISSUER", default_value = "tmaxcloud-issuer")]
    cluster_issuer: String,

    /// Seconds between resyncs of converged clusters
    #[arg(long, env = "FLEET_RESYNC_SECONDS", default_value_t = 300)]
    resync_seconds: u64,

    /// Deadline in seconds for one reconcile tick
    #[arg(long, env = "FLEET_TICK_TIMEOUT_SECONDS", default_value_t = 120)]
    tick_timeout_seconds: u64,

    /// Log output format (text or json)
    #[arg(long, env = "FLEET_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,
}

impl Cli {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            base_domain: self.base_domain.clone(),
            argo_namespace: self.argo_namespace.clone(),
            gitops: GitOpsSource {
                repo_url: self.gitops_repo_url.clone(),
                path: self.gitops_repo_path.clone(),
                revision: self.gitops_revision.clone(),
            },
            identity: IdentityConfig {
                url: self.identity_url.clone(),
                realm: self.identity_realm.clone(),
                ..IdentityConfig::default()
            },
            cluster_issuer: self.cluster_issuer.clone(),
            resync_interval: Duration::from_secs(self.resync_seconds),
            tick_timeout: Duration::from_secs(self.tick_timeout_seconds),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&ManagedCluster::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        service_name: "fleet-operator".to_string(),
        format: cli.log_format,
        filter: None,
    })?;

    run_controller(cli).await
}

/// Install the ManagedCluster CRD
///
/// The operator installs its own CRD on startup using server-side apply.
/// This ensures the CRD version always matches the operator version.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(fleet_common::FIELD_MANAGER).force();

    tracing::info!("Installing ManagedCluster CRD...");
    crds.patch(
        "managedclusters.fleet.dev",
        &params,
        &Patch::Apply(&ManagedCluster::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install ManagedCluster CRD: {}", e))?;

    Ok(())
}

async fn run_controller(cli: Cli) -> anyhow::Result<()> {
    tracing::info!("Fleet controller starting...");

    let client = create_client(cli.kubeconfig.as_deref())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;

    let config = cli.controller_config();
    tracing::info!(
        base_domain = %config.base_domain,
        argo_namespace = %config.argo_namespace,
        resync_secs = config.resync_interval.as_secs(),
        "controller configuration loaded"
    );
    let ctx = Arc::new(
        Context::builder(client.clone())
            .config(config)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build controller context: {}", e))?,
    );

    tracing::info!("Starting controllers:");
    let controllers =
        controller_runner::build_cluster_controllers(client, ctx, cli.namespace.as_deref());
    futures::future::join_all(controllers).await;

    tracing::info!("Fleet controller shutting down");
    Ok(())
}
