//! Controller runner - builds the ManagedCluster controller future
//!
//! Construction is kept apart from `main` so the binary only composes
//! futures and never touches reconcile wiring.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use fleet_cluster::{error_policy, reconcile, Context};
use fleet_common::crd::ManagedCluster;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Build the ManagedCluster controller future
///
/// Watches every namespace unless `namespace` is given.
pub fn build_cluster_controllers(
    client: Client,
    ctx: Arc<Context>,
    namespace: Option<&str>,
) -> Vec<Pin<Box<dyn Future<Output = ()> + Send>>> {
    let clusters: Api<ManagedCluster> = match namespace {
        Some(ns) => {
            tracing::info!(namespace = %ns, "- ManagedCluster controller (namespaced)");
            Api::namespaced(client, ns)
        }
        None => {
            tracing::info!("- ManagedCluster controller");
            Api::all(client)
        }
    };

    vec![Box::pin(
        Controller::new(
            clusters,
            WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(log_reconcile_result("Cluster")),
    )]
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
