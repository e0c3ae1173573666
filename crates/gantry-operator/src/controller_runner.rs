//! Controller runner - starts and manages the Kubernetes controllers
//!
//! Wires the EphemeralRunnerSet controller to its watch streams: the sets
//! themselves plus the owned runners and proxy secrets, so a change to any
//! child re-triggers the owning set's reconcile.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use gantry_common::crd::{EphemeralRunner, EphemeralRunnerSet};
use gantry_common::{LABEL_MANAGED_BY, LABEL_MANAGED_BY_GANTRY, LABEL_RUNNER_SET};
use gantry_runnerset::controller::{error_policy, reconcile, Context};

/// Run all controllers until shutdown
pub async fn run_controllers(client: Client) {
    tracing::info!("Starting Gantry controllers...");
    tracing::info!("- EphemeralRunnerSet controller");

    let ctx = Arc::new(Context::from_client(client.clone()));

    let runner_sets: Api<EphemeralRunnerSet> = Api::all(client.clone());
    let runners: Api<EphemeralRunner> = Api::all(client.clone());
    let secrets: Api<Secret> = Api::all(client);

    // Owned runners carry the set label, derived secrets the managed-by
    // label; restricting the watches keeps the reflector caches small
    let runner_watch = WatcherConfig::default().labels(LABEL_RUNNER_SET);
    let secret_watch = WatcherConfig::default()
        .labels(&format!("{}={}", LABEL_MANAGED_BY, LABEL_MANAGED_BY_GANTRY));

    Controller::new(runner_sets, WatcherConfig::default())
        .owns(runners, runner_watch)
        .owns(secrets, secret_watch)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => tracing::debug!(?action, "RunnerSet reconciliation completed"),
                Err(e) => tracing::error!(error = ?e, "RunnerSet reconciliation error"),
            }
        })
        .await;
}
