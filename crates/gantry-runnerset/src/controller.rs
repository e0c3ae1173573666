//! EphemeralRunnerSet controller implementation
//!
//! This module implements the reconciliation logic for EphemeralRunnerSet
//! resources. It follows the Kubernetes controller pattern: observe current
//! state, determine desired state, calculate diff, and apply changes.
//!
//! Each pass lists the owned runner population, asks the pure selector for a
//! scale plan, and executes it: finished runners are reaped, surplus runners
//! are deregistered from the dispatch service and deleted, missing runners
//! are created from the template snapshot. A finalizer holds the set alive
//! until every runner is drained and deregistered.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use gantry_common::NoopEventPublisher;
#[cfg(test)]
use mockall::automock;

use gantry_common::crd::{
    EphemeralRunner, EphemeralRunnerSet, EphemeralRunnerSetStatus, ProxyConfig,
};
use gantry_common::events::{EventPublisher, RunnerSetEvent};
use gantry_common::metrics::{self, ReconcileTimer, RunnerState};
use gantry_common::{
    Error, KubeEventPublisher, ANNOTATION_PATCH_ID, GITHUB_TOKEN_KEY, LABEL_MANAGED_BY,
    LABEL_MANAGED_BY_GANTRY, LABEL_RUNNER_SET,
};

use gantry_actions::{
    DispatchClient, DispatchClientFactory, DispatchConfig, HttpDispatchClientFactory,
};

use crate::proxy::{proxy_secret_name, resolved_proxy, secret_data};
use crate::selector::{self, ObservedCounts};

/// Finalizer blocking EphemeralRunnerSet reclamation until teardown completes
pub const EPHEMERAL_RUNNER_SET_FINALIZER: &str = "ephemeralrunnerset.actions.github.com/finalizer";

/// Field manager for all writes issued by this controller
const FIELD_MANAGER: &str = "gantry-runnerset-controller";

/// Helper function to get a Kubernetes resource by name, returning None if not found.
///
/// This reduces boilerplate for the common pattern of handling 404 errors when
/// fetching resources that may or may not exist.
async fn get_optional<K>(api: &Api<K>, name: &str) -> Result<Option<K>, Error>
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug,
{
    match api.get(name).await {
        Ok(resource) => Ok(Some(resource)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

// =============================================================================
// Traits for dependency injection and testability
// =============================================================================

/// Trait abstracting Kubernetes client operations for EphemeralRunnerSet
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RunnerSetKubeClient: Send + Sync {
    /// Patch the status of an EphemeralRunnerSet
    async fn patch_status(
        &self,
        name: &str,
        namespace: &str,
        status: &EphemeralRunnerSetStatus,
    ) -> Result<(), Error>;

    /// List the runners owned by the named set in the given namespace
    async fn list_runners(
        &self,
        namespace: &str,
        runner_set: &str,
    ) -> Result<Vec<EphemeralRunner>, Error>;

    /// Create a runner object
    async fn create_runner(&self, namespace: &str, runner: &EphemeralRunner) -> Result<(), Error>;

    /// Delete a runner by name; a runner already gone is success
    async fn delete_runner(&self, name: &str, namespace: &str) -> Result<(), Error>;

    /// Get a Secret by name and namespace
    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, Error>;

    /// Create or update a Secret via server-side apply
    async fn apply_secret(&self, namespace: &str, secret: &Secret) -> Result<(), Error>;

    /// Delete a Secret by name; a secret already gone is success
    async fn delete_secret(&self, name: &str, namespace: &str) -> Result<(), Error>;

    /// Add a finalizer to an EphemeralRunnerSet
    async fn add_finalizer(
        &self,
        name: &str,
        namespace: &str,
        finalizer: &str,
    ) -> Result<(), Error>;

    /// Remove a finalizer from an EphemeralRunnerSet
    async fn remove_finalizer(
        &self,
        name: &str,
        namespace: &str,
        finalizer: &str,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct RunnerSetKubeClientImpl {
    client: Client,
}

impl RunnerSetKubeClientImpl {
    /// Create a new RunnerSetKubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RunnerSetKubeClient for RunnerSetKubeClientImpl {
    async fn patch_status(
        &self,
        name: &str,
        namespace: &str,
        status: &EphemeralRunnerSetStatus,
    ) -> Result<(), Error> {
        let api: Api<EphemeralRunnerSet> = Api::namespaced(self.client.clone(), namespace);
        let status_patch = serde_json::json!({ "status": status });

        api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&status_patch),
        )
        .await?;

        Ok(())
    }

    async fn list_runners(
        &self,
        namespace: &str,
        runner_set: &str,
    ) -> Result<Vec<EphemeralRunner>, Error> {
        let api: Api<EphemeralRunner> = Api::namespaced(self.client.clone(), namespace);
        let params =
            ListParams::default().labels(&format!("{}={}", LABEL_RUNNER_SET, runner_set));
        let list = api.list(&params).await?;
        Ok(list.items)
    }

    async fn create_runner(&self, namespace: &str, runner: &EphemeralRunner) -> Result<(), Error> {
        let api: Api<EphemeralRunner> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), runner).await?;
        Ok(())
    }

    async fn delete_runner(&self, name: &str, namespace: &str) -> Result<(), Error> {
        let api: Api<EphemeralRunner> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        get_optional(&api, name).await
    }

    async fn apply_secret(&self, namespace: &str, secret: &Secret) -> Result<(), Error> {
        let name = secret.metadata.name.as_deref().ok_or_else(|| {
            Error::internal_with_context("apply_secret", "secret has no name")
        })?;
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(secret),
        )
        .await?;
        Ok(())
    }

    async fn delete_secret(&self, name: &str, namespace: &str) -> Result<(), Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn add_finalizer(
        &self,
        name: &str,
        namespace: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        let api: Api<EphemeralRunnerSet> = Api::namespaced(self.client.clone(), namespace);

        let runner_set = match get_optional(&api, name).await? {
            Some(rs) => rs,
            None => {
                debug!(runner_set = %name, "runner set not found, skipping finalizer addition");
                return Ok(());
            }
        };

        let mut finalizers = runner_set.metadata.finalizers.unwrap_or_default();
        if finalizers.contains(&finalizer.to_string()) {
            return Ok(());
        }
        finalizers.push(finalizer.to_string());

        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }

    async fn remove_finalizer(
        &self,
        name: &str,
        namespace: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        let api: Api<EphemeralRunnerSet> = Api::namespaced(self.client.clone(), namespace);

        let runner_set = match get_optional(&api, name).await? {
            Some(rs) => rs,
            None => {
                debug!(runner_set = %name, "runner set not found, finalizer already removed");
                return Ok(());
            }
        };

        let finalizers: Vec<String> = runner_set
            .metadata
            .finalizers
            .map(|f| f.into_iter().filter(|s| s != finalizer).collect())
            .unwrap_or_default();

        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }
}

// =============================================================================
// Controller context
// =============================================================================

/// Controller context containing shared state and clients
///
/// The context is shared across all reconciliation calls and holds resources
/// that are expensive to create, like the Kubernetes client and the dispatch
/// client cache.
pub struct Context {
    /// Kubernetes client for API operations
    pub kube: Arc<dyn RunnerSetKubeClient>,
    /// Factory producing authenticated dispatch service clients
    pub dispatch: Arc<dyn DispatchClientFactory>,
    /// Event publisher for emitting Kubernetes Events
    pub events: Arc<dyn EventPublisher>,
}

impl Context {
    /// Create a new Context with the given dependencies
    pub fn new(
        kube: Arc<dyn RunnerSetKubeClient>,
        dispatch: Arc<dyn DispatchClientFactory>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            kube,
            dispatch,
            events,
        }
    }

    /// Create a production Context from a Kubernetes client
    pub fn from_client(client: Client) -> Self {
        let events = Arc::new(KubeEventPublisher::new(client.clone(), FIELD_MANAGER));
        Self {
            kube: Arc::new(RunnerSetKubeClientImpl::new(client)),
            dispatch: Arc::new(HttpDispatchClientFactory::new()),
            events,
        }
    }

    /// Create a context for testing with mock clients
    #[cfg(test)]
    fn for_testing(
        kube: Arc<dyn RunnerSetKubeClient>,
        dispatch: Arc<dyn DispatchClientFactory>,
    ) -> Self {
        Self {
            kube,
            dispatch,
            events: Arc::new(NoopEventPublisher),
        }
    }
}

// =============================================================================
// Reconciliation
// =============================================================================

/// Reconcile an EphemeralRunnerSet resource
///
/// Called whenever the set or one of its owned runners changes. Re-running a
/// pass on identical observed state yields zero mutations; correctness
/// depends only on the latest snapshot, never on event ordering.
#[instrument(
    skip(runner_set, ctx),
    fields(
        runner_set = %runner_set.name_any(),
        replicas = runner_set.spec.replicas,
    )
)]
pub async fn reconcile(
    runner_set: Arc<EphemeralRunnerSet>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    let name = runner_set.name_any();
    let timer = ReconcileTimer::start(&name);
    info!("reconciling runner set");

    let namespace = match runner_set.metadata.namespace.as_deref() {
        Some(ns) => ns,
        None => {
            error!("EphemeralRunnerSet is missing a namespace");
            timer.error("permanent");
            return Ok(Action::await_change());
        }
    };

    // Handle deletion via finalizer
    if runner_set.metadata.deletion_timestamp.is_some() {
        let result = handle_deletion(&runner_set, namespace, &ctx).await;
        match &result {
            Ok(_) => timer.success(),
            Err(e) => timer.error(error_type(e)),
        }
        return result;
    }

    // Ensure the finalizer is present before any runner exists; without it
    // a deleted set would orphan dispatch-service registrations
    if !has_finalizer(&runner_set) {
        debug!("adding finalizer");
        if let Err(e) = ctx
            .kube
            .add_finalizer(&name, namespace, EPHEMERAL_RUNNER_SET_FINALIZER)
            .await
        {
            timer.error(error_type(&e));
            return Err(e);
        }
        timer.success();
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    let result = reconcile_active(&runner_set, namespace, &ctx).await;
    match &result {
        Ok(_) => timer.success(),
        Err(e) => timer.error(error_type(e)),
    }
    result
}

/// Error policy for the controller
///
/// Called when reconciliation fails. Retryable errors (conflicts, network,
/// dispatch 5xx, missing dependencies) requeue with backoff; permanent errors
/// wait for a spec change.
pub fn error_policy(
    runner_set: Arc<EphemeralRunnerSet>,
    error: &Error,
    _ctx: Arc<Context>,
) -> Action {
    error!(
        ?error,
        runner_set = %runner_set.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(Duration::from_secs(30))
    } else {
        Action::await_change()
    }
}

/// One live (non-deleting) reconcile pass: spec.replicas vs observed runners
async fn reconcile_active(
    runner_set: &EphemeralRunnerSet,
    namespace: &str,
    ctx: &Context,
) -> Result<Action, Error> {
    let name = runner_set.name_any();

    if let Err(e) = runner_set.spec.validate(&name) {
        warn!(error = %e, "runner set validation failed");
        ctx.events
            .publish(
                &runner_set.object_ref(&()),
                RunnerSetEvent::ValidationFailed {
                    message: e.to_string(),
                },
            )
            .await;
        // Don't requeue for validation errors - they require spec changes
        return Ok(Action::await_change());
    }

    // Proxy phase: materialize the flattened secret before any runner that
    // would reference it exists
    let proxy_secret_ref = match ensure_proxy_secret(runner_set, namespace, ctx).await {
        Ok(r) => r,
        Err(e @ Error::DependencyMissing { .. }) => {
            debug!(error = %e, "waiting for proxy credential secret");
            ctx.events
                .publish(
                    &runner_set.object_ref(&()),
                    RunnerSetEvent::DependencyMissing {
                        message: e.to_string(),
                    },
                )
                .await;
            return Err(e);
        }
        Err(e) => return Err(e),
    };

    let runners = ctx.kube.list_runners(namespace, &name).await?;
    let plan = selector::plan(&runners, runner_set.spec.replicas, runner_set.spec.patch_id);
    debug!(
        observed = plan.counts.total,
        to_create = plan.to_create,
        to_reap = plan.to_reap.len(),
        to_delete = plan.to_delete.len(),
        "computed scale plan"
    );

    // Reap finished runners; the worker already exited, nothing to deregister
    for candidate in &plan.to_reap {
        ctx.kube.delete_runner(&candidate.name, namespace).await?;
    }
    if !plan.to_reap.is_empty() {
        info!(count = plan.to_reap.len(), "reaped finished runners");
        ctx.events
            .publish(
                &runner_set.object_ref(&()),
                RunnerSetEvent::FinishedReaped {
                    reaped: plan.to_reap.len(),
                },
            )
            .await;
    }

    // Scale down: registered runners must be removed from the dispatch
    // service first; unregistered ones have no assignment to rescind and are
    // deleted directly
    let mut deferred = 0usize;
    if !plan.to_delete.is_empty() {
        let client = if plan.to_delete.iter().any(|c| c.runner_id != 0) {
            Some(dispatch_client(runner_set, namespace, ctx).await?)
        } else {
            None
        };

        let mut deleted = 0usize;
        for candidate in &plan.to_delete {
            if candidate.runner_id != 0 {
                if let Some(client) = client.as_ref() {
                    match client.remove_runner(candidate.runner_id).await {
                        Ok(()) => metrics::record_dispatch_result("success"),
                        Err(e) if e.is_retryable() => {
                            metrics::record_dispatch_result("transient");
                            warn!(
                                runner = %candidate.name,
                                error = %e,
                                "deregistration failed, keeping runner for retry"
                            );
                            ctx.events
                                .publish(
                                    &runner_set.object_ref(&()),
                                    RunnerSetEvent::DispatchFailed {
                                        runner: candidate.name.clone(),
                                        message: e.to_string(),
                                    },
                                )
                                .await;
                            deferred += 1;
                            continue;
                        }
                        Err(e) => {
                            metrics::record_dispatch_result("permanent");
                            return Err(Error::dispatch_permanent(&name, e.to_string()));
                        }
                    }
                }
            }
            ctx.kube.delete_runner(&candidate.name, namespace).await?;
            deleted += 1;
        }

        if deleted > 0 {
            info!(count = deleted, "scaled down runners");
            ctx.events
                .publish(
                    &runner_set.object_ref(&()),
                    RunnerSetEvent::ScaledDown { deleted },
                )
                .await;
        }
    }

    // Scale up: snapshot the template once; the API server generates a fresh
    // name suffix per create, so collisions are its problem, not ours
    if plan.to_create > 0 {
        let runner = desired_runner(runner_set, proxy_secret_ref.as_deref());
        for _ in 0..plan.to_create {
            ctx.kube.create_runner(namespace, &runner).await?;
        }
        info!(count = plan.to_create, "created runners");
        ctx.events
            .publish(
                &runner_set.object_ref(&()),
                RunnerSetEvent::ScaledUp {
                    created: plan.to_create,
                },
            )
            .await;
    }

    update_status(runner_set, namespace, ctx, status_from(&plan.counts)).await?;
    record_runner_metrics(&name, &plan.counts);

    if deferred > 0 {
        // Some deregistrations failed transiently; come back quickly
        return Ok(Action::requeue(Duration::from_secs(10)));
    }
    Ok(Action::requeue(Duration::from_secs(60)))
}

// =============================================================================
// Teardown
// =============================================================================

/// Handle runner set deletion: drain runners, deregister, remove finalizer
///
/// Runners holding a job are respected even here — teardown waits for the
/// per-runner controller to flip them to a terminal phase. Failed runners,
/// unlike during scale-down, are deleted. If the dispatch service stays
/// unreachable teardown blocks with the finalizer in place: stuck deletion
/// is preferred over silent dispatch-registry leaks.
async fn handle_deletion(
    runner_set: &EphemeralRunnerSet,
    namespace: &str,
    ctx: &Context,
) -> Result<Action, Error> {
    let name = runner_set.name_any();

    if !has_finalizer(runner_set) {
        debug!("no finalizer, allowing deletion");
        return Ok(Action::await_change());
    }

    info!("tearing down runner set");
    let runners = ctx.kube.list_runners(namespace, &name).await?;

    if runners.is_empty() {
        if runner_set.spec.ephemeral_runner_spec.proxy.is_some() {
            let secret_name = proxy_secret_name(&name);
            // Best effort: the owner reference reaps it if this fails
            if let Err(e) = ctx.kube.delete_secret(&secret_name, namespace).await {
                warn!(
                    secret = %secret_name,
                    error = %e,
                    "failed to delete proxy secret, leaving it to garbage collection"
                );
            }
        }
        ctx.kube
            .remove_finalizer(&name, namespace, EPHEMERAL_RUNNER_SET_FINALIZER)
            .await?;
        info!("teardown complete, finalizer removed");
        ctx.events
            .publish(
                &runner_set.object_ref(&()),
                RunnerSetEvent::TeardownComplete,
            )
            .await;
        return Ok(Action::await_change());
    }

    let blocked_by_job = |r: &EphemeralRunner| r.has_job() && !r.is_done();

    let needs_dispatch = runners
        .iter()
        .any(|r| !blocked_by_job(r) && r.is_configured());
    let client = if needs_dispatch {
        Some(dispatch_client(runner_set, namespace, ctx).await?)
    } else {
        None
    };

    let mut blocked = 0usize;
    for runner in &runners {
        if blocked_by_job(runner) {
            blocked += 1;
            continue;
        }

        let runner_name = runner.name_any();
        if runner.is_configured() {
            if let Some(client) = client.as_ref() {
                match client.remove_runner(runner.runner_id()).await {
                    Ok(()) => metrics::record_dispatch_result("success"),
                    Err(e) if e.is_retryable() => {
                        metrics::record_dispatch_result("transient");
                        warn!(
                            runner = %runner_name,
                            error = %e,
                            "deregistration failed during teardown, will retry"
                        );
                        blocked += 1;
                        continue;
                    }
                    Err(e) => {
                        metrics::record_dispatch_result("permanent");
                        return Err(Error::dispatch_permanent(&name, e.to_string()));
                    }
                }
            }
        }
        ctx.kube.delete_runner(&runner_name, namespace).await?;
    }

    if blocked > 0 {
        debug!(blocked, "teardown waiting on runners");
        ctx.events
            .publish(
                &runner_set.object_ref(&()),
                RunnerSetEvent::TeardownBlocked { waiting: blocked },
            )
            .await;
        return Ok(Action::requeue(Duration::from_secs(30)));
    }

    // All deletions issued; requeue to observe the empty population and
    // finish the cascade
    Ok(Action::requeue(Duration::from_secs(5)))
}

// =============================================================================
// Proxy secret
// =============================================================================

/// Materialize the flattened proxy secret, returning its name when proxy is
/// configured.
///
/// The write is skipped when the stored secret already matches byte-for-byte,
/// so converged passes stay mutation-free.
async fn ensure_proxy_secret(
    runner_set: &EphemeralRunnerSet,
    namespace: &str,
    ctx: &Context,
) -> Result<Option<String>, Error> {
    let name = runner_set.name_any();
    let secret_name = proxy_secret_name(&name);

    let Some(proxy) = &runner_set.spec.ephemeral_runner_spec.proxy else {
        // Proxy removed from the spec: the derived secret must not outlive it
        if ctx.kube.get_secret(&secret_name, namespace).await?.is_some() {
            info!(secret = %secret_name, "proxy no longer configured, deleting derived secret");
            ctx.kube.delete_secret(&secret_name, namespace).await?;
        }
        return Ok(None);
    };

    let credential_secrets = fetch_credential_secrets(proxy, namespace, ctx).await?;
    let data = secret_data(proxy, &credential_secrets)?;
    let desired = desired_proxy_secret(runner_set, &secret_name, data);

    let existing = ctx.kube.get_secret(&secret_name, namespace).await?;
    let unchanged = existing
        .as_ref()
        .map(|s| s.data == desired.data)
        .unwrap_or(false);
    if unchanged {
        debug!(secret = %secret_name, "proxy secret up to date");
    } else {
        info!(secret = %secret_name, "writing flattened proxy secret");
        ctx.kube.apply_secret(namespace, &desired).await?;
    }

    Ok(Some(secret_name))
}

/// Fetch the credential secrets the proxy config references; absent ones are
/// simply omitted and surface as DependencyMissing inside the builder
async fn fetch_credential_secrets(
    proxy: &ProxyConfig,
    namespace: &str,
    ctx: &Context,
) -> Result<BTreeMap<String, Secret>, Error> {
    let mut secrets = BTreeMap::new();
    for name in proxy.referenced_secrets() {
        if let Some(secret) = ctx.kube.get_secret(name, namespace).await? {
            secrets.insert(name.to_string(), secret);
        }
    }
    Ok(secrets)
}

/// Build the desired proxy Secret with an owner reference back to the set
fn desired_proxy_secret(
    runner_set: &EphemeralRunnerSet,
    secret_name: &str,
    data: BTreeMap<String, Vec<u8>>,
) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(secret_name.to_string()),
            namespace: runner_set.metadata.namespace.clone(),
            labels: Some(BTreeMap::from([(
                LABEL_MANAGED_BY.to_string(),
                LABEL_MANAGED_BY_GANTRY.to_string(),
            )])),
            owner_references: runner_set.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(data.into_iter().map(|(k, v)| (k, ByteString(v))).collect()),
        ..Default::default()
    }
}

// =============================================================================
// Dispatch client
// =============================================================================

/// Build an authenticated dispatch client for this runner set.
///
/// Resolves the token from the GitHub config secret and proxy credentials
/// from their referenced secrets; the factory caches the underlying HTTP
/// client by configuration fingerprint.
async fn dispatch_client(
    runner_set: &EphemeralRunnerSet,
    namespace: &str,
    ctx: &Context,
) -> Result<Arc<dyn DispatchClient>, Error> {
    let name = runner_set.name_any();
    let spec = &runner_set.spec.ephemeral_runner_spec;

    let config_secret = ctx
        .kube
        .get_secret(&spec.github_config_secret, namespace)
        .await?
        .ok_or_else(|| {
            Error::dependency_missing(
                spec.github_config_secret.clone(),
                "github config secret not found",
            )
        })?;

    let token_bytes = config_secret
        .data
        .as_ref()
        .and_then(|d| d.get(GITHUB_TOKEN_KEY))
        .ok_or_else(|| {
            Error::validation_for(
                &name,
                format!(
                    "config secret '{}' is missing the '{}' entry",
                    spec.github_config_secret, GITHUB_TOKEN_KEY
                ),
            )
        })?;
    let token = String::from_utf8(token_bytes.0.clone())
        .map_err(|_| Error::validation_for(&name, "github token is not valid UTF-8"))?;

    let proxy = match &spec.proxy {
        Some(proxy) => {
            let credential_secrets = fetch_credential_secrets(proxy, namespace, ctx).await?;
            Some(resolved_proxy(proxy, &credential_secrets)?)
        }
        None => None,
    };

    let config = DispatchConfig {
        config_url: spec.github_config_url.clone(),
        token,
        runner_scale_set_id: spec.runner_scale_set_id,
        proxy,
    };

    ctx.dispatch.client_for(&config).await.map_err(|e| {
        if e.is_retryable() {
            Error::dispatch(&name, e.to_string())
        } else {
            Error::dispatch_permanent(&name, e.to_string())
        }
    })
}

// =============================================================================
// Helpers
// =============================================================================

/// Check if the runner set carries our finalizer
fn has_finalizer(runner_set: &EphemeralRunnerSet) -> bool {
    runner_set
        .metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.contains(&EPHEMERAL_RUNNER_SET_FINALIZER.to_string()))
}

/// Build a runner from the template snapshot.
///
/// `generateName` delegates suffix generation to the API server, which also
/// owns collision handling. The patch-id annotation records which template
/// generation this runner belongs to.
fn desired_runner(
    runner_set: &EphemeralRunnerSet,
    proxy_secret_ref: Option<&str>,
) -> EphemeralRunner {
    let name = runner_set.name_any();
    let mut spec = runner_set.spec.ephemeral_runner_spec.clone();
    spec.proxy_secret_ref = proxy_secret_ref.map(String::from);

    EphemeralRunner {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}-runner-", name)),
            namespace: runner_set.metadata.namespace.clone(),
            labels: Some(BTreeMap::from([(
                LABEL_RUNNER_SET.to_string(),
                name.clone(),
            )])),
            annotations: Some(BTreeMap::from([(
                ANNOTATION_PATCH_ID.to_string(),
                runner_set.spec.patch_id.to_string(),
            )])),
            owner_references: runner_set.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        spec,
        status: None,
    }
}

/// Map observed counts into the status block
fn status_from(counts: &ObservedCounts) -> EphemeralRunnerSetStatus {
    EphemeralRunnerSetStatus {
        current_replicas: counts.total,
        pending_ephemeral_runners: counts.pending,
        running_ephemeral_runners: counts.running,
        failed_ephemeral_runners: counts.failed,
    }
}

/// Patch status, skipping the write when nothing changed.
///
/// The skip matters: a merge patch that always differs would generate a watch
/// event that triggers another reconcile, looping forever.
async fn update_status(
    runner_set: &EphemeralRunnerSet,
    namespace: &str,
    ctx: &Context,
    status: EphemeralRunnerSetStatus,
) -> Result<(), Error> {
    if runner_set.status.as_ref() == Some(&status) {
        debug!("status unchanged, skipping update");
        return Ok(());
    }
    ctx.kube
        .patch_status(&runner_set.name_any(), namespace, &status)
        .await
}

/// Export the phase gauge for this set
fn record_runner_metrics(runner_set: &str, counts: &ObservedCounts) {
    metrics::set_runner_state_count(runner_set, RunnerState::Pending, counts.pending as i64);
    metrics::set_runner_state_count(runner_set, RunnerState::Running, counts.running as i64);
    metrics::set_runner_state_count(runner_set, RunnerState::Failed, counts.failed as i64);
}

/// Metric label for a failed reconcile
fn error_type(error: &Error) -> &'static str {
    if error.is_retryable() {
        "transient"
    } else {
        "permanent"
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::{self, PASSWORD_KEY, USERNAME_KEY};
    use gantry_actions::DispatchError;
    use gantry_common::crd::{
        EphemeralRunnerSetSpec, EphemeralRunnerSpec, EphemeralRunnerStatus, ProxyServerConfig,
        RunnerPhase,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use mockall::mock;

    mock! {
        DispatchFactory {}

        #[async_trait]
        impl DispatchClientFactory for DispatchFactory {
            async fn client_for(
                &self,
                config: &DispatchConfig,
            ) -> Result<Arc<dyn DispatchClient>, DispatchError>;
        }
    }

    mock! {
        Dispatch {}

        #[async_trait]
        impl DispatchClient for Dispatch {
            async fn remove_runner(&self, runner_id: i64) -> Result<(), DispatchError>;
        }
    }

    // =========================================================================
    // Test Fixtures
    // =========================================================================

    const NS: &str = "test";

    fn sample_runner_set(name: &str, replicas: i32) -> EphemeralRunnerSet {
        EphemeralRunnerSet {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(NS.to_string()),
                finalizers: Some(vec![EPHEMERAL_RUNNER_SET_FINALIZER.to_string()]),
                ..Default::default()
            },
            spec: EphemeralRunnerSetSpec {
                replicas,
                patch_id: 0,
                ephemeral_runner_spec: EphemeralRunnerSpec {
                    github_config_url: "https://github.com/owner/repo".to_string(),
                    github_config_secret: "github-config-secret".to_string(),
                    runner_scale_set_id: 100,
                    ..Default::default()
                },
            },
            status: None,
        }
    }

    fn runner(name: &str, phase: RunnerPhase, runner_id: i64, job_request_id: i64) -> EphemeralRunner {
        EphemeralRunner {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(NS.to_string()),
                ..Default::default()
            },
            spec: EphemeralRunnerSpec::default(),
            status: Some(EphemeralRunnerStatus {
                phase,
                runner_id,
                job_request_id,
                message: None,
            }),
        }
    }

    fn secret_with(entries: &[(&str, &str)]) -> Secret {
        Secret {
            data: Some(
                entries
                    .iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    fn config_secret() -> Secret {
        secret_with(&[(GITHUB_TOKEN_KEY, "gh_token")])
    }

    fn proxied_runner_set(name: &str, replicas: i32) -> EphemeralRunnerSet {
        let mut rs = sample_runner_set(name, replicas);
        rs.spec.ephemeral_runner_spec.proxy = Some(ProxyConfig {
            http: Some(ProxyServerConfig {
                url: "http://proxy.example.com".to_string(),
                credential_secret_ref: Some("proxy-credentials".to_string()),
            }),
            https: None,
            no_proxy: vec!["example.com".to_string()],
        });
        rs
    }

    fn ctx(kube: MockRunnerSetKubeClient, dispatch: MockDispatchFactory) -> Arc<Context> {
        Arc::new(Context::for_testing(Arc::new(kube), Arc::new(dispatch)))
    }

    fn dispatch_with_removals(expected: usize) -> MockDispatchFactory {
        let mut client = MockDispatch::new();
        client
            .expect_remove_runner()
            .times(expected)
            .returning(|_| Ok(()));
        let client: Arc<dyn DispatchClient> = Arc::new(client);

        let mut factory = MockDispatchFactory::new();
        factory
            .expect_client_for()
            .returning(move |_| Ok(client.clone()));
        factory
    }

    fn matching_status(runners: &[EphemeralRunner]) -> EphemeralRunnerSetStatus {
        let plan = selector::plan(runners, 0, 0);
        status_from(&plan.counts)
    }

    /// Sets without proxy config probe for a leftover derived secret
    fn expect_no_proxy_secret(kube: &mut MockRunnerSetKubeClient) {
        kube.expect_get_secret()
            .withf(|name, _| name == "test-asrs-runner-proxy-config")
            .returning(|_, _| Ok(None));
    }

    // =========================================================================
    // Reconciliation Story Tests
    // =========================================================================

    /// Story: a fresh runner set gets the finalizer before anything else
    #[tokio::test]
    async fn story_new_set_gets_finalizer() {
        let mut rs = sample_runner_set("test-asrs", 0);
        rs.metadata.finalizers = None;

        let mut kube = MockRunnerSetKubeClient::new();
        kube.expect_add_finalizer()
            .withf(|name, ns, fin| {
                name == "test-asrs" && ns == NS && fin == EPHEMERAL_RUNNER_SET_FINALIZER
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let action = reconcile(Arc::new(rs), ctx(kube, MockDispatchFactory::new()))
            .await
            .expect("reconcile should succeed");
        assert_eq!(action, Action::requeue(Duration::from_secs(1)));
    }

    /// Story: with the finalizer in place and no runners, a target of zero
    /// does nothing beyond establishing status
    #[tokio::test]
    async fn story_zero_replicas_creates_nothing() {
        let rs = sample_runner_set("test-asrs", 0);

        let mut kube = MockRunnerSetKubeClient::new();
        expect_no_proxy_secret(&mut kube);
        kube.expect_list_runners().returning(|_, _| Ok(vec![]));
        kube.expect_patch_status()
            .withf(|_, _, status| *status == EphemeralRunnerSetStatus::default())
            .times(1)
            .returning(|_, _, _| Ok(()));

        let action = reconcile(Arc::new(rs), ctx(kube, MockDispatchFactory::new()))
            .await
            .expect("reconcile should succeed");
        assert_eq!(action, Action::requeue(Duration::from_secs(60)));
    }

    /// Story: scaling up creates one runner per missing slot, each stamped
    /// with the set label, patch annotation, and generateName prefix
    #[tokio::test]
    async fn story_scale_up_creates_runners() {
        let rs = sample_runner_set("test-asrs", 5);

        let mut kube = MockRunnerSetKubeClient::new();
        expect_no_proxy_secret(&mut kube);
        kube.expect_list_runners().returning(|_, _| Ok(vec![]));
        kube.expect_create_runner()
            .withf(|ns, runner| {
                ns == NS
                    && runner.metadata.generate_name.as_deref() == Some("test-asrs-runner-")
                    && runner
                        .metadata
                        .labels
                        .as_ref()
                        .and_then(|l| l.get(LABEL_RUNNER_SET))
                        .map(String::as_str)
                        == Some("test-asrs")
            })
            .times(5)
            .returning(|_, _| Ok(()));
        kube.expect_patch_status().returning(|_, _, _| Ok(()));

        let action = reconcile(Arc::new(rs), ctx(kube, MockDispatchFactory::new()))
            .await
            .expect("reconcile should succeed");
        assert_eq!(action, Action::requeue(Duration::from_secs(60)));
    }

    /// Story: a finished runner is deleted without any dispatch call and a
    /// fresh one takes its slot
    #[tokio::test]
    async fn story_finished_runner_reaped_and_replaced() {
        let mut rs = sample_runner_set("test-asrs", 5);
        let runners = vec![
            runner("r-a", RunnerPhase::Running, 100, 0),
            runner("r-b", RunnerPhase::Running, 101, 0),
            runner("r-c", RunnerPhase::Running, 102, 0),
            runner("r-d", RunnerPhase::Running, 103, 0),
            runner("r-fin", RunnerPhase::Succeeded, 104, 0),
        ];
        rs.status = Some(matching_status(&runners));

        let mut kube = MockRunnerSetKubeClient::new();
        expect_no_proxy_secret(&mut kube);
        let observed = runners.clone();
        kube.expect_list_runners()
            .returning(move |_, _| Ok(observed.clone()));
        kube.expect_delete_runner()
            .withf(|name, _| name == "r-fin")
            .times(1)
            .returning(|_, _| Ok(()));
        kube.expect_create_runner().times(1).returning(|_, _| Ok(()));

        // No dispatch factory expectations: reaping must not deregister
        let action = reconcile(Arc::new(rs), ctx(kube, MockDispatchFactory::new()))
            .await
            .expect("reconcile should succeed");
        assert_eq!(action, Action::requeue(Duration::from_secs(60)));
    }

    /// Story: scaling 5 → 1 with two busy runners converges to 2, not 1;
    /// the three idle runners are deregistered then deleted
    #[tokio::test]
    async fn story_scale_down_respects_running_jobs() {
        let mut rs = sample_runner_set("test-asrs", 1);
        let runners = vec![
            runner("r-a", RunnerPhase::Running, 100, 1000),
            runner("r-b", RunnerPhase::Running, 101, 1001),
            runner("r-c", RunnerPhase::Running, 102, 0),
            runner("r-d", RunnerPhase::Running, 103, 0),
            runner("r-e", RunnerPhase::Running, 104, 0),
        ];
        rs.status = Some(matching_status(&runners));

        let mut kube = MockRunnerSetKubeClient::new();
        expect_no_proxy_secret(&mut kube);
        let observed = runners.clone();
        kube.expect_list_runners()
            .returning(move |_, _| Ok(observed.clone()));
        kube.expect_get_secret()
            .withf(|name, _| name == "github-config-secret")
            .returning(|_, _| Ok(Some(config_secret())));
        kube.expect_delete_runner()
            .withf(|name, _| matches!(name, "r-c" | "r-d" | "r-e"))
            .times(3)
            .returning(|_, _| Ok(()));

        let action = reconcile(Arc::new(rs), ctx(kube, dispatch_with_removals(3)))
            .await
            .expect("reconcile should succeed");
        assert_eq!(action, Action::requeue(Duration::from_secs(60)));
    }

    /// Story: a failed runner and a busy runner pin the population above a
    /// zero target; nothing is deleted
    #[tokio::test]
    async fn story_failed_runner_blocks_scale_down() {
        let mut rs = sample_runner_set("test-asrs", 0);
        let runners = vec![
            runner("r-failed", RunnerPhase::Failed, 100, 0),
            runner("r-busy", RunnerPhase::Running, 101, 1000),
        ];
        rs.status = Some(matching_status(&runners));

        let mut kube = MockRunnerSetKubeClient::new();
        expect_no_proxy_secret(&mut kube);
        let observed = runners.clone();
        kube.expect_list_runners()
            .returning(move |_, _| Ok(observed.clone()));

        // No delete/create/dispatch expectations: any mutation panics
        let action = reconcile(Arc::new(rs), ctx(kube, MockDispatchFactory::new()))
            .await
            .expect("reconcile should succeed");
        assert_eq!(action, Action::requeue(Duration::from_secs(60)));
    }

    /// Story: a transient dispatch failure leaves the runner in place and
    /// requeues quickly instead of failing the pass
    #[tokio::test]
    async fn story_transient_dispatch_failure_defers_deletion() {
        let mut rs = sample_runner_set("test-asrs", 0);
        let runners = vec![runner("r-idle", RunnerPhase::Running, 100, 0)];
        rs.status = Some(matching_status(&runners));

        let mut kube = MockRunnerSetKubeClient::new();
        expect_no_proxy_secret(&mut kube);
        let observed = runners.clone();
        kube.expect_list_runners()
            .returning(move |_, _| Ok(observed.clone()));
        kube.expect_get_secret()
            .withf(|name, _| name == "github-config-secret")
            .returning(|_, _| Ok(Some(config_secret())));

        let mut client = MockDispatch::new();
        client.expect_remove_runner().times(1).returning(|_| {
            Err(DispatchError::Api {
                status: 503,
                message: "unavailable".to_string(),
            })
        });
        let client: Arc<dyn DispatchClient> = Arc::new(client);
        let mut factory = MockDispatchFactory::new();
        factory
            .expect_client_for()
            .returning(move |_| Ok(client.clone()));

        // delete_runner must not be called for the kept runner
        let action = reconcile(Arc::new(rs), ctx(kube, factory))
            .await
            .expect("reconcile should succeed");
        assert_eq!(action, Action::requeue(Duration::from_secs(10)));
    }

    /// Story: identical observed state twice in a row mutates nothing the
    /// second time — the pass is idempotent
    #[tokio::test]
    async fn story_second_pass_is_mutation_free() {
        let mut rs = sample_runner_set("test-asrs", 2);
        let runners = vec![
            runner("r-a", RunnerPhase::Running, 100, 0),
            runner("r-b", RunnerPhase::Running, 101, 0),
        ];
        rs.status = Some(matching_status(&runners));

        let mut kube = MockRunnerSetKubeClient::new();
        expect_no_proxy_secret(&mut kube);
        let observed = runners.clone();
        kube.expect_list_runners()
            .returning(move |_, _| Ok(observed.clone()));

        // Only reads are expected; create/delete/patch_status would panic
        let action = reconcile(Arc::new(rs), ctx(kube, MockDispatchFactory::new()))
            .await
            .expect("reconcile should succeed");
        assert_eq!(action, Action::requeue(Duration::from_secs(60)));
    }

    /// Story: an invalid spec awaits a spec change instead of retrying
    #[tokio::test]
    async fn story_invalid_spec_awaits_change() {
        let mut rs = sample_runner_set("test-asrs", 0);
        rs.spec.replicas = -1;

        let kube = MockRunnerSetKubeClient::new();
        let action = reconcile(Arc::new(rs), ctx(kube, MockDispatchFactory::new()))
            .await
            .expect("reconcile should succeed");
        assert_eq!(action, Action::await_change());
    }

    // =========================================================================
    // Proxy Secret Tests
    // =========================================================================

    /// Story: the flattened proxy secret is written byte-for-byte as the
    /// builder produces it, and new runners reference it
    #[tokio::test]
    async fn story_proxy_secret_materialized_and_referenced() {
        let rs = proxied_runner_set("test-asrs", 1);
        let credentials = secret_with(&[(USERNAME_KEY, "test"), (PASSWORD_KEY, "password")]);

        let expected_data: BTreeMap<String, ByteString> = {
            let proxy = rs.spec.ephemeral_runner_spec.proxy.clone().unwrap();
            let secrets =
                BTreeMap::from([("proxy-credentials".to_string(), credentials.clone())]);
            proxy::secret_data(&proxy, &secrets)
                .unwrap()
                .into_iter()
                .map(|(k, v)| (k, ByteString(v)))
                .collect()
        };

        let mut kube = MockRunnerSetKubeClient::new();
        kube.expect_get_secret()
            .withf(|name, _| name == "proxy-credentials")
            .returning(move |_, _| Ok(Some(credentials.clone())));
        kube.expect_get_secret()
            .withf(|name, _| name == "test-asrs-runner-proxy-config")
            .returning(|_, _| Ok(None));
        kube.expect_apply_secret()
            .withf(move |ns, secret| {
                ns == NS
                    && secret.metadata.name.as_deref() == Some("test-asrs-runner-proxy-config")
                    && secret.data.as_ref() == Some(&expected_data)
            })
            .times(1)
            .returning(|_, _| Ok(()));
        kube.expect_list_runners().returning(|_, _| Ok(vec![]));
        kube.expect_create_runner()
            .withf(|_, runner| {
                runner.spec.proxy_secret_ref.as_deref() == Some("test-asrs-runner-proxy-config")
            })
            .times(1)
            .returning(|_, _| Ok(()));
        kube.expect_patch_status().returning(|_, _, _| Ok(()));

        reconcile(Arc::new(rs), ctx(kube, MockDispatchFactory::new()))
            .await
            .expect("reconcile should succeed");
    }

    /// Story: an absent credential secret aborts the pass before any partial
    /// secret or runner is written, and the error is retryable
    #[tokio::test]
    async fn story_missing_proxy_credentials_requeues() {
        let rs = proxied_runner_set("test-asrs", 1);

        let mut kube = MockRunnerSetKubeClient::new();
        kube.expect_get_secret()
            .withf(|name, _| name == "proxy-credentials")
            .returning(|_, _| Ok(None));

        // apply_secret/create_runner have no expectations: a call panics
        let err = reconcile(Arc::new(rs), ctx(kube, MockDispatchFactory::new()))
            .await
            .expect_err("reconcile should fail");
        assert!(matches!(err, Error::DependencyMissing { .. }));
        assert!(err.is_retryable());
    }

    /// Story: once the stored secret matches, converged passes skip the write
    #[tokio::test]
    async fn story_unchanged_proxy_secret_not_rewritten() {
        let mut rs = proxied_runner_set("test-asrs", 1);
        let credentials = secret_with(&[(USERNAME_KEY, "test"), (PASSWORD_KEY, "password")]);

        let stored = {
            let proxy = rs.spec.ephemeral_runner_spec.proxy.clone().unwrap();
            let secrets =
                BTreeMap::from([("proxy-credentials".to_string(), credentials.clone())]);
            desired_proxy_secret(
                &rs,
                "test-asrs-runner-proxy-config",
                proxy::secret_data(&proxy, &secrets).unwrap(),
            )
        };

        let runners = vec![runner("r-a", RunnerPhase::Running, 100, 0)];
        rs.status = Some(matching_status(&runners));

        let mut kube = MockRunnerSetKubeClient::new();
        kube.expect_get_secret()
            .withf(|name, _| name == "proxy-credentials")
            .returning(move |_, _| Ok(Some(credentials.clone())));
        kube.expect_get_secret()
            .withf(|name, _| name == "test-asrs-runner-proxy-config")
            .returning(move |_, _| Ok(Some(stored.clone())));
        let observed = runners.clone();
        kube.expect_list_runners()
            .returning(move |_, _| Ok(observed.clone()));

        // apply_secret has no expectation: rewriting an unchanged secret panics
        reconcile(Arc::new(rs), ctx(kube, MockDispatchFactory::new()))
            .await
            .expect("reconcile should succeed");
    }

    // =========================================================================
    // Teardown Tests
    // =========================================================================

    fn deleting(mut rs: EphemeralRunnerSet) -> EphemeralRunnerSet {
        rs.metadata.deletion_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));
        rs
    }

    /// Story: teardown deregisters configured runners and deletes everything
    /// without a live job — including failed runners
    #[tokio::test]
    async fn story_teardown_drains_runners() {
        let rs = deleting(sample_runner_set("test-asrs", 5));
        let runners = vec![
            runner("r-done", RunnerPhase::Succeeded, 100, 0),
            runner("r-failed", RunnerPhase::Failed, 0, 0),
        ];

        let mut kube = MockRunnerSetKubeClient::new();
        kube.expect_list_runners()
            .returning(move |_, _| Ok(runners.clone()));
        kube.expect_get_secret()
            .withf(|name, _| name == "github-config-secret")
            .returning(|_, _| Ok(Some(config_secret())));
        kube.expect_delete_runner()
            .withf(|name, _| matches!(name, "r-done" | "r-failed"))
            .times(2)
            .returning(|_, _| Ok(()));

        let action = reconcile(Arc::new(rs), ctx(kube, dispatch_with_removals(1)))
            .await
            .expect("reconcile should succeed");
        assert_eq!(action, Action::requeue(Duration::from_secs(5)));
    }

    /// Story: a runner still executing a job blocks teardown; the finalizer
    /// stays until the job reaches a terminal phase
    #[tokio::test]
    async fn story_teardown_waits_for_running_job() {
        let rs = deleting(sample_runner_set("test-asrs", 1));
        let runners = vec![runner("r-busy", RunnerPhase::Running, 100, 1000)];

        let mut kube = MockRunnerSetKubeClient::new();
        kube.expect_list_runners()
            .returning(move |_, _| Ok(runners.clone()));

        // No delete/remove_finalizer expectations: touching them panics
        let action = reconcile(Arc::new(rs), ctx(kube, MockDispatchFactory::new()))
            .await
            .expect("reconcile should succeed");
        assert_eq!(action, Action::requeue(Duration::from_secs(30)));
    }

    /// Story: once the population is empty the proxy secret goes away and
    /// the finalizer is removed, releasing the object
    #[tokio::test]
    async fn story_teardown_completes_when_drained() {
        let rs = deleting(proxied_runner_set("test-asrs", 0));

        let mut kube = MockRunnerSetKubeClient::new();
        kube.expect_list_runners().returning(|_, _| Ok(vec![]));
        kube.expect_delete_secret()
            .withf(|name, _| name == "test-asrs-runner-proxy-config")
            .times(1)
            .returning(|_, _| Ok(()));
        kube.expect_remove_finalizer()
            .withf(|name, _, fin| name == "test-asrs" && fin == EPHEMERAL_RUNNER_SET_FINALIZER)
            .times(1)
            .returning(|_, _, _| Ok(()));

        let action = reconcile(Arc::new(rs), ctx(kube, MockDispatchFactory::new()))
            .await
            .expect("reconcile should succeed");
        assert_eq!(action, Action::await_change());
    }

    /// Story: deletion without our finalizer is none of our business
    #[tokio::test]
    async fn story_teardown_without_finalizer_is_noop() {
        let mut rs = deleting(sample_runner_set("test-asrs", 0));
        rs.metadata.finalizers = None;

        let kube = MockRunnerSetKubeClient::new();
        let action = reconcile(Arc::new(rs), ctx(kube, MockDispatchFactory::new()))
            .await
            .expect("reconcile should succeed");
        assert_eq!(action, Action::await_change());
    }

    // =========================================================================
    // Error Policy Tests
    // =========================================================================

    /// Story: error policy distinguishes retryable vs non-retryable errors
    #[test]
    fn story_error_policy_requeues_retryable() {
        let rs = Arc::new(sample_runner_set("test-asrs", 0));
        let kube = MockRunnerSetKubeClient::new();
        let ctx = ctx(kube, MockDispatchFactory::new());

        let transient = Error::dispatch("test-asrs", "503");
        assert_eq!(
            error_policy(Arc::clone(&rs), &transient, Arc::clone(&ctx)),
            Action::requeue(Duration::from_secs(30))
        );

        let permanent = Error::validation("bad spec");
        assert_eq!(error_policy(rs, &permanent, ctx), Action::await_change());
    }

    // =========================================================================
    // Helper Tests
    // =========================================================================

    #[test]
    fn desired_runner_snapshots_template_and_patch_id() {
        let mut rs = sample_runner_set("test-asrs", 1);
        rs.spec.patch_id = 7;

        let runner = desired_runner(&rs, Some("test-asrs-runner-proxy-config"));
        assert_eq!(
            runner.metadata.generate_name.as_deref(),
            Some("test-asrs-runner-")
        );
        assert_eq!(
            runner
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(ANNOTATION_PATCH_ID))
                .map(String::as_str),
            Some("7")
        );
        assert_eq!(
            runner.spec.proxy_secret_ref.as_deref(),
            Some("test-asrs-runner-proxy-config")
        );
        assert_eq!(runner.spec.runner_scale_set_id, 100);
    }

    #[test]
    fn has_finalizer_checks_exact_string() {
        let rs = sample_runner_set("test-asrs", 0);
        assert!(has_finalizer(&rs));

        let mut bare = rs.clone();
        bare.metadata.finalizers = Some(vec!["other/finalizer".to_string()]);
        assert!(!has_finalizer(&bare));
    }
}
