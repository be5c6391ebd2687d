//! registry-proxy-operator library crate
//!
//! This module exports the controllers, CRD definitions, and resource generators.

pub mod config;
pub mod controller;
pub mod crd;
pub mod health;
pub mod resources;

pub use config::OperatorConfig;
pub use health::HealthState;

use std::sync::Arc;

use futures::{Stream, StreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::runtime::controller::{Action, Error as ControllerError};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::{Controller, WatchStreamExt, metadata_watcher, predicates, reflector, watcher};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use controller::arbiter::ReconcileAllTrigger;
use controller::context::Context;
use controller::error::Error;
use controller::readiness::{Dependency, run_dependency_watch};
use controller::{connection_reconciler, operator_reconciler, reverse_proxy_reconciler};
use crd::{Connection, ImagePullReverseProxy, PeerAuthentication, RegistryProxy};

/// Create namespaced or cluster-wide API based on scope
pub fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Create the default watcher configuration for all controllers.
///
/// - `any_semantic()`: More reliable resource discovery in test environments
fn default_watcher_config() -> WatcherConfig {
    WatcherConfig::default().any_semantic()
}

/// Create a filtered stream for a resource type with standard optimizations.
///
/// This creates a reflector-backed stream that:
/// - Maintains an in-memory cache via reflector
/// - Uses automatic retry with exponential backoff on errors
/// - Converts watch events to objects (Added/Modified only)
/// - Filters out status-only updates via generation predicate
fn create_filtered_stream<K>(
    api: Api<K>,
    watcher_config: WatcherConfig,
) -> (
    reflector::Store<K>,
    impl Stream<Item = Result<K, watcher::Error>>,
)
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug + Send + 'static,
    K::DynamicType: Default + Eq + std::hash::Hash + Clone,
{
    let (reader, writer) = reflector::store();
    let stream = reflector(writer, watcher(api, watcher_config))
        .default_backoff()
        .applied_objects()
        .predicate_filter(predicates::generation);
    (reader, stream)
}

/// Log one controller result.
///
/// ObjectNotFound/NotFound errors are expected after deletion when related
/// watch events trigger reconciliation for a deleted object.
async fn log_result<K>(result: Result<(ObjectRef<K>, Action), ControllerError<Error, watcher::Error>>)
where
    K: Resource<DynamicType = ()>,
{
    match result {
        Ok((obj, _action)) => {
            debug!("Reconciled: {}", obj.name);
        }
        Err(e) => {
            let is_not_found = match &e {
                ControllerError::ObjectNotFound(_) => true,
                ControllerError::ReconcilerFailed(err, _) => err.is_not_found(),
                _ => false,
            };
            if is_not_found {
                debug!("Object no longer exists (likely deleted): {:?}", e);
            } else {
                error!("Reconciliation error: {:?}", e);
            }
        }
    }
}

/// Whether a CRD is registered in the cluster right now.
async fn crd_installed(client: &Client, dependency: Dependency) -> bool {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    match crds.get_opt(dependency.crd_name()).await {
        Ok(crd) => crd.is_some(),
        Err(e) => {
            warn!(dependency = dependency.as_str(), error = %e, "Failed to look up CRD");
            false
        }
    }
}

/// Run all three controllers until their streams end.
///
/// When `config.watch_namespace` is set, Connections and
/// ImagePullReverseProxies are only watched in that namespace. RegistryProxy
/// instances are always watched cluster-wide since only one of them may be
/// served per cluster.
pub async fn run_controllers(
    client: Client,
    config: OperatorConfig,
    health_state: Option<Arc<HealthState>>,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let namespace = config.watch_namespace.clone();
    let namespace = namespace.as_deref();
    info!(
        "Starting controllers (scope: {})",
        namespace.unwrap_or("cluster-wide")
    );

    let (reconcile_all, reconcile_all_rx) = ReconcileAllTrigger::channel();
    let ctx = Arc::new(Context::new(
        client.clone(),
        config,
        health_state.clone(),
        cancel,
        reconcile_all,
    )?);

    // Dependency watches feed the readiness caches for the whole process lifetime
    for (dependency, cache) in [
        (Dependency::ConnectivityProxy, ctx.connectivity_proxy.clone()),
        (Dependency::Istio, ctx.istio.clone()),
    ] {
        tokio::spawn(run_dependency_watch(
            client.clone(),
            cache,
            dependency,
            health_state.clone(),
        ));
    }
    let istio_installed = crd_installed(&client, Dependency::Istio).await;

    if let Some(ref state) = health_state {
        state.set_ready(true).await;
    }

    let watcher_config = default_watcher_config();

    // RegistryProxy: the installed objects are not owned through owner references
    let (reader, stream) =
        create_filtered_stream(Api::<RegistryProxy>::all(client.clone()), watcher_config.clone());
    let operator = Controller::for_stream(stream, reader)
        .reconcile_all_on(reconcile_all_rx)
        .run(
            operator_reconciler::reconcile,
            operator_reconciler::error_policy,
            ctx.clone(),
        )
        .for_each(log_result);

    // Connection: keep full watcher for Deployment since its spec is compared;
    // Services and PeerAuthentications only need change notifications.
    let (reader, stream) = create_filtered_stream(
        scoped_api::<Connection>(client.clone(), namespace),
        watcher_config.clone(),
    );
    let mut connections = Controller::for_stream(stream, reader)
        .owns(
            scoped_api::<Deployment>(client.clone(), namespace),
            watcher_config.clone(),
        )
        .owns_stream(
            metadata_watcher(
                scoped_api::<Service>(client.clone(), namespace),
                watcher_config.clone(),
            )
            .touched_objects(),
        );
    if istio_installed {
        connections = connections.owns_stream(
            metadata_watcher(
                scoped_api::<PeerAuthentication>(client.clone(), namespace),
                watcher_config.clone(),
            )
            .touched_objects(),
        );
    }
    let connections = connections
        .run(
            connection_reconciler::reconcile,
            connection_reconciler::error_policy,
            ctx.clone(),
        )
        .for_each(log_result);

    let (reader, stream) = create_filtered_stream(
        scoped_api::<ImagePullReverseProxy>(client.clone(), namespace),
        watcher_config.clone(),
    );
    let reverse_proxies = Controller::for_stream(stream, reader)
        .owns(
            scoped_api::<Deployment>(client.clone(), namespace),
            watcher_config.clone(),
        )
        .owns_stream(
            metadata_watcher(scoped_api::<Service>(client.clone(), namespace), watcher_config)
                .touched_objects(),
        )
        .run(
            reverse_proxy_reconciler::reconcile,
            reverse_proxy_reconciler::error_policy,
            ctx,
        )
        .for_each(log_result);

    futures::join!(operator, connections, reverse_proxies);

    // This should never complete in normal operation
    error!("Controller streams ended unexpectedly");
    Ok(())
}
