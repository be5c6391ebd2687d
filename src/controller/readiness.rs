//! Readiness of external dependencies the operator does not own.
//!
//! A [`ReadinessCache`] is a shared boolean written by a CRD watch and read
//! by state functions without blocking. Reads may be stale by one watch
//! notification.

use std::sync::{Arc, Mutex};

use futures::StreamExt;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Client};
use tracing::{debug, info, warn};

use crate::health::HealthState;

/// Thread-safe availability flag for one dependency.
#[derive(Debug, Default)]
pub struct ReadinessCache {
    ready: Mutex<bool>,
}

impl ReadinessCache {
    pub fn new(ready: bool) -> Self {
        Self {
            ready: Mutex::new(ready),
        }
    }

    pub fn get(&self) -> bool {
        // A poisoned lock still holds a valid bool
        match self.ready.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn set(&self, ready: bool) {
        match self.ready.lock() {
            Ok(mut guard) => *guard = ready,
            Err(poisoned) => *poisoned.into_inner() = ready,
        }
    }
}

/// External components whose presence gates convergence.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Dependency {
    /// SAP Connectivity Proxy (required by every proxy workload)
    ConnectivityProxy,
    /// Istio (PeerAuthentication support)
    Istio,
}

impl Dependency {
    /// API group of the CRD that signals the dependency is installed.
    pub fn group(&self) -> &'static str {
        match self {
            Dependency::ConnectivityProxy => "connectivityproxy.sap.com",
            Dependency::Istio => "security.istio.io",
        }
    }

    /// Kind served by that CRD.
    pub fn kind(&self) -> &'static str {
        match self {
            Dependency::ConnectivityProxy => "ConnectivityProxy",
            Dependency::Istio => "PeerAuthentication",
        }
    }

    /// Full CRD object name.
    pub fn crd_name(&self) -> &'static str {
        match self {
            Dependency::ConnectivityProxy => "connectivityproxies.connectivityproxy.sap.com",
            Dependency::Istio => "peerauthentications.security.istio.io",
        }
    }

    /// Label used in metrics and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Dependency::ConnectivityProxy => "connectivity-proxy",
            Dependency::Istio => "istio",
        }
    }
}

fn crd_matches(crd: &CustomResourceDefinition, group: &str, kind: &str) -> bool {
    crd.spec.group == group && crd.spec.names.kind == kind
}

/// Map a CRD watch event onto the new availability of a dependency.
///
/// Returns `None` when the event says nothing about the dependency.
pub fn crd_presence_from_event(
    event: &watcher::Event<CustomResourceDefinition>,
    group: &str,
    kind: &str,
) -> Option<bool> {
    match event {
        watcher::Event::Apply(crd) | watcher::Event::InitApply(crd) => {
            crd_matches(crd, group, kind).then_some(true)
        }
        watcher::Event::Delete(crd) => crd_matches(crd, group, kind).then_some(false),
        // A relist starts from scratch; the CRD shows up again as InitApply if present
        watcher::Event::Init => Some(false),
        watcher::Event::InitDone => None,
    }
}

/// Watch the CRD of `dependency` and keep `cache` in sync until the stream ends.
pub async fn run_dependency_watch(
    client: Client,
    cache: Arc<ReadinessCache>,
    dependency: Dependency,
    health_state: Option<Arc<HealthState>>,
) {
    let api: Api<CustomResourceDefinition> = Api::all(client);
    let config =
        watcher::Config::default().fields(&format!("metadata.name={}", dependency.crd_name()));

    info!(dependency = dependency.as_str(), "Starting dependency watch");

    let mut stream = watcher::watcher(api, config).default_backoff().boxed();
    while let Some(event) = stream.next().await {
        match event {
            Ok(event) => {
                let Some(ready) =
                    crd_presence_from_event(&event, dependency.group(), dependency.kind())
                else {
                    continue;
                };
                if cache.get() != ready {
                    info!(dependency = dependency.as_str(), ready, "Dependency availability changed");
                } else {
                    debug!(dependency = dependency.as_str(), ready, "Dependency availability unchanged");
                }
                cache.set(ready);
                if let Some(health) = &health_state {
                    health.metrics.set_dependency_ready(dependency.as_str(), ready);
                }
            }
            Err(e) => {
                warn!(dependency = dependency.as_str(), error = %e, "Dependency watch error");
            }
        }
    }

    warn!(dependency = dependency.as_str(), "Dependency watch stopped");
}
