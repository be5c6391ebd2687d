//! Shared context for the controllers.
//!
//! The Context struct holds shared state that is passed to every reconciler:
//! the Kubernetes client, the event reporter, the readiness caches fed by
//! the dependency watches and the collaborators the state chains call.

use std::sync::Arc;

use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
use tokio_util::sync::CancellationToken;

use crate::config::OperatorConfig;
use crate::controller::arbiter::ReconcileAllTrigger;
use crate::controller::error::Result;
use crate::controller::installer::ManifestInstaller;
use crate::controller::manifest::KubeManifestInstaller;
use crate::controller::probe::{HttpPodProber, PodProber};
use crate::controller::readiness::ReadinessCache;
use crate::controller::store::{KubeStore, ObjectStore};
use crate::health::HealthState;

/// Field manager name for the operator
pub const FIELD_MANAGER: &str = "registry-proxy-operator";

/// A Kubernetes event a state chain wants published once the tick is over.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Milestone {
    pub warning: bool,
    pub reason: &'static str,
    pub action: &'static str,
    pub note: Option<String>,
}

impl Milestone {
    pub fn normal(reason: &'static str, action: &'static str, note: impl Into<String>) -> Self {
        Self {
            warning: false,
            reason,
            action,
            note: Some(note.into()),
        }
    }

    pub fn warning(reason: &'static str, action: &'static str, note: impl Into<String>) -> Self {
        Self {
            warning: true,
            reason,
            action,
            note: Some(note.into()),
        }
    }
}

/// Everything a state chain talks to, borrowed for one tick.
pub struct Collaborators<'a, S> {
    pub store: &'a S,
    pub config: &'a OperatorConfig,
    /// Connectivity Proxy CRD present.
    pub connectivity_proxy: &'a ReadinessCache,
    /// Istio PeerAuthentication CRD present.
    pub istio: &'a ReadinessCache,
    pub installer: &'a dyn ManifestInstaller,
    pub prober: &'a dyn PodProber,
    pub reconcile_all: &'a ReconcileAllTrigger,
}

/// Shared context for the controllers
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Event reporter identity
    reporter: Reporter,
    /// Optional health state for metrics and readiness
    pub health_state: Option<Arc<HealthState>>,
    pub config: OperatorConfig,
    pub connectivity_proxy: Arc<ReadinessCache>,
    pub istio: Arc<ReadinessCache>,
    pub installer: Arc<dyn ManifestInstaller>,
    pub prober: Arc<dyn PodProber>,
    /// Cancelled on shutdown; checked between state steps.
    pub cancel: CancellationToken,
    pub reconcile_all: ReconcileAllTrigger,
}

impl Context {
    /// Create a new context with cluster-backed collaborators.
    pub fn new(
        client: Client,
        config: OperatorConfig,
        health_state: Option<Arc<HealthState>>,
        cancel: CancellationToken,
        reconcile_all: ReconcileAllTrigger,
    ) -> Result<Self> {
        let prober = HttpPodProber::new(config.probe_timeout)?;
        Ok(Self {
            installer: Arc::new(KubeManifestInstaller::new(client.clone())),
            prober: Arc::new(prober),
            reporter: Reporter {
                controller: FIELD_MANAGER.into(),
                instance: std::env::var("POD_NAME").ok(),
            },
            client,
            health_state,
            config,
            connectivity_proxy: Arc::new(ReadinessCache::default()),
            istio: Arc::new(ReadinessCache::default()),
            cancel,
            reconcile_all,
        })
    }

    pub fn store(&self) -> KubeStore {
        KubeStore::new(self.client.clone())
    }

    /// Borrow the collaborators for one tick against `store`.
    pub fn collaborators<'a, S: ObjectStore>(&'a self, store: &'a S) -> Collaborators<'a, S> {
        Collaborators {
            store,
            config: &self.config,
            connectivity_proxy: &self.connectivity_proxy,
            istio: &self.istio,
            installer: self.installer.as_ref(),
            prober: self.prober.as_ref(),
            reconcile_all: &self.reconcile_all,
        }
    }

    /// Create an event recorder for publishing Kubernetes events
    fn recorder(&self) -> Recorder {
        Recorder::new(self.client.clone(), self.reporter.clone())
    }

    async fn publish<K>(&self, resource: &K, type_: EventType, reason: &str, action: &str, note: Option<String>)
    where
        K: Resource<DynamicType = ()>,
    {
        let object_ref = resource.object_ref(&());
        if let Err(e) = self
            .recorder()
            .publish(
                &Event {
                    type_,
                    reason: reason.into(),
                    note,
                    action: action.into(),
                    secondary: None,
                },
                &object_ref,
            )
            .await
        {
            tracing::warn!(reason = %reason, error = %e, "Failed to publish event");
        }
    }

    /// Publish a normal event for a resource
    pub async fn publish_normal_event<K>(&self, resource: &K, reason: &str, action: &str, note: Option<String>)
    where
        K: Resource<DynamicType = ()>,
    {
        self.publish(resource, EventType::Normal, reason, action, note)
            .await;
    }

    /// Publish a warning event for a resource
    pub async fn publish_warning_event<K>(&self, resource: &K, reason: &str, action: &str, note: Option<String>)
    where
        K: Resource<DynamicType = ()>,
    {
        self.publish(resource, EventType::Warning, reason, action, note)
            .await;
    }

    /// Publish the milestones a tick collected.
    pub async fn publish_milestones<K>(&self, resource: &K, milestones: &[Milestone])
    where
        K: Resource<DynamicType = ()>,
    {
        for milestone in milestones {
            if milestone.warning {
                self.publish_warning_event(resource, milestone.reason, milestone.action, milestone.note.clone())
                    .await;
            } else {
                self.publish_normal_event(resource, milestone.reason, milestone.action, milestone.note.clone())
                    .await;
            }
        }
    }
}
