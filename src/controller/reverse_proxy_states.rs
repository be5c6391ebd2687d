//! ImagePullReverseProxy state chain.
//!
//! ```text
//! ValidateDependency -> ValidateProxyUrl -> ResolveProxyUrl -> HandleDeployment
//!   -> HandleService -> HandlePodStatus -> HandleStatus
//! ```

use std::fmt::{Display, Formatter};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Probe};
use kube::ResourceExt;
use tracing::debug;

use crate::controller::connection_states::REQUEUE_FAST;
use crate::controller::context::{Collaborators, Milestone};
use crate::controller::converge::{Converged, converge, converge_from};
use crate::controller::engine::{Flow, REQUEUE_SLOW, StateMachine};
use crate::controller::error::Result;
use crate::controller::probe::{
    container_probes, is_success, latest_pod, pod_ip, probe_path, probe_url,
};
use crate::controller::proxy_url::{resolve_connectivity_proxy_url, validate_proxy_url};
use crate::controller::store::ObjectStore;
use crate::crd::{
    Condition, ConditionStatus, ImagePullReverseProxy, ImagePullReverseProxyStatus,
    ReverseProxyCondition, ReverseProxyReason,
};
use crate::resources::common::LABEL_APP;
use crate::resources::deployment::{ProxyWorkload, REGISTRY_CONTAINER_NAME, generate_deployment};
use crate::resources::services::{ServiceOptions, generate_service, node_port};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReverseProxyState {
    ValidateDependency,
    ValidateProxyUrl,
    ResolveProxyUrl,
    HandleDeployment,
    HandleService,
    HandlePodStatus,
    HandleStatus,
}

impl Display for ReverseProxyState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// One tick of an ImagePullReverseProxy.
pub struct ReverseProxyMachine<'a, S> {
    rp: ImagePullReverseProxy,
    status: ImagePullReverseProxyStatus,
    deps: Collaborators<'a, S>,
    milestones: Vec<Milestone>,
    proxy_url: String,
    node_port: i32,
}

impl<'a, S: ObjectStore> ReverseProxyMachine<'a, S> {
    pub fn new(rp: ImagePullReverseProxy, deps: Collaborators<'a, S>) -> Self {
        let status = rp.status.clone().unwrap_or_default();
        Self {
            rp,
            status,
            deps,
            milestones: Vec::new(),
            proxy_url: String::new(),
            node_port: 0,
        }
    }

    pub fn resource(&self) -> &ImagePullReverseProxy {
        &self.rp
    }

    pub fn milestones(&self) -> &[Milestone] {
        &self.milestones
    }

    fn namespace(&self) -> String {
        self.rp.namespace().unwrap_or_default()
    }

    fn spec_proxy_url(&self) -> Option<&str> {
        self.rp.spec.proxy_url.as_deref().filter(|url| !url.is_empty())
    }

    fn set_condition(
        &mut self,
        condition: ReverseProxyCondition,
        status: ConditionStatus,
        reason: ReverseProxyReason,
        message: impl Into<String>,
    ) {
        self.status.conditions.set(
            Condition::new(condition.as_str(), status, reason.as_str(), message)
                .with_generation(self.rp.metadata.generation),
        );
    }

    fn validate_dependency(&mut self) -> Flow<ReverseProxyState> {
        if !self.deps.connectivity_proxy.get() {
            self.set_condition(
                ReverseProxyCondition::Configured,
                ConditionStatus::False,
                ReverseProxyReason::ConnectivityProxyCrdUnknown,
                "Connectivity Proxy not installed. This module is required.",
            );
            return Flow::requeue_after(REQUEUE_SLOW);
        }
        self.set_condition(
            ReverseProxyCondition::Configured,
            ConditionStatus::True,
            ReverseProxyReason::ConnectivityProxyCrdFound,
            "Connectivity Proxy installed.",
        );
        Flow::Next(ReverseProxyState::ValidateProxyUrl)
    }

    fn validate_proxy_url(&mut self) -> Flow<ReverseProxyState> {
        let invalid = self.spec_proxy_url().and_then(|url| validate_proxy_url(url).err());
        if let Some(cause) = invalid {
            self.set_condition(
                ReverseProxyCondition::Ready,
                ConditionStatus::False,
                ReverseProxyReason::InvalidProxyUrl,
                format!("Invalid Connectivity Proxy URL: {cause}"),
            );
            return Flow::Stop;
        }
        Flow::Next(ReverseProxyState::ResolveProxyUrl)
    }

    async fn resolve_proxy_url(&mut self) -> Result<Flow<ReverseProxyState>> {
        self.proxy_url = match self.spec_proxy_url() {
            Some(url) => url.to_string(),
            None => {
                resolve_connectivity_proxy_url(self.deps.store, &self.deps.config.module_namespace)
                    .await?
            }
        };
        Ok(Flow::Next(ReverseProxyState::HandleDeployment))
    }

    async fn handle_deployment(&mut self) -> Result<Flow<ReverseProxyState>> {
        let name = self.rp.name_any();
        let current: Option<Deployment> = self.deps.store.get(&self.namespace(), &name).await?;
        let creating = current.is_none();
        let workload = ProxyWorkload {
            proxy_url: &self.proxy_url,
            target_host: &self.rp.spec.target_host,
            log_level: self.rp.spec.log_level,
            resources: self.rp.spec.resources.as_ref(),
            ..Default::default()
        };
        let desired = generate_deployment(&self.rp, &workload, self.deps.config);

        match converge_from(self.deps.store, &self.rp, current, desired).await {
            Ok(Converged::Unchanged(_)) => Ok(Flow::Next(ReverseProxyState::HandleService)),
            Ok(Converged::Created(_)) => {
                self.set_condition(
                    ReverseProxyCondition::Running,
                    ConditionStatus::Unknown,
                    ReverseProxyReason::DeploymentCreated,
                    format!("Deployment {name} created"),
                );
                self.milestones
                    .push(Milestone::normal("DeploymentCreated", "Create", format!("Deployment {name} created")));
                Ok(Flow::requeue_after(REQUEUE_SLOW))
            }
            Ok(Converged::Updated(_)) => {
                self.set_condition(
                    ReverseProxyCondition::Running,
                    ConditionStatus::Unknown,
                    ReverseProxyReason::DeploymentUpdated,
                    format!("Deployment {name} updated"),
                );
                Ok(Flow::requeue_after(REQUEUE_SLOW))
            }
            Err(e) => {
                let verb = if creating { "create" } else { "update" };
                self.set_condition(
                    ReverseProxyCondition::Running,
                    ConditionStatus::False,
                    ReverseProxyReason::DeploymentFailed,
                    format!("Deployment {name} {verb} failed: {e}"),
                );
                Err(e)
            }
        }
    }

    async fn handle_service(&mut self) -> Result<Flow<ReverseProxyState>> {
        let desired = generate_service(&self.rp, ServiceOptions::default());
        match converge(self.deps.store, &self.rp, desired).await? {
            Converged::Created(_) => {
                self.status.node_port = 0;
                Ok(Flow::requeue_after(REQUEUE_SLOW))
            }
            Converged::Updated(_) => Ok(Flow::requeue_after(REQUEUE_SLOW)),
            Converged::Unchanged(service) => {
                let port = node_port(&service, REGISTRY_CONTAINER_NAME);
                if port == 0 {
                    return Ok(Flow::requeue_after(REQUEUE_SLOW));
                }
                self.node_port = port;
                Ok(Flow::Next(ReverseProxyState::HandlePodStatus))
            }
        }
    }

    async fn handle_probe(
        &mut self,
        ip: &str,
        probe: Option<&Probe>,
        condition: ReverseProxyCondition,
    ) -> Result<()> {
        let answer = match probe_url(ip, probe) {
            Ok(url) => self.deps.prober.probe(&url).await,
            Err(e) => Err(e),
        };
        match answer {
            Err(e) => {
                self.set_condition(
                    condition,
                    ConditionStatus::False,
                    ReverseProxyReason::ProbeError,
                    format!("cannot read health probe:{e}"),
                );
                Err(e)
            }
            Ok(code) if is_success(code) => {
                self.set_condition(condition, ConditionStatus::True, ReverseProxyReason::ProbeSuccess, "");
                Ok(())
            }
            Ok(code) => {
                let path = probe.map(probe_path).unwrap_or_default();
                self.set_condition(
                    condition,
                    ConditionStatus::False,
                    ReverseProxyReason::ProbeFailure,
                    format!("{path} probe has returned {code} status"),
                );
                Ok(())
            }
        }
    }

    async fn handle_pod_status(&mut self) -> Result<Flow<ReverseProxyState>> {
        let selector = format!("{LABEL_APP}={}", self.rp.name_any());
        let pods: Vec<Pod> = self
            .deps
            .store
            .list(Some(&self.namespace()), Some(&selector))
            .await?;

        let Some(pod) = latest_pod(&pods) else {
            for condition in [ReverseProxyCondition::Running, ReverseProxyCondition::Ready] {
                self.set_condition(
                    condition,
                    ConditionStatus::False,
                    ReverseProxyReason::ProbeError,
                    "no pod exists",
                );
            }
            return Ok(Flow::requeue_after(REQUEUE_SLOW));
        };

        let Some(ip) = pod_ip(pod).map(str::to_string) else {
            debug!(pod = %pod.name_any(), "pod IP not assigned yet");
            return Ok(Flow::requeue_after(REQUEUE_FAST));
        };
        let (liveness, readiness) = container_probes(pod);

        self.handle_probe(&ip, liveness.as_ref(), ReverseProxyCondition::Running)
            .await?;
        self.handle_probe(&ip, readiness.as_ref(), ReverseProxyCondition::Ready)
            .await?;
        Ok(Flow::Next(ReverseProxyState::HandleStatus))
    }

    fn handle_status(&mut self) -> Flow<ReverseProxyState> {
        self.status.proxy_url.clone_from(&self.proxy_url);
        self.status.node_port = self.node_port;
        Flow::Stop
    }
}

#[async_trait]
impl<S: ObjectStore> StateMachine for ReverseProxyMachine<'_, S> {
    type State = ReverseProxyState;
    type Status = ImagePullReverseProxyStatus;

    fn status(&self) -> &ImagePullReverseProxyStatus {
        &self.status
    }

    async fn step(&mut self, state: ReverseProxyState) -> Result<Flow<ReverseProxyState>> {
        match state {
            ReverseProxyState::ValidateDependency => Ok(self.validate_dependency()),
            ReverseProxyState::ValidateProxyUrl => Ok(self.validate_proxy_url()),
            ReverseProxyState::ResolveProxyUrl => self.resolve_proxy_url().await,
            ReverseProxyState::HandleDeployment => self.handle_deployment().await,
            ReverseProxyState::HandleService => self.handle_service().await,
            ReverseProxyState::HandlePodStatus => self.handle_pod_status().await,
            ReverseProxyState::HandleStatus => Ok(self.handle_status()),
        }
    }

    async fn persist_status(&mut self) -> Result<()> {
        self.rp = self.deps.store.update_status(&self.rp, &self.status).await?;
        Ok(())
    }
}
