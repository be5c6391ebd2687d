//! Connection state chain.
//!
//! ```text
//! ValidateDependency -> ValidateProxyUrl -> ResolveProxyUrl -> ResolveNodePorts
//!   -> HandleDeployment -> HandlePodStatus -> HandleService
//!   -> HandlePeerAuthentication -> HandleStatus
//! ```
//!
//! The authorization container needs the NodePort the platform assigns to
//! the authorization Service port, so a Connection with an authorization
//! host converges over a few ticks: Deployment, Service, then the
//! Deployment again once the port is known.

use std::fmt::{Display, Formatter};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Probe, Service};
use kube::ResourceExt;
use tracing::debug;

use crate::controller::context::{Collaborators, Milestone};
use crate::controller::converge::{Converged, converge, converge_from};
use crate::controller::engine::{Flow, REQUEUE_SLOW, StateMachine};
use crate::controller::error::Result;
use crate::controller::probe::{container_probes, is_success, latest_pod, pod_ip, probe_url};
use crate::controller::proxy_url::{resolve_connectivity_proxy_url, validate_proxy_url};
use crate::controller::store::ObjectStore;
use crate::crd::{
    Condition, ConditionStatus, Connection, ConnectionCondition, ConnectionReason,
    ConnectionStatus,
};
use crate::resources::common::LABEL_APP;
use crate::resources::deployment::{
    AUTHORIZATION_CONTAINER_NAME, AuthorizationTarget, ProxyWorkload, REGISTRY_CONTAINER_NAME,
    generate_deployment,
};
use crate::resources::peer_authentication::generate_peer_authentication;
use crate::resources::services::{ServiceOptions, generate_service, node_port};

/// Wait for a pod IP or an assigned NodePort.
pub const REQUEUE_FAST: Duration = Duration::from_secs(10);

/// Steps of the Connection chain.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    ValidateDependency,
    ValidateProxyUrl,
    ResolveProxyUrl,
    ResolveNodePorts,
    HandleDeployment,
    HandlePodStatus,
    HandleService,
    HandlePeerAuthentication,
    HandleStatus,
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// One tick of a Connection.
pub struct ConnectionMachine<'a, S> {
    conn: Connection,
    status: ConnectionStatus,
    deps: Collaborators<'a, S>,
    milestones: Vec<Milestone>,
    proxy_url: String,
    node_port: i32,
    authorization_node_port: i32,
}

/// Which probe of the pod is being mapped.
#[derive(Clone, Copy)]
enum ProbeKind {
    Liveness,
    Readiness,
}

impl<'a, S: ObjectStore> ConnectionMachine<'a, S> {
    pub fn new(conn: Connection, deps: Collaborators<'a, S>) -> Self {
        let status = conn.status.clone().unwrap_or_default();
        Self {
            conn,
            status,
            deps,
            milestones: Vec::new(),
            proxy_url: String::new(),
            node_port: 0,
            authorization_node_port: 0,
        }
    }

    pub fn resource(&self) -> &Connection {
        &self.conn
    }

    pub fn milestones(&self) -> &[Milestone] {
        &self.milestones
    }

    fn namespace(&self) -> String {
        self.conn.namespace().unwrap_or_default()
    }

    fn set_condition(
        &mut self,
        condition: ConnectionCondition,
        status: ConditionStatus,
        reason: ConnectionReason,
        message: impl Into<String>,
    ) {
        self.status.conditions.set(
            Condition::new(condition.as_str(), status, reason.as_str(), message)
                .with_generation(self.conn.metadata.generation),
        );
    }

    fn validate_dependency(&mut self) -> Flow<ConnectionState> {
        if self.conn.spec.proxy.url().is_some() {
            return Flow::Next(ConnectionState::ValidateProxyUrl);
        }
        if !self.deps.connectivity_proxy.get() {
            self.set_condition(
                ConnectionCondition::Configured,
                ConditionStatus::False,
                ConnectionReason::ConnectivityProxyCrdUnknown,
                "Connectivity Proxy not installed. This module is required.",
            );
            return Flow::requeue_after(REQUEUE_SLOW);
        }
        self.set_condition(
            ConnectionCondition::Configured,
            ConditionStatus::True,
            ConnectionReason::ConnectivityProxyCrdFound,
            "Connectivity Proxy installed.",
        );
        Flow::Next(ConnectionState::ValidateProxyUrl)
    }

    fn validate_proxy_url(&mut self) -> Flow<ConnectionState> {
        if let Some(url) = self.conn.spec.proxy.url() {
            if let Err(cause) = validate_proxy_url(url) {
                self.set_condition(
                    ConnectionCondition::ConnectionReady,
                    ConditionStatus::False,
                    ConnectionReason::InvalidProxyUrl,
                    format!("Invalid Connectivity Proxy URL: {cause}"),
                );
                return Flow::Stop;
            }
        }
        Flow::Next(ConnectionState::ResolveProxyUrl)
    }

    async fn resolve_proxy_url(&mut self) -> Result<Flow<ConnectionState>> {
        self.proxy_url = match self.conn.spec.proxy.url() {
            Some(url) => url.to_string(),
            None => {
                resolve_connectivity_proxy_url(self.deps.store, &self.deps.config.module_namespace)
                    .await?
            }
        };
        Ok(Flow::Next(ConnectionState::ResolveNodePorts))
    }

    async fn resolve_node_ports(&mut self) -> Result<Flow<ConnectionState>> {
        let service: Option<Service> = self
            .deps
            .store
            .get(&self.namespace(), &self.conn.name_any())
            .await?;
        if let Some(service) = service {
            self.node_port = node_port(&service, REGISTRY_CONTAINER_NAME);
            self.authorization_node_port = node_port(&service, AUTHORIZATION_CONTAINER_NAME);
        }
        Ok(Flow::Next(ConnectionState::HandleDeployment))
    }

    fn desired_deployment(&self) -> Deployment {
        let spec = &self.conn.spec;
        let workload = ProxyWorkload {
            proxy_url: &self.proxy_url,
            target_host: &spec.target.host,
            location_id: Some(spec.proxy.location_id()).filter(|id| !id.is_empty()),
            log_level: Some(spec.log_level),
            resources: spec.resources.as_ref(),
            header_secret: spec.target.authorization.header_secret(),
            authorization: spec.target.authorization.host().map(|host| AuthorizationTarget {
                host,
                node_port: self.authorization_node_port,
            }),
        };
        generate_deployment(&self.conn, &workload, self.deps.config)
    }

    async fn handle_deployment(&mut self) -> Result<Flow<ConnectionState>> {
        let name = self.conn.name_any();
        let current: Option<Deployment> = self.deps.store.get(&self.namespace(), &name).await?;
        let creating = current.is_none();
        let desired = self.desired_deployment();

        match converge_from(self.deps.store, &self.conn, current, desired).await {
            Ok(Converged::Unchanged(_)) => Ok(Flow::Next(ConnectionState::HandlePodStatus)),
            Ok(Converged::Created(_)) => {
                self.set_condition(
                    ConnectionCondition::ConnectionDeployed,
                    ConditionStatus::Unknown,
                    ConnectionReason::DeploymentCreated,
                    format!("Deployment {name} created"),
                );
                self.milestones
                    .push(Milestone::normal("DeploymentCreated", "Create", format!("Deployment {name} created")));
                Ok(Flow::requeue_after(REQUEUE_SLOW))
            }
            Ok(Converged::Updated(_)) => {
                self.set_condition(
                    ConnectionCondition::ConnectionDeployed,
                    ConditionStatus::Unknown,
                    ConnectionReason::DeploymentUpdated,
                    format!("Deployment {name} updated"),
                );
                Ok(Flow::requeue_after(REQUEUE_SLOW))
            }
            Err(e) => {
                let verb = if creating { "create" } else { "update" };
                self.set_condition(
                    ConnectionCondition::ConnectionDeployed,
                    ConditionStatus::False,
                    ConnectionReason::DeploymentFailed,
                    format!("Deployment {name} {verb} failed: {e}"),
                );
                Err(e)
            }
        }
    }

    /// Map one probe answer onto its condition.
    async fn handle_probe(&mut self, ip: &str, probe: Option<&Probe>, kind: ProbeKind) -> Result<()> {
        let (condition, ok_reason, ok_message, fail_reason, fail_prefix) = match kind {
            ProbeKind::Liveness => (
                ConnectionCondition::ConnectionDeployed,
                ConnectionReason::ResourcesDeployed,
                "Reverse-proxy ready",
                ConnectionReason::ResourcesNotReady,
                "Reverse-proxy not ready",
            ),
            ProbeKind::Readiness => (
                ConnectionCondition::ConnectionReady,
                ConnectionReason::Established,
                "Target registry reachable",
                ConnectionReason::NotEstablished,
                "Target registry not reachable",
            ),
        };

        let answer = match probe_url(ip, probe) {
            Ok(url) => self.deps.prober.probe(&url).await,
            Err(e) => Err(e),
        };
        match answer {
            Err(e) => {
                self.set_condition(
                    condition,
                    ConditionStatus::False,
                    ConnectionReason::Error,
                    format!("{fail_prefix}: {e}"),
                );
                Err(e)
            }
            Ok(code) if is_success(code) => {
                self.set_condition(condition, ConditionStatus::True, ok_reason, ok_message);
                Ok(())
            }
            Ok(code) => {
                self.set_condition(
                    condition,
                    ConditionStatus::False,
                    fail_reason,
                    format!("{fail_prefix}: probe has returned status {code}"),
                );
                Ok(())
            }
        }
    }

    async fn handle_pod_status(&mut self) -> Result<Flow<ConnectionState>> {
        let selector = format!("{LABEL_APP}={}", self.conn.name_any());
        let pods: Vec<Pod> = self
            .deps
            .store
            .list(Some(&self.namespace()), Some(&selector))
            .await?;

        let Some(pod) = latest_pod(&pods) else {
            self.set_condition(
                ConnectionCondition::ConnectionDeployed,
                ConditionStatus::False,
                ConnectionReason::ResourcesNotReady,
                "no pod exists",
            );
            self.set_condition(
                ConnectionCondition::ConnectionReady,
                ConditionStatus::False,
                ConnectionReason::NotEstablished,
                "no pod exists",
            );
            return Ok(Flow::requeue_after(REQUEUE_SLOW));
        };

        let Some(ip) = pod_ip(pod).map(str::to_string) else {
            debug!(pod = %pod.name_any(), "pod IP not assigned yet");
            return Ok(Flow::requeue_after(REQUEUE_FAST));
        };
        let (liveness, readiness) = container_probes(pod);

        self.handle_probe(&ip, liveness.as_ref(), ProbeKind::Liveness)
            .await?;
        self.handle_probe(&ip, readiness.as_ref(), ProbeKind::Readiness)
            .await?;
        Ok(Flow::Next(ConnectionState::HandleService))
    }

    async fn handle_service(&mut self) -> Result<Flow<ConnectionState>> {
        let spec = &self.conn.spec;
        let authorization = spec.target.authorization.host().is_some();
        let desired = generate_service(
            &self.conn,
            ServiceOptions {
                node_port: spec.node_port,
                authorization,
            },
        );

        let service = match converge(self.deps.store, &self.conn, desired).await? {
            Converged::Created(_) => {
                self.status.node_port = 0;
                return Ok(Flow::requeue_after(REQUEUE_SLOW));
            }
            Converged::Updated(_) => return Ok(Flow::requeue_after(REQUEUE_SLOW)),
            Converged::Unchanged(service) => service,
        };

        let registry = node_port(&service, REGISTRY_CONTAINER_NAME);
        if registry == 0 {
            return Ok(Flow::requeue_after(REQUEUE_SLOW));
        }
        self.node_port = registry;

        if authorization {
            let authorization_port = node_port(&service, AUTHORIZATION_CONTAINER_NAME);
            if authorization_port == 0 {
                return Ok(Flow::requeue_after(REQUEUE_FAST));
            }
            self.authorization_node_port = authorization_port;
        }
        Ok(Flow::Next(ConnectionState::HandlePeerAuthentication))
    }

    async fn handle_peer_authentication(&mut self) -> Result<Flow<ConnectionState>> {
        if !self.deps.istio.get() {
            return Ok(Flow::Next(ConnectionState::HandleStatus));
        }
        let desired = generate_peer_authentication(&self.conn);
        match converge(self.deps.store, &self.conn, desired).await? {
            Converged::Unchanged(_) => Ok(Flow::Next(ConnectionState::HandleStatus)),
            Converged::Created(_) | Converged::Updated(_) => Ok(Flow::requeue_after(REQUEUE_SLOW)),
        }
    }

    fn handle_status(&mut self) -> Flow<ConnectionState> {
        self.status.proxy_url.clone_from(&self.proxy_url);
        self.status.node_port = self.node_port;
        Flow::Stop
    }
}

#[async_trait]
impl<S: ObjectStore> StateMachine for ConnectionMachine<'_, S> {
    type State = ConnectionState;
    type Status = ConnectionStatus;

    fn status(&self) -> &ConnectionStatus {
        &self.status
    }

    async fn step(&mut self, state: ConnectionState) -> Result<Flow<ConnectionState>> {
        match state {
            ConnectionState::ValidateDependency => Ok(self.validate_dependency()),
            ConnectionState::ValidateProxyUrl => Ok(self.validate_proxy_url()),
            ConnectionState::ResolveProxyUrl => self.resolve_proxy_url().await,
            ConnectionState::ResolveNodePorts => self.resolve_node_ports().await,
            ConnectionState::HandleDeployment => self.handle_deployment().await,
            ConnectionState::HandlePodStatus => self.handle_pod_status().await,
            ConnectionState::HandleService => self.handle_service().await,
            ConnectionState::HandlePeerAuthentication => self.handle_peer_authentication().await,
            ConnectionState::HandleStatus => Ok(self.handle_status()),
        }
    }

    async fn persist_status(&mut self) -> Result<()> {
        self.conn = self.deps.store.update_status(&self.conn, &self.status).await?;
        Ok(())
    }
}
