//! RegistryProxy state chain.
//!
//! ```text
//! ServedFilter -> AddFinalizer -> Initialize -+-> Validate -> Apply -> Verify
//!                                             |
//!                                             +-> DeleteResources -> SafeDeletion
//!                                                 -> Uninstall -> RemoveFinalizer
//! ```
//!
//! The served instance installs the packaged module manifest; every other
//! instance is marked redundant and never gets past `ServedFilter`.

use std::fmt::{Display, Formatter};
use std::time::Duration;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::controller::arbiter::{
    Election, duplicate_message, elect, release_redundant_peers, served_peer_exists,
};
use crate::controller::context::{Collaborators, Milestone};
use crate::controller::engine::{Flow, REQUEUE_SLOW, StateMachine};
use crate::controller::error::{Error, Result};
use crate::controller::finalizer::{add_finalizer, has_finalizer, remove_finalizer};
use crate::controller::installer::{InstallFlags, ManifestConfig, UninstallKind};
use crate::controller::proxy_url::validate_proxy_url;
use crate::controller::store::ObjectStore;
use crate::crd::{
    Condition, ConditionStatus, REGISTRY_PROXY_FINALIZER, RegistryProxy, RegistryProxyCondition,
    RegistryProxyReason, RegistryProxyStatus, Served, State,
};
use crate::resources::common::MANAGED_BY;

/// Poll interval while the installed workloads roll out.
pub const REQUEUE_VERIFY: Duration = Duration::from_secs(3);
/// Poll interval while a group of uninstalled objects terminates.
pub const REQUEUE_UNINSTALL: Duration = Duration::from_secs(1);
/// Retry interval while an older contender is arbitrated first.
pub const REQUEUE_ELECTION: Duration = Duration::from_secs(3);

/// Steps of the RegistryProxy chain.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OperatorState {
    ServedFilter,
    AddFinalizer,
    Initialize,
    Validate,
    Apply,
    Verify,
    DeleteResources,
    SafeDeletion,
    Uninstall,
    RemoveFinalizer,
}

impl Display for OperatorState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// One tick of a RegistryProxy.
pub struct OperatorMachine<'a, S> {
    rp: RegistryProxy,
    status: RegistryProxyStatus,
    deps: Collaborators<'a, S>,
    milestones: Vec<Milestone>,
}

impl<'a, S: ObjectStore> OperatorMachine<'a, S> {
    pub fn new(rp: RegistryProxy, deps: Collaborators<'a, S>) -> Self {
        let status = rp.status.clone().unwrap_or_default();
        Self {
            rp,
            status,
            deps,
            milestones: Vec::new(),
        }
    }

    pub fn resource(&self) -> &RegistryProxy {
        &self.rp
    }

    /// Events collected during the tick.
    pub fn milestones(&self) -> &[Milestone] {
        &self.milestones
    }

    fn manifest_config(&self) -> ManifestConfig {
        ManifestConfig {
            release_name: format!(
                "{}/{}",
                self.rp.namespace().unwrap_or_default(),
                self.rp.name_any()
            ),
            namespace: self.deps.config.module_namespace.clone(),
            manifest_dir: self.deps.config.manifest_dir.clone(),
        }
    }

    fn set_condition(
        &mut self,
        condition: RegistryProxyCondition,
        status: ConditionStatus,
        reason: RegistryProxyReason,
        message: impl Into<String>,
    ) {
        self.status.conditions.set(
            Condition::new(condition.as_str(), status, reason.as_str(), message)
                .with_generation(self.rp.metadata.generation),
        );
    }

    fn install_values(&self) -> serde_json::Value {
        let config = self.deps.config;
        let mut flags = InstallFlags::new()
            .with_managed_by_label(MANAGED_BY)
            .with_istio_installed(self.deps.istio.get());
        if let Some(url) = self.rp.spec.proxy.url() {
            flags = flags.with_proxy_url(url);
        }
        let location_id = self.rp.spec.proxy.location_id();
        if !location_id.is_empty() {
            flags = flags.with_proxy_location_id(location_id);
        }
        if let Some(image) = config.image_registry_proxy.as_deref() {
            flags = flags.with_image_registry_proxy(image);
        }
        if let Some(image) = config.image_connection.as_deref() {
            flags = flags.with_image_connection(image);
        }
        flags.build()
    }

    async fn served_filter(&mut self) -> Result<Flow<OperatorState>> {
        if self.status.served == Some(Served::True) {
            return Ok(Flow::Next(OperatorState::AddFinalizer));
        }
        if self.rp.metadata.deletion_timestamp.is_some() {
            // Never served, so nothing was installed
            return Ok(Flow::Stop);
        }

        let peers: Vec<RegistryProxy> = self.deps.store.list(None, None).await?;
        if self.status.served == Some(Served::False) && served_peer_exists(&self.rp, &peers) {
            return Ok(Flow::Stop);
        }

        match elect(&self.rp, &peers) {
            Election::Served => {
                info!(name = %self.rp.name_any(), "elected as served RegistryProxy");
                self.status.served = Some(Served::True);
                self.status.state = Some(State::Processing);
                // Left over from an earlier round as a redundant instance
                self.status
                    .conditions
                    .remove(RegistryProxyCondition::Configured.as_str());
                self.milestones.push(Milestone::normal(
                    "Served",
                    "Arbitrate",
                    "This RegistryProxy is the served instance",
                ));
                Ok(Flow::Next(OperatorState::AddFinalizer))
            }
            Election::Redundant { served_peer } => {
                let message = duplicate_message(&served_peer);
                warn!(name = %self.rp.name_any(), served = %served_peer, "redundant RegistryProxy");
                self.status.served = Some(Served::False);
                self.status.state = Some(State::Warning);
                self.set_condition(
                    RegistryProxyCondition::Configured,
                    ConditionStatus::False,
                    RegistryProxyReason::Duplicated,
                    message.clone(),
                );
                self.milestones
                    .push(Milestone::warning("Duplicated", "Arbitrate", message));
                Ok(Flow::Stop)
            }
            Election::Deferred { peer } => {
                debug!(name = %self.rp.name_any(), older = %peer, "older RegistryProxy is arbitrated first");
                Ok(Flow::requeue_after(REQUEUE_ELECTION))
            }
        }
    }

    async fn add_finalizer(&mut self) -> Result<Flow<OperatorState>> {
        if !has_finalizer(&self.rp, REGISTRY_PROXY_FINALIZER) {
            if self.rp.metadata.deletion_timestamp.is_some() {
                // Nothing was installed; let the object go
                return Ok(Flow::Stop);
            }
            add_finalizer(self.deps.store, &mut self.rp, REGISTRY_PROXY_FINALIZER).await?;
        }
        Ok(Flow::Next(OperatorState::Initialize))
    }

    fn initialize(&self) -> Flow<OperatorState> {
        if self.rp.metadata.deletion_timestamp.is_some() {
            Flow::Next(OperatorState::DeleteResources)
        } else {
            Flow::Next(OperatorState::Validate)
        }
    }

    fn validate(&mut self) -> Flow<OperatorState> {
        if let Some(url) = self.rp.spec.proxy.url() {
            if let Err(cause) = validate_proxy_url(url) {
                self.set_condition(
                    RegistryProxyCondition::PrerequisitesSatisfied,
                    ConditionStatus::False,
                    RegistryProxyReason::ProxyUrlInvalid,
                    format!("Invalid Proxy URL: {cause}"),
                );
                return Flow::Stop;
            }
            self.set_condition(
                RegistryProxyCondition::PrerequisitesSatisfied,
                ConditionStatus::True,
                RegistryProxyReason::ConnectivityProxySkipped,
                "Connectivity Proxy check skipped, .spec.proxy.url is set.",
            );
            return Flow::Next(OperatorState::Apply);
        }

        if !self.deps.connectivity_proxy.get() {
            self.status.state = Some(State::Warning);
            self.set_condition(
                RegistryProxyCondition::PrerequisitesSatisfied,
                ConditionStatus::False,
                RegistryProxyReason::ConnectivityProxyUnavailable,
                "Connectivity Proxy is unavailable. This module is required.",
            );
            return Flow::requeue_after(REQUEUE_SLOW);
        }

        self.set_condition(
            RegistryProxyCondition::PrerequisitesSatisfied,
            ConditionStatus::True,
            RegistryProxyReason::ConnectivityProxyAvailable,
            "Connectivity Proxy installed.",
        );
        Flow::Next(OperatorState::Apply)
    }

    async fn apply(&mut self) -> Result<Flow<OperatorState>> {
        if !self
            .status
            .conditions
            .is_set(RegistryProxyCondition::Installed.as_str())
        {
            self.status.state = Some(State::Processing);
            self.set_condition(
                RegistryProxyCondition::Installed,
                ConditionStatus::Unknown,
                RegistryProxyReason::Installation,
                "Installing for configuration",
            );
        }

        let values = self.install_values();
        if let Err(e) = self
            .deps
            .installer
            .install(&self.manifest_config(), &values)
            .await
        {
            self.status.state = Some(State::Error);
            self.set_condition(
                RegistryProxyCondition::Installed,
                ConditionStatus::False,
                RegistryProxyReason::InstallationErr,
                e.to_string(),
            );
            self.milestones
                .push(Milestone::warning("InstallationErr", "Install", e.to_string()));
            return Err(e);
        }
        Ok(Flow::Next(OperatorState::Verify))
    }

    async fn verify(&mut self) -> Result<Flow<OperatorState>> {
        let verification = match self.deps.installer.verify(&self.manifest_config()).await {
            Ok(verification) => verification,
            Err(e) => {
                self.status.state = Some(State::Error);
                self.set_condition(
                    RegistryProxyCondition::Installed,
                    ConditionStatus::False,
                    RegistryProxyReason::InstallationErr,
                    e.to_string(),
                );
                return Err(e);
            }
        };

        if verification.is_processing() {
            return Ok(Flow::requeue_after(REQUEUE_VERIFY));
        }

        if !verification.ready {
            self.status.state = Some(State::Error);
            self.set_condition(
                RegistryProxyCondition::DeploymentFailure,
                ConditionStatus::True,
                RegistryProxyReason::DeploymentReplicaFailure,
                verification.reason.clone(),
            );
            return Err(Error::Transient(verification.reason));
        }

        self.status
            .conditions
            .remove(RegistryProxyCondition::DeploymentFailure.as_str());
        if self.status.state != Some(State::Ready) {
            self.milestones.push(Milestone::normal(
                "Installed",
                "Install",
                "Registry Proxy installed",
            ));
        }
        self.status.state = Some(State::Ready);
        self.set_condition(
            RegistryProxyCondition::Installed,
            ConditionStatus::True,
            RegistryProxyReason::Installed,
            "Registry Proxy installed",
        );
        Ok(Flow::Stop)
    }

    fn delete_resources(&mut self) -> Flow<OperatorState> {
        self.status.state = Some(State::Deleting);
        self.set_condition(
            RegistryProxyCondition::Deleted,
            ConditionStatus::Unknown,
            RegistryProxyReason::Deletion,
            "Uninstalling",
        );
        Flow::Next(OperatorState::SafeDeletion)
    }

    async fn safe_deletion(&mut self) -> Result<Flow<OperatorState>> {
        let Err(e) = self
            .deps
            .installer
            .check_orphan_resources(&self.manifest_config())
            .await
        else {
            return Ok(Flow::Next(OperatorState::Uninstall));
        };

        self.status.state = Some(State::Warning);
        self.set_condition(
            RegistryProxyCondition::Deleted,
            ConditionStatus::False,
            RegistryProxyReason::DeletionErr,
            e.to_string(),
        );
        match e {
            // Waits for a human; the periodic resync re-checks
            Error::OrphanResources(hazard) => {
                warn!(name = %self.rp.name_any(), hazard = %hazard, "deletion blocked");
                self.milestones
                    .push(Milestone::warning("DeletionBlocked", "Delete", hazard));
                Ok(Flow::Stop)
            }
            other => Err(other),
        }
    }

    /// Delete one group; `true` once none of it is left.
    async fn empty_group(&self, kind: UninstallKind, config: &ManifestConfig) -> Result<bool> {
        kind.delete(self.deps.installer, config).await?;
        kind.is_empty(self.deps.installer, config).await
    }

    async fn uninstall(&mut self) -> Result<Flow<OperatorState>> {
        let config = self.manifest_config();
        for kind in UninstallKind::ORDER {
            match self.empty_group(kind, &config).await {
                Ok(true) => {}
                Ok(false) => {
                    self.status.state = Some(State::Deleting);
                    self.set_condition(
                        RegistryProxyCondition::Deleted,
                        ConditionStatus::True,
                        RegistryProxyReason::Deletion,
                        format!("Deleting {kind}"),
                    );
                    return Ok(Flow::requeue_after(REQUEUE_UNINSTALL));
                }
                Err(e) => {
                    self.status.state = Some(State::Error);
                    self.set_condition(
                        RegistryProxyCondition::Deleted,
                        ConditionStatus::False,
                        RegistryProxyReason::DeletionErr,
                        e.to_string(),
                    );
                    return Err(e);
                }
            }
        }

        self.status.state = Some(State::Deleting);
        self.set_condition(
            RegistryProxyCondition::Deleted,
            ConditionStatus::True,
            RegistryProxyReason::Deleted,
            "Registry Proxy module deleted",
        );
        Ok(Flow::Next(OperatorState::RemoveFinalizer))
    }

    async fn remove_finalizer(&mut self) -> Result<Flow<OperatorState>> {
        if !remove_finalizer(&mut self.rp, REGISTRY_PROXY_FINALIZER) {
            // Someone else removed it first
            return Ok(Flow::requeue_now());
        }
        self.rp = self.deps.store.update(&self.rp).await?;
        self.milestones.push(Milestone::normal(
            "Deleted",
            "Delete",
            "Registry Proxy module deleted",
        ));

        if self.status.served == Some(Served::True) {
            release_redundant_peers(self.deps.store, &self.rp, self.deps.reconcile_all).await?;
        }
        Ok(Flow::Stop)
    }
}

#[async_trait]
impl<S: ObjectStore> StateMachine for OperatorMachine<'_, S> {
    type State = OperatorState;
    type Status = RegistryProxyStatus;

    fn status(&self) -> &RegistryProxyStatus {
        &self.status
    }

    async fn step(&mut self, state: OperatorState) -> Result<Flow<OperatorState>> {
        match state {
            OperatorState::ServedFilter => self.served_filter().await,
            OperatorState::AddFinalizer => self.add_finalizer().await,
            OperatorState::Initialize => Ok(self.initialize()),
            OperatorState::Validate => Ok(self.validate()),
            OperatorState::Apply => self.apply().await,
            OperatorState::Verify => self.verify().await,
            OperatorState::DeleteResources => Ok(self.delete_resources()),
            OperatorState::SafeDeletion => self.safe_deletion().await,
            OperatorState::Uninstall => self.uninstall().await,
            OperatorState::RemoveFinalizer => self.remove_finalizer().await,
        }
    }

    async fn persist_status(&mut self) -> Result<()> {
        self.rp = self.deps.store.update_status(&self.rp, &self.status).await?;
        Ok(())
    }
}
