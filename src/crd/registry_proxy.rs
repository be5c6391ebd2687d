//! RegistryProxy Custom Resource Definition.
//!
//! The RegistryProxy is the module-level installer resource: a single served
//! instance per cluster installs the packaged registry-proxy manifests.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::condition::Conditions;
use super::connection::ProxySpec;

/// Finalizer guarding removal of the installed module resources.
pub const REGISTRY_PROXY_FINALIZER: &str = "registry-proxy-operator.kyma-project.io/deletion-hook";

/// RegistryProxy installs the registry-proxy module into the cluster.
///
/// Example:
/// ```yaml
/// apiVersion: operator.kyma-project.io/v1alpha1
/// kind: RegistryProxy
/// metadata:
///   name: default
///   namespace: kyma-system
/// spec: {}
/// ```
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "operator.kyma-project.io",
    version = "v1alpha1",
    kind = "RegistryProxy",
    plural = "registryproxies",
    shortname = "rp",
    status = "RegistryProxyStatus",
    namespaced,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Served", "type":"string", "jsonPath":".status.served"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RegistryProxySpec {
    /// Connectivity Proxy defaults passed to the installed components.
    #[serde(default)]
    pub proxy: ProxySpec,
}

/// Status of a RegistryProxy.
///
/// `state` and `served` serialize as `null` when unset so a status write can
/// clear them.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegistryProxyStatus {
    /// Coarse lifecycle state.
    #[serde(default)]
    pub state: Option<State>,

    /// Whether this instance is the one managed by the operator.
    #[serde(default)]
    pub served: Option<Served>,

    /// Conditions describing the current state.
    #[serde(default)]
    pub conditions: Conditions,
}

/// Lifecycle state of a RegistryProxy.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum State {
    /// Module installed and verified.
    Ready,
    /// Installation in progress.
    Processing,
    /// Needs user attention (duplicate instance, missing prerequisite, orphans).
    Warning,
    /// The controller failed to install or remove the module.
    Error,
    /// Module resources are being removed.
    Deleting,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            State::Ready => write!(f, "Ready"),
            State::Processing => write!(f, "Processing"),
            State::Warning => write!(f, "Warning"),
            State::Error => write!(f, "Error"),
            State::Deleting => write!(f, "Deleting"),
        }
    }
}

/// Singleton election outcome.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum Served {
    True,
    False,
}

impl std::fmt::Display for Served {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Served::True => write!(f, "True"),
            Served::False => write!(f, "False"),
        }
    }
}

/// Condition types of a RegistryProxy.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RegistryProxyCondition {
    Installed,
    Configured,
    Deleted,
    PrerequisitesSatisfied,
    DeploymentFailure,
}

impl RegistryProxyCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistryProxyCondition::Installed => "Installed",
            RegistryProxyCondition::Configured => "Configured",
            RegistryProxyCondition::Deleted => "Deleted",
            RegistryProxyCondition::PrerequisitesSatisfied => "PrerequisitesSatisfied",
            RegistryProxyCondition::DeploymentFailure => "DeploymentFailure",
        }
    }
}

impl std::fmt::Display for RegistryProxyCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Condition reasons of a RegistryProxy.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RegistryProxyReason {
    Installation,
    InstallationErr,
    Installed,
    Duplicated,
    Deletion,
    DeletionErr,
    Deleted,
    ProxyUrlInvalid,
    ConnectivityProxySkipped,
    ConnectivityProxyAvailable,
    ConnectivityProxyUnavailable,
    DeploymentReplicaFailure,
}

impl RegistryProxyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistryProxyReason::Installation => "Installation",
            RegistryProxyReason::InstallationErr => "InstallationErr",
            RegistryProxyReason::Installed => "Installed",
            RegistryProxyReason::Duplicated => "RegistryProxyDuplicated",
            RegistryProxyReason::Deletion => "Deletion",
            RegistryProxyReason::DeletionErr => "DeletionErr",
            RegistryProxyReason::Deleted => "Deleted",
            RegistryProxyReason::ProxyUrlInvalid => "ProxyURLInvalid",
            RegistryProxyReason::ConnectivityProxySkipped => "ConnectivityProxySkipped",
            RegistryProxyReason::ConnectivityProxyAvailable => "ConnectivityProxyAvailable",
            RegistryProxyReason::ConnectivityProxyUnavailable => "ConnectivityProxyUnavailable",
            RegistryProxyReason::DeploymentReplicaFailure => "DeploymentReplicaFailure",
        }
    }
}

impl std::fmt::Display for RegistryProxyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RegistryProxy {
    /// Whether the singleton election already ran for this instance.
    pub fn is_served_set(&self) -> bool {
        self.status.as_ref().and_then(|s| s.served).is_some()
    }

    pub fn served(&self) -> Option<Served> {
        self.status.as_ref().and_then(|s| s.served)
    }
}
