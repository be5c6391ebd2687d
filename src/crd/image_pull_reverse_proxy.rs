//! ImagePullReverseProxy Custom Resource Definition.
//!
//! Legacy single-container variant of [`Connection`](super::Connection)
//! without registry authorization support.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::condition::Conditions;
use super::connection::{LogLevel, ResourceRequirementsSpec};

/// ImagePullReverseProxy exposes one registry through a NodePort proxy.
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "operator.kyma-project.io",
    version = "v1alpha1",
    kind = "ImagePullReverseProxy",
    plural = "imagepullreverseproxies",
    shortname = "iprp",
    status = "ImagePullReverseProxyStatus",
    namespaced,
    printcolumn = r#"{"name":"Running", "type":"string", "jsonPath":".status.conditions[?(@.type=='Running')].status"}"#,
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type=='Ready')].status"}"#,
    printcolumn = r#"{"name":"NodePort", "type":"string", "jsonPath":".status.nodePort"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ImagePullReverseProxySpec {
    /// URL of the Connectivity Proxy, with protocol.
    #[serde(
        default,
        rename = "proxyURL",
        skip_serializing_if = "Option::is_none"
    )]
    pub proxy_url: Option<String>,

    /// Host (and optional port) of the target registry.
    pub target_host: String,

    /// Resource requirements of the proxy container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirementsSpec>,

    /// Log level of the proxy. Defaults to "info" inside the proxy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<LogLevel>,
}

/// Status of an ImagePullReverseProxy.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImagePullReverseProxyStatus {
    #[serde(default)]
    pub node_port: i32,

    #[serde(default, rename = "proxyURL")]
    pub proxy_url: String,

    #[serde(default)]
    pub conditions: Conditions,
}

/// Condition types of an ImagePullReverseProxy.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReverseProxyCondition {
    Configured,
    /// Liveness probe result.
    Running,
    /// Readiness probe result.
    Ready,
}

impl ReverseProxyCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReverseProxyCondition::Configured => "Configured",
            ReverseProxyCondition::Running => "Running",
            ReverseProxyCondition::Ready => "Ready",
        }
    }
}

/// Condition reasons of an ImagePullReverseProxy.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReverseProxyReason {
    ConnectivityProxyCrdFound,
    ConnectivityProxyCrdUnknown,
    DeploymentCreated,
    DeploymentUpdated,
    DeploymentFailed,
    InvalidProxyUrl,
    ProbeError,
    ProbeSuccess,
    ProbeFailure,
}

impl ReverseProxyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReverseProxyReason::ConnectivityProxyCrdFound => "ConnectivityProxyCrdFound",
            ReverseProxyReason::ConnectivityProxyCrdUnknown => "ConnectivityProxyCrdUnknown",
            ReverseProxyReason::DeploymentCreated => "DeploymentCreated",
            ReverseProxyReason::DeploymentUpdated => "DeploymentUpdated",
            ReverseProxyReason::DeploymentFailed => "DeploymentFailed",
            ReverseProxyReason::InvalidProxyUrl => "InvalidProxyURL",
            ReverseProxyReason::ProbeError => "ProbeError",
            ReverseProxyReason::ProbeSuccess => "ProbeSuccess",
            ReverseProxyReason::ProbeFailure => "ProbeFailure",
        }
    }
}
