//! Connection Custom Resource Definition.
//!
//! A Connection exposes one private container registry to the cluster's
//! kubelets through a NodePort reverse proxy that tunnels through the
//! Connectivity Proxy.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::condition::Conditions;

/// Connection is a custom resource for a per-tenant registry reverse proxy.
///
/// Example:
/// ```yaml
/// apiVersion: registry-proxy.kyma-project.io/v1alpha1
/// kind: Connection
/// metadata:
///   name: my-registry
/// spec:
///   target:
///     host: registry.internal:5000
///     authorization:
///       host: auth.registry.internal
///   proxy:
///     locationID: my-location
/// ```
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "registry-proxy.kyma-project.io",
    version = "v1alpha1",
    kind = "Connection",
    plural = "connections",
    status = "ConnectionStatus",
    namespaced,
    printcolumn = r#"{"name":"Running", "type":"string", "jsonPath":".status.conditions[?(@.type=='ConnectionDeployed')].status"}"#,
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type=='ConnectionReady')].status"}"#,
    printcolumn = r#"{"name":"NodePort", "type":"string", "jsonPath":".status.nodePort"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSpec {
    /// Details of the Connectivity Proxy used by the connection.
    #[serde(default)]
    pub proxy: ProxySpec,

    /// Registry the connection forwards to.
    pub target: TargetSpec,

    /// Resource requirements of the proxy containers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirementsSpec>,

    /// Log level of the proxy ("debug", "info", "warn", "error", "fatal").
    #[serde(default)]
    pub log_level: LogLevel,

    /// NodePort on which the registry is exposed on every node.
    /// A random port is assigned when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_port: Option<i32>,
}

/// Connectivity Proxy settings.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProxySpec {
    /// URL of the Connectivity Proxy, with protocol.
    /// Resolved from the ConnectivityProxy resource when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Location ID sent with every forwarded request.
    #[serde(
        default,
        rename = "locationID",
        skip_serializing_if = "Option::is_none"
    )]
    pub location_id: Option<String>,
}

impl ProxySpec {
    /// Configured proxy URL, ignoring empty strings.
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref().filter(|url| !url.is_empty())
    }

    pub fn location_id(&self) -> &str {
        self.location_id.as_deref().unwrap_or_default()
    }
}

/// Target registry.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TargetSpec {
    /// Host (and optional port) of the target registry.
    pub host: String,

    /// Authorization method for the connection. Use either host or headerSecret.
    #[serde(default)]
    pub authorization: AuthorizationSpec,
}

/// Registry authorization settings.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationSpec {
    /// Host used for registry token authorization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Name of the Secret holding the authorization header.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_secret: Option<String>,
}

impl AuthorizationSpec {
    pub fn host(&self) -> Option<&str> {
        self.host.as_deref().filter(|host| !host.is_empty())
    }

    pub fn header_secret(&self) -> Option<&str> {
        self.header_secret.as_deref().filter(|name| !name.is_empty())
    }
}

/// Resource requirements for proxy containers.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirementsSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceQuantities>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceQuantities>,
}

/// CPU and memory quantities (e.g. "100m", "64Mi").
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceQuantities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// Proxy log level.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Fatal,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
            LogLevel::Fatal => write!(f, "fatal"),
        }
    }
}

/// Status of a Connection.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    /// Assigned NodePort; pull images through `localhost:<nodePort>`.
    #[serde(default)]
    pub node_port: i32,

    /// Resolved URL of the Connectivity Proxy.
    #[serde(default, rename = "proxyURL")]
    pub proxy_url: String,

    /// Conditions describing the current state.
    #[serde(default)]
    pub conditions: Conditions,
}

/// Condition types of a Connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionCondition {
    /// Connectivity Proxy prerequisite.
    Configured,
    /// Proxy workload deployed and alive (liveness probe).
    ConnectionDeployed,
    /// Target registry reachable (readiness probe).
    ConnectionReady,
}

impl ConnectionCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionCondition::Configured => "Configured",
            ConnectionCondition::ConnectionDeployed => "ConnectionDeployed",
            ConnectionCondition::ConnectionReady => "ConnectionReady",
        }
    }
}

impl std::fmt::Display for ConnectionCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Condition reasons of a Connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionReason {
    ConnectivityProxyCrdFound,
    ConnectivityProxyCrdUnknown,
    DeploymentCreated,
    DeploymentUpdated,
    DeploymentFailed,
    InvalidProxyUrl,
    ResourcesDeployed,
    ResourcesNotReady,
    Established,
    NotEstablished,
    Error,
}

impl ConnectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionReason::ConnectivityProxyCrdFound => "ConnectivityProxyCrdFound",
            ConnectionReason::ConnectivityProxyCrdUnknown => "ConnectivityProxyCrdUnknown",
            ConnectionReason::DeploymentCreated => "DeploymentCreated",
            ConnectionReason::DeploymentUpdated => "DeploymentUpdated",
            ConnectionReason::DeploymentFailed => "DeploymentFailed",
            ConnectionReason::InvalidProxyUrl => "InvalidProxyURL",
            ConnectionReason::ResourcesDeployed => "ConnectionResourcesDeployed",
            ConnectionReason::ResourcesNotReady => "ConnectionResourcesNotReady",
            ConnectionReason::Established => "ConnectionEstablished",
            ConnectionReason::NotEstablished => "ConnectionNotEstablished",
            ConnectionReason::Error => "ConnectionError",
        }
    }
}

impl std::fmt::Display for ConnectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
