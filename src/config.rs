//! Operator configuration read from the environment.

use std::path::PathBuf;
use std::time::Duration;

/// Default directory holding the packaged module manifests.
pub const DEFAULT_MANIFEST_DIR: &str = "/module-chart/manifests";
/// Namespace the module and the Connectivity Proxy live in.
pub const DEFAULT_MODULE_NAMESPACE: &str = "kyma-system";
/// Resync interval used when a tick asks for no explicit requeue.
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(600);
/// HTTP timeout for pod health probes.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Runtime configuration of the operator.
#[derive(Clone, Debug, PartialEq)]
pub struct OperatorConfig {
    /// Image of the reverse proxy containers.
    pub proxy_image: String,
    /// Entrypoint of the reverse proxy containers.
    pub proxy_command: String,
    /// Override of the registry-proxy controller image in the module manifests.
    pub image_registry_proxy: Option<String>,
    /// Override of the connection image in the module manifests.
    pub image_connection: Option<String>,
    pub manifest_dir: PathBuf,
    pub module_namespace: String,
    /// Restrict all controllers to one namespace.
    pub watch_namespace: Option<String>,
    pub resync_interval: Duration,
    pub probe_timeout: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            proxy_image: String::new(),
            proxy_command: String::new(),
            image_registry_proxy: None,
            image_connection: None,
            manifest_dir: PathBuf::from(DEFAULT_MANIFEST_DIR),
            module_namespace: DEFAULT_MODULE_NAMESPACE.to_string(),
            watch_namespace: None,
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

impl OperatorConfig {
    /// Read configuration from process environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary key lookup.
    ///
    /// Empty values count as unset; unparsable durations fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let secs = |key: &str, default: Duration| {
            get(key)
                .and_then(|value| value.trim().parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(default)
        };

        Self {
            proxy_image: get("PROXY_IMAGE").unwrap_or_default(),
            proxy_command: get("PROXY_COMMAND").unwrap_or_default(),
            image_registry_proxy: get("IMAGE_REGISTRY_PROXY"),
            image_connection: get("IMAGE_CONNECTION"),
            manifest_dir: get("MANIFEST_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MANIFEST_DIR)),
            module_namespace: get("MODULE_NAMESPACE")
                .unwrap_or_else(|| DEFAULT_MODULE_NAMESPACE.to_string()),
            watch_namespace: get("WATCH_NAMESPACE"),
            resync_interval: secs("RESYNC_INTERVAL_SECS", DEFAULT_RESYNC_INTERVAL),
            probe_timeout: secs("PROBE_TIMEOUT_SECS", DEFAULT_PROBE_TIMEOUT),
        }
    }
}
