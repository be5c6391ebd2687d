//! Connectivity Proxy URL validation and resolution.

use reqwest::Url;

use crate::controller::error::{Error, Result};
use crate::controller::store::ObjectStore;
use crate::crd::ConnectivityProxy;

/// Name of the ConnectivityProxy installation the URL is resolved from.
pub const CONNECTIVITY_PROXY_NAME: &str = "connectivity-proxy";

/// Check a user-supplied proxy URL; the error is the human-readable cause.
pub fn validate_proxy_url(url: &str) -> std::result::Result<(), String> {
    let parsed = Url::parse(url).map_err(|e| e.to_string())?;
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err("URL has no host".to_string());
    }
    Ok(())
}

/// In-cluster URL of the Connectivity Proxy HTTP endpoint.
pub fn connectivity_proxy_url(namespace: &str, port: i32) -> String {
    format!("http://{CONNECTIVITY_PROXY_NAME}.{namespace}.svc.cluster.local:{port}")
}

/// Read the ConnectivityProxy installation in `namespace` and build its URL.
pub async fn resolve_connectivity_proxy_url<S: ObjectStore>(store: &S, namespace: &str) -> Result<String> {
    let proxy: ConnectivityProxy = store
        .get(namespace, CONNECTIVITY_PROXY_NAME)
        .await?
        .ok_or_else(|| {
            Error::Transient(format!(
                "connectivity proxy {namespace}/{CONNECTIVITY_PROXY_NAME} not found"
            ))
        })?;
    let port = proxy.http_port().ok_or_else(|| {
        Error::Transient("proxy http port was not specified in the connectivity proxy".to_string())
    })?;
    Ok(connectivity_proxy_url(namespace, port))
}
