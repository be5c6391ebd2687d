//! Pod health verification.
//!
//! The proxy containers expose `/healthz` (liveness, the proxy itself is up)
//! and `/readyz` (readiness, the target registry is reachable through the
//! connectivity proxy). The controllers call those endpoints on the newest
//! pod and map the answers onto conditions.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Container, Pod, Probe};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::controller::error::{Error, Result};
use crate::resources::deployment::REGISTRY_CONTAINER_NAME;

/// Newest pod by creation timestamp; on ties the first one seen wins.
pub fn latest_pod(pods: &[Pod]) -> Option<&Pod> {
    let created = |pod: &Pod| pod.metadata.creation_timestamp.as_ref().map(|t| t.0);
    pods.iter().reduce(|latest, pod| {
        if created(latest) < created(pod) {
            pod
        } else {
            latest
        }
    })
}

/// IP assigned to the pod, `None` while it is still pending.
pub fn pod_ip(pod: &Pod) -> Option<&str> {
    pod.status
        .as_ref()
        .and_then(|status| status.pod_ip.as_deref())
        .filter(|ip| !ip.is_empty())
}

/// The proxy container of `pod`. Injected sidecars may come first.
pub fn proxy_container(pod: &Pod) -> Option<&Container> {
    pod.spec
        .as_ref()?
        .containers
        .iter()
        .find(|c| c.name == REGISTRY_CONTAINER_NAME)
}

/// Liveness and readiness probes of the proxy container, with named ports
/// resolved against the ports it declares.
pub fn container_probes(pod: &Pod) -> (Option<Probe>, Option<Probe>) {
    let Some(container) = proxy_container(pod) else {
        return (None, None);
    };
    let resolve = |probe: Option<&Probe>| probe.map(|p| resolve_named_port(p.clone(), container));
    (
        resolve(container.liveness_probe.as_ref()),
        resolve(container.readiness_probe.as_ref()),
    )
}

fn resolve_named_port(mut probe: Probe, container: &Container) -> Probe {
    if let Some(get) = probe.http_get.as_mut() {
        if let IntOrString::String(name) = &get.port {
            let declared = container
                .ports
                .iter()
                .flatten()
                .find(|port| port.name.as_deref() == Some(name.as_str()));
            if let Some(port) = declared {
                get.port = IntOrString::Int(port.container_port);
            }
        }
    }
    probe
}

/// Path probed by an HTTP probe, empty when there is none.
pub fn probe_path(probe: &Probe) -> &str {
    probe
        .http_get
        .as_ref()
        .and_then(|get| get.path.as_deref())
        .unwrap_or_default()
}

/// URL of an HTTP probe on `pod_ip`.
pub fn probe_url(pod_ip: &str, probe: Option<&Probe>) -> Result<String> {
    let probe = probe.ok_or_else(|| Error::Validation("probe is nil".to_string()))?;
    let get = probe
        .http_get
        .as_ref()
        .ok_or_else(|| Error::Validation("probe has no httpGet action".to_string()))?;
    let port = match &get.port {
        IntOrString::Int(port) => *port,
        IntOrString::String(name) => {
            return Err(Error::Validation(format!(
                "probe port {name} is not declared by the container"
            )));
        }
    };
    Ok(format!(
        "http://{pod_ip}:{port}{}",
        get.path.as_deref().unwrap_or_default()
    ))
}

pub fn is_success(status: u16) -> bool {
    (200..300).contains(&status)
}

/// Issues probe requests against pods.
#[async_trait]
pub trait PodProber: Send + Sync {
    /// GET `url` and return the HTTP status code.
    async fn probe(&self, url: &str) -> Result<u16>;
}

/// [`PodProber`] over plain HTTP.
#[derive(Clone, Debug)]
pub struct HttpPodProber {
    client: reqwest::Client,
}

impl HttpPodProber {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PodProber for HttpPodProber {
    async fn probe(&self, url: &str) -> Result<u16> {
        let response = self.client.get(url).send().await?;
        Ok(response.status().as_u16())
    }
}
