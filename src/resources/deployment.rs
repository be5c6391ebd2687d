//! Deployment generation for reverse proxy workloads.
//!
//! One Deployment per declared resource, holding:
//! - `registry` container: forwards registry traffic (8080, probes on 8081)
//! - `authorization` container: forwards token requests (8082, probes on 8083),
//!   only once the authorization NodePort is known

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, ContainerPort, EnvVar, HTTPGetAction, PodSpec, PodTemplateSpec,
    Probe, ResourceRequirements, SeccompProfile, SecretVolumeSource, SecurityContext, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::Resource;

use crate::config::OperatorConfig;
use crate::crd::{LogLevel, ResourceQuantities, ResourceRequirementsSpec};
use crate::resources::common::{ManagedResource, owned_metadata, standard_labels};

pub const REGISTRY_CONTAINER_NAME: &str = "registry";
pub const AUTHORIZATION_CONTAINER_NAME: &str = "authorization";

pub const REGISTRY_PORT: i32 = 8080;
pub const REGISTRY_PROBE_PORT: i32 = 8081;
pub const AUTHORIZATION_PORT: i32 = 8082;
pub const AUTHORIZATION_PROBE_PORT: i32 = 8083;

const DEFAULT_LIMIT_CPU: &str = "100m";
const DEFAULT_LIMIT_MEMORY: &str = "64Mi";
const DEFAULT_REQUEST_CPU: &str = "5m";
const DEFAULT_REQUEST_MEMORY: &str = "32Mi";

const RUN_AS_ID: i64 = 1000;
const AUTHORIZATION_VOLUME: &str = "authorization";
const AUTHORIZATION_MOUNT_PATH: &str = "/secrets/authorization";

/// Authorization pass-through settings.
#[derive(Clone, Copy, Debug)]
pub struct AuthorizationTarget<'a> {
    pub host: &'a str,
    /// Assigned NodePort of the authorization Service port.
    pub node_port: i32,
}

/// Inputs for a proxy Deployment, resolved by the state chain.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProxyWorkload<'a> {
    pub proxy_url: &'a str,
    pub target_host: &'a str,
    /// `None` omits the variable entirely.
    pub location_id: Option<&'a str>,
    pub log_level: Option<LogLevel>,
    pub resources: Option<&'a ResourceRequirementsSpec>,
    pub header_secret: Option<&'a str>,
    pub authorization: Option<AuthorizationTarget<'a>>,
}

/// Generate the Deployment running the reverse proxy of `owner`.
pub fn generate_deployment<K>(
    owner: &K,
    workload: &ProxyWorkload<'_>,
    config: &OperatorConfig,
) -> Deployment
where
    K: Resource<DynamicType = ()>,
{
    let meta = owned_metadata(owner, BTreeMap::new());
    let name = meta.name.clone().unwrap_or_default();
    let labels = standard_labels(&name, ManagedResource::Deployment);

    let mut pod_labels = labels.clone();
    pod_labels.insert("sidecar.istio.io/inject".to_string(), "true".to_string());

    let mut registry = proxy_container(
        REGISTRY_CONTAINER_NAME,
        REGISTRY_PORT,
        REGISTRY_PROBE_PORT,
        registry_env(workload),
        workload.resources,
        config,
    );

    let volumes = workload.header_secret.map(|secret| {
        registry.volume_mounts = Some(vec![VolumeMount {
            name: AUTHORIZATION_VOLUME.to_string(),
            mount_path: AUTHORIZATION_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        }]);
        vec![Volume {
            name: AUTHORIZATION_VOLUME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }]
    });

    let mut containers = vec![registry];
    if let Some(auth) = workload.authorization.filter(|auth| auth.node_port != 0) {
        containers.push(proxy_container(
            AUTHORIZATION_CONTAINER_NAME,
            AUTHORIZATION_PORT,
            AUTHORIZATION_PROBE_PORT,
            authorization_env(workload, auth),
            workload.resources,
            config,
        ));
    }

    Deployment {
        metadata: ObjectMeta {
            labels: Some(labels.clone()),
            ..meta
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers,
                    volumes,
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn common_env(workload: &ProxyWorkload<'_>, target_host: &str) -> Vec<EnvVar> {
    let mut vars = vec![
        env("PROXY_URL", workload.proxy_url),
        env("TARGET_HOST", target_host),
    ];
    if let Some(location_id) = workload.location_id {
        vars.push(env("LOCATION_ID", location_id));
    }
    if let Some(level) = workload.log_level {
        vars.push(env("LOG_LEVEL", level.to_string()));
    }
    vars
}

fn registry_env(workload: &ProxyWorkload<'_>) -> Vec<EnvVar> {
    let mut vars = common_env(workload, workload.target_host);
    if let Some(auth) = workload.authorization.filter(|auth| auth.node_port != 0) {
        vars.push(env("AUTHORIZATION_NODE_PORT", auth.node_port.to_string()));
    }
    vars
}

fn authorization_env(workload: &ProxyWorkload<'_>, auth: AuthorizationTarget<'_>) -> Vec<EnvVar> {
    common_env(workload, auth.host)
}

fn proxy_container(
    name: &str,
    port: i32,
    probe_port: i32,
    env: Vec<EnvVar>,
    resources: Option<&ResourceRequirementsSpec>,
    config: &OperatorConfig,
) -> Container {
    Container {
        name: name.to_string(),
        image: Some(config.proxy_image.clone()),
        command: Some(vec![config.proxy_command.clone()]),
        args: Some(vec![
            "--connection-bind-address".to_string(),
            format!(":{port}"),
            "--health-probe-bind-address".to_string(),
            format!(":{probe_port}"),
        ]),
        image_pull_policy: Some("IfNotPresent".to_string()),
        resources: Some(resource_requirements(resources)),
        env: Some(env),
        ports: Some(vec![ContainerPort {
            container_port: port,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        startup_probe: Some(generate_startup_probe(probe_port)),
        readiness_probe: Some(generate_readiness_probe(probe_port)),
        liveness_probe: Some(generate_liveness_probe(probe_port)),
        security_context: Some(restricted_security_context()),
        ..Default::default()
    }
}

fn http_get(path: &str, port: i32) -> Option<HTTPGetAction> {
    Some(HTTPGetAction {
        path: Some(path.to_string()),
        port: IntOrString::Int(port),
        ..Default::default()
    })
}

/// Startup probe: up to 150s for the proxy to come up.
fn generate_startup_probe(port: i32) -> Probe {
    Probe {
        http_get: http_get("/healthz", port),
        initial_delay_seconds: Some(0),
        period_seconds: Some(5),
        success_threshold: Some(1),
        failure_threshold: Some(30),
        ..Default::default()
    }
}

/// Readiness probe: the target registry is reachable through the proxy.
fn generate_readiness_probe(port: i32) -> Probe {
    Probe {
        http_get: http_get("/readyz", port),
        initial_delay_seconds: Some(0),
        failure_threshold: Some(1),
        period_seconds: Some(10),
        timeout_seconds: Some(2),
        ..Default::default()
    }
}

/// Liveness probe: the proxy process itself is healthy.
fn generate_liveness_probe(port: i32) -> Probe {
    Probe {
        http_get: http_get("/healthz", port),
        failure_threshold: Some(3),
        period_seconds: Some(5),
        timeout_seconds: Some(4),
        ..Default::default()
    }
}

fn restricted_security_context() -> SecurityContext {
    SecurityContext {
        run_as_group: Some(RUN_AS_ID),
        run_as_user: Some(RUN_AS_ID),
        run_as_non_root: Some(true),
        allow_privilege_escalation: Some(false),
        seccomp_profile: Some(SeccompProfile {
            type_: "RuntimeDefault".to_string(),
            ..Default::default()
        }),
        capabilities: Some(Capabilities {
            drop: Some(vec!["All".to_string()]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn quantities(q: &ResourceQuantities) -> BTreeMap<String, Quantity> {
    let mut map = BTreeMap::new();
    if let Some(cpu) = &q.cpu {
        map.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = &q.memory {
        map.insert("memory".to_string(), Quantity(memory.clone()));
    }
    map
}

/// Container resources from the spec, or the proxy defaults when unset.
pub fn resource_requirements(spec: Option<&ResourceRequirementsSpec>) -> ResourceRequirements {
    match spec {
        Some(spec) => ResourceRequirements {
            limits: spec.limits.as_ref().map(quantities),
            requests: spec.requests.as_ref().map(quantities),
            ..Default::default()
        },
        None => ResourceRequirements {
            limits: Some(BTreeMap::from([
                ("cpu".to_string(), Quantity(DEFAULT_LIMIT_CPU.to_string())),
                ("memory".to_string(), Quantity(DEFAULT_LIMIT_MEMORY.to_string())),
            ])),
            requests: Some(BTreeMap::from([
                ("cpu".to_string(), Quantity(DEFAULT_REQUEST_CPU.to_string())),
                ("memory".to_string(), Quantity(DEFAULT_REQUEST_MEMORY.to_string())),
            ])),
            ..Default::default()
        },
    }
}

fn containers(deployment: &Deployment) -> &[Container] {
    deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.template.spec.as_ref())
        .map(|pod| pod.containers.as_slice())
        .unwrap_or_default()
}

fn find_container<'a>(containers: &'a [Container], name: &str) -> Option<&'a Container> {
    containers.iter().find(|c| c.name == name)
}

/// Compare the fields of a container the operator owns.
pub fn container_changed(current: &Container, desired: &Container) -> bool {
    current.image != desired.image
        || current.command != desired.command
        || current.args != desired.args
        || current.env != desired.env
        || current.ports != desired.ports
        || current.resources != desired.resources
}

/// Whether the current Deployment drifted from the desired one.
///
/// Containers are matched by name, so their order in the pod spec is irrelevant.
pub fn deployment_changed(current: &Deployment, desired: &Deployment) -> bool {
    let current_containers = containers(current);
    let desired_containers = containers(desired);
    if current_containers.is_empty()
        || desired_containers.is_empty()
        || current_containers.len() != desired_containers.len()
    {
        return true;
    }

    for wanted in desired_containers {
        match find_container(current_containers, &wanted.name) {
            Some(existing) if !container_changed(existing, wanted) => {}
            _ => return true,
        }
    }

    let template_labels = |d: &Deployment| {
        d.spec
            .as_ref()
            .and_then(|s| s.template.metadata.as_ref())
            .and_then(|m| m.labels.clone())
    };
    if template_labels(current) != template_labels(desired) {
        return true;
    }

    let replicas = |d: &Deployment| d.spec.as_ref().and_then(|s| s.replicas);
    if replicas(current) != replicas(desired) {
        return true;
    }

    secret_volumes(current) != secret_volumes(desired)
}

/// Volume names and the Secrets they mount. The API server fills in
/// `defaultMode` and friends, so nothing else is compared.
fn secret_volumes(deployment: &Deployment) -> Vec<(&str, Option<&str>)> {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|p| p.volumes.as_ref())
        .map(|volumes| {
            volumes
                .iter()
                .map(|v| {
                    let secret = v.secret.as_ref().and_then(|s| s.secret_name.as_deref());
                    (v.name.as_str(), secret)
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Copy the operator-owned parts of `desired` onto `current`.
pub fn adopt_deployment(current: &mut Deployment, desired: &Deployment) {
    let Some(desired_spec) = desired.spec.as_ref() else {
        return;
    };
    let spec = current.spec.get_or_insert_with(Default::default);
    spec.template = desired_spec.template.clone();
    spec.replicas = desired_spec.replicas;
    spec.selector = desired_spec.selector.clone();
}
