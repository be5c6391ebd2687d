//! Service generation for reverse proxy workloads.
//!
//! A single NodePort Service exposes the proxy on every node:
//! - port 80 named `registry` targeting the registry container
//! - port 82 named `authorization`, only when an authorization host is set
//!
//! NodePorts are chosen by the platform unless the user pinned one.

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::Resource;

use crate::resources::common::{ManagedResource, owned_metadata, selector_labels, standard_labels};
use crate::resources::deployment::{
    AUTHORIZATION_CONTAINER_NAME, AUTHORIZATION_PORT, REGISTRY_CONTAINER_NAME, REGISTRY_PORT,
};

/// Service port of the registry endpoint
pub const REGISTRY_SERVICE_PORT: i32 = 80;
/// Service port of the authorization endpoint
pub const AUTHORIZATION_SERVICE_PORT: i32 = 82;

/// Inputs for a proxy Service.
#[derive(Clone, Copy, Debug, Default)]
pub struct ServiceOptions {
    /// NodePort pinned in the spec.
    pub node_port: Option<i32>,
    /// Expose the authorization endpoint as well.
    pub authorization: bool,
}

/// Generate the NodePort Service of `owner`.
pub fn generate_service<K>(owner: &K, options: ServiceOptions) -> Service
where
    K: Resource<DynamicType = ()>,
{
    let meta = owned_metadata(owner, Default::default());
    let name = meta.name.clone().unwrap_or_default();

    let mut ports = vec![ServicePort {
        name: Some(REGISTRY_CONTAINER_NAME.to_string()),
        port: REGISTRY_SERVICE_PORT,
        protocol: Some("TCP".to_string()),
        target_port: Some(IntOrString::Int(REGISTRY_PORT)),
        node_port: options.node_port.filter(|port| *port != 0),
        ..Default::default()
    }];
    if options.authorization {
        ports.push(ServicePort {
            name: Some(AUTHORIZATION_CONTAINER_NAME.to_string()),
            port: AUTHORIZATION_SERVICE_PORT,
            protocol: Some("TCP".to_string()),
            target_port: Some(IntOrString::Int(AUTHORIZATION_PORT)),
            ..Default::default()
        });
    }

    Service {
        metadata: ObjectMeta {
            labels: Some(standard_labels(&name, ManagedResource::Service)),
            ..meta
        },
        spec: Some(ServiceSpec {
            type_: Some("NodePort".to_string()),
            selector: Some(selector_labels(&name)),
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn ports(service: &Service) -> &[ServicePort] {
    service
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_deref())
        .unwrap_or_default()
}

/// Assigned NodePort of the named port, 0 when not (yet) assigned.
pub fn node_port(service: &Service, port_name: &str) -> i32 {
    ports(service)
        .iter()
        .find(|p| p.name.as_deref() == Some(port_name))
        .and_then(|p| p.node_port)
        .unwrap_or(0)
}

/// Whether the current Service drifted from the desired one.
///
/// Ports are matched by name; a NodePort only counts when it is pinned in
/// the desired Service.
pub fn service_changed(current: &Service, desired: &Service) -> bool {
    if current.metadata.labels != desired.metadata.labels {
        return true;
    }

    let (current_spec, desired_spec) = match (current.spec.as_ref(), desired.spec.as_ref()) {
        (Some(c), Some(d)) => (c, d),
        _ => return true,
    };
    if current_spec.type_ != desired_spec.type_ || current_spec.selector != desired_spec.selector {
        return true;
    }

    let current_ports = ports(current);
    let desired_ports = ports(desired);
    if current_ports.len() != desired_ports.len() {
        return true;
    }
    desired_ports.iter().any(|wanted| {
        match current_ports.iter().find(|p| p.name == wanted.name) {
            None => true,
            Some(existing) => {
                existing.port != wanted.port
                    || existing.protocol != wanted.protocol
                    || existing.target_port != wanted.target_port
                    || (wanted.node_port.is_some() && existing.node_port != wanted.node_port)
            }
        }
    })
}

/// Copy the operator-owned parts of `desired` onto `current`, keeping
/// platform-assigned NodePorts of ports that still exist.
pub fn adopt_service(current: &mut Service, desired: &Service) {
    let assigned: Vec<ServicePort> = ports(current).to_vec();
    let mut wanted_ports = ports(desired).to_vec();
    for port in &mut wanted_ports {
        if port.node_port.is_none() {
            port.node_port = assigned
                .iter()
                .find(|p| p.name == port.name)
                .and_then(|p| p.node_port);
        }
    }

    current.metadata.labels.clone_from(&desired.metadata.labels);
    let spec = current.spec.get_or_insert_with(Default::default);
    if let Some(desired_spec) = desired.spec.as_ref() {
        spec.type_.clone_from(&desired_spec.type_);
        spec.selector.clone_from(&desired_spec.selector);
    }
    spec.ports = Some(wanted_ports);
}
