//! Common resource generation utilities.
//!
//! Labels and owner references shared by every object the connection
//! controllers create.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};

/// Value of the managed-by label on every created object.
pub const MANAGED_BY: &str = "registry-proxy-operator";

/// Module the created objects belong to.
pub const MODULE_NAME: &str = "registry-proxy";

pub const LABEL_APP: &str = "app";
pub const LABEL_NAME: &str = "app.kubernetes.io/name";
pub const LABEL_PART_OF: &str = "app.kubernetes.io/part-of";
pub const LABEL_MODULE: &str = "kyma-project.io/module";
pub const LABEL_MANAGED_BY: &str = "registry-proxy.kyma-project.io/managed-by";
pub const LABEL_RESOURCE: &str = "registry-proxy.kyma-project.io/resource";

/// Which managed object a label set is for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ManagedResource {
    Deployment,
    Service,
    PeerAuthentication,
}

impl ManagedResource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManagedResource::Deployment => "deployment",
            ManagedResource::Service => "service",
            ManagedResource::PeerAuthentication => "peer-authentication",
        }
    }
}

/// Standard labels applied to all managed resources
pub fn standard_labels(name: &str, resource: ManagedResource) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_APP.to_string(), name.to_string()),
        (LABEL_NAME.to_string(), name.to_string()),
        (LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string()),
        (LABEL_MODULE.to_string(), MODULE_NAME.to_string()),
        (LABEL_RESOURCE.to_string(), resource.as_str().to_string()),
        (LABEL_PART_OF.to_string(), MODULE_NAME.to_string()),
    ])
}

/// Labels selecting the proxy pods of one declared resource.
pub fn selector_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(LABEL_APP.to_string(), name.to_string())])
}

/// Create a controller owner reference pointing at `owner`.
pub fn owner_reference<K>(owner: &K) -> OwnerReference
where
    K: Resource<DynamicType = ()>,
{
    OwnerReference {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        name: owner.name_any(),
        uid: owner.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Metadata for an object named after, and owned by, `owner`.
pub fn owned_metadata<K>(owner: &K, labels: BTreeMap<String, String>) -> ObjectMeta
where
    K: Resource<DynamicType = ()>,
{
    ObjectMeta {
        name: Some(owner.name_any()),
        namespace: owner.namespace(),
        labels: Some(labels),
        owner_references: Some(vec![owner_reference(owner)]),
        ..Default::default()
    }
}

/// Whether `meta` carries a controller reference to `owner`.
pub fn is_owned_by<K>(meta: &ObjectMeta, owner: &K) -> bool
where
    K: Resource<DynamicType = ()>,
{
    let uid = owner.uid();
    meta.owner_references
        .iter()
        .flatten()
        .any(|r| r.controller == Some(true) && Some(&r.uid) == uid.as_ref())
}
