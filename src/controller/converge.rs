//! Diff-based create/update of managed objects.
//!
//! [`converge`] fetches the current object, creates it from the desired
//! state when missing, and otherwise updates only the fields the operator
//! owns when the kind-specific change detector reports drift.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::{Resource, ResourceExt};
use tracing::{debug, info};

use crate::controller::error::{Error, Result};
use crate::controller::store::{ObjectStore, StoredKind};
use crate::crd::PeerAuthentication;
use crate::resources::common::{is_owned_by, owner_reference};
use crate::resources::deployment::{adopt_deployment, deployment_changed};
use crate::resources::peer_authentication::{
    adopt_peer_authentication, peer_authentication_changed,
};
use crate::resources::services::{adopt_service, service_changed};

/// A kind whose instances are converged toward a generated desired state.
pub trait ManagedKind: StoredKind {
    /// Kind name used in conditions and logs.
    const KIND: &'static str;

    /// Whether `current` drifted from `desired` in any operator-owned field.
    fn changed(current: &Self, desired: &Self) -> bool;

    /// Copy operator-owned fields from `desired` onto `current`.
    fn adopt(current: &mut Self, desired: &Self);
}

impl ManagedKind for Deployment {
    const KIND: &'static str = "Deployment";

    fn changed(current: &Self, desired: &Self) -> bool {
        deployment_changed(current, desired)
    }

    fn adopt(current: &mut Self, desired: &Self) {
        adopt_deployment(current, desired);
    }
}

impl ManagedKind for Service {
    const KIND: &'static str = "Service";

    fn changed(current: &Self, desired: &Self) -> bool {
        service_changed(current, desired)
    }

    fn adopt(current: &mut Self, desired: &Self) {
        adopt_service(current, desired);
    }
}

impl ManagedKind for PeerAuthentication {
    const KIND: &'static str = "PeerAuthentication";

    fn changed(current: &Self, desired: &Self) -> bool {
        peer_authentication_changed(current, desired)
    }

    fn adopt(current: &mut Self, desired: &Self) {
        adopt_peer_authentication(current, desired);
    }
}

/// Result of a convergence pass.
#[derive(Clone, Debug)]
pub enum Converged<K> {
    /// The object did not exist and was created.
    Created(K),
    /// The object drifted and was updated.
    Updated(K),
    /// The object already matched the desired state.
    Unchanged(K),
}

impl<K> Converged<K> {
    /// Whether a write was issued.
    pub fn is_write(&self) -> bool {
        !matches!(self, Converged::Unchanged(_))
    }

    pub fn object(&self) -> &K {
        match self {
            Converged::Created(obj) | Converged::Updated(obj) | Converged::Unchanged(obj) => obj,
        }
    }
}

/// Create or update the object named by `desired` so it matches `desired`.
///
/// `owner` is attached as controller reference before any create.
pub async fn converge<S, K, O>(store: &S, owner: &O, desired: K) -> Result<Converged<K>>
where
    S: ObjectStore,
    K: ManagedKind,
    O: Resource<DynamicType = ()> + Sync,
{
    let (namespace, name) = identity(&desired)?;
    let current = store.get::<K>(&namespace, &name).await?;
    converge_from(store, owner, current, desired).await
}

/// [`converge`] against an already fetched `current` object.
pub async fn converge_from<S, K, O>(
    store: &S,
    owner: &O,
    current: Option<K>,
    mut desired: K,
) -> Result<Converged<K>>
where
    S: ObjectStore,
    K: ManagedKind,
    O: Resource<DynamicType = ()> + Sync,
{
    let (namespace, name) = identity(&desired)?;

    match current {
        None => {
            if !is_owned_by(desired.meta(), owner) {
                desired
                    .meta_mut()
                    .owner_references
                    .get_or_insert_with(Vec::new)
                    .push(owner_reference(owner));
            }
            let created = store.create(&desired).await?;
            info!(kind = K::KIND, name = %name, namespace = %namespace, "created");
            Ok(Converged::Created(created))
        }
        Some(mut current) => {
            if !K::changed(&current, &desired) {
                debug!(kind = K::KIND, name = %current.name_any(), "up to date");
                return Ok(Converged::Unchanged(current));
            }
            K::adopt(&mut current, &desired);
            let updated = store.update(&current).await?;
            info!(kind = K::KIND, name = %name, namespace = %namespace, "updated");
            Ok(Converged::Updated(updated))
        }
    }
}

fn identity<K: ManagedKind>(obj: &K) -> Result<(String, String)> {
    let name = obj
        .meta()
        .name
        .clone()
        .ok_or_else(|| Error::MissingField(format!("{}.metadata.name", K::KIND)))?;
    let namespace = obj
        .meta()
        .namespace
        .clone()
        .ok_or_else(|| Error::MissingField(format!("{}.metadata.namespace", K::KIND)))?;
    Ok((namespace, name))
}
