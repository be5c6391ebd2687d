//! Finalizer helpers.
//!
//! The finalizer is written with a full update right away, never deferred to
//! the end-of-tick status write, so it exists before anything is created.

use kube::ResourceExt;

use crate::controller::error::Result;
use crate::controller::store::{ObjectStore, StoredKind};

pub fn has_finalizer<K: StoredKind>(obj: &K, finalizer: &str) -> bool {
    obj.finalizers().iter().any(|f| f == finalizer)
}

/// Add `finalizer` and update the object immediately.
///
/// `obj` is replaced by the stored copy so later writes carry the new
/// resourceVersion.
pub async fn add_finalizer<S, K>(store: &S, obj: &mut K, finalizer: &str) -> Result<()>
where
    S: ObjectStore,
    K: StoredKind,
{
    if has_finalizer(obj, finalizer) {
        return Ok(());
    }
    obj.finalizers_mut().push(finalizer.to_string());
    *obj = store.update(obj).await?;
    Ok(())
}

/// Strip `finalizer` from the in-memory object.
///
/// Returns whether anything was removed; the caller persists the change.
pub fn remove_finalizer<K: StoredKind>(obj: &mut K, finalizer: &str) -> bool {
    let before = obj.finalizers().len();
    obj.finalizers_mut().retain(|f| f != finalizer);
    obj.finalizers().len() != before
}
