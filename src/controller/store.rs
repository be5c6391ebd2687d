//! Object store contract consumed by the state machines.
//!
//! State functions never talk to `kube::Api` directly; they go through
//! [`ObjectStore`] so scenario tests can drive them against an in-memory
//! cluster.

use std::fmt::Debug;

use async_trait::async_trait;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::NamespaceResourceScope;
use kube::{Api, Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::controller::error::Result;

/// Bound shared by every namespaced kind the operator reads or writes.
pub trait StoredKind:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> StoredKind for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Get/list/create/update/delete plus status writes.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch an object; a missing object is `Ok(None)`.
    async fn get<K: StoredKind>(&self, namespace: &str, name: &str) -> Result<Option<K>>;

    /// List objects in `namespace`, or cluster-wide when `None`.
    async fn list<K: StoredKind>(
        &self,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<K>>;

    async fn create<K: StoredKind>(&self, obj: &K) -> Result<K>;

    /// Replace an object; the write fails on a stale resourceVersion.
    async fn update<K: StoredKind>(&self, obj: &K) -> Result<K>;

    /// Delete an object; an already missing object is not an error.
    async fn delete<K: StoredKind>(&self, namespace: &str, name: &str) -> Result<()>;

    /// Write the status subresource, guarded by the object's resourceVersion.
    async fn update_status<K: StoredKind, S: Serialize + Send + Sync>(
        &self,
        obj: &K,
        status: &S,
    ) -> Result<K>;
}

/// [`ObjectStore`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K: StoredKind>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get<K: StoredKind>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        Ok(self.api::<K>(namespace).get_opt(name).await?)
    }

    async fn list<K: StoredKind>(
        &self,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<K>> {
        let api: Api<K> = match namespace {
            Some(ns) => self.api(ns),
            None => Api::all(self.client.clone()),
        };
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        Ok(api.list(&params).await?.items)
    }

    async fn create<K: StoredKind>(&self, obj: &K) -> Result<K> {
        let namespace = obj.namespace().unwrap_or_default();
        Ok(self
            .api::<K>(&namespace)
            .create(&PostParams::default(), obj)
            .await?)
    }

    async fn update<K: StoredKind>(&self, obj: &K) -> Result<K> {
        let namespace = obj.namespace().unwrap_or_default();
        Ok(self
            .api::<K>(&namespace)
            .replace(&obj.name_any(), &PostParams::default(), obj)
            .await?)
    }

    async fn delete<K: StoredKind>(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .api::<K>(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_status<K: StoredKind, S: Serialize + Send + Sync>(
        &self,
        obj: &K,
        status: &S,
    ) -> Result<K> {
        let namespace = obj.namespace().unwrap_or_default();
        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": obj.resource_version(),
            },
            "status": status,
        });
        Ok(self
            .api::<K>(&namespace)
            .patch_status(&obj.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }
}
