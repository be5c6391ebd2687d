//! [`ManifestInstaller`] backed by the Kubernetes API.
//!
//! The packaged manifest is a directory of YAML files. Each file may hold
//! several documents and may reference install values as
//! `{{ .Values.<dotted.key> }}`. Rendered objects are applied with
//! server-side apply through API discovery, so any kind the cluster serves
//! can be part of the package.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::ByteString;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams};
use kube::discovery::{ApiCapabilities, ApiResource, Discovery, Scope};
use kube::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::controller::context::FIELD_MANAGER;
use crate::controller::error::{Error, Result};
use crate::controller::installer::{
    ManifestConfig, ManifestInstaller, UninstallKind, Verification, lookup_value,
};
use crate::resources::common::{LABEL_MANAGED_BY, LABEL_MODULE, MANAGED_BY, MODULE_NAME};

/// One object of the rendered manifest.
#[derive(Clone, Debug, PartialEq)]
pub struct RenderedObject {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
    pub value: Value,
}

impl RenderedObject {
    fn gvk(&self) -> GroupVersionKind {
        let (group, version) = match self.api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", self.api_version.as_str()),
        };
        GroupVersionKind::gvk(group, version, &self.kind)
    }

    fn key(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}/{}/{}", self.kind, ns, self.name),
            None => format!("{}/{}", self.kind, self.name),
        }
    }
}

/// Apply order, lower first.
pub fn kind_priority(kind: &str) -> u8 {
    match kind {
        "Namespace" => 0,
        "CustomResourceDefinition" => 1,
        "ServiceAccount" => 2,
        "ClusterRole" | "Role" => 3,
        "ClusterRoleBinding" | "RoleBinding" => 4,
        "ConfigMap" | "Secret" => 5,
        "PeerAuthentication" => 6,
        "Service" => 7,
        "Deployment" | "DaemonSet" | "StatefulSet" => 8,
        _ => 9,
    }
}

fn render_value(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Substitute `{{ .Values.<key> }}` placeholders. Missing keys render empty;
/// any other template expression is left untouched.
pub fn render_template(template: &str, values: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        let (before, tail) = rest.split_at(start);
        out.push_str(before);

        let Some(end) = tail.find("}}") else {
            out.push_str(tail);
            return out;
        };
        let (expr, after) = tail.split_at(end + 2);
        let inner = expr
            .trim_start_matches("{{")
            .trim_end_matches("}}")
            .trim()
            .trim_start_matches('-')
            .trim_end_matches('-')
            .trim();

        match inner.strip_prefix(".Values.") {
            Some(key) => out.push_str(&render_value(lookup_value(values, key))),
            None => out.push_str(expr),
        }
        rest = after;
    }
    out.push_str(rest);
    out
}

/// Parse every document of a rendered YAML file.
pub fn parse_documents(text: &str) -> Result<Vec<RenderedObject>> {
    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_str(text) {
        let value = Value::deserialize(document)?;
        if value.is_null() {
            continue;
        }

        let field = |pointer: &str| value.pointer(pointer).and_then(Value::as_str).map(str::to_string);
        let api_version =
            field("/apiVersion").ok_or_else(|| Error::Manifest("document without apiVersion".into()))?;
        let kind = field("/kind").ok_or_else(|| Error::Manifest("document without kind".into()))?;
        let name = field("/metadata/name")
            .ok_or_else(|| Error::Manifest(format!("{kind} without metadata.name")))?;
        let namespace = field("/metadata/namespace");

        objects.push(RenderedObject {
            api_version,
            kind,
            name,
            namespace,
            value,
        });
    }
    Ok(objects)
}

fn add_common_labels(object: &mut RenderedObject) {
    let Some(metadata) = object.value.get_mut("metadata").and_then(Value::as_object_mut) else {
        return;
    };
    let labels = metadata
        .entry("labels")
        .or_insert_with(|| Value::Object(Default::default()));
    if let Some(labels) = labels.as_object_mut() {
        for (key, value) in common_labels() {
            labels.insert(key, value.into());
        }
    }
}

/// Render all `*.yaml`/`*.yml` files of `dir` in file name order.
pub async fn render_manifest_dir(dir: &Path, values: &Value) -> Result<Vec<RenderedObject>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| Error::Manifest(format!("cannot read {}: {e}", dir.display())))?;

    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| Error::Manifest(format!("cannot read {}: {e}", dir.display())))?
    {
        let path = entry.path();
        if matches!(path.extension().and_then(|e| e.to_str()), Some("yaml" | "yml")) {
            files.push(path);
        }
    }
    files.sort();

    let mut objects = Vec::new();
    for path in files {
        let template = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| Error::Manifest(format!("cannot read {}: {e}", path.display())))?;
        let mut parsed = parse_documents(&render_template(&template, values))?;
        parsed.iter_mut().for_each(add_common_labels);
        objects.append(&mut parsed);
    }
    Ok(objects)
}

/// Readiness of one Deployment of the package.
pub fn deployment_verification(deployment: &Deployment) -> Verification {
    let conditions = deployment
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_deref())
        .unwrap_or_default();
    let name = deployment.metadata.name.as_deref().unwrap_or_default();

    for condition in conditions {
        let message = condition.message.as_deref().unwrap_or_default();
        match condition.type_.as_str() {
            "ReplicaFailure" if condition.status == "True" => {
                return Verification::failed(format!("deployment {name} replica failure: {message}"));
            }
            "Progressing"
                if condition.status == "False"
                    && condition.reason.as_deref() == Some("ProgressDeadlineExceeded") =>
            {
                return Verification::failed(format!("deployment {name} progress deadline exceeded: {message}"));
            }
            _ => {}
        }
    }

    let available = conditions
        .iter()
        .any(|c| c.type_ == "Available" && c.status == "True");
    if available {
        Verification::ready()
    } else {
        Verification::processing()
    }
}

/// Error recorded while instances of a bundled CRD remain.
pub fn orphan_message(count: usize, group: &str, version: &str) -> String {
    format!("found {count} items with VersionKind {group}/{version}")
}

/// Group and served storage version of a rendered CRD.
fn crd_group_version(crd: &RenderedObject) -> Option<(String, String, String)> {
    let spec = crd.value.get("spec")?;
    let group = spec.get("group")?.as_str()?.to_string();
    let kind = spec.pointer("/names/kind")?.as_str()?.to_string();
    let versions = spec.get("versions")?.as_array()?;
    let version = versions
        .iter()
        .find(|v| v.get("storage").and_then(Value::as_bool) == Some(true))
        .or_else(|| versions.first())?
        .get("name")?
        .as_str()?
        .to_string();
    Some((group, version, kind))
}

/// Secret that keeps the values of the last install across restarts.
pub const MANIFEST_CACHE_SECRET: &str = "registry-proxy-manifest-cache";
const MANIFEST_CACHE_KEY: &str = "spec";

/// Persisted form of the last install.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedInstall {
    pub release_name: String,
    #[serde(default)]
    pub custom_flags: Value,
}

/// The cache Secret holding `install`.
pub fn manifest_cache_secret(namespace: &str, install: &CachedInstall) -> Result<Secret> {
    let spec = serde_json::to_vec(install)?;
    Ok(Secret {
        metadata: kube::api::ObjectMeta {
            name: Some(MANIFEST_CACHE_SECRET.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(common_labels()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            MANIFEST_CACHE_KEY.to_string(),
            ByteString(spec),
        )])),
        ..Default::default()
    })
}

/// Install values stored in `secret` for `release_name`, if any.
pub fn cached_values(secret: &Secret, release_name: &str) -> Option<Value> {
    let raw = secret.data.as_ref()?.get(MANIFEST_CACHE_KEY)?;
    match serde_json::from_slice::<CachedInstall>(&raw.0) {
        Ok(install) if install.release_name == release_name => Some(install.custom_flags),
        Ok(_) => None,
        Err(e) => {
            warn!(error = %e, "ignoring unreadable manifest cache");
            None
        }
    }
}

/// Installs the package with server-side apply.
pub struct KubeManifestInstaller {
    client: Client,
    renders: Mutex<HashMap<String, Vec<RenderedObject>>>,
}

impl KubeManifestInstaller {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            renders: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, release: &str) -> Option<Vec<RenderedObject>> {
        let renders = self.renders.lock().unwrap_or_else(|e| e.into_inner());
        renders.get(release).cloned()
    }

    fn cache(&self, release: &str, objects: Vec<RenderedObject>) {
        let mut renders = self.renders.lock().unwrap_or_else(|e| e.into_inner());
        renders.insert(release.to_string(), objects);
    }

    /// Objects of the last install. After a restart they are rendered again
    /// from the values kept in the cache Secret.
    async fn objects(&self, config: &ManifestConfig) -> Result<Vec<RenderedObject>> {
        if let Some(objects) = self.cached(&config.release_name) {
            return Ok(objects);
        }
        let values = self.load_values(config).await?.unwrap_or(Value::Null);
        let objects = render_manifest_dir(&config.manifest_dir, &values).await?;
        self.cache(&config.release_name, objects.clone());
        Ok(objects)
    }

    async fn load_values(&self, config: &ManifestConfig) -> Result<Option<Value>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &config.namespace);
        let secret = api.get_opt(MANIFEST_CACHE_SECRET).await?;
        Ok(secret.and_then(|s| cached_values(&s, &config.release_name)))
    }

    async fn store_values(&self, config: &ManifestConfig, values: &Value) -> Result<()> {
        let install = CachedInstall {
            release_name: config.release_name.clone(),
            custom_flags: values.clone(),
        };
        let mut secret = serde_json::to_value(manifest_cache_secret(&config.namespace, &install)?)?;
        secret["apiVersion"] = "v1".into();
        secret["kind"] = "Secret".into();
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &config.namespace);
        api.patch(
            MANIFEST_CACHE_SECRET,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&secret),
        )
        .await?;
        Ok(())
    }

    async fn discovery(&self) -> Result<Discovery> {
        Ok(Discovery::new(self.client.clone()).run().await?)
    }

    fn api(
        &self,
        resource: &ApiResource,
        caps: &ApiCapabilities,
        object: &RenderedObject,
        config: &ManifestConfig,
    ) -> Api<DynamicObject> {
        if matches!(caps.scope, Scope::Namespaced) {
            let ns = object.namespace.as_deref().unwrap_or(&config.namespace);
            Api::namespaced_with(self.client.clone(), ns, resource)
        } else {
            Api::all_with(self.client.clone(), resource)
        }
    }

    async fn apply(
        &self,
        discovery: &Discovery,
        object: &RenderedObject,
        config: &ManifestConfig,
    ) -> Result<()> {
        let (resource, caps) = discovery.resolve_gvk(&object.gvk()).ok_or_else(|| {
            Error::Manifest(format!(
                "unknown resource type {}/{}",
                object.api_version, object.kind
            ))
        })?;

        let mut value = object.value.clone();
        if matches!(caps.scope, Scope::Namespaced) && object.namespace.is_none() {
            if let Some(metadata) = value.get_mut("metadata").and_then(Value::as_object_mut) {
                metadata.insert("namespace".to_string(), config.namespace.clone().into());
            }
        }

        let params = PatchParams::apply(FIELD_MANAGER).force();
        self.api(&resource, &caps, object, config)
            .patch(&object.name, &params, &Patch::Apply(&value))
            .await
            .map_err(|e| Error::Manifest(format!("failed to apply {}: {e}", object.key())))?;
        debug!(object = %object.key(), "applied");
        Ok(())
    }
}

#[async_trait]
impl ManifestInstaller for KubeManifestInstaller {
    async fn install(&self, config: &ManifestConfig, values: &Value) -> Result<()> {
        let objects = render_manifest_dir(&config.manifest_dir, values).await?;

        let (mut foundational, mut rest): (Vec<&RenderedObject>, Vec<&RenderedObject>) = objects
            .iter()
            .partition(|o| o.kind == "Namespace" || o.kind == "CustomResourceDefinition");
        foundational.sort_by_key(|o| kind_priority(&o.kind));
        rest.sort_by_key(|o| kind_priority(&o.kind));

        let mut discovery = self.discovery().await?;
        for object in &foundational {
            self.apply(&discovery, object, config).await?;
        }
        if foundational.iter().any(|o| o.kind == "CustomResourceDefinition") {
            // New CRDs register new types
            discovery = self.discovery().await?;
        }
        for object in &rest {
            self.apply(&discovery, object, config).await?;
        }

        info!(release = %config.release_name, objects = objects.len(), "manifest applied");
        self.store_values(config, values).await?;
        self.cache(&config.release_name, objects);
        Ok(())
    }

    async fn verify(&self, config: &ManifestConfig) -> Result<Verification> {
        let objects = self.objects(config).await?;
        for object in objects.iter().filter(|o| o.kind == "Deployment") {
            let ns = object.namespace.as_deref().unwrap_or(&config.namespace);
            let api: Api<Deployment> = Api::namespaced(self.client.clone(), ns);
            let Some(deployment) = api.get_opt(&object.name).await? else {
                return Ok(Verification::processing());
            };
            let verification = deployment_verification(&deployment);
            if !verification.ready {
                return Ok(verification);
            }
        }
        Ok(Verification::ready())
    }

    async fn uninstall_by_kind(&self, config: &ManifestConfig, kind: UninstallKind) -> Result<()> {
        let objects = self.objects(config).await?;
        let discovery = self.discovery().await?;

        for object in objects.iter().filter(|o| kind.matches(&o.kind)) {
            let Some((resource, caps)) = discovery.resolve_gvk(&object.gvk()) else {
                // The type is gone, and so are its instances
                continue;
            };
            let api = self.api(&resource, &caps, object, config);
            match api.delete(&object.name, &DeleteParams::default()).await {
                Ok(_) => {}
                Err(kube::Error::Api(e)) if e.code == 404 => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn is_kind_empty(&self, config: &ManifestConfig, kind: UninstallKind) -> Result<bool> {
        let objects = self.objects(config).await?;
        let discovery = self.discovery().await?;
        let mut empty = true;

        for object in objects.iter().filter(|o| kind.matches(&o.kind)) {
            let Some((resource, caps)) = discovery.resolve_gvk(&object.gvk()) else {
                continue;
            };
            let api = self.api(&resource, &caps, object, config);
            if api.get_opt(&object.name).await?.is_some() {
                debug!(object = %object.key(), "still terminating");
                empty = false;
            }
        }
        Ok(empty)
    }

    async fn check_orphan_resources(&self, config: &ManifestConfig) -> Result<()> {
        let objects = self.objects(config).await?;
        let discovery = self.discovery().await?;

        for crd in objects.iter().filter(|o| o.kind == "CustomResourceDefinition") {
            let Some((group, version, kind)) = crd_group_version(crd) else {
                warn!(crd = %crd.name, "cannot read group and version of bundled CRD");
                continue;
            };
            let Some((resource, _)) = discovery.resolve_gvk(&GroupVersionKind::gvk(&group, &version, &kind))
            else {
                continue;
            };
            let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &resource);
            let count = api.list(&ListParams::default()).await?.items.len();
            if count > 0 {
                return Err(Error::OrphanResources(orphan_message(count, &group, &version)));
            }
        }
        Ok(())
    }
}

/// Labels every rendered object carries, for selection in tests and tooling.
pub fn common_labels() -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string()),
        (LABEL_MODULE.to_string(), MODULE_NAME.to_string()),
    ])
}
