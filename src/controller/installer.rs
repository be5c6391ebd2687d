//! Packaged-manifest installer contract.
//!
//! The RegistryProxy controller installs the whole module (CRDs, RBAC, the
//! connection controller Deployment, ...) as one unit. The state chain only
//! sees this trait; [`crate::controller::manifest::KubeManifestInstaller`]
//! implements it against the cluster.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::controller::error::Result;

/// Reason reported by [`ManifestInstaller::verify`] while workloads roll out.
pub const VERIFICATION_PROCESSING: &str = "processing";

/// Identifies one installation of the packaged manifest.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ManifestConfig {
    /// Unique per owner, `<namespace>/<name>` of the RegistryProxy.
    pub release_name: String,
    /// Namespace for namespaced objects without an explicit namespace.
    pub namespace: String,
    pub manifest_dir: PathBuf,
}

/// Readiness of the installed workloads.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Verification {
    pub ready: bool,
    /// Why the installation is not ready; empty when it is.
    pub reason: String,
}

impl Verification {
    pub fn ready() -> Self {
        Self {
            ready: true,
            reason: String::new(),
        }
    }

    pub fn processing() -> Self {
        Self {
            ready: false,
            reason: VERIFICATION_PROCESSING.to_string(),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            ready: false,
            reason: reason.into(),
        }
    }

    pub fn is_processing(&self) -> bool {
        !self.ready && self.reason == VERIFICATION_PROCESSING
    }
}

/// Groups of kinds removed one after another during uninstall.
///
/// Secrets go first so workload finalizers that still reference them do not
/// deadlock the teardown.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UninstallKind {
    Secrets,
    Workloads,
}

impl UninstallKind {
    /// Teardown order.
    pub const ORDER: [UninstallKind; 2] = [UninstallKind::Secrets, UninstallKind::Workloads];

    /// Whether objects of `kind` belong to this group.
    pub fn matches(&self, kind: &str) -> bool {
        match self {
            UninstallKind::Secrets => kind == "Secret",
            UninstallKind::Workloads => kind != "Secret",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UninstallKind::Secrets => "secrets",
            UninstallKind::Workloads => "workloads",
        }
    }

    /// Request deletion of every object in this group.
    pub async fn delete<I: ManifestInstaller + ?Sized>(
        self,
        installer: &I,
        config: &ManifestConfig,
    ) -> Result<()> {
        installer.uninstall_by_kind(config, self).await
    }

    /// Whether no object of this group is left.
    pub async fn is_empty<I: ManifestInstaller + ?Sized>(
        self,
        installer: &I,
        config: &ManifestConfig,
    ) -> Result<bool> {
        installer.is_kind_empty(config, self).await
    }
}

impl std::fmt::Display for UninstallKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Install, verify and remove the packaged manifest.
#[async_trait]
pub trait ManifestInstaller: Send + Sync {
    /// Render the manifest with `values` and apply it.
    async fn install(&self, config: &ManifestConfig, values: &Value) -> Result<()>;

    async fn verify(&self, config: &ManifestConfig) -> Result<Verification>;

    /// Request deletion of the objects of one group.
    async fn uninstall_by_kind(&self, config: &ManifestConfig, kind: UninstallKind) -> Result<()>;

    /// Whether none of the objects of one group exist anymore.
    async fn is_kind_empty(&self, config: &ManifestConfig, kind: UninstallKind) -> Result<bool>;

    /// Fail with [`crate::controller::error::Error::OrphanResources`] while
    /// instances of a bundled CRD still exist.
    async fn check_orphan_resources(&self, config: &ManifestConfig) -> Result<()>;

    /// Remove everything, one group at a time in [`UninstallKind::ORDER`].
    async fn uninstall(&self, config: &ManifestConfig) -> Result<bool> {
        for kind in UninstallKind::ORDER {
            kind.delete(self, config).await?;
            if !kind.is_empty(self, config).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Builder for the values map passed to [`ManifestInstaller::install`].
///
/// Keys are dotted paths; `build` expands them into nested objects.
#[derive(Clone, Debug, Default)]
pub struct InstallFlags {
    flags: BTreeMap<String, Value>,
}

impl InstallFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an arbitrary dotted key.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.flags.insert(key.to_string(), value.into());
        self
    }

    pub fn with_managed_by_label(self, managed_by: &str) -> Self {
        self.with("global.commonLabels.managedBy", managed_by)
    }

    /// The flag is rendered into a container env value, hence the quotes.
    pub fn with_istio_installed(self, installed: bool) -> Self {
        self.with(
            "controllerManager.container.env.ISTIO_INSTALLED",
            format!("\"{installed}\""),
        )
    }

    pub fn with_proxy_url(self, url: &str) -> Self {
        self.with("global.proxy.url", url)
    }

    pub fn with_proxy_location_id(self, location_id: &str) -> Self {
        self.with("global.proxy.locationID", location_id)
    }

    pub fn with_image_registry_proxy(self, image: &str) -> Self {
        self.with("global.images.registry_proxy", image)
    }

    pub fn with_image_connection(self, image: &str) -> Self {
        self.with("global.images.connection", image)
    }

    /// Expand the dotted keys into a nested JSON object.
    ///
    /// A key that is a prefix of another key loses to the longer one.
    pub fn build(&self) -> Value {
        let mut root = Map::new();
        for (key, value) in &self.flags {
            let mut node = &mut root;
            let mut parts = key.split('.').peekable();
            while let Some(part) = parts.next() {
                if parts.peek().is_none() {
                    if !matches!(node.get(part), Some(Value::Object(_))) {
                        node.insert(part.to_string(), value.clone());
                    }
                    break;
                }
                let child = node
                    .entry(part.to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
                if !child.is_object() {
                    *child = Value::Object(Map::new());
                }
                let Value::Object(next) = child else {
                    break;
                };
                node = next;
            }
        }
        Value::Object(root)
    }
}

/// Look up a dotted key in a values map.
pub fn lookup_value<'a>(values: &'a Value, key: &str) -> Option<&'a Value> {
    key.split('.')
        .try_fold(values, |node, part| node.as_object()?.get(part))
}
