//! Mock infrastructure for driving the state chains in functional tests.
//!
//! `MockCluster` is an in-memory [`ObjectStore`] with the API server
//! behaviors the chains depend on: resourceVersion conflicts, a status
//! subresource that plain updates do not touch, finalizer-guarded deletion
//! and NodePort assignment. Every write is recorded so tests can assert on
//! write counts and ordering.
//!
//! `ScriptedInstaller` and `ScriptedProber` stand in for the manifest
//! installer and the HTTP pod prober.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::channel::mpsc::UnboundedReceiver;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::Resource;
use serde::Serialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use registry_proxy_operator::config::OperatorConfig;
use registry_proxy_operator::controller::arbiter::ReconcileAllTrigger;
use registry_proxy_operator::controller::connection_states::{ConnectionMachine, ConnectionState};
use registry_proxy_operator::controller::context::{Collaborators, Milestone};
use registry_proxy_operator::controller::engine::{RequeueSignal, run};
use registry_proxy_operator::controller::error::{Error, Result};
use registry_proxy_operator::controller::installer::{
    ManifestConfig, ManifestInstaller, UninstallKind, Verification,
};
use registry_proxy_operator::controller::operator_states::{OperatorMachine, OperatorState};
use registry_proxy_operator::controller::probe::PodProber;
use registry_proxy_operator::controller::readiness::ReadinessCache;
use registry_proxy_operator::controller::reverse_proxy_states::{
    ReverseProxyMachine, ReverseProxyState,
};
use registry_proxy_operator::controller::store::{ObjectStore, StoredKind};
use registry_proxy_operator::crd::{Connection, ImagePullReverseProxy, RegistryProxy};

/// First NodePort handed out by the mock API server.
pub const FIRST_NODE_PORT: i32 = 30000;

/// Kind of write issued against the mock cluster.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Op {
    Create,
    Update,
    Delete,
    UpdateStatus,
}

/// One recorded write.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Write {
    pub op: Op,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

type Key = (String, String, String);

#[derive(Default)]
struct ClusterInner {
    objects: BTreeMap<Key, Value>,
    writes: Vec<Write>,
    failures: Vec<(Op, String, Option<String>)>,
    next_version: u64,
    next_node_port: i32,
    manual_node_ports: bool,
}

impl ClusterInner {
    fn bump_version(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    fn take_failure(&mut self, op: Op, kind: &str, name: &str) -> Option<Error> {
        let idx = self.failures.iter().position(|(o, k, n)| {
            *o == op && k == kind && n.as_deref().is_none_or(|n| n == name)
        })?;
        self.failures.remove(idx);
        Some(api_error(500, "InternalError", "injected failure"))
    }

    /// Field defaults the API server fills in on write.
    fn apply_defaults(kind: &str, value: &mut Value) {
        if kind != "Deployment" {
            return;
        }
        let Some(volumes) = value["spec"]["template"]["spec"]["volumes"].as_array_mut() else {
            return;
        };
        for volume in volumes {
            if volume["secret"].is_object() && volume["secret"]["defaultMode"].is_null() {
                volume["secret"]["defaultMode"] = json!(420);
            }
        }
    }

    fn assign_node_ports(&mut self, service: &mut Value) {
        if self.manual_node_ports {
            return;
        }
        let Some(ports) = service["spec"]["ports"].as_array_mut() else {
            return;
        };
        for port in ports {
            if port.get("nodePort").is_none_or(Value::is_null) {
                port["nodePort"] = json!(FIRST_NODE_PORT + self.next_node_port);
                self.next_node_port += 1;
            }
        }
    }
}

/// Build a Kubernetes API error like the API server returns it.
pub fn api_error(code: u16, reason: &str, message: &str) -> Error {
    Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: message.to_string(),
        reason: reason.to_string(),
        code,
    }))
}

fn kind_of<K: StoredKind>() -> String {
    K::kind(&()).to_string()
}

fn key_of(kind: &str, value: &Value) -> Key {
    let meta = &value["metadata"];
    (
        kind.to_string(),
        meta["namespace"].as_str().unwrap_or_default().to_string(),
        meta["name"].as_str().unwrap_or_default().to_string(),
    )
}

fn labels_match(value: &Value, selector: Option<&str>) -> bool {
    let Some(selector) = selector else {
        return true;
    };
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| {
            let (k, v) = term.split_once('=').unwrap();
            value["metadata"]["labels"][k].as_str() == Some(v)
        })
}

fn has_finalizers(value: &Value) -> bool {
    value["metadata"]["finalizers"]
        .as_array()
        .is_some_and(|f| !f.is_empty())
}

fn is_terminating(value: &Value) -> bool {
    !value["metadata"]["deletionTimestamp"].is_null()
}

/// In-memory cluster.
#[derive(Default)]
pub struct MockCluster {
    inner: Mutex<ClusterInner>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop assigning NodePorts on Service create.
    pub fn manual_node_ports(&self) {
        self.inner.lock().unwrap().manual_node_ports = true;
    }

    /// Seed an object without recording a write.
    pub fn insert<K: StoredKind>(&self, obj: &K) {
        let mut inner = self.inner.lock().unwrap();
        let mut value = serde_json::to_value(obj).unwrap();
        if value["metadata"]["resourceVersion"].is_null() {
            value["metadata"]["resourceVersion"] = json!(inner.bump_version());
        }
        let key = key_of(&kind_of::<K>(), &value);
        inner.objects.insert(key, value);
    }

    /// Replace an object as another actor would, bumping its resourceVersion.
    pub fn modify<K: StoredKind>(&self, namespace: &str, name: &str, f: impl FnOnce(&mut K)) {
        let mut obj: K = self.object(namespace, name).unwrap();
        f(&mut obj);
        obj.meta_mut().resource_version = None;
        self.insert(&obj);
    }

    pub fn object<K: StoredKind>(&self, namespace: &str, name: &str) -> Option<K> {
        let inner = self.inner.lock().unwrap();
        let key = (kind_of::<K>(), namespace.to_string(), name.to_string());
        inner
            .objects
            .get(&key)
            .map(|value| serde_json::from_value(value.clone()).unwrap())
    }

    pub fn exists<K: StoredKind>(&self, namespace: &str, name: &str) -> bool {
        self.object::<K>(namespace, name).is_some()
    }

    /// Request deletion the way `kubectl delete` does.
    pub fn request_deletion<K: StoredKind>(&self, namespace: &str, name: &str) {
        let mut inner = self.inner.lock().unwrap();
        let key = (kind_of::<K>(), namespace.to_string(), name.to_string());
        let Some(value) = inner.objects.get_mut(&key) else {
            return;
        };
        if has_finalizers(value) {
            value["metadata"]["deletionTimestamp"] =
                serde_json::to_value(Time(jiff::Timestamp::now())).unwrap();
        } else {
            inner.objects.remove(&key);
        }
    }

    /// Fail the next `op` on `kind` with a server error.
    pub fn fail_next(&self, op: Op, kind: &str) {
        self.inner
            .lock()
            .unwrap()
            .failures
            .push((op, kind.to_string(), None));
    }

    /// Fail the next `op` on the `kind` object called `name`.
    pub fn fail_next_on(&self, op: Op, kind: &str, name: &str) {
        self.inner
            .lock()
            .unwrap()
            .failures
            .push((op, kind.to_string(), Some(name.to_string())));
    }

    pub fn writes(&self) -> Vec<Write> {
        self.inner.lock().unwrap().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.inner.lock().unwrap().writes.clear();
    }

    /// Recorded writes of `op` on `kind`.
    pub fn count(&self, op: Op, kind: &str) -> usize {
        self.writes()
            .iter()
            .filter(|w| w.op == op && w.kind == kind)
            .count()
    }

    fn record(inner: &mut ClusterInner, op: Op, key: &Key) {
        inner.writes.push(Write {
            op,
            kind: key.0.clone(),
            namespace: key.1.clone(),
            name: key.2.clone(),
        });
    }

    fn check_version(stored: &Value, incoming: &Value) -> Result<()> {
        let incoming = &incoming["metadata"]["resourceVersion"];
        if !incoming.is_null() && *incoming != stored["metadata"]["resourceVersion"] {
            return Err(api_error(409, "Conflict", "the object has been modified"));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MockCluster {
    async fn get<K: StoredKind>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        let inner = self.inner.lock().unwrap();
        let key = (kind_of::<K>(), namespace.to_string(), name.to_string());
        inner
            .objects
            .get(&key)
            .map(|value| serde_json::from_value(value.clone()))
            .transpose()
            .map_err(Error::from)
    }

    async fn list<K: StoredKind>(
        &self,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<K>> {
        let inner = self.inner.lock().unwrap();
        let kind = kind_of::<K>();
        inner
            .objects
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && namespace.is_none_or(|n| n == ns))
            .filter(|(_, value)| labels_match(value, label_selector))
            .map(|(_, value)| serde_json::from_value(value.clone()).map_err(Error::from))
            .collect()
    }

    async fn create<K: StoredKind>(&self, obj: &K) -> Result<K> {
        let mut inner = self.inner.lock().unwrap();
        let kind = kind_of::<K>();
        let mut value = serde_json::to_value(obj)?;
        let key = key_of(&kind, &value);
        if let Some(e) = inner.take_failure(Op::Create, &kind, &key.2) {
            return Err(e);
        }
        if inner.objects.contains_key(&key) {
            return Err(api_error(409, "AlreadyExists", "object already exists"));
        }
        value["metadata"]["resourceVersion"] = json!(inner.bump_version());
        if value["metadata"]["uid"].is_null() {
            value["metadata"]["uid"] = json!(format!("uid-{}-{}", key.1, key.2));
        }
        if kind == "Service" {
            inner.assign_node_ports(&mut value);
        }
        ClusterInner::apply_defaults(&kind, &mut value);
        Self::record(&mut inner, Op::Create, &key);
        inner.objects.insert(key, value.clone());
        Ok(serde_json::from_value(value)?)
    }

    async fn update<K: StoredKind>(&self, obj: &K) -> Result<K> {
        let mut inner = self.inner.lock().unwrap();
        let kind = kind_of::<K>();
        let mut value = serde_json::to_value(obj)?;
        let key = key_of(&kind, &value);
        if let Some(e) = inner.take_failure(Op::Update, &kind, &key.2) {
            return Err(e);
        }
        let stored = inner
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| api_error(404, "NotFound", "object not found"))?;
        Self::check_version(&stored, &value)?;

        // The status subresource is not writable through a plain update
        value["status"] = stored["status"].clone();
        ClusterInner::apply_defaults(&kind, &mut value);
        value["metadata"]["deletionTimestamp"] = stored["metadata"]["deletionTimestamp"].clone();
        value["metadata"]["resourceVersion"] = json!(inner.bump_version());
        Self::record(&mut inner, Op::Update, &key);

        if is_terminating(&value) && !has_finalizers(&value) {
            inner.objects.remove(&key);
        } else {
            inner.objects.insert(key, value.clone());
        }
        Ok(serde_json::from_value(value)?)
    }

    async fn delete<K: StoredKind>(&self, namespace: &str, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let kind = kind_of::<K>();
        if let Some(e) = inner.take_failure(Op::Delete, &kind, name) {
            return Err(e);
        }
        let key = (kind, namespace.to_string(), name.to_string());
        Self::record(&mut inner, Op::Delete, &key);
        let Some(value) = inner.objects.get_mut(&key) else {
            return Ok(());
        };
        if has_finalizers(value) {
            value["metadata"]["deletionTimestamp"] =
                serde_json::to_value(Time(jiff::Timestamp::now()))?;
        } else {
            inner.objects.remove(&key);
        }
        Ok(())
    }

    async fn update_status<K: StoredKind, S: Serialize + Send + Sync>(
        &self,
        obj: &K,
        status: &S,
    ) -> Result<K> {
        let mut inner = self.inner.lock().unwrap();
        let kind = kind_of::<K>();
        let incoming = serde_json::to_value(obj)?;
        let key = key_of(&kind, &incoming);
        if let Some(e) = inner.take_failure(Op::UpdateStatus, &kind, &key.2) {
            return Err(e);
        }
        let mut value = inner
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| api_error(404, "NotFound", "object not found"))?;
        Self::check_version(&value, &incoming)?;

        value["status"] = serde_json::to_value(status)?;
        value["metadata"]["resourceVersion"] = json!(inner.bump_version());
        Self::record(&mut inner, Op::UpdateStatus, &key);
        inner.objects.insert(key, value.clone());
        Ok(serde_json::from_value(value)?)
    }
}

/// Recorded installer call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InstallerCall {
    Install,
    Verify,
    CheckOrphans,
    Uninstall(UninstallKind),
}

#[derive(Default)]
struct InstallerInner {
    calls: Vec<InstallerCall>,
    values: Vec<Value>,
    install_error: Option<String>,
    verifications: VecDeque<Verification>,
    pending: Vec<(UninstallKind, usize)>,
    orphan_hazard: Option<String>,
}

/// [`ManifestInstaller`] that follows a script instead of talking to a cluster.
///
/// Verification answers ready unless results were queued; each kind is gone
/// on the first uninstall request unless pending rounds were configured.
#[derive(Default)]
pub struct ScriptedInstaller {
    inner: Mutex<InstallerInner>,
}

impl ScriptedInstaller {
    pub fn fail_install(&self, message: &str) {
        self.inner.lock().unwrap().install_error = Some(message.to_string());
    }

    pub fn queue_verification(&self, verification: Verification) {
        self.inner
            .lock()
            .unwrap()
            .verifications
            .push_back(verification);
    }

    /// Report `kind` as still present for `rounds` emptiness checks.
    pub fn pending(&self, kind: UninstallKind, rounds: usize) {
        self.inner.lock().unwrap().pending.push((kind, rounds));
    }

    pub fn set_orphan_hazard(&self, hazard: Option<&str>) {
        self.inner.lock().unwrap().orphan_hazard = hazard.map(str::to_string);
    }

    pub fn calls(&self) -> Vec<InstallerCall> {
        self.inner.lock().unwrap().calls.clone()
    }

    /// Values passed to the last install.
    pub fn last_values(&self) -> Option<Value> {
        self.inner.lock().unwrap().values.last().cloned()
    }
}

#[async_trait]
impl ManifestInstaller for ScriptedInstaller {
    async fn install(&self, _config: &ManifestConfig, values: &Value) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(InstallerCall::Install);
        inner.values.push(values.clone());
        match &inner.install_error {
            Some(message) => Err(Error::Manifest(message.clone())),
            None => Ok(()),
        }
    }

    async fn verify(&self, _config: &ManifestConfig) -> Result<Verification> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(InstallerCall::Verify);
        Ok(inner
            .verifications
            .pop_front()
            .unwrap_or_else(Verification::ready))
    }

    async fn uninstall_by_kind(&self, _config: &ManifestConfig, kind: UninstallKind) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .calls
            .push(InstallerCall::Uninstall(kind));
        Ok(())
    }

    async fn is_kind_empty(&self, _config: &ManifestConfig, kind: UninstallKind) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        match inner.pending.iter_mut().find(|(k, rounds)| *k == kind && *rounds > 0) {
            Some((_, rounds)) => {
                *rounds -= 1;
                Ok(false)
            }
            None => Ok(true),
        }
    }

    async fn check_orphan_resources(&self, _config: &ManifestConfig) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(InstallerCall::CheckOrphans);
        match &inner.orphan_hazard {
            Some(hazard) => Err(Error::OrphanResources(hazard.clone())),
            None => Ok(()),
        }
    }
}

/// Scripted answer of the pod prober.
#[derive(Clone, Debug)]
pub enum ProbeAnswer {
    Status(u16),
    Unreachable(String),
}

/// [`PodProber`] answering from a table keyed by URL suffix.
///
/// URLs without a matching entry answer 200.
#[derive(Default)]
pub struct ScriptedProber {
    answers: Mutex<Vec<(String, ProbeAnswer)>>,
    requests: Mutex<Vec<String>>,
}

impl ScriptedProber {
    /// Answer every URL ending in `suffix` (e.g. `":8081/healthz"`).
    pub fn answer(&self, suffix: &str, answer: ProbeAnswer) {
        let mut answers = self.answers.lock().unwrap();
        answers.retain(|(s, _)| s != suffix);
        answers.push((suffix.to_string(), answer));
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl PodProber for ScriptedProber {
    async fn probe(&self, url: &str) -> Result<u16> {
        self.requests.lock().unwrap().push(url.to_string());
        let answers = self.answers.lock().unwrap();
        match answers.iter().find(|(suffix, _)| url.ends_with(suffix.as_str())) {
            Some((_, ProbeAnswer::Status(code))) => Ok(*code),
            Some((_, ProbeAnswer::Unreachable(message))) => Err(Error::Transient(message.clone())),
            None => Ok(200),
        }
    }
}

/// Everything a tick needs, wired to the mocks.
pub struct Harness {
    pub cluster: MockCluster,
    pub config: OperatorConfig,
    pub connectivity_proxy: ReadinessCache,
    pub istio: ReadinessCache,
    pub installer: ScriptedInstaller,
    pub prober: ScriptedProber,
    pub reconcile_all: ReconcileAllTrigger,
    reconcile_all_rx: Mutex<UnboundedReceiver<()>>,
    pub cancel: CancellationToken,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    /// Harness with both dependencies unavailable.
    pub fn new() -> Self {
        let (reconcile_all, rx) = ReconcileAllTrigger::channel();
        Self {
            cluster: MockCluster::new(),
            config: OperatorConfig {
                proxy_image: "europe-docker.pkg.dev/kyma-project/prod/registry-proxy:1.0.0".to_string(),
                proxy_command: "/app/registry-proxy".to_string(),
                ..OperatorConfig::default()
            },
            connectivity_proxy: ReadinessCache::default(),
            istio: ReadinessCache::default(),
            installer: ScriptedInstaller::default(),
            prober: ScriptedProber::default(),
            reconcile_all,
            reconcile_all_rx: Mutex::new(rx),
            cancel: CancellationToken::new(),
        }
    }

    /// Harness with the Connectivity Proxy CRD present.
    pub fn with_connectivity_proxy() -> Self {
        let harness = Self::new();
        harness.connectivity_proxy.set(true);
        harness
    }

    pub fn deps(&self) -> Collaborators<'_, MockCluster> {
        Collaborators {
            store: &self.cluster,
            config: &self.config,
            connectivity_proxy: &self.connectivity_proxy,
            istio: &self.istio,
            installer: &self.installer,
            prober: &self.prober,
            reconcile_all: &self.reconcile_all,
        }
    }

    /// Run one RegistryProxy tick against the stored object.
    pub async fn tick_registry_proxy(&self, namespace: &str, name: &str) -> (Result<RequeueSignal>, Vec<Milestone>) {
        let rp: RegistryProxy = self.cluster.object(namespace, name).unwrap();
        let mut machine = OperatorMachine::new(rp, self.deps());
        let outcome = run(&mut machine, OperatorState::ServedFilter, &self.cancel).await;
        (outcome, machine.milestones().to_vec())
    }

    pub async fn tick_connection(&self, namespace: &str, name: &str) -> Result<RequeueSignal> {
        let conn: Connection = self.cluster.object(namespace, name).unwrap();
        let mut machine = ConnectionMachine::new(conn, self.deps());
        run(&mut machine, ConnectionState::ValidateDependency, &self.cancel).await
    }

    pub async fn tick_reverse_proxy(&self, namespace: &str, name: &str) -> Result<RequeueSignal> {
        let rp: ImagePullReverseProxy = self.cluster.object(namespace, name).unwrap();
        let mut machine = ReverseProxyMachine::new(rp, self.deps());
        run(&mut machine, ReverseProxyState::ValidateDependency, &self.cancel).await
    }

    /// Whether a reconcile of all RegistryProxies was requested since the last call.
    pub fn reconcile_all_requested(&self) -> bool {
        let mut rx = self.reconcile_all_rx.lock().unwrap();
        let mut fired = false;
        while let Ok(Some(())) = rx.try_next() {
            fired = true;
        }
        fired
    }
}
