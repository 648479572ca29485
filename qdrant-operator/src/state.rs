//! Process-wide control-plane state.
//!
//! Everything the event router, status writer and reconcilers need to agree
//! on lives in one owned [`ControlState`] value: the per-resource dedup
//! versions, the spec caches (fast reads, never the source of truth), the
//! status-write locks with their event buffers, the in-flight reconcile set
//! and the shutdown latch. All maps sit behind short, non-async critical
//! sections so concurrent tasks observe each transition atomically.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use k8s_openapi::api::apps::v1::StatefulSet;
use kube::core::NamespaceResourceScope;
use kube::Resource;
use parking_lot::Mutex;
use qdrant_operator_api::{
    CleanupPhase, InvalidSpec, Phase, QdrantCluster, QdrantCollection, QdrantClusterStatus,
    QdrantCollectionStatus,
};
use serde::{de::DeserializeOwned, Serialize};
use tokio_util::sync::CancellationToken;

/// Identity of an operated resource: `(namespace, name)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Key {
    pub namespace: String,
    pub name: String,
}

impl Key {
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Extracts the key from object metadata; `None` for objects the API
    /// server should never hand us (no name or namespace).
    pub fn from_object<K: Resource>(obj: &K) -> Option<Self> {
        Some(Self {
            namespace: obj.meta().namespace.clone()?,
            name: obj.meta().name.clone()?,
        })
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// The two kinds driven through the work queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Cluster,
    Collection,
}

impl ResourceKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Cluster => "cluster",
            ResourceKind::Collection => "collection",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work flowing through the work queue.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Request {
    pub kind: ResourceKind,
    pub key: Key,
}

/// An event withheld while a status write held the key locked.
#[derive(Clone, Debug)]
pub enum PendingEvent<K> {
    Applied(K),
    Deleted(K),
}

/// Per-kind tracking maps.
pub struct KindState<K> {
    versions: HashMap<Key, String>,
    cache: HashMap<Key, K>,
    setting_status: HashSet<Key>,
    pending: HashMap<Key, Vec<PendingEvent<K>>>,
    cleaning: HashSet<Key>,
}

impl<K> Default for KindState<K> {
    fn default() -> Self {
        Self {
            versions: HashMap::new(),
            cache: HashMap::new(),
            setting_status: HashSet::new(),
            pending: HashMap::new(),
            cleaning: HashSet::new(),
        }
    }
}

impl<K: Clone> KindState<K> {
    /// Buffers the event if a status write is in flight for `key`.
    /// Hands the event back when the key is not locked.
    pub fn buffer_if_locked(&mut self, key: &Key, event: PendingEvent<K>) -> Option<PendingEvent<K>> {
        if self.setting_status.contains(key) {
            self.pending.entry(key.clone()).or_default().push(event);
            return None;
        }
        Some(event)
    }

    /// Whether this resource version has already been observed for `key`.
    #[must_use]
    pub fn is_duplicate(&self, key: &Key, resource_version: &str) -> bool {
        self.versions.get(key).map(String::as_str) == Some(resource_version)
    }

    /// Records the observed version without caching the object. Used when an
    /// invalid spec is rejected so its event is not re-processed.
    pub fn observe_version(&mut self, key: &Key, resource_version: &str) {
        self.versions.insert(key.clone(), resource_version.to_string());
    }

    /// Records the observed version and caches the object.
    pub fn track(&mut self, key: &Key, resource_version: &str, obj: K) {
        self.versions.insert(key.clone(), resource_version.to_string());
        self.cache.insert(key.clone(), obj);
    }

    /// Drops all tracking for `key`.
    pub fn forget(&mut self, key: &Key) {
        self.versions.remove(key);
        self.cache.remove(key);
        self.pending.remove(key);
        self.setting_status.remove(key);
        self.cleaning.remove(key);
    }

    /// Drops tracking for every key not present in `live`. Called after a
    /// watch relist, which may hide deletions that happened while the stream
    /// was down.
    pub fn retain_live(&mut self, live: &HashSet<Key>) -> Vec<Key> {
        let gone: Vec<Key> = self
            .cache
            .keys()
            .filter(|key| !live.contains(*key))
            .cloned()
            .collect();
        for key in &gone {
            self.forget(key);
        }
        gone
    }

    #[must_use]
    pub fn get(&self, key: &Key) -> Option<K> {
        self.cache.get(key).cloned()
    }

    #[must_use]
    pub fn keys(&self) -> Vec<Key> {
        self.cache.keys().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Locks the key for a status write; events arriving meanwhile buffer.
    pub fn lock_status(&mut self, key: &Key) {
        self.setting_status.insert(key.clone());
    }

    /// Releases the status lock and drains the buffered events, oldest first.
    pub fn unlock_status(&mut self, key: &Key) -> Vec<PendingEvent<K>> {
        self.setting_status.remove(key);
        self.pending.remove(key).unwrap_or_default()
    }

    /// Marks cleanup as running; `false` when one is already in flight.
    pub fn begin_cleanup(&mut self, key: &Key) -> bool {
        self.cleaning.insert(key.clone())
    }

    pub fn end_cleanup(&mut self, key: &Key) {
        self.cleaning.remove(key);
    }
}

/// All shared control-plane state, owned once and passed by reference.
pub struct ControlState {
    pub clusters: Mutex<KindState<QdrantCluster>>,
    pub collections: Mutex<KindState<QdrantCollection>>,
    /// Last observed workload per cluster; a cache, never the decision basis.
    workloads: Mutex<HashMap<Key, StatefulSet>>,
    /// Keys whose reconcile is currently executing.
    active: Mutex<HashSet<Request>>,
    /// Abort handles for per-cluster readiness watches.
    readiness: Mutex<HashMap<Key, CancellationToken>>,
    shutting_down: AtomicBool,
}

impl Default for ControlState {
    fn default() -> Self {
        Self {
            clusters: Mutex::new(KindState::default()),
            collections: Mutex::new(KindState::default()),
            workloads: Mutex::new(HashMap::new()),
            active: Mutex::new(HashSet::new()),
            readiness: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
        }
    }
}

impl ControlState {
    /// Latches the shutdown flag. New reconciles must not start afterwards.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Adds the request to the active set; `false` if it was already there.
    pub fn mark_active(&self, request: &Request) -> bool {
        self.active.lock().insert(request.clone())
    }

    pub fn clear_active(&self, request: &Request) {
        self.active.lock().remove(request);
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Waits for in-flight reconciles to finish, up to `cap`.
    /// Returns `false` when the cap expired with work still running.
    pub async fn drained(&self, cap: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + cap;
        loop {
            if self.active_count() == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    #[must_use]
    pub fn cached_workload(&self, key: &Key) -> Option<StatefulSet> {
        self.workloads.lock().get(key).cloned()
    }

    pub fn cache_workload(&self, key: &Key, workload: Option<StatefulSet>) {
        let mut workloads = self.workloads.lock();
        match workload {
            Some(sts) => {
                workloads.insert(key.clone(), sts);
            }
            None => {
                workloads.remove(key);
            }
        }
    }

    /// Registers the abort handle of a readiness watch, cancelling any
    /// previous one for the same key.
    pub fn register_readiness(&self, key: &Key, token: CancellationToken) {
        if let Some(previous) = self.readiness.lock().insert(key.clone(), token) {
            previous.cancel();
        }
    }

    /// Aborts the readiness watch for `key`, if one is running.
    pub fn abort_readiness(&self, key: &Key) {
        if let Some(token) = self.readiness.lock().remove(key) {
            token.cancel();
        }
    }
}

/// Control-plane view of an operated kind: the hooks the generic router,
/// status writer and cleanup need, implemented for clusters and collections.
pub trait Operated:
    Resource<Scope = NamespaceResourceScope, DynamicType = ()>
    + Clone
    + Serialize
    + DeserializeOwned
    + fmt::Debug
    + Send
    + Sync
    + 'static
{
    const KIND: ResourceKind;
    type Status: Clone + Default + fmt::Debug + Serialize + DeserializeOwned + Send + Sync;

    fn validate_spec(&self) -> Result<(), InvalidSpec>;
    fn kind_state(state: &ControlState) -> &Mutex<KindState<Self>>;
    fn status(&self) -> Option<&Self::Status>;
    /// Mutable status, initialized to default when absent.
    fn status_mut(&mut self) -> &mut Self::Status;
    fn phase(&self) -> Option<Phase>;
    fn observed_generation(&self) -> Option<i64>;
    fn set_phase(status: &mut Self::Status, phase: Phase, observed_generation: Option<i64>);
    fn set_error(
        status: &mut Self::Status,
        reason: &str,
        message: &str,
        observed_generation: Option<i64>,
    );
    fn set_cleanup(
        status: &mut Self::Status,
        phase: CleanupPhase,
        attempts: u32,
        error: Option<String>,
    );
}

impl Operated for QdrantCluster {
    const KIND: ResourceKind = ResourceKind::Cluster;
    type Status = QdrantClusterStatus;

    fn validate_spec(&self) -> Result<(), InvalidSpec> {
        self.spec.validate()
    }

    fn kind_state(state: &ControlState) -> &Mutex<KindState<Self>> {
        &state.clusters
    }

    fn status(&self) -> Option<&Self::Status> {
        self.status.as_ref()
    }

    fn status_mut(&mut self) -> &mut Self::Status {
        self.status.get_or_insert_with(Default::default)
    }

    fn phase(&self) -> Option<Phase> {
        self.status.as_ref().and_then(|status| status.qdrant_status)
    }

    fn observed_generation(&self) -> Option<i64> {
        self.status.as_ref().and_then(|status| status.observed_generation)
    }

    fn set_phase(status: &mut Self::Status, phase: Phase, observed_generation: Option<i64>) {
        status.qdrant_status = Some(phase);
        status.observed_generation = observed_generation;
        if phase != Phase::Error {
            status.reason = None;
            status.error_message = None;
        }
        status.conditions = vec![qdrant_operator_api::ready_condition(
            phase.is_ready(),
            &phase.to_string(),
            "",
            observed_generation,
        )];
    }

    fn set_error(
        status: &mut Self::Status,
        reason: &str,
        message: &str,
        observed_generation: Option<i64>,
    ) {
        status.qdrant_status = Some(Phase::Error);
        status.reason = Some(reason.to_string());
        status.error_message = Some(message.to_string());
        status.observed_generation = observed_generation;
        status.conditions = vec![qdrant_operator_api::ready_condition(
            false,
            reason,
            message,
            observed_generation,
        )];
    }

    fn set_cleanup(
        status: &mut Self::Status,
        phase: CleanupPhase,
        attempts: u32,
        error: Option<String>,
    ) {
        status.cleanup_phase = Some(phase);
        status.cleanup_attempts = Some(attempts);
        status.cleanup_error = error;
    }
}

impl Operated for QdrantCollection {
    const KIND: ResourceKind = ResourceKind::Collection;
    type Status = QdrantCollectionStatus;

    fn validate_spec(&self) -> Result<(), InvalidSpec> {
        self.spec.validate()
    }

    fn kind_state(state: &ControlState) -> &Mutex<KindState<Self>> {
        &state.collections
    }

    fn status(&self) -> Option<&Self::Status> {
        self.status.as_ref()
    }

    fn status_mut(&mut self) -> &mut Self::Status {
        self.status.get_or_insert_with(Default::default)
    }

    fn phase(&self) -> Option<Phase> {
        self.status.as_ref().and_then(|status| status.qdrant_status)
    }

    fn observed_generation(&self) -> Option<i64> {
        self.status.as_ref().and_then(|status| status.observed_generation)
    }

    fn set_phase(status: &mut Self::Status, phase: Phase, observed_generation: Option<i64>) {
        status.qdrant_status = Some(phase);
        status.observed_generation = observed_generation;
        if phase != Phase::Error {
            status.reason = None;
            status.error_message = None;
        }
        status.conditions = vec![qdrant_operator_api::ready_condition(
            phase.is_ready(),
            &phase.to_string(),
            "",
            observed_generation,
        )];
    }

    fn set_error(
        status: &mut Self::Status,
        reason: &str,
        message: &str,
        observed_generation: Option<i64>,
    ) {
        status.qdrant_status = Some(Phase::Error);
        status.reason = Some(reason.to_string());
        status.error_message = Some(message.to_string());
        status.observed_generation = observed_generation;
        status.conditions = vec![qdrant_operator_api::ready_condition(
            false,
            reason,
            message,
            observed_generation,
        )];
    }

    fn set_cleanup(
        status: &mut Self::Status,
        phase: CleanupPhase,
        attempts: u32,
        error: Option<String>,
    ) {
        status.cleanup_phase = Some(phase);
        status.cleanup_attempts = Some(attempts);
        status.cleanup_error = error;
    }
}
