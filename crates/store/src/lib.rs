//! Filestore fact store: in-memory caches of cluster facts fed by watchers.
//!
//! Readers (hooks, reconcilers) load a consistent map per read through
//! `ArcSwap`; a single ingest loop applies watcher deltas in batches and
//! broadcasts which fact kinds each batch touched.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use filestore_core::{
    content_hash, FactChange, FactKind, FactKinds, FactSnapshot, Infrastructure, LogLevel,
    ManagementState, OperatorConfig, ProxyConfig,
};
use k8s_openapi::api::core::v1::{ConfigMap, Node, Secret};
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Read-only, concurrency-safe view over one kind of cached object.
pub trait Lister<K>: Send + Sync {
    fn get(&self, name: &str) -> Option<Arc<K>>;
    fn list(&self) -> Vec<Arc<K>>;
}

/// Objects that can live in a [`Cache`].
pub trait Keyed {
    fn cache_key(&self) -> Option<&str>;
}

impl Keyed for Secret {
    fn cache_key(&self) -> Option<&str> { self.metadata.name.as_deref() }
}

impl Keyed for ConfigMap {
    fn cache_key(&self) -> Option<&str> { self.metadata.name.as_deref() }
}

impl Keyed for Node {
    fn cache_key(&self) -> Option<&str> { self.metadata.name.as_deref() }
}

impl Keyed for Infrastructure {
    fn cache_key(&self) -> Option<&str> { Some(self.name.as_str()) }
}

/// Name-keyed cache. Single writer (the ingest loop), many readers.
pub struct Cache<K> {
    map: ArcSwap<FxHashMap<String, Arc<K>>>,
}

impl<K> Default for Cache<K> {
    fn default() -> Self { Self { map: ArcSwap::from_pointee(FxHashMap::default()) } }
}

impl<K: Keyed> Cache<K> {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.map.load().len() }
    pub fn is_empty(&self) -> bool { self.map.load().is_empty() }

    pub fn upsert(&self, obj: K) {
        let Some(key) = obj.cache_key().map(str::to_string) else { return; };
        let mut next = (**self.map.load()).clone();
        next.insert(key, Arc::new(obj));
        self.map.store(Arc::new(next));
    }

    pub fn remove(&self, obj: &K) {
        let Some(key) = obj.cache_key() else { return; };
        if !self.map.load().contains_key(key) { return; }
        let mut next = (**self.map.load()).clone();
        next.remove(key);
        self.map.store(Arc::new(next));
    }

    /// Replace the whole content, as after a watch restart (relist).
    pub fn replace_all(&self, items: Vec<K>) {
        let mut next = FxHashMap::default();
        for obj in items {
            if let Some(key) = obj.cache_key().map(str::to_string) {
                next.insert(key, Arc::new(obj));
            }
        }
        self.map.store(Arc::new(next));
    }

    fn apply(&self, op: Op<K>) {
        match op {
            Op::Applied(o) => self.upsert(o),
            Op::Deleted(o) => self.remove(&o),
            Op::Restarted(list) => self.replace_all(list),
        }
    }
}

impl<K: Keyed + Send + Sync> Lister<K> for Cache<K> {
    fn get(&self, name: &str) -> Option<Arc<K>> { self.map.load().get(name).cloned() }

    fn list(&self) -> Vec<Arc<K>> {
        let map = self.map.load();
        let mut out: Vec<(&String, &Arc<K>)> = map.iter().collect();
        out.sort_by(|a, b| a.0.cmp(b.0));
        out.into_iter().map(|(_, v)| Arc::clone(v)).collect()
    }
}

/// Watch event for a cached kind.
#[derive(Debug, Clone)]
pub enum Op<K> {
    Applied(K),
    Deleted(K),
    Restarted(Vec<K>),
}

/// One change observed by a watcher.
#[derive(Debug, Clone)]
pub enum FactDelta {
    Secret(Op<Secret>),
    ConfigMap(Op<ConfigMap>),
    Node(Op<Node>),
    Infrastructure(Op<Infrastructure>),
    Operator { management_state: ManagementState, log_level: LogLevel },
    Proxy(Option<ProxyConfig>),
    /// Payload-free notification (e.g. a managed workload's status moved).
    Touched(FactKind),
}

impl FactDelta {
    pub fn kind(&self) -> FactKind {
        match self {
            Self::Secret(_) => FactKind::Secret,
            Self::ConfigMap(_) => FactKind::ConfigMap,
            Self::Node(_) => FactKind::Node,
            Self::Infrastructure(_) => FactKind::Infrastructure,
            Self::Operator { .. } => FactKind::OperatorConfig,
            Self::Proxy(_) => FactKind::Proxy,
            Self::Touched(k) => *k,
        }
    }
}

/// Content hash of a secret's data, stable across passes.
pub fn secret_hash(secret: &Secret) -> String {
    let data = secret.data.as_ref();
    content_hash(data.into_iter().flatten().map(|(k, v)| (k.as_str(), v.0.as_slice())))
}

/// Content hash of a config map's string and binary data.
pub fn config_map_hash(cm: &ConfigMap) -> String {
    let text = cm.data.iter().flatten().map(|(k, v)| (k.as_str(), v.as_bytes()));
    let bin = cm.binary_data.iter().flatten().map(|(k, v)| (k.as_str(), v.0.as_slice()));
    content_hash(text.chain(bin))
}

/// All fact sources of the operator, constructed once at startup.
pub struct FactStore {
    pub secrets: Arc<Cache<Secret>>,
    pub config_maps: Arc<Cache<ConfigMap>>,
    pub nodes: Arc<Cache<Node>>,
    pub infrastructure: Arc<Cache<Infrastructure>>,
    config: ArcSwap<OperatorConfig>,
    epoch: AtomicU64,
    changes: broadcast::Sender<FactChange>,
}

impl FactStore {
    pub fn new(config: OperatorConfig) -> Arc<Self> {
        let (changes, _) = broadcast::channel(256);
        Arc::new(Self {
            secrets: Arc::new(Cache::new()),
            config_maps: Arc::new(Cache::new()),
            nodes: Arc::new(Cache::new()),
            infrastructure: Arc::new(Cache::new()),
            config: ArcSwap::from_pointee(config),
            epoch: AtomicU64::new(0),
            changes,
        })
    }

    pub fn operator_config(&self) -> Arc<OperatorConfig> { self.config.load_full() }
    pub fn epoch(&self) -> u64 { self.epoch.load(Ordering::Acquire) }

    /// Subscribe to per-batch change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<FactChange> { self.changes.subscribe() }

    /// Apply a batch of deltas, bump the epoch and notify subscribers.
    pub fn apply(&self, batch: Vec<FactDelta>) -> Option<FactChange> {
        if batch.is_empty() { return None; }
        let mut kinds = FactKinds::new();
        for d in batch {
            let kind = d.kind();
            if !kinds.contains(&kind) { kinds.push(kind); }
            match d {
                FactDelta::Secret(op) => self.secrets.apply(op),
                FactDelta::ConfigMap(op) => self.config_maps.apply(op),
                FactDelta::Node(op) => self.nodes.apply(op),
                FactDelta::Infrastructure(op) => self.infrastructure.apply(op),
                FactDelta::Operator { management_state, log_level } => {
                    let mut next = (*self.config.load_full()).clone();
                    next.management_state = management_state;
                    next.log_level = log_level;
                    self.config.store(Arc::new(next));
                }
                FactDelta::Proxy(proxy) => {
                    let mut next = (*self.config.load_full()).clone();
                    next.proxy = proxy.filter(|p| !p.is_empty());
                    self.config.store(Arc::new(next));
                }
                FactDelta::Touched(_) => {}
            }
        }
        kinds.sort_unstable();
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        let change = FactChange { epoch, kinds };
        debug!(epoch, kinds = ?change.kinds, "fact batch applied");
        // No subscribers yet is fine; the first pass reads current state anyway.
        let _ = self.changes.send(change.clone());
        Some(change)
    }

    /// Summarize current facts for diagnostics.
    pub fn snapshot(&self) -> FactSnapshot {
        let infrastructure_name = self
            .infrastructure
            .get(filestore_core::GLOBAL_CONFIG_NAME)
            .map(|i| i.infrastructure_name.clone());
        FactSnapshot {
            epoch: self.epoch(),
            infrastructure_name,
            node_count: self.nodes.len(),
            secret_hashes: self
                .secrets
                .list()
                .iter()
                .filter_map(|s| s.cache_key().map(|k| (k.to_string(), secret_hash(s))))
                .collect(),
            config_map_hashes: self
                .config_maps
                .list()
                .iter()
                .filter_map(|c| c.cache_key().map(|k| (k.to_string(), config_map_hash(c))))
                .collect(),
        }
    }
}

/// Spawn the ingest loop: deltas are batched on a short tick and applied to
/// `store` in arrival order. The loop flushes and exits once every sender is dropped.
pub fn spawn_ingest(store: Arc<FactStore>, cap: usize) -> (mpsc::Sender<FactDelta>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<FactDelta>(cap.max(1));
    let handle = tokio::spawn(async move {
        let mut pending: Vec<FactDelta> = Vec::new();
        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(8));
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(d) => pending.push(d),
                        None => {
                            debug!("fact channel closed; draining and exiting ingest loop");
                            flush(&store, &mut pending);
                            break;
                        }
                    }
                }
                _ = ticker.tick() => flush(&store, &mut pending),
            }
        }
        info!("fact ingest loop stopped");
    });
    (tx, handle)
}

fn flush(store: &FactStore, pending: &mut Vec<FactDelta>) {
    if pending.is_empty() { return; }
    let batch = std::mem::take(pending);
    counter!("fact_ingest_batches_total", 1u64);
    store.apply(batch);
}
