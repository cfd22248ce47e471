//! In-memory object store with write counters and injectable failures.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use filestore_apply::{ManagedObject, ObjectKey, ObjectKind, ObjectStore, StoreError};
use serde_json::{json, Value as Json};

#[derive(Default)]
pub struct MemStore {
    objects: Mutex<HashMap<ObjectKey, Json>>,
    unsupported: Mutex<HashSet<String>>,
    conflicts: AtomicUsize,
    timeouts: AtomicUsize,
    next_rv: AtomicUsize,
    pub creates: AtomicUsize,
    pub updates: AtomicUsize,
    pub deletes: AtomicUsize,
}

impl MemStore {
    pub fn new() -> Self { Self::default() }

    /// Reject every call for dynamic kinds named `kind`.
    pub fn unsupported(self, kind: &str) -> Self {
        self.unsupported.lock().unwrap().insert(kind.to_string());
        self
    }

    /// Fail the next `n` updates with a conflict.
    pub fn conflicts(&self, n: usize) { self.conflicts.store(n, Ordering::SeqCst); }

    /// Time out the next `n` reads.
    pub fn timeouts(&self, n: usize) { self.timeouts.store(n, Ordering::SeqCst); }

    pub fn writes(&self) -> usize {
        self.creates.load(Ordering::SeqCst) + self.updates.load(Ordering::SeqCst) + self.deletes.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize { self.objects.lock().unwrap().len() }

    pub fn raw(&self, key: &ObjectKey) -> Option<Json> { self.objects.lock().unwrap().get(key).cloned() }

    pub fn insert(&self, obj: &ManagedObject) {
        let mut v = obj.to_json().unwrap();
        v["metadata"]["resourceVersion"] = json!(self.bump().to_string());
        v["metadata"]["generation"] = json!(1);
        self.objects.lock().unwrap().insert(obj.key(), v);
    }

    /// Pretend the workload controller caught up with the latest spec.
    pub fn finish_rollout(&self, key: &ObjectKey) {
        let mut objects = self.objects.lock().unwrap();
        let Some(v) = objects.get_mut(key) else { return };
        let generation = v["metadata"]["generation"].clone();
        v["status"] = match key.kind {
            ObjectKind::Deployment => {
                let replicas = v["spec"]["replicas"].as_i64().unwrap_or(1);
                json!({
                    "observedGeneration": generation,
                    "replicas": replicas,
                    "updatedReplicas": replicas,
                    "availableReplicas": replicas,
                })
            }
            _ => json!({
                "observedGeneration": generation,
                "currentNumberScheduled": 3,
                "desiredNumberScheduled": 3,
                "numberMisscheduled": 0,
                "numberReady": 3,
                "updatedNumberScheduled": 3,
                "numberAvailable": 3,
            }),
        };
    }

    fn bump(&self) -> usize { self.next_rv.fetch_add(1, Ordering::SeqCst) + 1 }

    fn check_kind(&self, key: &ObjectKey) -> Result<(), StoreError> {
        if let ObjectKind::Dynamic(gvk) = &key.kind {
            if self.unsupported.lock().unwrap().contains(&gvk.kind) {
                return Err(StoreError::Unsupported(key.kind.to_string()));
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<ManagedObject>, StoreError> {
        self.check_kind(key)?;
        if self.timeouts.load(Ordering::SeqCst) > 0 {
            self.timeouts.fetch_sub(1, Ordering::SeqCst);
            return Err(StoreError::Timeout { op: format!("get {}", key), secs: 15 });
        }
        let found = self.objects.lock().unwrap().get(key).cloned();
        found.map(ManagedObject::from_json).transpose()
    }

    async fn create(&self, obj: &ManagedObject) -> Result<ManagedObject, StoreError> {
        let key = obj.key();
        self.check_kind(&key)?;
        if self.objects.lock().unwrap().contains_key(&key) {
            return Err(StoreError::Api(format!("{} already exists", key)));
        }
        self.insert(obj);
        self.creates.fetch_add(1, Ordering::SeqCst);
        ManagedObject::from_json(self.raw(&key).unwrap())
    }

    async fn update(&self, obj: &ManagedObject) -> Result<ManagedObject, StoreError> {
        let key = obj.key();
        self.check_kind(&key)?;
        if self.conflicts.load(Ordering::SeqCst) > 0 {
            self.conflicts.fetch_sub(1, Ordering::SeqCst);
            return Err(StoreError::Conflict(key.to_string()));
        }
        let rv = self.bump().to_string();
        let mut objects = self.objects.lock().unwrap();
        let Some(live) = objects.get(&key) else { return Err(StoreError::NotFound(key.to_string())) };
        if live["metadata"]["resourceVersion"].as_str() != obj.resource_version() {
            return Err(StoreError::Conflict(key.to_string()));
        }
        let generation = live["metadata"]["generation"].as_i64().unwrap_or(1) + 1;
        let status = live.get("status").cloned();
        let mut next = obj.to_json()?;
        next["metadata"]["resourceVersion"] = json!(rv);
        next["metadata"]["generation"] = json!(generation);
        if let Some(status) = status {
            next["status"] = status;
        }
        objects.insert(key.clone(), next.clone());
        self.updates.fetch_add(1, Ordering::SeqCst);
        ManagedObject::from_json(next)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<bool, StoreError> {
        self.check_kind(key)?;
        let removed = self.objects.lock().unwrap().remove(key).is_some();
        if removed {
            self.deletes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(removed)
    }

    async fn list(&self, kind: &ObjectKind, namespace: Option<&str>) -> Result<Vec<ManagedObject>, StoreError> {
        let probe = ObjectKey { kind: kind.clone(), namespace: namespace.map(str::to_string), name: String::new() };
        self.check_kind(&probe)?;
        let objects = self.objects.lock().unwrap();
        let mut found: Vec<_> = objects
            .iter()
            .filter(|(k, _)| &k.kind == kind && (namespace.is_none() || k.namespace.as_deref() == namespace))
            .map(|(k, v)| (k.name.clone(), v.clone()))
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));
        found.into_iter().map(|(_, v)| ManagedObject::from_json(v)).collect()
    }
}
