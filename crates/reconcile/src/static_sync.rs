//! Static object set: a fixed, named collection of auxiliary objects kept
//! convergent with the cluster, one entry at a time.

use std::collections::HashSet;
use std::sync::Arc;

use filestore_apply::{ensure, ApplyOutcome, ManagedObject, ObjectStore};
use filestore_core::{Condition, EventSink, FactKind, ManagementState, RecordedEvent};
use filestore_store::FactStore;
use futures::future::join_all;
use metrics::counter;
use tracing::{debug, info, warn};

use crate::Reconciler;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StaticSetError {
    #[error("duplicate static entry name {0}")]
    DuplicateName(String),
    #[error("static entries {first} and {second} manage the same object {object}")]
    DuplicateObject { first: String, second: String, object: String },
}

#[derive(Debug, Clone)]
pub struct StaticEntry {
    pub name: String,
    pub object: ManagedObject,
}

/// Logical name → object definition. Keys and cardinality never change after construction.
#[derive(Debug, Clone)]
pub struct StaticObjectSet {
    entries: Vec<StaticEntry>,
}

impl StaticObjectSet {
    pub fn new<I, S>(entries: I) -> Result<Self, StaticSetError>
    where
        I: IntoIterator<Item = (S, ManagedObject)>,
        S: Into<String>,
    {
        let mut names = HashSet::new();
        let mut keys: Vec<(String, String)> = Vec::new();
        let mut out = Vec::new();
        for (name, object) in entries {
            let name = name.into();
            if !names.insert(name.clone()) {
                return Err(StaticSetError::DuplicateName(name));
            }
            let key = object.key().to_string();
            if let Some((first, _)) = keys.iter().find(|(_, k)| *k == key) {
                return Err(StaticSetError::DuplicateObject { first: first.clone(), second: name, object: key });
            }
            keys.push((name.clone(), key));
            out.push(StaticEntry { name, object });
        }
        Ok(Self { entries: out })
    }

    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
    pub fn names(&self) -> impl Iterator<Item = &str> { self.entries.iter().map(|e| e.name.as_str()) }
    pub fn iter(&self) -> impl Iterator<Item = &StaticEntry> { self.entries.iter() }
}

pub struct StaticResourceSync {
    name: String,
    set: Arc<StaticObjectSet>,
    store: Arc<dyn ObjectStore>,
    facts: Arc<FactStore>,
    events: Arc<dyn EventSink>,
}

impl StaticResourceSync {
    pub fn new(
        name: impl Into<String>,
        set: Arc<StaticObjectSet>,
        store: Arc<dyn ObjectStore>,
        facts: Arc<FactStore>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self { name: name.into(), set, store, facts, events }
    }
}

#[async_trait::async_trait]
impl Reconciler for StaticResourceSync {
    fn name(&self) -> &str { &self.name }

    fn interests(&self) -> &[FactKind] { &[FactKind::OperatorConfig] }

    async fn reconcile(&self) -> Condition {
        match self.facts.operator_config().management_state {
            ManagementState::Managed => {}
            ManagementState::Unmanaged => return Condition::available("Unmanaged", "static resources are not managed"),
            ManagementState::Removed => return Condition::available("Removed", "static resources are left in place"),
        }

        let results = join_all(self.set.iter().map(|entry| async move {
            (entry, ensure(self.store.as_ref(), &entry.object).await)
        }))
        .await;

        let mut failed = Vec::new();
        let mut writes = 0usize;
        for (entry, res) in results {
            match res {
                Ok(outcome) => {
                    if outcome.wrote() {
                        writes += 1;
                        let verb = if matches!(outcome, ApplyOutcome::Created(_)) { "create" } else { "update" };
                        counter!("static_writes_total", 1u64, "op" => verb);
                        info!(reconciler = %self.name, entry = %entry.name, object = %entry.object.key(), op = verb, "static object written");
                    }
                }
                Err(e) => {
                    warn!(reconciler = %self.name, entry = %entry.name, error = %e, "static object sync failed");
                    failed.push(format!("{}: {}", entry.name, e));
                }
            }
        }
        debug!(reconciler = %self.name, entries = self.set.len(), writes, failed = failed.len(), "static pass done");

        if failed.is_empty() {
            return Condition::available("AsExpected", format!("{} static objects in sync", self.set.len()));
        }
        let message = format!("failed to sync {} of {}: {}", failed.len(), self.set.len(), failed.join("; "));
        self.events.record(RecordedEvent::warning("StaticResourcesFailed", message.clone()));
        Condition::degraded("StaticResourcesFailed", message)
    }
}
