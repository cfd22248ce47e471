//! Filestore apply: managed-object model, managed-field diffs and the object store seam.
//!
//! Writes follow read-then-compare-then-conditionally-write: an object is
//! only created when absent and only rewritten when its rendered definition
//! changed since the last write or a field it sets was altered live.

#![forbid(unsafe_code)]

pub mod kube_store;
pub mod objects;

pub use kube_store::KubeObjectStore;
pub use objects::{ManagedObject, ObjectKey, ObjectKind, Rollout, Workload};

use filestore_core::content_hash;
use metrics::counter;
use serde_json::Value as Json;
use tracing::debug;

/// Field manager recorded on every write.
pub const FIELD_MANAGER: &str = "filestore-operator";

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("conflict: {0} was modified concurrently")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("{op} timed out after {secs}s")]
    Timeout { op: String, secs: u64 },
    #[error("kind {0} is not served by the cluster")]
    Unsupported(String),
    #[error("invalid object: {0}")]
    Invalid(String),
    #[error("api: {0}")]
    Api(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool { matches!(self, Self::Conflict(_)) }

    /// Errors expected to clear up on a later pass without outside help.
    pub fn is_transient(&self) -> bool { matches!(self, Self::Conflict(_) | Self::Timeout { .. }) }
}

/// Object store client used by the reconcilers.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> Result<Option<ManagedObject>, StoreError>;
    async fn create(&self, obj: &ManagedObject) -> Result<ManagedObject, StoreError>;
    /// Full replace guarded by the object's `resourceVersion`.
    async fn update(&self, obj: &ManagedObject) -> Result<ManagedObject, StoreError>;
    /// Returns false when the object was already gone.
    async fn delete(&self, key: &ObjectKey) -> Result<bool, StoreError>;
    /// Every object of `kind`, scoped to `namespace` for namespaced kinds.
    async fn list(&self, kind: &ObjectKind, namespace: Option<&str>) -> Result<Vec<ManagedObject>, StoreError>;
}

#[derive(Debug, Clone)]
pub enum ApplyOutcome {
    Created(ManagedObject),
    Updated(ManagedObject),
    Unchanged(ManagedObject),
}

impl ApplyOutcome {
    pub fn object(&self) -> &ManagedObject {
        match self {
            Self::Created(o) | Self::Updated(o) | Self::Unchanged(o) => o,
        }
    }

    pub fn wrote(&self) -> bool { !matches!(self, Self::Unchanged(_)) }
}

/// Annotation carrying the hash of the last applied desired object.
pub const APPLIED_HASH_ANNOTATION: &str = "operator.openshift.io/applied-spec-hash";

/// Top-level fields never owned by the operator.
const SERVER_OWNED: [&str; 4] = ["apiVersion", "kind", "metadata", "status"];

/// Create `desired` if absent, replace its owned fields if the rendered
/// definition changed or a managed field drifted, else leave it.
pub async fn ensure(store: &dyn ObjectStore, desired: &ManagedObject) -> Result<ApplyOutcome, StoreError> {
    let key = desired.key();
    let want = stamp_applied_hash(desired.to_json()?);
    let Some(live) = store.get(&key).await? else {
        let created = store.create(&ManagedObject::from_json(want)?).await?;
        counter!("object_writes_total", 1u64, "op" => "create");
        return Ok(ApplyOutcome::Created(created));
    };
    let have = live.to_json()?;
    if !needs_update(&want, &have) {
        return Ok(ApplyOutcome::Unchanged(live));
    }
    let drift = drifted_paths(&want, &have);
    debug!(object = %key, hash_changed = applied_hash(&want) != applied_hash(&have), paths = ?drift, "object out of date");
    let updated = store.update(&ManagedObject::from_json(replace_owned(have, &want))?).await?;
    counter!("object_writes_total", 1u64, "op" => "update");
    Ok(ApplyOutcome::Updated(updated))
}

/// Drop fields the API server writes; they never take part in comparisons.
pub fn strip_server_fields(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(Json::as_object_mut) {
        for f in ["managedFields", "resourceVersion", "generation", "creationTimestamp", "uid", "selfLink"] {
            meta.remove(f);
        }
        if let Some(annotations) = meta.get_mut("annotations").and_then(Json::as_object_mut) {
            annotations.remove(APPLIED_HASH_ANNOTATION);
            annotations.remove("deployment.kubernetes.io/revision");
        }
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

/// Hash of the desired definition, stable across serializations of the same object.
pub fn desired_hash(desired: &Json) -> String {
    let canonical = strip_server_fields(desired.clone()).to_string();
    content_hash([("object", canonical.as_bytes())])
}

fn stamp_applied_hash(mut desired: Json) -> Json {
    let hash = desired_hash(&desired);
    if let Some(obj) = desired.as_object_mut() {
        let meta = obj.entry("metadata").or_insert_with(|| Json::Object(Default::default()));
        if let Some(meta) = meta.as_object_mut() {
            let annotations = meta.entry("annotations").or_insert_with(|| Json::Object(Default::default()));
            if let Some(annotations) = annotations.as_object_mut() {
                annotations.insert(APPLIED_HASH_ANNOTATION.to_string(), Json::String(hash));
            }
        }
    }
    desired
}

fn applied_hash(v: &Json) -> Option<&str> {
    v.pointer("/metadata/annotations")?.get(APPLIED_HASH_ANNOTATION)?.as_str()
}

/// True when every field set in `desired` holds the same value in `live`.
///
/// Objects compare key-by-key (extra live keys are server defaults and are
/// ignored); arrays must have equal length and pairwise-subset elements.
pub fn is_subset(desired: &Json, live: &Json) -> bool {
    match (desired, live) {
        (Json::Object(d), Json::Object(l)) => d.iter().all(|(k, dv)| match l.get(k) {
            Some(lv) => is_subset(dv, lv),
            None => dv.is_null(),
        }),
        (Json::Array(d), Json::Array(l)) => d.len() == l.len() && d.iter().zip(l).all(|(a, b)| is_subset(a, b)),
        (d, l) => d == l,
    }
}

/// Whether `live` must be rewritten: the rendered definition changed since
/// the last write, or someone altered a field the operator sets.
pub fn needs_update(desired: &Json, live: &Json) -> bool {
    applied_hash(desired) != applied_hash(live)
        || !is_subset(&strip_server_fields(desired.clone()), &strip_server_fields(live.clone()))
}

/// Build the write body: every top-level field `desired` sets replaces the
/// live one wholesale, so fields dropped from the rendered definition go away.
/// Labels and annotations merge key-by-key; identity, status and top-level
/// fields the operator never sets are kept from `live`.
pub fn replace_owned(live: Json, desired: &Json) -> Json {
    let (Json::Object(mut out), Json::Object(want)) = (live, desired) else {
        return desired.clone();
    };
    for (k, v) in want {
        if !SERVER_OWNED.contains(&k.as_str()) {
            out.insert(k.clone(), v.clone());
        }
    }
    if let Some(want_meta) = want.get("metadata").and_then(Json::as_object) {
        let meta = out.entry("metadata").or_insert_with(|| Json::Object(Default::default()));
        if let Some(meta) = meta.as_object_mut() {
            meta.remove("managedFields");
            for field in ["labels", "annotations"] {
                let Some(Json::Object(add)) = want_meta.get(field) else { continue };
                let slot = meta.entry(field).or_insert_with(|| Json::Object(Default::default()));
                if let Some(slot) = slot.as_object_mut() {
                    for (k, v) in add {
                        slot.insert(k.clone(), v.clone());
                    }
                }
            }
        }
    }
    Json::Object(out)
}

/// JSON paths (`/spec/template/...`) where a field set in `desired` is
/// missing from or different in `live`, for logging.
pub fn drifted_paths(desired: &Json, live: &Json) -> Vec<String> {
    fn walk(d: &Json, l: Option<&Json>, path: &mut String, out: &mut Vec<String>) {
        match (d, l) {
            (Json::Object(dm), Some(Json::Object(lm))) => {
                for (k, dv) in dm {
                    let len = path.len();
                    path.push('/');
                    path.push_str(k);
                    walk(dv, lm.get(k), path, out);
                    path.truncate(len);
                }
            }
            (Json::Array(da), Some(Json::Array(la))) if da.len() == la.len() => {
                for (i, (dv, lv)) in da.iter().zip(la).enumerate() {
                    let len = path.len();
                    path.push_str(&format!("/{}", i));
                    walk(dv, Some(lv), path, out);
                    path.truncate(len);
                }
            }
            (Json::Null, None) => {}
            (d, Some(l)) if is_subset(d, l) => {}
            _ => out.push(if path.is_empty() { "/".to_string() } else { path.clone() }),
        }
    }
    let mut out = Vec::new();
    walk(&strip_server_fields(desired.clone()), Some(&strip_server_fields(live.clone())), &mut String::new(), &mut out);
    out
}
