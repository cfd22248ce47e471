//! `ObjectStore` backed by a kube client; every call is bounded by a timeout.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{ConfigMap, Service, ServiceAccount};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::api::storage::v1::CSIDriver;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::discovery::{Discovery, Scope};
use kube::Client;
use metrics::{counter, histogram};
use tracing::{debug, warn};

use crate::{ManagedObject, ObjectKey, ObjectKind, ObjectStore, StoreError, FIELD_MANAGER};

pub struct KubeObjectStore {
    client: Client,
    call_timeout: Duration,
    /// Discovered dynamic kinds; only positive results are cached so a CRD
    /// installed later is picked up on the next pass.
    resources: Mutex<HashMap<GroupVersionKind, (ApiResource, bool)>>,
}

impl KubeObjectStore {
    pub fn new(client: Client, call_timeout: Duration) -> Self {
        Self { client, call_timeout, resources: Mutex::new(HashMap::new()) }
    }

    async fn timed<T, F>(&self, op: &str, key: &ObjectKey, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, kube::Error>>,
    {
        let t0 = std::time::Instant::now();
        let res = tokio::time::timeout(self.call_timeout, fut).await;
        histogram!("object_store_call_ms", t0.elapsed().as_secs_f64() * 1000.0, "op" => op.to_string());
        match res {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(map_kube_err(e, key)),
            Err(_) => {
                counter!("object_store_timeouts_total", 1u64);
                Err(StoreError::Timeout { op: format!("{} {}", op, key), secs: self.call_timeout.as_secs() })
            }
        }
    }

    async fn resolve(&self, gvk: &GroupVersionKind, key: &ObjectKey) -> Result<(ApiResource, bool), StoreError> {
        if let Some(hit) = self.cached_resource(gvk) {
            return Ok(hit);
        }
        let groups = [gvk.group.as_str()];
        let discovery = Discovery::new(self.client.clone()).filter(&groups);
        let discovery = self.timed("discovery", key, discovery.run()).await?;
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                    let namespaced = matches!(caps.scope, Scope::Namespaced);
                    debug!(gvk = ?gvk, plural = %ar.plural, namespaced, "resolved dynamic kind");
                    if let Ok(mut cache) = self.resources.lock() {
                        cache.insert(gvk.clone(), (ar.clone(), namespaced));
                    }
                    return Ok((ar, namespaced));
                }
            }
        }
        Err(StoreError::Unsupported(key.kind.to_string()))
    }

    fn cached_resource(&self, gvk: &GroupVersionKind) -> Option<(ApiResource, bool)> {
        self.resources.lock().ok().and_then(|c| c.get(gvk).cloned())
    }
}

fn map_kube_err(e: kube::Error, key: &ObjectKey) -> StoreError {
    match e {
        kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict(key.to_string()),
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound(key.to_string()),
        kube::Error::Api(ae) => StoreError::Api(format!("{}: {} ({})", key, ae.message, ae.reason)),
        other => StoreError::Api(format!("{}: {}", key, other)),
    }
}

fn namespace_of(key: &ObjectKey) -> Result<&str, StoreError> {
    key.namespace.as_deref().ok_or_else(|| StoreError::Invalid(format!("{} needs a namespace", key)))
}

fn post_params() -> PostParams {
    PostParams { dry_run: false, field_manager: Some(FIELD_MANAGER.to_string()) }
}

/// Run `$body` with `$api` bound to the typed `Api` for `$key`'s kind, `$wrap`
/// wrapping a typed object into `ManagedObject` and `$peel` extracting one.
/// Pass `_` for a helper the body does not need.
macro_rules! with_api {
    ($self:ident, $key:expr, |$api:ident, $wrap:pat_param, $peel:pat_param| $body:block) => {{
        let key: &ObjectKey = $key;
        match &key.kind {
            ObjectKind::Deployment => with_api!(@ns $self, key, Deployment, Deployment, $api, $wrap, $peel, $body),
            ObjectKind::DaemonSet => with_api!(@ns $self, key, DaemonSet, DaemonSet, $api, $wrap, $peel, $body),
            ObjectKind::ServiceAccount => with_api!(@ns $self, key, ServiceAccount, ServiceAccount, $api, $wrap, $peel, $body),
            ObjectKind::Role => with_api!(@ns $self, key, Role, Role, $api, $wrap, $peel, $body),
            ObjectKind::RoleBinding => with_api!(@ns $self, key, RoleBinding, RoleBinding, $api, $wrap, $peel, $body),
            ObjectKind::Service => with_api!(@ns $self, key, Service, Service, $api, $wrap, $peel, $body),
            ObjectKind::ConfigMap => with_api!(@ns $self, key, ConfigMap, ConfigMap, $api, $wrap, $peel, $body),
            ObjectKind::PodDisruptionBudget => with_api!(@ns $self, key, PodDisruptionBudget, PodDisruptionBudget, $api, $wrap, $peel, $body),
            ObjectKind::ClusterRole => with_api!(@all $self, ClusterRole, ClusterRole, $api, $wrap, $peel, $body),
            ObjectKind::ClusterRoleBinding => with_api!(@all $self, ClusterRoleBinding, ClusterRoleBinding, $api, $wrap, $peel, $body),
            ObjectKind::CsiDriver => with_api!(@all $self, CsiDriver, CSIDriver, $api, $wrap, $peel, $body),
            ObjectKind::Dynamic(gvk) => {
                let (ar, namespaced) = $self.resolve(gvk, key).await?;
                let $api: Api<DynamicObject> = if namespaced {
                    Api::namespaced_with($self.client.clone(), namespace_of(key)?, &ar)
                } else {
                    Api::all_with($self.client.clone(), &ar)
                };
                let $wrap = ManagedObject::Dynamic;
                let $peel = |o: &ManagedObject| match o {
                    ManagedObject::Dynamic(x) => Ok(x.clone()),
                    other => Err(StoreError::Invalid(format!("expected dynamic object, got {}", other.key()))),
                };
                $body
            }
        }
    }};
    (@ns $self:ident, $key:ident, $variant:ident, $ty:ty, $api:ident, $wrap:pat_param, $peel:pat_param, $body:block) => {{
        let $api: Api<$ty> = Api::namespaced($self.client.clone(), namespace_of($key)?);
        with_api!(@bind $variant, $wrap, $peel, $body)
    }};
    (@all $self:ident, $variant:ident, $ty:ty, $api:ident, $wrap:pat_param, $peel:pat_param, $body:block) => {{
        let $api: Api<$ty> = Api::all($self.client.clone());
        with_api!(@bind $variant, $wrap, $peel, $body)
    }};
    (@bind $variant:ident, $wrap:pat_param, $peel:pat_param, $body:block) => {{
        let $wrap = ManagedObject::$variant;
        let $peel = |o: &ManagedObject| match o {
            ManagedObject::$variant(x) => Ok(x.clone()),
            other => Err(StoreError::Invalid(format!("expected {}, got {}", stringify!($variant), other.key()))),
        };
        $body
    }};
}

#[async_trait::async_trait]
impl ObjectStore for KubeObjectStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<ManagedObject>, StoreError> {
        with_api!(self, key, |api, wrap, _| {
            let found = self.timed("get", key, api.get_opt(&key.name)).await?;
            Ok(found.map(wrap))
        })
    }

    async fn create(&self, obj: &ManagedObject) -> Result<ManagedObject, StoreError> {
        let key = obj.key();
        with_api!(self, &key, |api, wrap, peel| {
            let body = peel(obj)?;
            let created = self.timed("create", &key, api.create(&post_params(), &body)).await?;
            Ok(wrap(created))
        })
    }

    async fn update(&self, obj: &ManagedObject) -> Result<ManagedObject, StoreError> {
        let key = obj.key();
        if obj.resource_version().is_none() {
            warn!(object = %key, "update without resourceVersion; optimistic concurrency disabled for this write");
        }
        with_api!(self, &key, |api, wrap, peel| {
            let body = peel(obj)?;
            let updated = self.timed("update", &key, api.replace(&key.name, &post_params(), &body)).await?;
            Ok(wrap(updated))
        })
    }

    async fn delete(&self, key: &ObjectKey) -> Result<bool, StoreError> {
        with_api!(self, key, |api, _, _| {
            match self.timed("delete", key, api.delete(&key.name, &DeleteParams::default())).await {
                Ok(_) => Ok(true),
                Err(StoreError::NotFound(_)) => Ok(false),
                Err(e) => Err(e),
            }
        })
    }

    async fn list(&self, kind: &ObjectKind, namespace: Option<&str>) -> Result<Vec<ManagedObject>, StoreError> {
        let key = ObjectKey { kind: kind.clone(), namespace: namespace.map(str::to_string), name: String::new() };
        with_api!(self, &key, |api, wrap, _| {
            let list = self.timed("list", &key, api.list(&ListParams::default())).await?;
            Ok(list.items.into_iter().map(wrap).collect())
        })
    }
}
