//! Filestore kubehub: kube client, watchers feeding the fact store, event
//! recording and status publishing on the operator configuration object.

#![forbid(unsafe_code)]

pub mod events;
pub mod status;
pub mod watch;

pub use events::KubeEvents;
pub use status::{merge_conditions, KubeStatusPublisher, OperatorCondition};
pub use watch::spawn_watchers;

use anyhow::{Context, Result};
use filestore_core::{Infrastructure, LogLevel, ManagementState, ProxyConfig, ResourceLabel};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::Client;
use once_cell::sync::OnceCell;
use serde_json::Value as Json;
use tracing::warn;

/// Name of the cluster-scoped ClusterCSIDriver object this operator serves.
pub const OPERATOR_CONFIG_NAME: &str = "filestore.csi.storage.gke.io";

static CLIENT: OnceCell<Client> = OnceCell::new();

/// Shared kube client, built from the ambient kubeconfig or in-cluster config.
pub async fn kube_client() -> Result<Client> {
    if let Some(c) = CLIENT.get() {
        return Ok(c.clone());
    }
    let client = Client::try_default().await.context("building kube client")?;
    Ok(CLIENT.get_or_init(|| client).clone())
}

pub fn cluster_csi_driver_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("operator.openshift.io", "v1", "ClusterCSIDriver"),
        "clustercsidrivers",
    )
}

pub fn infrastructure_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk("config.openshift.io", "v1", "Infrastructure"), "infrastructures")
}

pub fn proxy_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk("config.openshift.io", "v1", "Proxy"), "proxies")
}

fn str_at<'a>(v: &'a Json, path: &[&str]) -> Option<&'a str> {
    path.iter().try_fold(v, |cur, k| cur.get(*k)).and_then(|v| v.as_str())
}

fn non_empty(s: Option<&str>) -> Option<String> {
    s.filter(|s| !s.is_empty()).map(str::to_string)
}

/// Project the cluster Infrastructure object; None until `infrastructureName` is set.
pub fn infrastructure_from(obj: &DynamicObject) -> Option<Infrastructure> {
    let name = obj.metadata.name.clone()?;
    let infrastructure_name = non_empty(str_at(&obj.data, &["status", "infrastructureName"]))?;
    let resource_labels = obj.data["status"]["platformStatus"]["gcp"]["resourceLabels"]
        .as_array()
        .map(|labels| {
            labels
                .iter()
                .filter_map(|l| {
                    let key = non_empty(l.get("key").and_then(Json::as_str))?;
                    let value = l.get("value").and_then(Json::as_str).unwrap_or_default().to_string();
                    Some(ResourceLabel { key, value })
                })
                .collect()
        })
        .unwrap_or_default();
    Some(Infrastructure { name, infrastructure_name, resource_labels })
}

/// Observed proxy settings come from the Proxy object's status, not its spec.
pub fn proxy_from(obj: &DynamicObject) -> ProxyConfig {
    ProxyConfig {
        http_proxy: non_empty(str_at(&obj.data, &["status", "httpProxy"])),
        https_proxy: non_empty(str_at(&obj.data, &["status", "httpsProxy"])),
        no_proxy: non_empty(str_at(&obj.data, &["status", "noProxy"])),
    }
}

/// Unknown values fall back to the API defaults (`Managed`, `Normal`).
pub fn operator_from(obj: &DynamicObject) -> (ManagementState, LogLevel) {
    let raw_state = str_at(&obj.data, &["spec", "managementState"]).unwrap_or_default();
    let state = ManagementState::parse(raw_state).unwrap_or_else(|| {
        warn!(value = raw_state, "unknown managementState; treating as Managed");
        ManagementState::Managed
    });
    let raw_level = str_at(&obj.data, &["spec", "logLevel"]).unwrap_or_default();
    let level = LogLevel::parse(raw_level).unwrap_or_else(|| {
        warn!(value = raw_level, "unknown logLevel; using Normal");
        LogLevel::Normal
    });
    (state, level)
}
