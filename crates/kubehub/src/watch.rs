//! List+watch loops that keep the fact store current.
//!
//! Each watcher maps kube events to [`FactDelta`]s and sends them into the
//! ingest channel; watch errors back off and resume, they never end the loop.

use std::fmt::Debug;

use filestore_core::{FactKind, Infrastructure, GLOBAL_CONFIG_NAME};
use filestore_store::{FactDelta, Op};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{ConfigMap, Node, Secret};
use kube::api::Api;
use kube::core::DynamicObject;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Client, Resource};
use metrics::counter;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    cluster_csi_driver_resource, infrastructure_from, infrastructure_resource, operator_from, proxy_from,
    proxy_resource, OPERATOR_CONFIG_NAME,
};

fn op<K>(ev: Event<K>) -> Op<K> {
    match ev {
        Event::Applied(o) => Op::Applied(o),
        Event::Deleted(o) => Op::Deleted(o),
        Event::Restarted(list) => Op::Restarted(list),
    }
}

fn named(name: &str) -> watcher::Config { watcher::Config::default().fields(&format!("metadata.name={}", name)) }

async fn pump<K, F>(
    what: &'static str,
    api: Api<K>,
    config: watcher::Config,
    tx: mpsc::Sender<FactDelta>,
    shutdown: CancellationToken,
    mut map: F,
) where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
    F: FnMut(Event<K>) -> Option<FactDelta> + Send,
{
    let stream = watcher::watcher(api, config).default_backoff();
    futures::pin_mut!(stream);
    info!(what, "watcher started");
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(ev)) => {
                let Some(delta) = map(ev) else { continue };
                if tx.send(delta).await.is_err() {
                    debug!(what, "fact channel closed");
                    break;
                }
            }
            Some(Err(e)) => {
                counter!("watch_errors_total", 1u64, "watch" => what);
                warn!(what, error = %e, "watch error; backing off");
            }
            None => {
                warn!(what, "watch stream ended");
                break;
            }
        }
    }
    info!(what, "watcher stopped");
}

/// Workloads are only watched to retrigger passes when their status moves.
fn touched<K>(kind: FactKind) -> impl FnMut(Event<K>) -> Option<FactDelta> + Send {
    move |_| Some(FactDelta::Touched(kind))
}

fn proxy_delta(ev: Event<DynamicObject>) -> Option<FactDelta> {
    Some(FactDelta::Proxy(match ev {
        Event::Applied(o) => Some(proxy_from(&o)),
        Event::Deleted(_) => None,
        Event::Restarted(list) => list.first().map(proxy_from),
    }))
}

fn infrastructure_delta(ev: Event<DynamicObject>) -> Option<FactDelta> {
    let op = match ev {
        Event::Applied(o) => match infrastructure_from(&o) {
            Some(infra) => Op::Applied(infra),
            None => {
                debug!("infrastructure object has no infrastructureName yet");
                return None;
            }
        },
        Event::Deleted(o) => Op::Deleted(Infrastructure { name: o.metadata.name?, ..Default::default() }),
        Event::Restarted(list) => Op::Restarted(list.iter().filter_map(infrastructure_from).collect()),
    };
    Some(FactDelta::Infrastructure(op))
}

fn operator_delta(ev: Event<DynamicObject>) -> Option<FactDelta> {
    let obj = match ev {
        Event::Applied(o) => o,
        Event::Restarted(mut list) => list.pop()?,
        Event::Deleted(_) => {
            // Keep acting on the last observed configuration.
            warn!(name = OPERATOR_CONFIG_NAME, "operator configuration object deleted");
            return None;
        }
    };
    let (management_state, log_level) = operator_from(&obj);
    Some(FactDelta::Operator { management_state, log_level })
}

/// Start every watcher the operator needs. Tasks exit on `shutdown` or when
/// the ingest channel closes.
pub fn spawn_watchers(
    client: Client,
    namespace: &str,
    tx: mpsc::Sender<FactDelta>,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let ns = namespace;
    let c = || client.clone();
    vec![
        tokio::spawn(pump("secrets", Api::<Secret>::namespaced(c(), ns), watcher::Config::default(), tx.clone(), shutdown.clone(), |ev| {
            Some(FactDelta::Secret(op(ev)))
        })),
        tokio::spawn(pump("configmaps", Api::<ConfigMap>::namespaced(c(), ns), watcher::Config::default(), tx.clone(), shutdown.clone(), |ev| {
            Some(FactDelta::ConfigMap(op(ev)))
        })),
        tokio::spawn(pump("nodes", Api::<Node>::all(c()), watcher::Config::default(), tx.clone(), shutdown.clone(), |ev| {
            Some(FactDelta::Node(op(ev)))
        })),
        tokio::spawn(pump(
            "infrastructure",
            Api::<DynamicObject>::all_with(c(), &infrastructure_resource()),
            named(GLOBAL_CONFIG_NAME),
            tx.clone(),
            shutdown.clone(),
            infrastructure_delta,
        )),
        tokio::spawn(pump(
            "proxy",
            Api::<DynamicObject>::all_with(c(), &proxy_resource()),
            named(GLOBAL_CONFIG_NAME),
            tx.clone(),
            shutdown.clone(),
            proxy_delta,
        )),
        tokio::spawn(pump(
            "clustercsidriver",
            Api::<DynamicObject>::all_with(c(), &cluster_csi_driver_resource()),
            named(OPERATOR_CONFIG_NAME),
            tx.clone(),
            shutdown.clone(),
            operator_delta,
        )),
        tokio::spawn(pump("deployments", Api::<Deployment>::namespaced(c(), ns), watcher::Config::default(), tx.clone(), shutdown.clone(), touched(FactKind::Deployment))),
        tokio::spawn(pump("daemonsets", Api::<DaemonSet>::namespaced(c(), ns), watcher::Config::default(), tx, shutdown, touched(FactKind::DaemonSet))),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn infra_obj(name: Option<&str>) -> DynamicObject {
        let mut v = json!({ "apiVersion": "config.openshift.io/v1", "kind": "Infrastructure", "metadata": { "name": "cluster" } });
        if let Some(n) = name {
            v["status"] = json!({ "infrastructureName": n });
        }
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn infrastructure_events_skip_unpopulated_objects() {
        assert!(infrastructure_delta(Event::Applied(infra_obj(None))).is_none());
        match infrastructure_delta(Event::Applied(infra_obj(Some("c1")))) {
            Some(FactDelta::Infrastructure(Op::Applied(i))) => assert_eq!(i.infrastructure_name, "c1"),
            other => panic!("unexpected {:?}", other),
        }
        match infrastructure_delta(Event::Restarted(vec![infra_obj(None), infra_obj(Some("c2"))])) {
            Some(FactDelta::Infrastructure(Op::Restarted(list))) => assert_eq!(list.len(), 1),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn proxy_deletion_clears_settings() {
        let obj: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "config.openshift.io/v1", "kind": "Proxy", "metadata": { "name": "cluster" },
            "status": { "httpsProxy": "http://p:3128" }
        }))
        .unwrap();
        assert!(matches!(proxy_delta(Event::Applied(obj.clone())), Some(FactDelta::Proxy(Some(_)))));
        assert!(matches!(proxy_delta(Event::Deleted(obj)), Some(FactDelta::Proxy(None))));
    }

    #[test]
    fn operator_deletion_keeps_last_config() {
        let obj: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "operator.openshift.io/v1", "kind": "ClusterCSIDriver", "metadata": { "name": OPERATOR_CONFIG_NAME },
            "spec": { "managementState": "Unmanaged" }
        }))
        .unwrap();
        assert!(matches!(
            operator_delta(Event::Applied(obj.clone())),
            Some(FactDelta::Operator { management_state: filestore_core::ManagementState::Unmanaged, .. })
        ));
        assert!(operator_delta(Event::Deleted(obj)).is_none());
    }
}
