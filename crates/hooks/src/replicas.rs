//! Controller replica count derived from the nodes the controller may land on.

use std::collections::BTreeMap;
use std::sync::Arc;

use filestore_apply::Workload;
use filestore_core::OperatorConfig;
use filestore_store::Lister;
use k8s_openapi::api::core::v1::Node;
use tracing::debug;

use crate::{Hook, HookError};

/// Clamp bounds for the replica count; `min >= 1` and `max >= min` always hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaPolicy {
    min: i32,
    max: i32,
}

impl Default for ReplicaPolicy {
    fn default() -> Self { Self { min: 1, max: 2 } }
}

impl ReplicaPolicy {
    pub fn new(min: i32, max: i32) -> Self {
        let min = min.max(1);
        Self { min, max: max.max(min) }
    }

    pub fn min(&self) -> i32 { self.min }
    pub fn max(&self) -> i32 { self.max }

    /// Non-decreasing in `nodes`, never outside `[min, max]`.
    pub fn replicas_for(&self, nodes: usize) -> i32 {
        let n = i32::try_from(nodes).unwrap_or(i32::MAX);
        n.clamp(self.min, self.max)
    }
}

pub struct ReplicasHook {
    nodes: Arc<dyn Lister<Node>>,
    policy: ReplicaPolicy,
}

impl ReplicasHook {
    pub fn new(nodes: Arc<dyn Lister<Node>>, policy: ReplicaPolicy) -> Self { Self { nodes, policy } }
}

fn matches_selector(node: &Node, selector: Option<&BTreeMap<String, String>>) -> bool {
    let Some(selector) = selector else { return true; };
    let labels = node.metadata.labels.as_ref();
    selector.iter().all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
}

impl Hook for ReplicasHook {
    fn name(&self) -> &'static str { "replicas" }

    fn apply(&self, _config: &OperatorConfig, workload: &mut Workload) -> Result<(), HookError> {
        let selector = workload.node_selector().cloned();
        let eligible = self.nodes.list().iter().filter(|n| matches_selector(n, selector.as_ref())).count();
        let replicas = self.policy.replicas_for(eligible);
        if !workload.set_replicas(replicas) {
            return Err(HookError::Invalid {
                hook: "replicas",
                detail: format!("{} does not carry a replica count", workload.name()),
            });
        }
        debug!(workload = workload.name(), eligible, replicas, "replica count set");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use filestore_store::Cache;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn node(name: &str, master: bool) -> Node {
        let mut labels = BTreeMap::from([("kubernetes.io/os".to_string(), "linux".to_string())]);
        if master {
            labels.insert("node-role.kubernetes.io/master".into(), String::new());
        }
        Node { metadata: ObjectMeta { name: Some(name.into()), labels: Some(labels), ..Default::default() }, ..Default::default() }
    }

    #[test]
    fn policy_is_clamped_and_monotonic() {
        let p = ReplicaPolicy::new(0, -3);
        assert_eq!((p.min(), p.max()), (1, 1));

        let p = ReplicaPolicy::new(1, 2);
        assert_eq!(p.replicas_for(0), 1);
        let mut last = 0;
        for n in 0..10 {
            let r = p.replicas_for(n);
            assert!(r >= last && (1..=2).contains(&r));
            last = r;
        }
        assert_eq!(p.replicas_for(3), 2);
    }

    #[test]
    fn counts_only_nodes_matching_the_selector() {
        let cache = Arc::new(Cache::new());
        for (i, master) in [true, false, false, false].into_iter().enumerate() {
            cache.upsert(node(&format!("n{}", i), master));
        }
        let hook = ReplicasHook::new(cache.clone(), ReplicaPolicy::new(1, 3));

        let mut w = deployment(vec![container("csi-driver", &[])]);
        if let Workload::Deployment(d) = &mut w {
            let spec = d.spec.as_mut().unwrap().template.spec.as_mut().unwrap();
            spec.node_selector = Some(BTreeMap::from([("node-role.kubernetes.io/master".to_string(), String::new())]));
        }
        hook.apply(&OperatorConfig::new("ns"), &mut w).unwrap();
        let Workload::Deployment(d) = &w else { unreachable!() };
        assert_eq!(d.spec.as_ref().unwrap().replicas, Some(1));

        cache.upsert(node("n4", true));
        cache.upsert(node("n5", true));
        cache.upsert(node("n6", true));
        hook.apply(&OperatorConfig::new("ns"), &mut w).unwrap();
        let Workload::Deployment(d) = &w else { unreachable!() };
        assert_eq!(d.spec.as_ref().unwrap().replicas, Some(3));
    }

    #[test]
    fn daemonset_is_rejected() {
        let hook = ReplicasHook::new(Arc::new(Cache::<Node>::new()), ReplicaPolicy::default());
        let mut w = daemonset(vec![container("csi-driver", &[])]);
        let err = hook.apply(&OperatorConfig::new("ns"), &mut w).unwrap_err();
        assert!(matches!(err, HookError::Invalid { hook: "replicas", .. }));
    }
}
