//! Assembly of pipelines, reconcilers and the static object set.

use std::sync::Arc;

use anyhow::{Context, Result};
use filestore_apply::ObjectStore;
use filestore_core::EventSink;
use filestore_hooks::{
    CustomLabelsHook, LogLevelHook, Pipeline, ProxyHook, ReplicaPolicy, ReplicasHook, SecretHashHook, TrustBundleHook,
};
use filestore_reconcile::{Orchestrator, OrchestratorConfig, StaticObjectSet, StaticResourceSync, WorkloadReconciler};
use filestore_store::FactStore;

use crate::assets::Assets;

pub const OPERATOR_NAME: &str = "gcp-filestore-csi-driver-operator";
pub const CONTROLLER_RECONCILER: &str = "GCPFilestoreDriverControllerServiceController";
pub const NODE_RECONCILER: &str = "GCPFilestoreDriverNodeServiceController";
pub const STATIC_RECONCILER: &str = "GCPFilestoreDriverCSIStaticResourceController";

pub const CLOUD_CREDENTIALS_SECRET: &str = "gcp-filestore-cloud-credentials";
pub const METRICS_CERT_SECRET: &str = "gcp-filestore-csi-driver-controller-metrics-serving-cert";
pub const TRUSTED_CA_CONFIG_MAP: &str = "gcp-filestore-csi-driver-trusted-ca-bundle";

/// Logical name → asset of every statically managed object.
pub const STATIC_ASSETS: &[(&str, &str)] = &[
    ("CSIDriver", "csidriver.yaml"),
    ("PrivilegedRole", "rbac/privileged_role.yaml"),
    ("NodeServiceAccount", "node_sa.yaml"),
    ("NodeRoleBinding", "rbac/node_privileged_binding.yaml"),
    ("ControllerServiceAccount", "controller_sa.yaml"),
    ("ControllerRoleBinding", "rbac/controller_privileged_binding.yaml"),
    ("ProvisionerRoleBinding", "rbac/main_provisioner_binding.yaml"),
    ("VolumeSnapshotReaderProvisionerRoleBinding", "rbac/volumesnapshot_reader_provisioner_binding.yaml"),
    ("ResizerRoleBinding", "rbac/main_resizer_binding.yaml"),
    ("StorageClassReaderResizerRoleBinding", "rbac/storageclass_reader_resizer_binding.yaml"),
    ("SnapshotterRoleBinding", "rbac/main_snapshotter_binding.yaml"),
    ("VolumeSnapshotClass", "volumesnapshotclass.yaml"),
    ("ControllerPDB", "controller_pdb.yaml"),
    ("PrometheusRole", "rbac/prometheus_role.yaml"),
    ("PrometheusRoleBinding", "rbac/prometheus_rolebinding.yaml"),
    ("LeaseLeaderElectionRole", "rbac/lease_leader_election_role.yaml"),
    ("LeaseLeaderElectionRoleBinding", "rbac/lease_leader_election_rolebinding.yaml"),
    ("MetricsService", "service.yaml"),
    ("RBACProxyRole", "rbac/kube_rbac_proxy_role.yaml"),
    ("RBACProxyRoleBinding", "rbac/kube_rbac_proxy_binding.yaml"),
    ("CAConfigMap", "cabundle_cm.yaml"),
    ("ServiceMonitor", "servicemonitor.yaml"),
    ("CredentialsRequest", "credentials.yaml"),
];

fn secret_hash(facts: &FactStore, name: &str) -> SecretHashHook {
    SecretHashHook::new(facts.secrets.clone(), [name]).annotation(format!("operator.openshift.io/dep-{}-secret", name))
}

/// Proxy, trust bundle, log level, both secret hashes, replicas, custom labels.
pub fn controller_pipeline(facts: &FactStore, policy: ReplicaPolicy) -> Pipeline {
    Pipeline::new()
        .with(ProxyHook)
        .with(TrustBundleHook::new(facts.config_maps.clone(), TRUSTED_CA_CONFIG_MAP))
        .with(LogLevelHook)
        .with(secret_hash(facts, CLOUD_CREDENTIALS_SECRET))
        .with(secret_hash(facts, METRICS_CERT_SECRET))
        .with(ReplicasHook::new(facts.nodes.clone(), policy))
        .with(CustomLabelsHook::new(facts.infrastructure.clone()))
}

pub fn node_pipeline(facts: &FactStore) -> Pipeline {
    Pipeline::new()
        .with(ProxyHook)
        .with(TrustBundleHook::new(facts.config_maps.clone(), TRUSTED_CA_CONFIG_MAP))
        .with(LogLevelHook)
}

pub fn static_set(assets: &Assets) -> Result<StaticObjectSet> {
    let mut entries = Vec::with_capacity(STATIC_ASSETS.len());
    for (name, file) in STATIC_ASSETS {
        entries.push((*name, assets.object(file)?));
    }
    StaticObjectSet::new(entries).context("building static object set")
}

pub struct Reconcilers {
    pub controller: Arc<WorkloadReconciler>,
    pub node: Arc<WorkloadReconciler>,
    pub statics: Arc<StaticResourceSync>,
}

impl Reconcilers {
    pub fn build(
        assets: &Assets,
        facts: &Arc<FactStore>,
        store: Arc<dyn ObjectStore>,
        events: Arc<dyn EventSink>,
        policy: ReplicaPolicy,
    ) -> Result<Self> {
        let controller = WorkloadReconciler::new(
            CONTROLLER_RECONCILER,
            assets.workload("controller.yaml")?,
            controller_pipeline(facts, policy),
            store.clone(),
            facts.clone(),
            events.clone(),
        );
        let node = WorkloadReconciler::new(
            NODE_RECONCILER,
            assets.workload("node.yaml")?,
            node_pipeline(facts),
            store.clone(),
            facts.clone(),
            events.clone(),
        );
        let statics = StaticResourceSync::new(STATIC_RECONCILER, Arc::new(static_set(assets)?), store, facts.clone(), events);
        Ok(Self { controller: Arc::new(controller), node: Arc::new(node), statics: Arc::new(statics) })
    }

    pub fn orchestrator(&self, facts: Arc<FactStore>, config: OrchestratorConfig) -> Orchestrator {
        Orchestrator::new(facts, config)
            .register(self.controller.clone())
            .register(self.node.clone())
            .register(self.statics.clone())
    }
}
