//! Workload reconciler: template → hook pipeline → diff against live → apply.

use std::sync::Arc;

use filestore_apply::{ensure, ApplyOutcome, ObjectKey, ObjectStore, Rollout, StoreError, Workload};
use filestore_core::{Condition, EventSink, FactKind, ManagementState, OperatorConfig, RecordedEvent};
use filestore_hooks::{HookError, Pipeline};
use filestore_store::FactStore;
use metrics::counter;
use tracing::{debug, info, warn};

use crate::Reconciler;

#[derive(Debug, thiserror::Error)]
enum PassError {
    #[error(transparent)]
    Hook(#[from] HookError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Facts every workload pipeline may read; the workload's own kind is added per instance.
const BASE_INTERESTS: [FactKind; 6] = [
    FactKind::Secret,
    FactKind::ConfigMap,
    FactKind::Node,
    FactKind::Infrastructure,
    FactKind::OperatorConfig,
    FactKind::Proxy,
];

pub struct WorkloadReconciler {
    name: String,
    template: Workload,
    pipeline: Pipeline,
    store: Arc<dyn ObjectStore>,
    facts: Arc<FactStore>,
    events: Arc<dyn EventSink>,
    interests: Vec<FactKind>,
}

impl WorkloadReconciler {
    pub fn new(
        name: impl Into<String>,
        template: Workload,
        pipeline: Pipeline,
        store: Arc<dyn ObjectStore>,
        facts: Arc<FactStore>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let mut interests = BASE_INTERESTS.to_vec();
        interests.push(match template {
            Workload::Deployment(_) => FactKind::Deployment,
            Workload::DaemonSet(_) => FactKind::DaemonSet,
        });
        Self { name: name.into(), template, pipeline, store, facts, events, interests }
    }

    pub fn template(&self) -> &Workload { &self.template }

    /// Desired workload for the current facts, without touching the cluster.
    pub fn render(&self) -> Result<Workload, HookError> {
        self.pipeline.run(&self.facts.operator_config(), &self.template)
    }

    fn key(&self) -> ObjectKey { self.template.clone().into_managed().key() }

    async fn pass(&self, config: &OperatorConfig) -> Result<Condition, PassError> {
        let facts = self.facts.snapshot();
        debug!(
            reconciler = %self.name,
            epoch = facts.epoch,
            nodes = facts.node_count,
            infrastructure = ?facts.infrastructure_name,
            secrets = facts.secret_hashes.len(),
            "rendering workload"
        );
        let desired = self.pipeline.run(config, &self.template)?;
        let outcome = ensure(self.store.as_ref(), &desired.into_managed()).await?;
        let key = outcome.object().key();
        match &outcome {
            ApplyOutcome::Created(_) => {
                counter!("workload_writes_total", 1u64, "op" => "create");
                info!(reconciler = %self.name, object = %key, "workload created");
                self.events.record(RecordedEvent::normal("WorkloadCreated", format!("Created {}", key)));
            }
            ApplyOutcome::Updated(_) => {
                counter!("workload_writes_total", 1u64, "op" => "update");
                info!(reconciler = %self.name, object = %key, "workload updated");
                self.events.record(RecordedEvent::normal("WorkloadUpdated", format!("Updated {}", key)));
            }
            ApplyOutcome::Unchanged(_) => debug!(reconciler = %self.name, object = %key, "workload unchanged"),
        }
        let live = Workload::from_managed(outcome.object().clone())?;
        Ok(match live.rollout() {
            Rollout::Complete => Condition::available("AsExpected", format!("{} is available", live.name())),
            Rollout::InProgress(msg) => Condition::progressing("Deploying", msg),
        })
    }

    async fn remove(&self) -> Condition {
        let key = self.key();
        match self.store.delete(&key).await {
            Ok(true) => {
                info!(reconciler = %self.name, object = %key, "workload removed");
                self.events.record(RecordedEvent::normal("WorkloadDeleted", format!("Deleted {}", key)));
                Condition::available("Removed", format!("{} removed", key))
            }
            Ok(false) => Condition::available("Removed", format!("{} is absent", key)),
            Err(e) => {
                warn!(reconciler = %self.name, object = %key, error = %e, "workload removal failed");
                Condition::degraded("DeleteFailed", e.to_string())
            }
        }
    }
}

#[async_trait::async_trait]
impl Reconciler for WorkloadReconciler {
    fn name(&self) -> &str { &self.name }

    fn interests(&self) -> &[FactKind] { &self.interests }

    async fn reconcile(&self) -> Condition {
        let mut retried = false;
        loop {
            let config = self.facts.operator_config();
            match config.management_state {
                ManagementState::Unmanaged => {
                    return Condition::available("Unmanaged", "operand is not managed by the operator");
                }
                ManagementState::Removed => return self.remove().await,
                ManagementState::Managed => {}
            }
            match self.pass(&config).await {
                Ok(cond) => return cond,
                Err(PassError::Hook(e)) => {
                    warn!(reconciler = %self.name, hook = e.hook(), error = %e, "hook pipeline failed");
                    self.events.record(RecordedEvent::warning("HookFailed", e.to_string()));
                    return Condition::degraded("HookFailed", e.to_string());
                }
                Err(PassError::Store(e)) if e.is_conflict() && !retried => {
                    debug!(reconciler = %self.name, error = %e, "write conflict; retrying pass");
                    retried = true;
                }
                Err(PassError::Store(e)) if e.is_conflict() => {
                    warn!(reconciler = %self.name, error = %e, "write conflict persisted");
                    return Condition::degraded("ApplyConflict", e.to_string());
                }
                Err(PassError::Store(e)) if e.is_transient() => {
                    warn!(reconciler = %self.name, error = %e, "apply interrupted; retrying next pass");
                    return Condition::progressing("ApplyRetrying", e.to_string());
                }
                Err(PassError::Store(e)) => {
                    warn!(reconciler = %self.name, error = %e, "apply failed");
                    return Condition::degraded("ApplyFailed", e.to_string());
                }
            }
        }
    }
}
