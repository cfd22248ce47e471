//! Filestore reconcilers and the orchestrator that drives them.
//!
//! Every reconciler is level-triggered: a pass recomputes the full desired
//! state from the current facts and reports a single [`Condition`].

#![forbid(unsafe_code)]

pub mod orchestrator;
pub mod static_sync;
pub mod workload;

pub use orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorHandle};
pub use static_sync::{StaticEntry, StaticObjectSet, StaticResourceSync, StaticSetError};
pub use workload::WorkloadReconciler;

use filestore_core::{AggregateCondition, Condition, FactKind};

#[async_trait::async_trait]
pub trait Reconciler: Send + Sync {
    /// Stable name; also the prefix of the published condition types.
    fn name(&self) -> &str;

    /// Fact kinds whose changes trigger a pass.
    fn interests(&self) -> &[FactKind];

    /// Run one full pass. Failures are folded into the returned condition.
    async fn reconcile(&self) -> Condition;
}

/// Sink for the aggregate condition, e.g. the operator object's status.
#[async_trait::async_trait]
pub trait ConditionPublisher: Send + Sync {
    async fn publish(&self, aggregate: &AggregateCondition) -> anyhow::Result<()>;
}
