//! Publishes the aggregate condition onto the ClusterCSIDriver status.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use filestore_core::{AggregateCondition, ConditionState};
use filestore_reconcile::ConditionPublisher;
use kube::api::{Api, Patch, PatchParams};
use kube::core::DynamicObject;
use kube::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{cluster_csi_driver_resource, OPERATOR_CONFIG_NAME};

/// Operator condition as stored in `status.conditions`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OperatorCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

const SUFFIXES: [(&str, ConditionState); 3] = [
    ("Available", ConditionState::Available),
    ("Progressing", ConditionState::Progressing),
    ("Degraded", ConditionState::Degraded),
];

/// Replace this operator's conditions, keeping conditions written by others.
///
/// Every member gets `<Member>Available|Progressing|Degraded`; the aggregate is
/// published as plain `Available|Progressing|Degraded`. `lastTransitionTime`
/// only moves when a condition's status flips.
pub fn merge_conditions(existing: &[OperatorCondition], agg: &AggregateCondition, now: &str) -> Vec<OperatorCondition> {
    let mut ours: Vec<OperatorCondition> = Vec::with_capacity((agg.members.len() + 1) * SUFFIXES.len());
    let mut emit = |prefix: &str, state: ConditionState, reason: &str, message: &str| {
        for (suffix, s) in SUFFIXES {
            let type_ = format!("{}{}", prefix, suffix);
            let status = if state == s { "True" } else { "False" }.to_string();
            let last_transition_time = match existing.iter().find(|c| c.type_ == type_) {
                Some(p) if p.status == status && p.last_transition_time.is_some() => p.last_transition_time.clone(),
                _ => Some(now.to_string()),
            };
            ours.push(OperatorCondition {
                type_,
                status,
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time,
            });
        }
    };
    emit("", agg.state, &agg.reason, &agg.message);
    for (name, cond) in &agg.members {
        emit(name, cond.state, &cond.reason, &cond.message);
    }
    let mut out: Vec<OperatorCondition> =
        existing.iter().filter(|c| !ours.iter().any(|o| o.type_ == c.type_)).cloned().collect();
    out.extend(ours);
    out
}

pub struct KubeStatusPublisher {
    api: Api<DynamicObject>,
    call_timeout: Duration,
}

impl KubeStatusPublisher {
    pub fn new(client: Client, call_timeout: Duration) -> Self {
        Self { api: Api::all_with(client, &cluster_csi_driver_resource()), call_timeout }
    }
}

#[async_trait::async_trait]
impl ConditionPublisher for KubeStatusPublisher {
    async fn publish(&self, aggregate: &AggregateCondition) -> Result<()> {
        let current = tokio::time::timeout(self.call_timeout, self.api.get_opt(OPERATOR_CONFIG_NAME))
            .await
            .context("reading ClusterCSIDriver timed out")?
            .context("reading ClusterCSIDriver")?;
        let Some(current) = current else {
            debug!(name = OPERATOR_CONFIG_NAME, "operator configuration object absent; status not published");
            return Ok(());
        };
        let existing: Vec<OperatorCondition> = current
            .data
            .get("status")
            .and_then(|s| s.get("conditions"))
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .context("decoding status.conditions")?
            .unwrap_or_default();
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let next = merge_conditions(&existing, aggregate, &now);
        if next == existing {
            return Ok(());
        }
        let patch = serde_json::json!({ "status": { "conditions": next } });
        let params = PatchParams::default();
        tokio::time::timeout(self.call_timeout, self.api.patch_status(OPERATOR_CONFIG_NAME, &params, &Patch::Merge(&patch)))
            .await
            .context("patching ClusterCSIDriver status timed out")?
            .context("patching ClusterCSIDriver status")?;
        debug!(state = ?aggregate.state, reason = %aggregate.reason, "operator status published");
        Ok(())
    }
}
