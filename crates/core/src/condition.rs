//! Reconcile conditions and their aggregation into the operator-level condition.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ConditionState {
    Available,
    Progressing,
    Degraded,
}

/// Status tuple reported by one reconciler after a pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Condition {
    pub state: ConditionState,
    pub reason: String,
    pub message: String,
}

impl Condition {
    pub fn available(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self { state: ConditionState::Available, reason: reason.into(), message: message.into() }
    }

    pub fn progressing(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self { state: ConditionState::Progressing, reason: reason.into(), message: message.into() }
    }

    pub fn degraded(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self { state: ConditionState::Degraded, reason: reason.into(), message: message.into() }
    }

    pub fn is_available(&self) -> bool { self.state == ConditionState::Available }
    pub fn is_degraded(&self) -> bool { self.state == ConditionState::Degraded }
}

/// Operator-level condition plus the member conditions it was derived from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AggregateCondition {
    pub state: ConditionState,
    pub reason: String,
    pub message: String,
    /// Member conditions in registration order.
    pub members: Vec<(String, Condition)>,
}

impl Default for AggregateCondition {
    fn default() -> Self {
        Self {
            state: ConditionState::Progressing,
            reason: "Initializing".into(),
            message: "no reconcile pass finished yet".into(),
            members: Vec::new(),
        }
    }
}

/// Fold member conditions (in registration order) into one condition.
///
/// Available iff every member is Available. Any Degraded member makes the
/// aggregate Degraded with the first degraded member's reason; the message
/// lists every degraded member. Otherwise the aggregate is Progressing.
pub fn aggregate<'a, I>(members: I) -> AggregateCondition
where
    I: IntoIterator<Item = (&'a str, &'a Condition)>,
{
    let members: Vec<(String, Condition)> =
        members.into_iter().map(|(n, c)| (n.to_string(), c.clone())).collect();
    if members.is_empty() {
        return AggregateCondition::default();
    }

    let pick = |state: ConditionState| -> Option<(String, String)> {
        let hits: Vec<&(String, Condition)> = members.iter().filter(|(_, c)| c.state == state).collect();
        let first = hits.first()?;
        let message = hits
            .iter()
            .map(|(n, c)| format!("{}: {}", n, c.message))
            .collect::<Vec<_>>()
            .join("; ");
        Some((first.1.reason.clone(), message))
    };

    let (state, reason, message) = if let Some((reason, message)) = pick(ConditionState::Degraded) {
        (ConditionState::Degraded, reason, message)
    } else if let Some((reason, message)) = pick(ConditionState::Progressing) {
        (ConditionState::Progressing, reason, message)
    } else {
        (ConditionState::Available, "AsExpected".to_string(), format!("{} reconcilers available", members.len()))
    };
    AggregateCondition { state, reason, message, members }
}
