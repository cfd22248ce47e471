//! Filestore operator core types: operator configuration, cluster facts, conditions and events.

#![forbid(unsafe_code)]

pub mod condition;

pub use condition::{aggregate, AggregateCondition, Condition, ConditionState};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use smallvec::SmallVec;

/// Name of the driver container inside the operand workloads.
pub const DRIVER_CONTAINER: &str = "csi-driver";

/// Name of the cluster-scoped Infrastructure and Proxy singletons.
pub const GLOBAL_CONFIG_NAME: &str = "cluster";

/// Placeholder replaced with the operand namespace in every asset.
pub const NAMESPACE_PLACEHOLDER: &str = "${NAMESPACE}";

/// Placeholder replaced with the driver verbosity in container args.
pub const LOG_LEVEL_PLACEHOLDER: &str = "${LOG_LEVEL}";

/// Management state requested through the operator configuration object.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ManagementState {
    #[default]
    Managed,
    Unmanaged,
    Removed,
}

impl ManagementState {
    /// Empty string is the API default and means `Managed`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "" | "Managed" => Some(Self::Managed),
            "Unmanaged" => Some(Self::Unmanaged),
            "Removed" => Some(Self::Removed),
            _ => None,
        }
    }
}

/// Operand log level as exposed by the operator configuration object.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum LogLevel {
    #[default]
    Normal,
    Debug,
    Trace,
    TraceAll,
}

impl LogLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "" | "Normal" => Some(Self::Normal),
            "Debug" => Some(Self::Debug),
            "Trace" => Some(Self::Trace),
            "TraceAll" => Some(Self::TraceAll),
            _ => None,
        }
    }

    /// klog-style `--v` verbosity for the operand containers.
    pub fn verbosity(self) -> u8 {
        match self {
            Self::Normal => 2,
            Self::Debug => 4,
            Self::Trace => 6,
            Self::TraceAll => 8,
        }
    }
}

/// Cluster-wide proxy settings observed from the Proxy object.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProxyConfig {
    pub http_proxy: Option<String>,
    pub https_proxy: Option<String>,
    pub no_proxy: Option<String>,
}

impl ProxyConfig {
    /// Env var name/value pairs for every setting that is present and non-empty.
    pub fn env_pairs(&self) -> SmallVec<[(&'static str, &str); 3]> {
        let mut out = SmallVec::new();
        for (name, val) in [
            ("HTTP_PROXY", &self.http_proxy),
            ("HTTPS_PROXY", &self.https_proxy),
            ("NO_PROXY", &self.no_proxy),
        ] {
            if let Some(v) = val.as_deref().filter(|v| !v.is_empty()) {
                out.push((name, v));
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool { self.env_pairs().is_empty() }
}

/// Process-wide operator configuration read by hooks and reconcilers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperatorConfig {
    pub namespace: String,
    pub management_state: ManagementState,
    pub log_level: LogLevel,
    pub proxy: Option<ProxyConfig>,
}

impl OperatorConfig {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            management_state: ManagementState::Managed,
            log_level: LogLevel::Normal,
            proxy: None,
        }
    }
}

/// User-defined cloud resource label from the Infrastructure object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceLabel {
    pub key: String,
    pub value: String,
}

/// Projection of the cluster Infrastructure object.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Infrastructure {
    /// Object name (always `cluster` on a healthy cluster).
    pub name: String,
    /// `status.infrastructureName`, the cluster ID used in ownership labels.
    pub infrastructure_name: String,
    pub resource_labels: Vec<ResourceLabel>,
}

/// Kinds of cluster state that can trigger a reconcile pass.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FactKind {
    Secret,
    ConfigMap,
    Node,
    Infrastructure,
    OperatorConfig,
    Proxy,
    Deployment,
    DaemonSet,
}

pub type FactKinds = SmallVec<[FactKind; 8]>;

/// Notification that one ingest batch touched the given fact kinds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FactChange {
    pub epoch: u64,
    pub kinds: FactKinds,
}

impl FactChange {
    pub fn touches(&self, interest: &[FactKind]) -> bool {
        self.kinds.iter().any(|k| interest.contains(k))
    }
}

/// Point-in-time summary of the facts a pass reads.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FactSnapshot {
    pub epoch: u64,
    pub infrastructure_name: Option<String>,
    pub node_count: usize,
    pub secret_hashes: BTreeMap<String, String>,
    pub config_map_hashes: BTreeMap<String, String>,
}

/// SHA-256 over ordered key/value pairs, as lowercase hex.
///
/// Each key and value is length-prefixed so that moving bytes between a key
/// and its value changes the result.
pub fn content_hash<'a, I>(parts: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a [u8])>,
{
    let mut hasher = Sha256::new();
    for (k, v) in parts {
        hasher.update((k.len() as u64).to_le_bytes());
        hasher.update(k.as_bytes());
        hasher.update((v.len() as u64).to_le_bytes());
        hasher.update(v);
    }
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

/// Human-readable reconciliation event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordedEvent {
    pub type_: EventType,
    pub reason: String,
    pub note: String,
}

impl RecordedEvent {
    pub fn normal(reason: impl Into<String>, note: impl Into<String>) -> Self {
        Self { type_: EventType::Normal, reason: reason.into(), note: note.into() }
    }

    pub fn warning(reason: impl Into<String>, note: impl Into<String>) -> Self {
        Self { type_: EventType::Warning, reason: reason.into(), note: note.into() }
    }
}

/// Fire-and-forget event emitter. Implementations must never block the caller.
pub trait EventSink: Send + Sync {
    fn record(&self, event: RecordedEvent);
}

/// Sink that drops every event; used when no cluster event recorder is wired.
pub struct NoopEvents;

impl EventSink for NoopEvents {
    fn record(&self, _event: RecordedEvent) {}
}

pub mod prelude {
    pub use super::{
        Condition, ConditionState, EventSink, FactChange, FactKind, Infrastructure, LogLevel,
        ManagementState, OperatorConfig, ProxyConfig, RecordedEvent, ResourceLabel,
    };
}
