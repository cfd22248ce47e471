//! Filestore hooks: independent mutation steps composed into a pipeline that
//! turns a workload template into the desired workload for one pass.

#![forbid(unsafe_code)]

pub mod labels;
pub mod log_level;
pub mod proxy;
pub mod replicas;
pub mod secret_hash;
pub mod trust;

pub use labels::CustomLabelsHook;
pub use log_level::LogLevelHook;
pub use proxy::ProxyHook;
pub use replicas::{ReplicaPolicy, ReplicasHook};
pub use secret_hash::SecretHashHook;
pub use trust::TrustBundleHook;

use filestore_apply::Workload;
use filestore_core::OperatorConfig;
use k8s_openapi::api::core::v1::Container;
use tracing::debug;

#[derive(Debug, Clone, thiserror::Error)]
pub enum HookError {
    /// A fact the hook cannot work without is absent or unreadable.
    #[error("{hook}: {detail}")]
    MissingDependency { hook: &'static str, detail: String },
    #[error("{hook}: {detail}")]
    Invalid { hook: &'static str, detail: String },
}

impl HookError {
    pub fn hook(&self) -> &'static str {
        match self {
            Self::MissingDependency { hook, .. } | Self::Invalid { hook, .. } => hook,
        }
    }
}

/// One mutation step. Dependencies (fact sources) are injected at construction.
pub trait Hook: Send + Sync {
    fn name(&self) -> &'static str;
    fn apply(&self, config: &OperatorConfig, workload: &mut Workload) -> Result<(), HookError>;
}

/// Ordered hook list applied strictly in declaration order.
#[derive(Default)]
pub struct Pipeline {
    hooks: Vec<Box<dyn Hook>>,
}

impl Pipeline {
    pub fn new() -> Self { Self::default() }

    pub fn with(mut self, hook: impl Hook + 'static) -> Self {
        self.hooks.push(Box::new(hook));
        self
    }

    pub fn names(&self) -> Vec<&'static str> { self.hooks.iter().map(|h| h.name()).collect() }
    pub fn len(&self) -> usize { self.hooks.len() }
    pub fn is_empty(&self) -> bool { self.hooks.is_empty() }

    /// Run every hook over a copy of `template`. The first failure aborts the
    /// run and the partially mutated copy is dropped.
    pub fn run(&self, config: &OperatorConfig, template: &Workload) -> Result<Workload, HookError> {
        let mut desired = template.clone();
        for hook in &self.hooks {
            hook.apply(config, &mut desired)?;
            debug!(hook = hook.name(), workload = desired.name(), "hook applied");
        }
        Ok(desired)
    }
}

/// Append `arg` unless an identical argument is already present.
pub(crate) fn append_arg(container: &mut Container, arg: String) {
    let args = container.args.get_or_insert_with(Vec::new);
    if !args.contains(&arg) {
        args.push(arg);
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use filestore_apply::Workload;
    use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec, Deployment, DeploymentSpec};
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    pub fn container(name: &str, args: &[&str]) -> Container {
        Container {
            name: name.into(),
            args: Some(args.iter().map(|s| s.to_string()).collect()),
            ..Default::default()
        }
    }

    fn template(containers: Vec<Container>) -> PodTemplateSpec {
        PodTemplateSpec { metadata: None, spec: Some(PodSpec { containers, ..Default::default() }) }
    }

    pub fn deployment(containers: Vec<Container>) -> Workload {
        Workload::Deployment(Deployment {
            metadata: ObjectMeta { name: Some("filestore-csi-driver-controller".into()), ..Default::default() },
            spec: Some(DeploymentSpec { replicas: Some(1), template: template(containers), ..Default::default() }),
            status: None,
        })
    }

    pub fn daemonset(containers: Vec<Container>) -> Workload {
        Workload::DaemonSet(DaemonSet {
            metadata: ObjectMeta { name: Some("filestore-csi-driver-node".into()), ..Default::default() },
            spec: Some(DaemonSetSpec { template: template(containers), ..Default::default() }),
            status: None,
        })
    }
}
