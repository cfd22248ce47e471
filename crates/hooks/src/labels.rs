//! Cloud resource labels for volumes the driver provisions.

use std::sync::Arc;

use filestore_apply::Workload;
use filestore_core::{Infrastructure, OperatorConfig, DRIVER_CONTAINER, GLOBAL_CONFIG_NAME};
use filestore_store::Lister;
use tracing::debug;

use crate::{append_arg, Hook, HookError};

/// Label every provisioned resource carries to tie it to its cluster.
pub fn ownership_label(infrastructure_name: &str) -> String {
    format!("kubernetes-io-cluster-{}=owned", infrastructure_name)
}

pub struct CustomLabelsHook {
    infrastructure: Arc<dyn Lister<Infrastructure>>,
    container: String,
}

impl CustomLabelsHook {
    pub fn new(infrastructure: Arc<dyn Lister<Infrastructure>>) -> Self {
        Self { infrastructure, container: DRIVER_CONTAINER.to_string() }
    }

    pub fn container(mut self, name: impl Into<String>) -> Self {
        self.container = name.into();
        self
    }
}

impl Hook for CustomLabelsHook {
    fn name(&self) -> &'static str { "custom-labels" }

    fn apply(&self, _config: &OperatorConfig, workload: &mut Workload) -> Result<(), HookError> {
        let infra = self.infrastructure.get(GLOBAL_CONFIG_NAME).ok_or_else(|| HookError::MissingDependency {
            hook: "custom-labels",
            detail: "failed to fetch global Infrastructure object".into(),
        })?;
        if infra.infrastructure_name.is_empty() {
            return Err(HookError::Invalid {
                hook: "custom-labels",
                detail: "global Infrastructure object has no infrastructureName".into(),
            });
        }
        let mut labels: Vec<String> = infra.resource_labels.iter().map(|l| format!("{}={}", l.key, l.value)).collect();
        labels.push(ownership_label(&infra.infrastructure_name));
        let arg = format!("--extra-labels={}", labels.join(","));

        let mut found = false;
        for c in workload.containers_mut().iter_mut().filter(|c| c.name == self.container) {
            append_arg(c, arg.clone());
            found = true;
        }
        if !found {
            debug!(workload = workload.name(), container = %self.container, "no target container; labels not injected");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use filestore_core::ResourceLabel;
    use filestore_store::Cache;

    fn infra(labels: &[(&str, &str)]) -> Infrastructure {
        Infrastructure {
            name: GLOBAL_CONFIG_NAME.into(),
            infrastructure_name: "mycluster".into(),
            resource_labels: labels.iter().map(|(k, v)| ResourceLabel { key: k.to_string(), value: v.to_string() }).collect(),
        }
    }

    fn driver_args(labels: &[(&str, &str)]) -> Vec<String> {
        let cache = Arc::new(Cache::new());
        cache.upsert(infra(labels));
        let hook = CustomLabelsHook::new(cache);
        let mut w = deployment(vec![container("csi-driver", &["--v=2"]), container("csi-provisioner", &["--timeout=30s"])]);
        hook.apply(&OperatorConfig::new("ns"), &mut w).unwrap();
        assert_eq!(w.containers()[1].args.as_deref().unwrap(), &["--timeout=30s"]);
        w.containers()[0].args.clone().unwrap()
    }

    #[test]
    fn ownership_label_alone() {
        assert_eq!(driver_args(&[]), vec!["--v=2", "--extra-labels=kubernetes-io-cluster-mycluster=owned"]);
    }

    #[test]
    fn user_labels_precede_ownership_label() {
        assert_eq!(
            driver_args(&[("team", "storage")]),
            vec!["--v=2", "--extra-labels=team=storage,kubernetes-io-cluster-mycluster=owned"]
        );
    }

    #[test]
    fn missing_infrastructure_fails() {
        let hook = CustomLabelsHook::new(Arc::new(Cache::<Infrastructure>::new()));
        let mut w = deployment(vec![container("csi-driver", &[])]);
        let err = hook.apply(&OperatorConfig::new("ns"), &mut w).unwrap_err();
        assert_eq!(err.to_string(), "custom-labels: failed to fetch global Infrastructure object");
    }

    #[test]
    fn missing_target_container_is_noop() {
        let cache = Arc::new(Cache::new());
        cache.upsert(infra(&[]));
        let tpl = deployment(vec![container("csi-provisioner", &[])]);
        let mut w = tpl.clone();
        CustomLabelsHook::new(cache).apply(&OperatorConfig::new("ns"), &mut w).unwrap();
        assert_eq!(w, tpl);
    }
}
