//! Injects cluster-wide proxy settings as env vars into every container.

use filestore_apply::Workload;
use filestore_core::OperatorConfig;
use k8s_openapi::api::core::v1::EnvVar;

use crate::{Hook, HookError};

pub struct ProxyHook;

fn set_env(env: &mut Vec<EnvVar>, name: &str, value: &str) {
    match env.iter_mut().find(|e| e.name == name) {
        Some(e) => {
            e.value = Some(value.to_string());
            e.value_from = None;
        }
        None => env.push(EnvVar { name: name.to_string(), value: Some(value.to_string()), value_from: None }),
    }
}

impl Hook for ProxyHook {
    fn name(&self) -> &'static str { "proxy" }

    fn apply(&self, config: &OperatorConfig, workload: &mut Workload) -> Result<(), HookError> {
        let Some(proxy) = config.proxy.as_ref() else { return Ok(()); };
        let pairs = proxy.env_pairs();
        if pairs.is_empty() {
            return Ok(());
        }
        for c in workload.containers_mut() {
            let env = c.env.get_or_insert_with(Vec::new);
            for (name, value) in &pairs {
                set_env(env, name, value);
            }
        }
        Ok(())
    }
}
