//! Mounts the trusted CA bundle config map, when it is present and populated.

use std::sync::Arc;

use filestore_apply::Workload;
use filestore_core::{OperatorConfig, DRIVER_CONTAINER};
use filestore_store::{config_map_hash, Lister};
use k8s_openapi::api::core::v1::{ConfigMap, ConfigMapVolumeSource, KeyToPath, Volume, VolumeMount};
use tracing::debug;

use crate::{append_arg, Hook, HookError};

/// Key injected by the cluster network operator into labelled config maps.
pub const CA_BUNDLE_KEY: &str = "ca-bundle.crt";
pub const TRUST_VOLUME: &str = "trusted-ca-bundle";
pub const TRUST_MOUNT_PATH: &str = "/etc/pki/ca-trust/extracted/pem";
pub const TRUST_FILE: &str = "tls-ca-bundle.pem";
pub const TRUST_HASH_ANNOTATION: &str = "operator.openshift.io/trusted-ca-bundle-hash";

pub struct TrustBundleHook {
    config_maps: Arc<dyn Lister<ConfigMap>>,
    name: String,
}

impl TrustBundleHook {
    pub fn new(config_maps: Arc<dyn Lister<ConfigMap>>, name: impl Into<String>) -> Self {
        Self { config_maps, name: name.into() }
    }
}

impl Hook for TrustBundleHook {
    fn name(&self) -> &'static str { "trust-bundle" }

    fn apply(&self, _config: &OperatorConfig, workload: &mut Workload) -> Result<(), HookError> {
        // An absent or not-yet-populated bundle must never block reconciliation.
        let Some(cm) = self.config_maps.get(&self.name) else {
            debug!(config_map = %self.name, "trust bundle absent; skipping");
            return Ok(());
        };
        let populated = cm.data.as_ref().and_then(|d| d.get(CA_BUNDLE_KEY)).map(|v| !v.is_empty()).unwrap_or(false);
        if !populated {
            debug!(config_map = %self.name, "trust bundle empty; skipping");
            return Ok(());
        }

        let pod = workload.pod_spec_mut();
        let volumes = pod.volumes.get_or_insert_with(Vec::new);
        if !volumes.iter().any(|v| v.name == TRUST_VOLUME) {
            volumes.push(Volume {
                name: TRUST_VOLUME.to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: Some(self.name.clone()),
                    items: Some(vec![KeyToPath { key: CA_BUNDLE_KEY.to_string(), path: TRUST_FILE.to_string(), mode: None }]),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }
        for c in pod.containers.iter_mut() {
            let mounts = c.volume_mounts.get_or_insert_with(Vec::new);
            if !mounts.iter().any(|m| m.name == TRUST_VOLUME) {
                mounts.push(VolumeMount {
                    name: TRUST_VOLUME.to_string(),
                    mount_path: TRUST_MOUNT_PATH.to_string(),
                    read_only: Some(true),
                    ..Default::default()
                });
            }
            if c.name == DRIVER_CONTAINER {
                append_arg(c, format!("--ca-bundle={}/{}", TRUST_MOUNT_PATH, TRUST_FILE));
            }
        }
        workload.pod_annotations_mut().insert(TRUST_HASH_ANNOTATION.to_string(), config_map_hash(&cm));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use filestore_core::OperatorConfig;
    use filestore_store::{Cache, FactDelta, FactStore, Op};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn bundle(pem: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta { name: Some("filestore-trusted-ca-bundle".into()), ..Default::default() },
            data: Some(BTreeMap::from([(CA_BUNDLE_KEY.to_string(), pem.to_string())])),
            ..Default::default()
        }
    }

    fn hook(store: &FactStore) -> TrustBundleHook {
        let cms: Arc<Cache<ConfigMap>> = store.config_maps.clone();
        TrustBundleHook::new(cms, "filestore-trusted-ca-bundle")
    }

    #[test]
    fn absent_or_empty_bundle_is_noop() {
        let store = FactStore::new(OperatorConfig::new("ns"));
        let tpl = deployment(vec![container("csi-driver", &["--v=2"])]);
        let mut out = tpl.clone();
        hook(&store).apply(&OperatorConfig::new("ns"), &mut out).unwrap();
        assert_eq!(out, tpl);

        store.apply(vec![FactDelta::ConfigMap(Op::Applied(bundle("")))]);
        hook(&store).apply(&OperatorConfig::new("ns"), &mut out).unwrap();
        assert_eq!(out, tpl);
    }

    #[test]
    fn populated_bundle_is_mounted_once() {
        let store = FactStore::new(OperatorConfig::new("ns"));
        store.apply(vec![FactDelta::ConfigMap(Op::Applied(bundle("-----BEGIN CERTIFICATE-----")))]);
        let mut w = deployment(vec![container("csi-driver", &["--v=2"]), container("csi-provisioner", &[])]);
        let h = hook(&store);
        h.apply(&OperatorConfig::new("ns"), &mut w).unwrap();
        h.apply(&OperatorConfig::new("ns"), &mut w).unwrap();

        let pod = w.pod_template().unwrap().spec.as_ref().unwrap();
        assert_eq!(pod.volumes.as_ref().unwrap().len(), 1);
        for c in &pod.containers {
            assert_eq!(c.volume_mounts.as_ref().unwrap().len(), 1);
        }
        let driver_args = pod.containers[0].args.as_ref().unwrap();
        assert_eq!(driver_args.iter().filter(|a| a.starts_with("--ca-bundle=")).count(), 1);
        assert!(pod.containers[1].args.as_ref().unwrap().is_empty());
        let annotations = w.pod_template().unwrap().metadata.as_ref().unwrap().annotations.as_ref().unwrap();
        assert!(annotations.contains_key(TRUST_HASH_ANNOTATION));
    }
}
