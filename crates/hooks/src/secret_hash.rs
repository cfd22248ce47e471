//! Pod-template annotation carrying a hash of the named secrets' content.
//!
//! Any change in secret content changes the pod template and rolls the
//! workload, which is how credential rotation reaches running pods.

use std::sync::Arc;

use filestore_apply::Workload;
use filestore_core::{content_hash, OperatorConfig};
use filestore_store::{secret_hash, Lister};
use k8s_openapi::api::core::v1::Secret;

use crate::{Hook, HookError};

pub const SECRET_HASH_ANNOTATION: &str = "operator.openshift.io/secret-hash";

pub struct SecretHashHook {
    secrets: Arc<dyn Lister<Secret>>,
    names: Vec<String>,
    annotation: String,
}

impl SecretHashHook {
    pub fn new<I, S>(secrets: Arc<dyn Lister<Secret>>, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            secrets,
            names: names.into_iter().map(Into::into).collect(),
            annotation: SECRET_HASH_ANNOTATION.to_string(),
        }
    }

    pub fn annotation(mut self, key: impl Into<String>) -> Self {
        self.annotation = key.into();
        self
    }
}

impl Hook for SecretHashHook {
    fn name(&self) -> &'static str { "secret-hash" }

    fn apply(&self, config: &OperatorConfig, workload: &mut Workload) -> Result<(), HookError> {
        let mut per_secret = Vec::with_capacity(self.names.len());
        for name in &self.names {
            let secret = self.secrets.get(name).ok_or_else(|| HookError::MissingDependency {
                hook: "secret-hash",
                detail: format!("secret {}/{} not found", config.namespace, name),
            })?;
            per_secret.push((name.as_str(), secret_hash(&secret)));
        }
        let hash = content_hash(per_secret.iter().map(|(n, h)| (*n, h.as_bytes())));
        workload.pod_annotations_mut().insert(self.annotation.clone(), hash);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use filestore_store::{FactDelta, FactStore, Op};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    fn secret(name: &str, val: &[u8]) -> Secret {
        Secret {
            metadata: ObjectMeta { name: Some(name.into()), ..Default::default() },
            data: Some(BTreeMap::from([("service_account.json".to_string(), ByteString(val.to_vec()))])),
            ..Default::default()
        }
    }

    fn annotation(store: &Arc<FactStore>) -> Result<String, HookError> {
        let hook = SecretHashHook::new(store.secrets.clone(), ["cloud-credentials", "metrics-cert"]);
        let mut w = deployment(vec![container("csi-driver", &[])]);
        hook.apply(&OperatorConfig::new("ns"), &mut w)?;
        let meta = w.pod_template().unwrap().metadata.clone().unwrap();
        Ok(meta.annotations.unwrap()[SECRET_HASH_ANNOTATION].clone())
    }

    #[test]
    fn missing_secret_is_hard_failure() {
        let store = FactStore::new(OperatorConfig::new("ns"));
        store.apply(vec![FactDelta::Secret(Op::Applied(secret("cloud-credentials", b"{}")))]);
        let err = annotation(&store).unwrap_err();
        assert!(matches!(err, HookError::MissingDependency { .. }));
        assert!(err.to_string().contains("ns/metrics-cert"), "{}", err);
    }

    #[test]
    fn hash_is_stable_and_tracks_single_byte_changes() {
        let store = FactStore::new(OperatorConfig::new("ns"));
        store.apply(vec![
            FactDelta::Secret(Op::Applied(secret("cloud-credentials", b"{\"private_key\":\"aaaa\"}"))),
            FactDelta::Secret(Op::Applied(secret("metrics-cert", b"cert"))),
        ]);
        let first = annotation(&store).unwrap();
        assert_eq!(first, annotation(&store).unwrap());

        store.apply(vec![FactDelta::Secret(Op::Applied(secret("cloud-credentials", b"{\"private_key\":\"aaab\"}")))]);
        let rotated = annotation(&store).unwrap();
        assert_ne!(first, rotated);

        store.apply(vec![FactDelta::Secret(Op::Applied(secret("cloud-credentials", b"{\"private_key\":\"aaaa\"}")))]);
        assert_eq!(first, annotation(&store).unwrap());
    }
}
