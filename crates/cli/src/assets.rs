//! Embedded manifests with namespace and image placeholders resolved at load.

use filestore_apply::{ManagedObject, StoreError, Workload};
use filestore_core::{LOG_LEVEL_PLACEHOLDER, NAMESPACE_PLACEHOLDER};

#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    #[error("asset {0} not found")]
    NotFound(String),
    #[error("asset {name} still contains {placeholder} after substitution")]
    Unresolved { name: String, placeholder: String },
    #[error("decoding asset {name}: {source}")]
    Decode { name: String, source: StoreError },
}

macro_rules! embed {
    ($($path:literal),* $(,)?) => { &[$(($path, include_str!(concat!("../assets/", $path)))),*] };
}

static FILES: &[(&str, &str)] = embed![
    "controller.yaml",
    "node.yaml",
    "csidriver.yaml",
    "node_sa.yaml",
    "controller_sa.yaml",
    "controller_pdb.yaml",
    "service.yaml",
    "cabundle_cm.yaml",
    "volumesnapshotclass.yaml",
    "servicemonitor.yaml",
    "credentials.yaml",
    "rbac/privileged_role.yaml",
    "rbac/node_privileged_binding.yaml",
    "rbac/controller_privileged_binding.yaml",
    "rbac/main_provisioner_binding.yaml",
    "rbac/volumesnapshot_reader_provisioner_binding.yaml",
    "rbac/main_resizer_binding.yaml",
    "rbac/storageclass_reader_resizer_binding.yaml",
    "rbac/main_snapshotter_binding.yaml",
    "rbac/prometheus_role.yaml",
    "rbac/prometheus_rolebinding.yaml",
    "rbac/lease_leader_election_role.yaml",
    "rbac/lease_leader_election_rolebinding.yaml",
    "rbac/kube_rbac_proxy_role.yaml",
    "rbac/kube_rbac_proxy_binding.yaml",
];

pub fn raw(name: &str) -> Result<&'static str, AssetError> {
    FILES.iter().find(|(n, _)| *n == name).map(|(_, body)| *body).ok_or_else(|| AssetError::NotFound(name.to_string()))
}

/// Operand images substituted into the workload templates.
#[derive(Debug, Clone, clap::Args)]
pub struct Images {
    #[arg(long = "driver-image", env = "DRIVER_IMAGE", default_value = "quay.io/openshift/origin-gcp-filestore-csi-driver:latest")]
    pub driver: String,
    #[arg(long = "provisioner-image", env = "PROVISIONER_IMAGE", default_value = "quay.io/openshift/origin-csi-external-provisioner:latest")]
    pub provisioner: String,
    #[arg(long = "liveness-probe-image", env = "LIVENESS_PROBE_IMAGE", default_value = "quay.io/openshift/origin-csi-livenessprobe:latest")]
    pub liveness_probe: String,
    #[arg(long = "node-driver-registrar-image", env = "NODE_DRIVER_REGISTRAR_IMAGE", default_value = "quay.io/openshift/origin-csi-node-driver-registrar:latest")]
    pub node_driver_registrar: String,
    #[arg(long = "kube-rbac-proxy-image", env = "KUBE_RBAC_PROXY_IMAGE", default_value = "quay.io/openshift/origin-kube-rbac-proxy:latest")]
    pub kube_rbac_proxy: String,
}

pub struct Assets {
    replacements: Vec<(&'static str, String)>,
}

impl Assets {
    pub fn new(namespace: &str, images: &Images) -> Self {
        Self {
            replacements: vec![
                (NAMESPACE_PLACEHOLDER, namespace.to_string()),
                ("${DRIVER_IMAGE}", images.driver.clone()),
                ("${PROVISIONER_IMAGE}", images.provisioner.clone()),
                ("${LIVENESS_PROBE_IMAGE}", images.liveness_probe.clone()),
                ("${NODE_DRIVER_REGISTRAR_IMAGE}", images.node_driver_registrar.clone()),
                ("${KUBE_RBAC_PROXY_IMAGE}", images.kube_rbac_proxy.clone()),
            ],
        }
    }

    /// Substituted text. `${LOG_LEVEL}` survives; the log-level hook resolves it per pass.
    pub fn render(&self, name: &str) -> Result<String, AssetError> {
        let mut text = raw(name)?.to_string();
        for (placeholder, value) in &self.replacements {
            text = text.replace(placeholder, value);
        }
        let leftover = text.replace(LOG_LEVEL_PLACEHOLDER, "");
        if let Some(start) = leftover.find("${") {
            let end = leftover[start..].find('}').map(|e| start + e + 1).unwrap_or(leftover.len());
            return Err(AssetError::Unresolved { name: name.to_string(), placeholder: leftover[start..end].to_string() });
        }
        Ok(text)
    }

    pub fn object(&self, name: &str) -> Result<ManagedObject, AssetError> {
        let text = self.render(name)?;
        ManagedObject::from_yaml(&text).map_err(|source| AssetError::Decode { name: name.to_string(), source })
    }

    pub fn workload(&self, name: &str) -> Result<Workload, AssetError> {
        Workload::from_managed(self.object(name)?).map_err(|source| AssetError::Decode { name: name.to_string(), source })
    }
}
