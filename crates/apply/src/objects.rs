//! Closed set of object kinds the operator manages, plus the workload view hooks mutate.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{ConfigMap, Container, PodSpec, PodTemplateSpec, Service, ServiceAccount};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::api::storage::v1::CSIDriver;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::{DynamicObject, GroupVersionKind};
use serde_json::Value as Json;

use crate::StoreError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Deployment,
    DaemonSet,
    ServiceAccount,
    ClusterRole,
    ClusterRoleBinding,
    Role,
    RoleBinding,
    Service,
    ConfigMap,
    CsiDriver,
    PodDisruptionBudget,
    /// Kind only known at runtime (optional CRDs), resolved through discovery.
    Dynamic(GroupVersionKind),
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dynamic(gvk) if gvk.group.is_empty() => write!(f, "{}/{}", gvk.version, gvk.kind),
            Self::Dynamic(gvk) => write!(f, "{}/{}/{}", gvk.group, gvk.version, gvk.kind),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Identity of a managed object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub kind: ObjectKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// Tagged variant over every kind the operator writes.
#[derive(Debug, Clone)]
pub enum ManagedObject {
    Deployment(Deployment),
    DaemonSet(DaemonSet),
    ServiceAccount(ServiceAccount),
    ClusterRole(ClusterRole),
    ClusterRoleBinding(ClusterRoleBinding),
    Role(Role),
    RoleBinding(RoleBinding),
    Service(Service),
    ConfigMap(ConfigMap),
    CsiDriver(CSIDriver),
    PodDisruptionBudget(PodDisruptionBudget),
    Dynamic(DynamicObject),
}

macro_rules! each {
    ($self:expr, $o:ident => $body:expr) => {
        match $self {
            ManagedObject::Deployment($o) => $body,
            ManagedObject::DaemonSet($o) => $body,
            ManagedObject::ServiceAccount($o) => $body,
            ManagedObject::ClusterRole($o) => $body,
            ManagedObject::ClusterRoleBinding($o) => $body,
            ManagedObject::Role($o) => $body,
            ManagedObject::RoleBinding($o) => $body,
            ManagedObject::Service($o) => $body,
            ManagedObject::ConfigMap($o) => $body,
            ManagedObject::CsiDriver($o) => $body,
            ManagedObject::PodDisruptionBudget($o) => $body,
            ManagedObject::Dynamic($o) => $body,
        }
    };
}

fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

impl ManagedObject {
    pub fn meta(&self) -> &ObjectMeta { each!(self, o => &o.metadata) }
    pub fn meta_mut(&mut self) -> &mut ObjectMeta { each!(self, o => &mut o.metadata) }

    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::Deployment(_) => ObjectKind::Deployment,
            Self::DaemonSet(_) => ObjectKind::DaemonSet,
            Self::ServiceAccount(_) => ObjectKind::ServiceAccount,
            Self::ClusterRole(_) => ObjectKind::ClusterRole,
            Self::ClusterRoleBinding(_) => ObjectKind::ClusterRoleBinding,
            Self::Role(_) => ObjectKind::Role,
            Self::RoleBinding(_) => ObjectKind::RoleBinding,
            Self::Service(_) => ObjectKind::Service,
            Self::ConfigMap(_) => ObjectKind::ConfigMap,
            Self::CsiDriver(_) => ObjectKind::CsiDriver,
            Self::PodDisruptionBudget(_) => ObjectKind::PodDisruptionBudget,
            Self::Dynamic(o) => {
                let (api_version, kind) = o
                    .types
                    .as_ref()
                    .map(|t| (t.api_version.as_str(), t.kind.as_str()))
                    .unwrap_or(("", ""));
                let (group, version) = parse_api_version(api_version);
                ObjectKind::Dynamic(GroupVersionKind { group, version, kind: kind.to_string() })
            }
        }
    }

    pub fn key(&self) -> ObjectKey {
        let meta = self.meta();
        ObjectKey {
            kind: self.kind(),
            namespace: meta.namespace.clone(),
            name: meta.name.clone().unwrap_or_default(),
        }
    }

    pub fn resource_version(&self) -> Option<&str> { self.meta().resource_version.as_deref() }

    pub fn to_json(&self) -> Result<Json, StoreError> {
        each!(self, o => serde_json::to_value(o)).map_err(|e| StoreError::Invalid(e.to_string()))
    }

    /// Decode by `apiVersion`/`kind`; anything outside the typed set becomes `Dynamic`.
    pub fn from_json(value: Json) -> Result<Self, StoreError> {
        let api_version = value.get("apiVersion").and_then(|v| v.as_str()).ok_or_else(|| StoreError::Invalid("object missing apiVersion".into()))?.to_string();
        let kind = value.get("kind").and_then(|v| v.as_str()).ok_or_else(|| StoreError::Invalid("object missing kind".into()))?.to_string();
        let obj = match (api_version.as_str(), kind.as_str()) {
            ("apps/v1", "Deployment") => serde_json::from_value(value).map(Self::Deployment),
            ("apps/v1", "DaemonSet") => serde_json::from_value(value).map(Self::DaemonSet),
            ("v1", "ServiceAccount") => serde_json::from_value(value).map(Self::ServiceAccount),
            ("v1", "Service") => serde_json::from_value(value).map(Self::Service),
            ("v1", "ConfigMap") => serde_json::from_value(value).map(Self::ConfigMap),
            ("rbac.authorization.k8s.io/v1", "ClusterRole") => serde_json::from_value(value).map(Self::ClusterRole),
            ("rbac.authorization.k8s.io/v1", "ClusterRoleBinding") => serde_json::from_value(value).map(Self::ClusterRoleBinding),
            ("rbac.authorization.k8s.io/v1", "Role") => serde_json::from_value(value).map(Self::Role),
            ("rbac.authorization.k8s.io/v1", "RoleBinding") => serde_json::from_value(value).map(Self::RoleBinding),
            ("storage.k8s.io/v1", "CSIDriver") => serde_json::from_value(value).map(Self::CsiDriver),
            ("policy/v1", "PodDisruptionBudget") => serde_json::from_value(value).map(Self::PodDisruptionBudget),
            _ => serde_json::from_value(value).map(Self::Dynamic),
        };
        obj.map_err(|e| StoreError::Invalid(e.to_string()))
    }

    /// Parse a single YAML manifest.
    pub fn from_yaml(yaml: &str) -> Result<Self, StoreError> {
        let val: serde_yaml::Value = serde_yaml::from_str(yaml).map_err(|e| StoreError::Invalid(format!("parsing YAML: {}", e)))?;
        let json = serde_json::to_value(val).map_err(|e| StoreError::Invalid(format!("converting YAML to JSON: {}", e)))?;
        let obj = Self::from_json(json)?;
        if obj.meta().name.as_deref().unwrap_or("").is_empty() {
            return Err(StoreError::Invalid("object missing metadata.name".into()));
        }
        Ok(obj)
    }
}

/// Rollout progress of a live workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rollout {
    Complete,
    InProgress(String),
}

/// Operand workload: the object hooks mutate.
#[derive(Debug, Clone, PartialEq)]
pub enum Workload {
    Deployment(Deployment),
    DaemonSet(DaemonSet),
}

impl Workload {
    pub fn from_managed(obj: ManagedObject) -> Result<Self, StoreError> {
        match obj {
            ManagedObject::Deployment(d) => Ok(Self::Deployment(d)),
            ManagedObject::DaemonSet(d) => Ok(Self::DaemonSet(d)),
            other => Err(StoreError::Invalid(format!("{} is not a workload", other.key()))),
        }
    }

    pub fn into_managed(self) -> ManagedObject {
        match self {
            Self::Deployment(d) => ManagedObject::Deployment(d),
            Self::DaemonSet(d) => ManagedObject::DaemonSet(d),
        }
    }

    pub fn name(&self) -> &str {
        let meta = match self {
            Self::Deployment(d) => &d.metadata,
            Self::DaemonSet(d) => &d.metadata,
        };
        meta.name.as_deref().unwrap_or("")
    }

    pub fn pod_template(&self) -> Option<&PodTemplateSpec> {
        match self {
            Self::Deployment(d) => d.spec.as_ref().map(|s| &s.template),
            Self::DaemonSet(d) => d.spec.as_ref().map(|s| &s.template),
        }
    }

    pub fn pod_template_mut(&mut self) -> &mut PodTemplateSpec {
        match self {
            Self::Deployment(d) => &mut d.spec.get_or_insert_with(Default::default).template,
            Self::DaemonSet(d) => &mut d.spec.get_or_insert_with(Default::default).template,
        }
    }

    pub fn pod_spec_mut(&mut self) -> &mut PodSpec {
        self.pod_template_mut().spec.get_or_insert_with(Default::default)
    }

    pub fn containers_mut(&mut self) -> &mut Vec<Container> { &mut self.pod_spec_mut().containers }

    pub fn containers(&self) -> &[Container] {
        self.pod_template()
            .and_then(|t| t.spec.as_ref())
            .map(|s| s.containers.as_slice())
            .unwrap_or(&[])
    }

    pub fn pod_annotations_mut(&mut self) -> &mut BTreeMap<String, String> {
        self.pod_template_mut()
            .metadata
            .get_or_insert_with(Default::default)
            .annotations
            .get_or_insert_with(Default::default)
    }

    pub fn node_selector(&self) -> Option<&BTreeMap<String, String>> {
        self.pod_template().and_then(|t| t.spec.as_ref()).and_then(|s| s.node_selector.as_ref())
    }

    /// Only Deployments carry a replica count; returns false for DaemonSets.
    pub fn set_replicas(&mut self, replicas: i32) -> bool {
        match self {
            Self::Deployment(d) => {
                d.spec.get_or_insert_with(Default::default).replicas = Some(replicas);
                true
            }
            Self::DaemonSet(_) => false,
        }
    }

    /// Whether the live object's observed state matches its spec.
    pub fn rollout(&self) -> Rollout {
        match self {
            Self::Deployment(d) => {
                let generation = d.metadata.generation.unwrap_or(0);
                let desired = d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
                let Some(st) = d.status.as_ref() else {
                    return Rollout::InProgress("deployment has no status yet".into());
                };
                if st.observed_generation.unwrap_or(0) < generation {
                    return Rollout::InProgress(format!(
                        "waiting for generation {} to be observed (at {})",
                        generation,
                        st.observed_generation.unwrap_or(0)
                    ));
                }
                let updated = st.updated_replicas.unwrap_or(0);
                let available = st.available_replicas.unwrap_or(0);
                if updated < desired {
                    return Rollout::InProgress(format!("{} of {} replicas updated", updated, desired));
                }
                if available < desired {
                    return Rollout::InProgress(format!("{} of {} replicas available", available, desired));
                }
                Rollout::Complete
            }
            Self::DaemonSet(d) => {
                let generation = d.metadata.generation.unwrap_or(0);
                let Some(st) = d.status.as_ref() else {
                    return Rollout::InProgress("daemonset has no status yet".into());
                };
                if st.observed_generation.unwrap_or(0) < generation {
                    return Rollout::InProgress(format!(
                        "waiting for generation {} to be observed (at {})",
                        generation,
                        st.observed_generation.unwrap_or(0)
                    ));
                }
                let desired = st.desired_number_scheduled;
                let updated = st.updated_number_scheduled.unwrap_or(0);
                let available = st.number_available.unwrap_or(0);
                if updated < desired {
                    return Rollout::InProgress(format!("{} of {} nodes updated", updated, desired));
                }
                if available < desired {
                    return Rollout::InProgress(format!("{} of {} nodes available", available, desired));
                }
                Rollout::Complete
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{DeploymentSpec, DeploymentStatus};

    #[test]
    fn from_yaml_picks_typed_variant_or_dynamic() {
        let sa = ManagedObject::from_yaml("apiVersion: v1\nkind: ServiceAccount\nmetadata:\n  name: node-sa\n  namespace: ns\n").unwrap();
        assert!(matches!(sa, ManagedObject::ServiceAccount(_)));
        assert_eq!(sa.key().to_string(), "ServiceAccount ns/node-sa");

        let vsc = ManagedObject::from_yaml(
            "apiVersion: snapshot.storage.k8s.io/v1\nkind: VolumeSnapshotClass\nmetadata:\n  name: csi-filestore\ndriver: filestore.csi.storage.gke.io\ndeletionPolicy: Delete\n",
        )
        .unwrap();
        match vsc.kind() {
            ObjectKind::Dynamic(gvk) => {
                assert_eq!(gvk.group, "snapshot.storage.k8s.io");
                assert_eq!(gvk.version, "v1");
                assert_eq!(gvk.kind, "VolumeSnapshotClass");
            }
            other => panic!("unexpected kind {:?}", other),
        }
        assert_eq!(vsc.to_json().unwrap()["driver"], "filestore.csi.storage.gke.io");
    }

    #[test]
    fn from_yaml_errors_are_friendly() {
        let e = ManagedObject::from_yaml("kind: Foo\nmetadata:\n  name: x\n").unwrap_err().to_string();
        assert!(e.contains("missing apiVersion"), "e={}", e);
        let e = ManagedObject::from_yaml("apiVersion: v1\nkind: ConfigMap\nmetadata: {}\n").unwrap_err().to_string();
        assert!(e.contains("missing metadata.name"), "e={}", e);
    }

    fn deployment(generation: i64, replicas: i32, status: Option<DeploymentStatus>) -> Workload {
        Workload::Deployment(Deployment {
            metadata: ObjectMeta { name: Some("ctrl".into()), generation: Some(generation), ..Default::default() },
            spec: Some(DeploymentSpec { replicas: Some(replicas), ..Default::default() }),
            status,
        })
    }

    #[test]
    fn deployment_rollout_tracks_generation_and_replicas() {
        assert!(matches!(deployment(2, 2, None).rollout(), Rollout::InProgress(_)));
        let stale = DeploymentStatus { observed_generation: Some(1), updated_replicas: Some(2), available_replicas: Some(2), ..Default::default() };
        assert!(matches!(deployment(2, 2, Some(stale)).rollout(), Rollout::InProgress(_)));
        let partial = DeploymentStatus { observed_generation: Some(2), updated_replicas: Some(1), available_replicas: Some(2), ..Default::default() };
        assert_eq!(deployment(2, 2, Some(partial)).rollout(), Rollout::InProgress("1 of 2 replicas updated".into()));
        let done = DeploymentStatus { observed_generation: Some(2), updated_replicas: Some(2), available_replicas: Some(2), ..Default::default() };
        assert_eq!(deployment(2, 2, Some(done)).rollout(), Rollout::Complete);
    }

    #[test]
    fn replicas_only_apply_to_deployments() {
        let mut d = deployment(1, 1, None);
        assert!(d.set_replicas(3));
        let mut ds = Workload::DaemonSet(DaemonSet::default());
        assert!(!ds.set_replicas(3));
    }
}
