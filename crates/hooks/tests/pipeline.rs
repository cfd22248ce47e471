use std::collections::BTreeMap;

use filestore_apply::{ManagedObject, Workload};
use filestore_core::{Infrastructure, OperatorConfig, ProxyConfig, ResourceLabel, GLOBAL_CONFIG_NAME};
use filestore_hooks::secret_hash::SECRET_HASH_ANNOTATION;
use filestore_hooks::{
    CustomLabelsHook, LogLevelHook, Pipeline, ProxyHook, ReplicaPolicy, ReplicasHook, SecretHashHook, TrustBundleHook,
};
use filestore_store::{FactDelta, FactStore, Op};
use k8s_openapi::api::core::v1::{Node, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;

const CONTROLLER: &str = r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: filestore-csi-driver-controller
  namespace: openshift-cluster-csi-drivers
spec:
  replicas: 1
  selector:
    matchLabels:
      app: filestore-csi-driver-controller
  template:
    metadata:
      labels:
        app: filestore-csi-driver-controller
    spec:
      nodeSelector:
        node-role.kubernetes.io/master: ""
      containers:
        - name: csi-driver
          image: driver:latest
          args:
            - --endpoint=unix:/csi/csi.sock
            - --v=${LOG_LEVEL}
        - name: csi-provisioner
          image: provisioner:latest
          args:
            - --csi-address=/csi/csi.sock
"#;

fn template() -> Workload {
    Workload::from_managed(ManagedObject::from_yaml(CONTROLLER).unwrap()).unwrap()
}

fn secret(name: &str) -> Secret {
    Secret {
        metadata: ObjectMeta { name: Some(name.into()), ..Default::default() },
        data: Some(BTreeMap::from([("key".to_string(), ByteString(b"value".to_vec()))])),
        ..Default::default()
    }
}

fn master(name: &str) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.into()),
            labels: Some(BTreeMap::from([("node-role.kubernetes.io/master".to_string(), String::new())])),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn controller_pipeline(store: &FactStore) -> Pipeline {
    Pipeline::new()
        .with(ProxyHook)
        .with(TrustBundleHook::new(store.config_maps.clone(), "filestore-trusted-ca-bundle"))
        .with(LogLevelHook)
        .with(SecretHashHook::new(store.secrets.clone(), ["gcp-filestore-cloud-credentials"]))
        .with(ReplicasHook::new(store.nodes.clone(), ReplicaPolicy::new(1, 2)))
        .with(CustomLabelsHook::new(store.infrastructure.clone()))
}

fn seeded() -> std::sync::Arc<FactStore> {
    let store = FactStore::new(OperatorConfig::new("openshift-cluster-csi-drivers"));
    store.apply(vec![
        FactDelta::Secret(Op::Applied(secret("gcp-filestore-cloud-credentials"))),
        FactDelta::Node(Op::Applied(master("m0"))),
        FactDelta::Node(Op::Applied(master("m1"))),
        FactDelta::Node(Op::Applied(master("m2"))),
        FactDelta::Proxy(Some(ProxyConfig { https_proxy: Some("http://proxy:3128".into()), ..Default::default() })),
    ]);
    store
}

#[test]
fn controller_pipeline_produces_full_desired_state() {
    let store = seeded();
    store.apply(vec![FactDelta::Infrastructure(Op::Applied(Infrastructure {
        name: GLOBAL_CONFIG_NAME.into(),
        infrastructure_name: "mycluster".into(),
        resource_labels: vec![ResourceLabel { key: "team".into(), value: "storage".into() }],
    }))]);

    let tpl = template();
    let out = controller_pipeline(&store).run(&store.operator_config(), &tpl).unwrap();

    let driver = &out.containers()[0];
    assert_eq!(
        driver.args.as_deref().unwrap(),
        &[
            "--endpoint=unix:/csi/csi.sock",
            "--v=2",
            "--extra-labels=team=storage,kubernetes-io-cluster-mycluster=owned",
        ]
    );
    for c in out.containers() {
        let env = c.env.as_ref().unwrap();
        assert!(env.iter().any(|e| e.name == "HTTPS_PROXY"));
    }
    let Workload::Deployment(d) = &out else { panic!("expected deployment") };
    let spec = d.spec.as_ref().unwrap();
    assert_eq!(spec.replicas, Some(2));
    let annotations = spec.template.metadata.as_ref().unwrap().annotations.as_ref().unwrap();
    assert!(annotations.contains_key(SECRET_HASH_ANNOTATION));

    // same facts, same result
    let again = controller_pipeline(&store).run(&store.operator_config(), &tpl).unwrap();
    assert_eq!(out, again);
    // the template is never mutated
    assert_eq!(tpl, template());
}

#[test]
fn missing_infrastructure_aborts_the_pipeline() {
    let store = seeded();
    let err = controller_pipeline(&store).run(&store.operator_config(), &template()).unwrap_err();
    assert_eq!(err.hook(), "custom-labels");
    assert!(err.to_string().contains("failed to fetch global Infrastructure object"));
}
