#![forbid(unsafe_code)]

use filestore_core::{FactKind, Infrastructure, LogLevel, ManagementState, OperatorConfig};
use filestore_store::{spawn_ingest, FactDelta, FactStore, Lister, Op};
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

fn node(name: &str) -> Node {
    Node { metadata: ObjectMeta { name: Some(name.into()), ..Default::default() }, ..Default::default() }
}

#[tokio::test]
async fn ingest_batches_and_notifies_subscribers() {
    let store = FactStore::new(OperatorConfig::new("openshift-cluster-csi-drivers"));
    let mut changes = store.subscribe();
    let (tx, handle) = spawn_ingest(store.clone(), 64);

    tx.send(FactDelta::Node(Op::Applied(node("a")))).await.unwrap();
    tx.send(FactDelta::Node(Op::Applied(node("b")))).await.unwrap();
    tx.send(FactDelta::Infrastructure(Op::Applied(Infrastructure {
        name: "cluster".into(),
        infrastructure_name: "mycluster".into(),
        resource_labels: vec![],
    })))
    .await
    .unwrap();
    tx.send(FactDelta::Operator { management_state: ManagementState::Unmanaged, log_level: LogLevel::Debug })
        .await
        .unwrap();
    drop(tx);
    handle.await.unwrap();

    // Every kind sent shows up in some notification, in ascending epoch order.
    let mut seen = Vec::new();
    let mut last_epoch = 0;
    while let Ok(ch) = changes.try_recv() {
        assert!(ch.epoch > last_epoch);
        last_epoch = ch.epoch;
        seen.extend(ch.kinds.iter().copied());
    }
    assert!(seen.contains(&FactKind::Node));
    assert!(seen.contains(&FactKind::Infrastructure));
    assert!(seen.contains(&FactKind::OperatorConfig));
    assert_eq!(last_epoch, store.epoch());

    assert_eq!(store.nodes.list().len(), 2);
    assert_eq!(store.infrastructure.get("cluster").unwrap().infrastructure_name, "mycluster");
    let cfg = store.operator_config();
    assert_eq!(cfg.management_state, ManagementState::Unmanaged);
    assert_eq!(cfg.log_level, LogLevel::Debug);
    assert_eq!(store.snapshot().node_count, 2);
}
