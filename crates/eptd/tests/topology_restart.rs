//! Structural change handling across monitor, distributor and workers

use ept_common::RetryPolicy;
use sonic_eptd::broker::{topology_queue, Broker, MemoryBroker, CONTROL_CHANNEL, SUBMIT_QUEUE};
use sonic_eptd::config_file::EptdConfig;
use sonic_eptd::distributor::Distributor;
use sonic_eptd::message::{Message, WorkerRole};
use sonic_eptd::metrics::MetricsCollector;
use sonic_eptd::store::{Collection, Db, MemoryStore};
use sonic_eptd::tables::{NodeRecord, TopologySnapshot};
use sonic_eptd::topology::{
    FileSession, Reaction, StructuralAction, StructuralClass, StructuralEvent, TopologyMonitor,
};
use sonic_eptd::worker::Worker;
use sonic_eptd::EptError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn write_snapshot(dir: &std::path::Path, nodes: &[u32]) {
    let snapshot = TopologySnapshot {
        nodes: nodes
            .iter()
            .map(|&node_id| NodeRecord {
                fabric: "ignored".into(),
                node_id,
                name: format!("leaf{node_id}"),
                role: "leaf".into(),
                peer: 0,
                tep_ip: String::new(),
            })
            .collect(),
        ..Default::default()
    };
    std::fs::write(
        dir.join("fab1.json"),
        serde_json::to_string_pretty(&snapshot).unwrap(),
    )
    .unwrap();
}

fn event(class: StructuralClass, ts: f64) -> StructuralEvent {
    StructuralEvent {
        class,
        ts,
        action: StructuralAction::Upsert,
        record: serde_json::Value::Null,
    }
}

/// Move everything the monitor submitted through the distributor
async fn relay(broker: &MemoryBroker, distributor: &mut Distributor) -> usize {
    let mut relayed = 0;
    while let Some((_, body)) = broker
        .pop(&[SUBMIT_QUEUE.to_string()], Duration::from_millis(1))
        .await
        .unwrap()
    {
        distributor.handle_submission(&body).await.unwrap();
        relayed += 1;
    }
    relayed
}

#[tokio::test]
async fn test_soft_restart_flushes_workers_once() {
    let dir = tempfile::tempdir().unwrap();
    write_snapshot(dir.path(), &[101, 102]);

    let broker = Arc::new(MemoryBroker::new());
    let store = Arc::new(MemoryStore::new());
    let db = Db::new(store.clone(), RetryPolicy::none());
    let mut control = broker.subscribe(CONTROL_CHANNEL).await.unwrap();
    let mut distributor = Distributor::new(
        broker.clone(),
        Duration::from_secs(3),
        Duration::from_millis(10),
    );
    let mut monitor = TopologyMonitor::new(
        "fab1",
        db.clone(),
        broker.clone(),
        Arc::new(FileSession::new(dir.path())),
    );
    let mut worker = Worker::new(
        "w1",
        WorkerRole::Worker,
        broker.clone(),
        db,
        Arc::new(EptdConfig::default()),
        MetricsCollector::new().unwrap(),
    );

    let reaction = monitor
        .handle(&event(StructuralClass::VpcDomain, 50.0))
        .await
        .unwrap();
    assert_eq!(reaction, Reaction::Rebuilt);
    assert_eq!(store.count(Collection::Node), 2);
    assert_eq!(relay(&broker, &mut distributor).await, 8);

    let mut kinds = Vec::new();
    while let Ok(body) = control.try_recv() {
        worker.on_control(&body).await.unwrap();
        let (_, message) = Message::decode(&body).unwrap();
        kinds.push(message.msg_type());
    }
    assert_eq!(kinds.len(), 8);
    assert_eq!(kinds.iter().filter(|k| **k == "flush-cache").count(), 7);

    // a new snapshot with a replayed, older event leaves the tables alone
    write_snapshot(dir.path(), &[101]);
    for ts in [10.0, 50.0] {
        let reaction = monitor
            .handle(&event(StructuralClass::NodeActivation, ts))
            .await
            .unwrap();
        assert_eq!(reaction, Reaction::Dropped);
    }
    assert_eq!(relay(&broker, &mut distributor).await, 0);
    assert_eq!(store.count(Collection::Node), 2);

    monitor
        .handle(&event(StructuralClass::NodeActivation, 60.0))
        .await
        .unwrap();
    assert_eq!(store.count(Collection::Node), 1);
    assert_eq!(monitor.last_rebuild_ts(), 60.0);
}

#[tokio::test]
async fn test_peering_change_restarts_monitor_loop() {
    let dir = tempfile::tempdir().unwrap();
    write_snapshot(dir.path(), &[101]);
    let broker = Arc::new(MemoryBroker::new());
    let db = Db::new(Arc::new(MemoryStore::new()), RetryPolicy::none());
    let monitor = TopologyMonitor::new(
        "fab1",
        db,
        broker.clone(),
        Arc::new(FileSession::new(dir.path())),
    );
    let (_shutdown_tx, shutdown) = watch::channel(false);
    let task = tokio::spawn(monitor.run(Duration::from_millis(10), shutdown));

    broker
        .push(&topology_queue("fab1"), "not json".into())
        .await
        .unwrap();
    let body = serde_json::to_string(&event(StructuralClass::PeeringPolicy, 5.0)).unwrap();
    broker.push(&topology_queue("fab1"), body).await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(EptError::HardRestart { .. })));
}
