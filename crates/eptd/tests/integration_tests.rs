//! End-to-end tests over the in-memory store and broker
//!
//! Covers the full distributor -> worker -> watcher pipeline, engine
//! scenarios that need topology tables, and shard routing.

use ept_common::RetryPolicy;
use sonic_eptd::broker::{worker_queues, Broker, MemoryBroker, CONTROL_CHANNEL};
use sonic_eptd::config_file::EptdConfig;
use sonic_eptd::distributor::{submit_event, Distributor};
use sonic_eptd::message::{FabricData, HelloData, Message, Sequencer, WorkData, WorkerRole};
use sonic_eptd::metrics::MetricsCollector;
use sonic_eptd::notify::RecordingNotifier;
use sonic_eptd::store::{filter, Collection, Db, MemoryStore};
use sonic_eptd::tables::{EpgRecord, NodeRecord, SubnetRecord, TunnelRecord};
use sonic_eptd::types::{
    vpc_pseudo_node, AddressType, CanonicalRecord, EndpointEvent, EventClass, EventStatus,
    MoveRecord, NotifyKind, FLAG_LOCAL, FLAG_VPC_ATTACHED,
};
use sonic_eptd::worker::Worker;
use sonic_eptd::{FabricCache, HistoryEngine};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};

const FABRIC: &str = "fab1";

fn mac_event(node: u32, ts: f64, intf: &str, flags: &[&str]) -> EndpointEvent {
    EndpointEvent {
        fabric: FABRIC.into(),
        node,
        vnid: 15001,
        addr: "00:50:56:aa:bb:cc".into(),
        addr_type: AddressType::Mac,
        class: EventClass::Mac,
        status: EventStatus::Created,
        ts,
        pctag: 32770,
        flags: flags.iter().map(|f| f.to_string()).collect(),
        intf_id: intf.into(),
        encap: "vlan-101".into(),
        rewrite_mac: String::new(),
        rewrite_bd: 0,
    }
}

fn ip_event(node: u32, ts: f64, addr: &str) -> EndpointEvent {
    EndpointEvent {
        fabric: FABRIC.into(),
        node,
        vnid: 2097154,
        addr: addr.into(),
        addr_type: AddressType::Ipv4,
        class: EventClass::Ip,
        status: EventStatus::Created,
        ts,
        pctag: 32770,
        flags: vec![FLAG_LOCAL.to_string()],
        intf_id: "eth1/10".into(),
        encap: "vlan-101".into(),
        rewrite_mac: "00:50:56:aa:bb:cc".into(),
        rewrite_bd: 15001,
    }
}

fn memory_db() -> (Arc<MemoryStore>, Db) {
    let store = Arc::new(MemoryStore::new());
    let db = Db::new(store.clone(), RetryPolicy::none());
    (store, db)
}

fn engine(db: &Db) -> HistoryEngine {
    let config = EptdConfig::default();
    let cache = FabricCache::new(FABRIC, db.clone(), &config.cache);
    HistoryEngine::new(cache, config.engine)
}

async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_pipeline_detects_move_and_ignores_replay() {
    let broker = Arc::new(MemoryBroker::new());
    let (store, db) = memory_db();
    let mut config = EptdConfig::default();
    config.cluster.hello_interval_ms = 20;
    config.cluster.pop_timeout_ms = 20;
    let config = Arc::new(config);
    let metrics = MetricsCollector::new().unwrap();
    let recorder = RecordingNotifier::new();
    let (shutdown_tx, shutdown) = watch::channel(false);

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(
        Distributor::new(broker.clone(), config.dead_interval(), config.pop_timeout())
            .run(shutdown.clone()),
    ));
    sleep(Duration::from_millis(50)).await;
    for id in ["worker-0", "worker-1"] {
        let worker = Worker::new(
            id,
            WorkerRole::Worker,
            broker.clone(),
            db.clone(),
            config.clone(),
            metrics.clone(),
        );
        tasks.push(tokio::spawn(worker.run(shutdown.clone())));
    }
    let watcher = Worker::new(
        "watcher-0",
        WorkerRole::Watcher,
        broker.clone(),
        db.clone(),
        config.clone(),
        metrics.clone(),
    )
    .with_notifier(Arc::new(recorder.clone()));
    tasks.push(tokio::spawn(watcher.run(shutdown.clone())));
    // several hello intervals so every worker is registered
    sleep(Duration::from_millis(200)).await;

    let sequencer = Sequencer::new();
    let events = [
        mac_event(101, 1.0, "eth1/1", &[FLAG_LOCAL]),
        mac_event(102, 2.0, "eth1/2", &[FLAG_LOCAL]),
    ];
    for event in events.clone() {
        submit_event(broker.as_ref(), &sequencer, event, 0).await.unwrap();
    }
    wait_for("move notification", || !recorder.jobs().is_empty()).await;

    let jobs = recorder.jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].kind, NotifyKind::Move);
    assert_eq!(jobs[0].node, 102);

    for event in events {
        submit_event(broker.as_ref(), &sequencer, event, 1).await.unwrap();
    }
    wait_for("replayed events", || metrics.events_received_total.get() >= 4.0).await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(metrics.events_rejected_total.get(), 2.0);
    assert_eq!(recorder.jobs().len(), 1);

    let by_endpoint = filter([
        ("fabric", FABRIC.into()),
        ("vnid", 15001u32.into()),
        ("addr", "00:50:56:aa:bb:cc".into()),
    ]);
    let moves: MoveRecord = db
        .find_one(Collection::Move, &by_endpoint)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(moves.history.len(), 1);
    assert_eq!(moves.history.events[0].src.node, 101);
    assert_eq!(moves.history.events[0].dst.node, 102);
    assert_eq!(store.count(Collection::History), 2);

    shutdown_tx.send(true).unwrap();
    for task in tasks {
        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}

#[tokio::test]
async fn test_control_messages_reach_every_worker() {
    let broker = Arc::new(MemoryBroker::new());
    let mut first = broker.subscribe(CONTROL_CHANNEL).await.unwrap();
    let mut second = broker.subscribe(CONTROL_CHANNEL).await.unwrap();
    let mut distributor = Distributor::new(
        broker.clone(),
        Duration::from_secs(3),
        Duration::from_millis(10),
    );

    let flush = Message::FlushFabric(FabricData {
        fabric: FABRIC.into(),
    });
    distributor
        .handle_submission(&flush.encode(7).unwrap())
        .await
        .unwrap();

    for sub in [&mut first, &mut second] {
        let (_, message) = Message::decode(&sub.recv().await.unwrap()).unwrap();
        assert_eq!(message, flush);
    }
}

#[tokio::test]
async fn test_sharding_is_deterministic_per_endpoint() {
    let broker = Arc::new(MemoryBroker::new());
    let now = Instant::now();
    let mut routers: Vec<Distributor> = (0..2)
        .map(|_| Distributor::new(broker.clone(), Duration::from_secs(3), Duration::from_millis(10)))
        .collect();
    let orders = [["w3", "w1", "w2"], ["w2", "w3", "w1"]];
    for (distributor, order) in routers.iter_mut().zip(orders) {
        for id in order {
            distributor.handle_hello(
                HelloData {
                    worker_id: id.into(),
                    role: WorkerRole::Worker,
                    queues: worker_queues(id),
                    start_time: 1.0,
                },
                1,
                now,
            );
        }
    }
    routers[1].handle_hello(
        HelloData {
            worker_id: "w0".into(),
            role: WorkerRole::Watcher,
            queues: worker_queues("w0"),
            start_time: 1.0,
        },
        1,
        now,
    );

    for n in 0..64 {
        let event = ip_event(101, 1.0, &format!("10.1.{}.{}", n / 8, n % 8));
        let high = routers[0].route(&WorkData::event(event.clone(), 0)).unwrap();
        let low = routers[0].route(&WorkData::event(event.clone(), 1)).unwrap();
        assert_eq!(high[3..], low[3..]);
        assert!(high.starts_with("q0_"));
        assert!(low.starts_with("q1_"));
        assert_eq!(Some(high), routers[1].route(&WorkData::event(event, 0)));
    }
}

#[tokio::test]
async fn test_stale_remote_learn_is_recorded_once() {
    let (store, db) = memory_db();
    db.replace_all(
        Collection::Tunnel,
        FABRIC,
        &[TunnelRecord {
            fabric: FABRIC.into(),
            node: 103,
            intf: "tunnel5".into(),
            dst: "10.0.72.67".into(),
            encap: "vxlan".into(),
            remote: 104,
        }],
    )
    .await
    .unwrap();
    let mut engine = engine(&db);

    engine
        .process(&mac_event(101, 1.0, "eth1/1", &[FLAG_LOCAL]))
        .await
        .unwrap();
    let outcome = engine
        .process(&mac_event(103, 2.0, "tunnel5", &[]))
        .await
        .unwrap();
    assert!(outcome.analyzed);
    assert_eq!(outcome.detections, vec![NotifyKind::Stale]);
    assert_eq!(store.count(Collection::Stale), 1);

    // unrelated update on the canonical node does not repeat the finding
    let outcome = engine
        .process(&mac_event(101, 3.0, "eth1/3", &[FLAG_LOCAL]))
        .await
        .unwrap();
    assert!(!outcome.detections.contains(&NotifyKind::Stale));
}

async fn seed_web_subnet(db: &Db) {
    db.replace_all(
        Collection::Epg,
        FABRIC,
        &[EpgRecord {
            fabric: FABRIC.into(),
            vrf: 2097154,
            pctag: 32770,
            name: "uni/tn-t1/ap-app/epg-web".into(),
            bd: 15001,
        }],
    )
    .await
    .unwrap();
    db.replace_all(
        Collection::Subnet,
        FABRIC,
        &[SubnetRecord {
            fabric: FABRIC.into(),
            bd: 15001,
            ip: "10.1.1.1/24".into(),
        }],
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn test_offsubnet_learn_is_detected() {
    let (store, db) = memory_db();
    seed_web_subnet(&db).await;
    let mut engine = engine(&db);

    let outcome = engine.process(&ip_event(101, 1.0, "10.1.1.20")).await.unwrap();
    assert!(outcome.analyzed);
    assert!(!outcome.detections.contains(&NotifyKind::OffSubnet));

    let outcome = engine.process(&ip_event(101, 2.0, "10.9.9.9")).await.unwrap();
    assert!(outcome.detections.contains(&NotifyKind::OffSubnet));
    assert_eq!(store.count(Collection::OffSubnet), 1);
}

#[tokio::test]
async fn test_first_local_learn_by_class() {
    let (store, db) = memory_db();
    seed_web_subnet(&db).await;
    let mut engine = engine(&db);

    // a local mac is present on its own, so it is analyzed at once
    let outcome = engine
        .process(&mac_event(101, 1.0, "eth1/1", &[FLAG_LOCAL]))
        .await
        .unwrap();
    assert!(outcome.analyzed);
    assert!(outcome.canonical_changed);
    assert_eq!(store.count(Collection::Endpoint), 1);

    // an ip without its rewrite leaves the canonical record alone but is
    // still checked against the epg subnets
    let mut bare = ip_event(101, 2.0, "10.9.9.9");
    bare.rewrite_mac.clear();
    bare.rewrite_bd = 0;
    let outcome = engine.process(&bare).await.unwrap();
    assert!(outcome.accepted);
    assert!(!outcome.analyzed);
    assert!(!outcome.canonical_changed);
    assert_eq!(outcome.detections, vec![NotifyKind::OffSubnet]);
    assert_eq!(store.count(Collection::Endpoint), 1);
    assert_eq!(store.count(Collection::OffSubnet), 1);
}

#[tokio::test]
async fn test_vpc_attached_learn_uses_pseudo_node() {
    let (_store, db) = memory_db();
    db.replace_all(
        Collection::Node,
        FABRIC,
        &[
            NodeRecord {
                fabric: FABRIC.into(),
                node_id: 101,
                name: "leaf101".into(),
                role: "leaf".into(),
                peer: 102,
                tep_ip: "10.0.72.64".into(),
            },
            NodeRecord {
                fabric: FABRIC.into(),
                node_id: 102,
                name: "leaf102".into(),
                role: "leaf".into(),
                peer: 101,
                tep_ip: "10.0.72.65".into(),
            },
        ],
    )
    .await
    .unwrap();
    let mut engine = engine(&db);

    let outcome = engine
        .process(&mac_event(101, 1.0, "po1", &[FLAG_LOCAL, FLAG_VPC_ATTACHED]))
        .await
        .unwrap();
    assert!(outcome.canonical_changed);
    let by_endpoint = filter([
        ("fabric", FABRIC.into()),
        ("vnid", 15001u32.into()),
        ("addr", "00:50:56:aa:bb:cc".into()),
    ]);
    let canonical: CanonicalRecord = db
        .find_one(Collection::Endpoint, &by_endpoint)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(canonical.history.events[0].node, vpc_pseudo_node(101, 102));

    // node 105 has no peer in the node table
    let mut orphan = mac_event(105, 2.0, "po3", &[FLAG_LOCAL, FLAG_VPC_ATTACHED]);
    orphan.addr = "00:50:56:aa:bb:dd".into();
    let outcome = engine.process(&orphan).await.unwrap();
    assert!(outcome.accepted);
    assert!(outcome.aborted);
    assert!(!outcome.analyzed);
}
