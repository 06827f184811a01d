//! Fabric Endpoint Tracker for SONiC
//!
//! eptd keeps a per-node and fabric-wide history of every endpoint (MAC,
//! IPv4, IPv6) learned in a fabric, and derives moves, stale learns,
//! off-subnet learns and rapid-learn conditions from that history.
//!
//! # Architecture
//!
//! ```text
//!   events ──▶ ept_submit ──▶ Distributor ──▶ q0_/q1_<worker> ──▶ Worker
//!                  ▲               │                                │
//!                  │               └──▶ ept_control (broadcast) ◀───┤
//!                  │                                                ▼
//!   TopologyMonitor (watcher) ◀── ept_topology_<fabric>       HistoryEngine
//!                                                                   │
//!                                            FabricCache ◀──────────┤
//!                                                                   ▼
//!                                                                 Store
//! ```
//!
//! Events are sharded on the endpoint address so every event for one
//! endpoint is processed by the same worker, in order.

pub mod analysis;
pub mod broker;
pub mod cache;
pub mod config_file;
pub mod distributor;
pub mod error;
pub mod history;
pub mod message;
pub mod metrics;
pub mod notify;
pub mod prefix;
pub mod store;
pub mod tables;
pub mod topology;
pub mod types;
pub mod worker;

pub use broker::{Broker, MemoryBroker, RedisBroker};
pub use cache::FabricCache;
pub use config_file::EptdConfig;
pub use distributor::{submit_event, Distributor};
pub use error::{EptError, Result};
pub use history::{HistoryEngine, Outcome};
pub use message::{Message, Sequencer, WorkerRole};
pub use metrics::MetricsCollector;
pub use notify::{LogNotifier, Notifier, RecordingNotifier};
pub use store::{Collection, Db, MemoryStore, RedisStore, Store};
pub use topology::{ControllerSession, FileSession, StructuralEvent, TopologyMonitor};
pub use types::{AddressType, EndpointEvent, EndpointKey, EventClass, EventStatus, NotifyJob, NotifyKind};
pub use worker::Worker;
