//! Wire schema for hello, work and control messages
//!
//! Every message is a JSON envelope `{msgType, sequence, data}`. The
//! envelope is decoded first and `data` is then parsed according to
//! `msgType`, so an unrecognized type is reported as
//! [`EptError::UnknownMessageType`] instead of a generic codec error.

use crate::error::{EptError, Result};
use crate::store::Collection;
use crate::types::{EndpointEvent, NotifyJob};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

pub const MSG_HELLO: &str = "hello";
pub const MSG_WORK: &str = "work";
pub const MSG_FLUSH_CACHE: &str = "flush-cache";
pub const MSG_FLUSH_FABRIC: &str = "flush-fabric";
pub const MSG_RESUBSCRIBE: &str = "resubscribe";
pub const MSG_RESTART: &str = "restart";

/// Role a worker process registers under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerRole {
    /// Runs history engines
    Worker,
    /// Handles notify jobs and hosts topology monitors
    Watcher,
}

impl WorkerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Worker => "worker",
            Self::Watcher => "watcher",
        }
    }
}

impl std::fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registration and heartbeat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloData {
    pub worker_id: String,
    pub role: WorkerRole,
    /// Queue names in priority order
    pub queues: Vec<String>,
    pub start_time: f64,
}

/// Work item body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "lowercase")]
pub enum WorkPayload {
    Event(EndpointEvent),
    Notify(NotifyJob),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkData {
    /// Shard key; the endpoint address
    pub shard: String,
    pub role: WorkerRole,
    pub payload: WorkPayload,
    /// Destination priority queue (0 or 1)
    #[serde(default)]
    pub queue_index: usize,
}

impl WorkData {
    /// Work item for an endpoint event, routed to a history worker
    pub fn event(event: EndpointEvent, queue_index: usize) -> Self {
        Self {
            shard: event.shard_key().to_string(),
            role: WorkerRole::Worker,
            payload: WorkPayload::Event(event),
            queue_index,
        }
    }

    /// Work item for a notification, routed to the watcher
    pub fn notify(job: NotifyJob) -> Self {
        Self {
            shard: job.key.addr.clone(),
            role: WorkerRole::Watcher,
            payload: WorkPayload::Notify(job),
            queue_index: 1,
        }
    }
}

/// Drop cached entries for one collection; `name` absent flushes it all
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlushCacheData {
    pub fabric: String,
    pub collection: Collection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FabricData {
    pub fabric: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartData {
    pub fabric: String,
    pub reason: String,
}

/// Decoded message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Hello(HelloData),
    Work(WorkData),
    FlushCache(FlushCacheData),
    /// Drop every cache and engine held for a fabric
    FlushFabric(FabricData),
    /// Ask the ingestion layer to recreate its subscription
    Resubscribe(FabricData),
    /// Hard restart; every process exits and is respawned
    Restart(RestartData),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    msg_type: String,
    #[serde(default)]
    sequence: u64,
    #[serde(default)]
    data: Value,
}

impl Message {
    pub fn msg_type(&self) -> &'static str {
        match self {
            Self::Hello(_) => MSG_HELLO,
            Self::Work(_) => MSG_WORK,
            Self::FlushCache(_) => MSG_FLUSH_CACHE,
            Self::FlushFabric(_) => MSG_FLUSH_FABRIC,
            Self::Resubscribe(_) => MSG_RESUBSCRIBE,
            Self::Restart(_) => MSG_RESTART,
        }
    }

    pub fn is_control(&self) -> bool {
        !matches!(self, Self::Hello(_) | Self::Work(_))
    }

    pub fn encode(&self, sequence: u64) -> Result<String> {
        let data = match self {
            Self::Hello(d) => serde_json::to_value(d)?,
            Self::Work(d) => serde_json::to_value(d)?,
            Self::FlushCache(d) => serde_json::to_value(d)?,
            Self::FlushFabric(d) | Self::Resubscribe(d) => serde_json::to_value(d)?,
            Self::Restart(d) => serde_json::to_value(d)?,
        };
        let envelope = Envelope {
            msg_type: self.msg_type().to_string(),
            sequence,
            data,
        };
        Ok(serde_json::to_string(&envelope)?)
    }

    /// Decode a message body, returning its sequence number and payload
    pub fn decode(body: &str) -> Result<(u64, Message)> {
        let envelope: Envelope = serde_json::from_str(body)?;
        let data = envelope.data;
        let message = match envelope.msg_type.as_str() {
            MSG_HELLO => Self::Hello(serde_json::from_value(data)?),
            MSG_WORK => Self::Work(serde_json::from_value(data)?),
            MSG_FLUSH_CACHE => Self::FlushCache(serde_json::from_value(data)?),
            MSG_FLUSH_FABRIC => Self::FlushFabric(serde_json::from_value(data)?),
            MSG_RESUBSCRIBE => Self::Resubscribe(serde_json::from_value(data)?),
            MSG_RESTART => Self::Restart(serde_json::from_value(data)?),
            other => return Err(EptError::UnknownMessageType(other.to_string())),
        };
        Ok((envelope.sequence, message))
    }
}

/// Monotonic per-sender sequence counter
#[derive(Debug, Default)]
pub struct Sequencer(AtomicU64);

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Encode `message` with the next sequence number
    pub fn encode(&self, message: &Message) -> Result<String> {
        message.encode(self.next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AddressType, EventClass, EventStatus};
    use pretty_assertions::assert_eq;

    fn sample_event() -> EndpointEvent {
        EndpointEvent {
            fabric: "fab1".into(),
            node: 101,
            vnid: 2949120,
            addr: "10.0.0.5".into(),
            addr_type: AddressType::Ipv4,
            class: EventClass::Ip,
            status: EventStatus::Created,
            ts: 1700000000.25,
            pctag: 49153,
            flags: vec!["local".into()],
            intf_id: "eth1/1".into(),
            encap: "vlan-100".into(),
            rewrite_mac: String::new(),
            rewrite_bd: 0,
        }
    }

    #[test]
    fn test_work_message_decodes_to_same_payload() {
        let msg = Message::Work(WorkData::event(sample_event(), 0));
        let body = msg.encode(7).unwrap();
        let (seq, decoded) = Message::decode(&body).unwrap();
        assert_eq!(seq, 7);
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_hello_wire_format() {
        let msg = Message::Hello(HelloData {
            worker_id: "w1".into(),
            role: WorkerRole::Worker,
            queues: vec!["q0_w1".into(), "q1_w1".into()],
            start_time: 1.5,
        });
        let value: Value = serde_json::from_str(&msg.encode(3).unwrap()).unwrap();
        assert_eq!(value["msgType"], "hello");
        assert_eq!(value["sequence"], 3);
        assert_eq!(value["data"]["workerId"], "w1");
        assert_eq!(value["data"]["queues"][1], "q1_w1");
        assert_eq!(value["data"]["startTime"], 1.5);
    }

    #[test]
    fn test_flush_cache_name_is_optional() {
        let body = r#"{"msgType":"flush-cache","sequence":1,"data":{"fabric":"fab1","collection":"epg"}}"#;
        let (_, msg) = Message::decode(body).unwrap();
        assert_eq!(
            msg,
            Message::FlushCache(FlushCacheData {
                fabric: "fab1".into(),
                collection: Collection::Epg,
                name: None,
            })
        );
        assert!(msg.is_control());
    }

    #[test]
    fn test_unknown_type_is_reported() {
        let body = r#"{"msgType":"bogus","sequence":1,"data":{}}"#;
        match Message::decode(body) {
            Err(EptError::UnknownMessageType(t)) => assert_eq!(t, "bogus"),
            other => panic!("unexpected decode result: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_body_is_codec_error() {
        assert!(matches!(Message::decode("not json"), Err(EptError::Codec(_))));
        let missing = r#"{"msgType":"work","sequence":1,"data":{"shard":"x"}}"#;
        assert!(matches!(Message::decode(missing), Err(EptError::Codec(_))));
    }

    #[test]
    fn test_sequencer_is_monotonic() {
        let seq = Sequencer::new();
        assert_eq!(seq.next(), 1);
        assert_eq!(seq.next(), 2);
        let (n, _) = Message::decode(
            &seq.encode(&Message::FlushFabric(FabricData { fabric: "fab1".into() })).unwrap(),
        )
        .unwrap();
        assert_eq!(n, 3);
    }
}
