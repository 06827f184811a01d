//! Core types for endpoint tracking
//!
//! Every record persisted by the tracker is defined here. Record key fields
//! are flattened to the top level of the stored document so the store can
//! filter on them (`fabric`, `vnid`, `addr`, `node`, ...).

use serde::{Deserialize, Serialize};

/// Flag set on events learned directly on the reporting switch
pub const FLAG_LOCAL: &str = "local";
/// Flag set on events learned on a vpc-attached interface
pub const FLAG_VPC_ATTACHED: &str = "vpc-attached";
/// Flag set on remote entries that bounce to the spine proxy
pub const FLAG_BOUNCE_TO_PROXY: &str = "bounce-to-proxy";

/// Endpoint address family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressType {
    Mac,
    Ipv4,
    Ipv6,
}

impl AddressType {
    /// Returns true for IPv4 and IPv6 endpoints
    #[inline]
    pub fn is_ip(&self) -> bool {
        matches!(self, Self::Ipv4 | Self::Ipv6)
    }
}

/// Controller object class an event was generated from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventClass {
    /// MAC endpoint (epmMacEp)
    Mac,
    /// IP endpoint (epmIpEp)
    Ip,
    /// IP to MAC rewrite association (epmRsMacEpToIpEpAtt)
    IpRewriteAssoc,
}

/// Object status reported by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Created,
    Modified,
    Deleted,
}

/// Immutable identity of an endpoint within a VRF (IP) or BD (MAC) scope
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointKey {
    pub fabric: String,
    pub vnid: u32,
    pub addr: String,
    pub addr_type: AddressType,
}

impl EndpointKey {
    pub fn new(fabric: impl Into<String>, vnid: u32, addr: impl Into<String>, addr_type: AddressType) -> Self {
        Self {
            fabric: fabric.into(),
            vnid,
            addr: addr.into(),
            addr_type,
        }
    }
}

impl std::fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.fabric, self.vnid, self.addr)
    }
}

/// Work item handed to the history engine: one controller event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointEvent {
    pub fabric: String,
    pub node: u32,
    pub vnid: u32,
    /// Endpoint address; the inner IP for rewrite associations
    pub addr: String,
    pub addr_type: AddressType,
    pub class: EventClass,
    pub status: EventStatus,
    /// Controller timestamp in fractional epoch seconds
    pub ts: f64,
    #[serde(default)]
    pub pctag: u32,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub intf_id: String,
    #[serde(default)]
    pub encap: String,
    #[serde(default)]
    pub rewrite_mac: String,
    #[serde(default)]
    pub rewrite_bd: u32,
}

impl EndpointEvent {
    pub fn key(&self) -> EndpointKey {
        EndpointKey::new(self.fabric.clone(), self.vnid, self.addr.clone(), self.addr_type)
    }

    /// Key used to shard the event onto a worker
    pub fn shard_key(&self) -> &str {
        &self.addr
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f == flag)
    }
}

/// One entry of a per-node history
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub class: Option<EventClass>,
    pub ts: f64,
    pub status: Option<EventStatus>,
    pub remote: u32,
    pub pctag: u32,
    pub flags: Vec<String>,
    pub encap: String,
    pub intf_id: String,
    pub intf_name: String,
    pub rewrite_mac: String,
    pub rewrite_bd: u32,
    pub epg_name: String,
    pub vnid_name: String,
}

impl HistoryEvent {
    pub fn is_deleted(&self) -> bool {
        self.status == Some(EventStatus::Deleted)
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f == flag)
    }

    pub fn has_rewrite(&self) -> bool {
        !self.rewrite_mac.is_empty() && self.rewrite_bd != 0
    }

    /// True if this entry may define the canonical location of the endpoint
    pub fn qualifies_local(&self, addr_type: AddressType) -> bool {
        !self.is_deleted()
            && self.has_flag(FLAG_LOCAL)
            && (!addr_type.is_ip() || self.has_rewrite())
    }
}

/// Bounded newest-first event list with a monotonic push counter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct History<T> {
    pub events: Vec<T>,
    /// Total number of events ever pushed
    pub count: u64,
}

impl<T> Default for History<T> {
    fn default() -> Self {
        Self {
            events: Vec::new(),
            count: 0,
        }
    }
}

impl<T> History<T> {
    pub fn head(&self) -> Option<&T> {
        self.events.first()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Pushes at the head and rotates out the oldest entries past `max_len`
    pub fn push(&mut self, event: T, max_len: usize) {
        self.events.insert(0, event);
        self.events.truncate(max_len.max(1));
        self.count += 1;
    }

    /// Overwrites the head in place; pushes if empty
    pub fn replace_head(&mut self, event: T, max_len: usize) {
        match self.events.first_mut() {
            Some(head) => *head = event,
            None => self.push(event, max_len),
        }
    }
}

/// Per-node history for one endpoint: (fabric, node, vnid, addr)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeHistory {
    #[serde(flatten)]
    pub key: EndpointKey,
    pub node: u32,
    #[serde(flatten)]
    pub history: History<HistoryEvent>,
}

/// Entry of the fabric-wide canonical history
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CanonicalEvent {
    /// Owning node, vpc pseudo-node, or 0 when the endpoint is nowhere
    pub node: u32,
    pub status: Option<EventStatus>,
    pub ts: f64,
    pub remote: u32,
    pub pctag: u32,
    pub flags: Vec<String>,
    pub encap: String,
    pub intf_id: String,
    pub intf_name: String,
    pub rewrite_mac: String,
    pub rewrite_bd: u32,
    pub epg_name: String,
    pub vnid_name: String,
}

impl CanonicalEvent {
    pub fn is_deleted(&self) -> bool {
        self.node == 0 || self.status == Some(EventStatus::Deleted)
    }

    /// Location attributes compared for updates and moves
    pub fn location(&self) -> (u32, u32, &str, &str, &str, u32) {
        (
            self.node,
            self.pctag,
            self.encap.as_str(),
            self.intf_id.as_str(),
            self.rewrite_mac.as_str(),
            self.rewrite_bd,
        )
    }

    pub fn from_history(node: u32, event: &HistoryEvent) -> Self {
        Self {
            node,
            status: event.status,
            ts: event.ts,
            remote: event.remote,
            pctag: event.pctag,
            flags: event.flags.clone(),
            encap: event.encap.clone(),
            intf_id: event.intf_id.clone(),
            intf_name: event.intf_name.clone(),
            rewrite_mac: event.rewrite_mac.clone(),
            rewrite_bd: event.rewrite_bd,
            epg_name: event.epg_name.clone(),
            vnid_name: event.vnid_name.clone(),
        }
    }

    /// Synthetic delete appended when the endpoint is local nowhere
    pub fn synthetic_delete(ts: f64, vnid_name: &str) -> Self {
        Self {
            status: Some(EventStatus::Deleted),
            ts,
            vnid_name: vnid_name.to_string(),
            ..Default::default()
        }
    }
}

/// A detected move between two canonical locations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveEvent {
    pub src: CanonicalEvent,
    pub dst: CanonicalEvent,
}

impl MoveEvent {
    /// True if both sides match on every location attribute
    pub fn same_as(&self, other: &MoveEvent) -> bool {
        self.src.location() == other.src.location() && self.dst.location() == other.dst.location()
    }
}

/// Attributes of a single per-node event tagged for stale/off-subnet dedupe
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeFinding {
    pub node: u32,
    pub ts: f64,
    pub remote: u32,
    /// Canonical node at detection time (stale findings only)
    #[serde(default)]
    pub expected_node: u32,
    /// Bridge domain vnid the subnets came from (off-subnet findings only)
    #[serde(default)]
    pub bd: u32,
    pub pctag: u32,
    pub encap: String,
    pub intf_id: String,
    pub intf_name: String,
    pub rewrite_mac: String,
    pub rewrite_bd: u32,
    pub epg_name: String,
    pub vnid_name: String,
}

impl NodeFinding {
    pub fn from_history(node: u32, event: &HistoryEvent) -> Self {
        Self {
            node,
            ts: event.ts,
            remote: event.remote,
            pctag: event.pctag,
            encap: event.encap.clone(),
            intf_id: event.intf_id.clone(),
            intf_name: event.intf_name.clone(),
            rewrite_mac: event.rewrite_mac.clone(),
            rewrite_bd: event.rewrite_bd,
            epg_name: event.epg_name.clone(),
            vnid_name: event.vnid_name.clone(),
            ..Default::default()
        }
    }

    /// True if both findings carry the same dedupe-relevant attributes
    pub fn same_as(&self, other: &NodeFinding) -> bool {
        self.node == other.node
            && self.remote == other.remote
            && self.intf_id == other.intf_id
            && self.pctag == other.pctag
            && self.encap == other.encap
            && self.rewrite_mac == other.rewrite_mac
            && self.rewrite_bd == other.rewrite_bd
    }
}

/// Endpoint-keyed bounded history (canonical, move, stale, off-subnet)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointRecord<T> {
    #[serde(flatten)]
    pub key: EndpointKey,
    #[serde(flatten)]
    pub history: History<T>,
}

impl<T> EndpointRecord<T> {
    pub fn new(key: EndpointKey) -> Self {
        Self {
            key,
            history: History::default(),
        }
    }
}

/// Canonical "best local" record of an endpoint
pub type CanonicalRecord = EndpointRecord<CanonicalEvent>;
/// Derived move history
pub type MoveRecord = EndpointRecord<MoveEvent>;
/// Derived stale-learn history
pub type StaleRecord = EndpointRecord<NodeFinding>;
/// Derived off-subnet history
pub type OffSubnetRecord = EndpointRecord<NodeFinding>;

/// Rapid-learn counters for one endpoint
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RapidCounters {
    pub fabric: String,
    pub vnid: u32,
    pub addr: String,
    pub window_start: f64,
    pub window_count: u64,
    pub total: u64,
    pub is_rapid: bool,
    pub rapid_until: f64,
}

/// Kind of derived transition a notification reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotifyKind {
    Move,
    Stale,
    OffSubnet,
    Rapid,
}

impl NotifyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Move => "move",
            Self::Stale => "stale",
            Self::OffSubnet => "offsubnet",
            Self::Rapid => "rapid",
        }
    }
}

/// Notification job emitted by the engine and handled by the watcher role
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyJob {
    pub kind: NotifyKind,
    #[serde(flatten)]
    pub key: EndpointKey,
    pub node: u32,
    pub ts: f64,
    pub detail: String,
}

/// Combine two vpc member node ids into a pseudo-node id
#[inline]
pub fn vpc_pseudo_node(n1: u32, n2: u32) -> u32 {
    (n1.max(n2) << 16) | n1.min(n2)
}

/// Split a pseudo-node id into its members; `None` for a physical node
#[inline]
pub fn vpc_members(node: u32) -> Option<(u32, u32)> {
    if node > 0xffff {
        Some((node >> 16, node & 0xffff))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vpc_pseudo_node_is_order_independent() {
        assert_eq!(vpc_pseudo_node(101, 102), vpc_pseudo_node(102, 101));
        assert_eq!(vpc_pseudo_node(101, 102), (102 << 16) | 101);
        assert_eq!(vpc_members(vpc_pseudo_node(101, 102)), Some((102, 101)));
        assert_eq!(vpc_members(101), None);
    }

    #[test]
    fn test_history_rotation_keeps_newest() {
        let mut history: History<u32> = History::default();
        for i in 0..5 {
            history.push(i, 3);
        }
        assert_eq!(history.events, vec![4, 3, 2]);
        assert_eq!(history.count, 5);
    }

    #[test]
    fn test_qualifies_local() {
        let mut event = HistoryEvent {
            status: Some(EventStatus::Created),
            flags: vec![FLAG_LOCAL.to_string()],
            ..Default::default()
        };
        assert!(event.qualifies_local(AddressType::Mac));
        assert!(!event.qualifies_local(AddressType::Ipv4));

        event.rewrite_mac = "00:00:00:00:00:01".to_string();
        event.rewrite_bd = 15000;
        assert!(event.qualifies_local(AddressType::Ipv4));

        event.status = Some(EventStatus::Deleted);
        assert!(!event.qualifies_local(AddressType::Ipv4));
    }

    #[test]
    fn test_record_serializes_flat_key() {
        let record: CanonicalRecord =
            EndpointRecord::new(EndpointKey::new("fab1", 2949120, "10.0.0.5", AddressType::Ipv4));
        let doc = serde_json::to_value(&record).unwrap();
        assert_eq!(doc["fabric"], "fab1");
        assert_eq!(doc["vnid"], 2949120);
        assert_eq!(doc["addr_type"], "ipv4");
        assert_eq!(doc["count"], 0);
    }
}
