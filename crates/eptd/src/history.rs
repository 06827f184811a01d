//! Per-node history and the event acceptance state machine
//!
//! [`HistoryEngine::process`] takes one controller event through metadata
//! resolution, acceptance against the per-node history head, rapid-learn
//! accounting and (when required) the endpoint analysis in
//! [`crate::analysis`].
//!
//! Delivery is at-least-once and may be out of order, so acceptance is
//! idempotent: replaying an already accepted event is rejected because
//! nothing differs from the head it produced.

use crate::cache::FabricCache;
use crate::config_file::EngineConfig;
use crate::error::{EptError, Result};
use crate::store::{filter, Collection, Filter};
use crate::types::{
    EndpointEvent, EndpointKey, EventClass, EventStatus, History, HistoryEvent, NodeHistory,
    NotifyJob, NotifyKind, FLAG_LOCAL, FLAG_VPC_ATTACHED,
};
use serde_json::Value;
use tracing::{debug, instrument, warn};

/// Interface ids that never resolve to a remote node
const UNRESOLVED_INTERFACES: [&str; 3] = ["cached", "vtep", "unspecified"];

/// Result of processing one event
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outcome {
    /// The event changed the per-node history
    pub accepted: bool,
    /// Local resolution and derivations ran
    pub analyzed: bool,
    /// Analysis was abandoned after a topology lookup failure
    pub aborted: bool,
    /// The canonical record was updated
    pub canonical_changed: bool,
    /// The endpoint is currently flagged rapid
    pub rapid: bool,
    /// Transitions detected and recorded, notified or not
    pub detections: Vec<NotifyKind>,
    /// Notify jobs to hand to the watcher
    pub notifications: Vec<NotifyJob>,
}

/// Decision for an incoming per-node event
#[derive(Debug, Clone, PartialEq)]
pub enum Acceptance {
    Reject(&'static str),
    /// Push a new head
    Push(HistoryEvent),
    /// Same timestamp as the head: overwrite it
    ReplaceHead(HistoryEvent),
}

fn location_differs(a: &HistoryEvent, b: &HistoryEvent) -> bool {
    a.remote != b.remote
        || a.pctag != b.pctag
        || a.flags != b.flags
        || a.encap != b.encap
        || a.intf_id != b.intf_id
}

/// Decide whether `event` changes a history whose newest entry is `head`.
///
/// `event` must already carry resolved metadata.
pub fn accept(head: Option<&HistoryEvent>, mut event: HistoryEvent) -> Acceptance {
    let Some(head) = head else {
        return Acceptance::Push(event);
    };
    if head.ts > event.ts {
        return Acceptance::Reject("older than head");
    }
    let same_ts = head.ts == event.ts;
    let class = event.class;

    let merged = if class == Some(EventClass::IpRewriteAssoc) {
        let mut merged = head.clone();
        merged.ts = event.ts;
        if event.status == Some(EventStatus::Deleted) {
            event.rewrite_mac.clear();
            event.rewrite_bd = 0;
        }
        if merged.rewrite_mac == event.rewrite_mac && merged.rewrite_bd == event.rewrite_bd {
            return Acceptance::Reject("rewrite unchanged");
        }
        merged.rewrite_mac = event.rewrite_mac;
        merged.rewrite_bd = event.rewrite_bd;
        if merged.vnid_name.is_empty() {
            merged.vnid_name = event.vnid_name;
        }
        merged
    } else if head.is_deleted() && event.status != Some(EventStatus::Created) {
        return Acceptance::Reject("head already deleted");
    } else if head.is_deleted() && same_ts && head.class == class {
        return Acceptance::Reject("head deleted at same timestamp");
    } else {
        match event.status {
            Some(EventStatus::Deleted) => HistoryEvent {
                class,
                ts: event.ts,
                status: event.status,
                vnid_name: if event.vnid_name.is_empty() {
                    head.vnid_name.clone()
                } else {
                    event.vnid_name
                },
                ..Default::default()
            },
            Some(EventStatus::Modified) => {
                fill_from_head(&mut event, head);
                if !location_differs(&event, head) {
                    return Acceptance::Reject("no change");
                }
                event
            }
            _ => {
                carry_rewrite(&mut event, head);
                if !head.is_deleted() && !location_differs(&event, head) {
                    return Acceptance::Reject("no change");
                }
                event
            }
        }
    };

    if same_ts {
        Acceptance::ReplaceHead(merged)
    } else {
        Acceptance::Push(merged)
    }
}

fn carry_rewrite(event: &mut HistoryEvent, head: &HistoryEvent) {
    if event.rewrite_mac.is_empty() && event.rewrite_bd == 0 {
        event.rewrite_mac = head.rewrite_mac.clone();
        event.rewrite_bd = head.rewrite_bd;
    }
}

/// Modify events only carry changed attributes
fn fill_from_head(event: &mut HistoryEvent, head: &HistoryEvent) {
    if event.remote == 0 {
        event.remote = head.remote;
    }
    if event.pctag == 0 {
        event.pctag = head.pctag;
    }
    if event.flags.is_empty() {
        event.flags = head.flags.clone();
    }
    for (field, prior) in [
        (&mut event.encap, &head.encap),
        (&mut event.intf_id, &head.intf_id),
        (&mut event.intf_name, &head.intf_name),
        (&mut event.epg_name, &head.epg_name),
        (&mut event.vnid_name, &head.vnid_name),
    ] {
        if field.is_empty() {
            field.clone_from(prior);
        }
    }
    carry_rewrite(event, head);
}

/// Store filter for every per-node history of an endpoint
pub(crate) fn endpoint_filter(key: &EndpointKey) -> Filter {
    filter([
        ("fabric", Value::from(key.fabric.as_str())),
        ("vnid", Value::from(key.vnid)),
        ("addr", Value::from(key.addr.as_str())),
    ])
}

fn node_filter(key: &EndpointKey, node: u32) -> Filter {
    let mut by_node = endpoint_filter(key);
    by_node.insert("node".to_string(), Value::from(node));
    by_node
}

/// History engine for one fabric
pub struct HistoryEngine {
    pub(crate) fabric: String,
    pub(crate) cache: FabricCache,
    pub(crate) settings: EngineConfig,
}

impl HistoryEngine {
    pub fn new(cache: FabricCache, settings: EngineConfig) -> Self {
        Self {
            fabric: cache.fabric().to_string(),
            cache,
            settings,
        }
    }

    pub fn fabric(&self) -> &str {
        &self.fabric
    }

    pub fn cache(&self) -> &FabricCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut FabricCache {
        &mut self.cache
    }

    /// Process one event end to end
    #[instrument(skip_all, fields(fabric = %self.fabric, node = event.node, vnid = event.vnid, addr = %event.addr))]
    pub async fn process(&mut self, event: &EndpointEvent) -> Result<Outcome> {
        let mut outcome = Outcome::default();
        let key = event.key();
        let resolved = self.resolve(event).await?;

        let by_node = node_filter(&key, event.node);
        let mut record: NodeHistory = self
            .cache
            .db()
            .find_one(Collection::History, &by_node)
            .await?
            .unwrap_or_else(|| NodeHistory {
                key: key.clone(),
                node: event.node,
                history: History::default(),
            });
        let first_ever = record.history.is_empty();

        let entry = match accept(record.history.head(), resolved) {
            Acceptance::Reject(reason) => {
                debug!(reason, status = ?event.status, ts = event.ts, "Event rejected");
                return Ok(outcome);
            }
            Acceptance::Push(entry) => {
                record.history.push(entry.clone(), self.settings.max_node_events);
                entry
            }
            Acceptance::ReplaceHead(entry) => {
                record
                    .history
                    .replace_head(entry.clone(), self.settings.max_node_events);
                entry
            }
        };
        self.cache
            .db()
            .upsert(Collection::History, &by_node, &record)
            .await?;
        outcome.accepted = true;

        outcome.rapid = self.update_rapid(&key, event.ts, &mut outcome).await?;
        let no_impact = first_ever && is_no_impact(event, &entry);
        if outcome.rapid {
            debug!("Endpoint is rapid, skipping analysis");
        } else if no_impact {
            debug!("First event has no canonical impact, skipping analysis");
            self.detect_offsubnet(&key, event.node, &entry, &mut outcome).await?;
        } else {
            match self.analyze(&key, event.node, &entry, event.ts, &mut outcome).await {
                Ok(()) => outcome.analyzed = true,
                Err(EptError::PeerLookupFailed { fabric, node }) => {
                    warn!(fabric = %fabric, peer_of = node, "vpc peer lookup failed, analysis aborted");
                    outcome.aborted = true;
                }
                Err(e) => return Err(e),
            }
        }

        self.cache.persist_write_back().await?;
        Ok(outcome)
    }

    /// Build the history entry for an event with display metadata resolved
    async fn resolve(&mut self, event: &EndpointEvent) -> Result<HistoryEvent> {
        let mut flags = event.flags.clone();
        flags.sort();
        flags.dedup();

        let mut entry = HistoryEvent {
            class: Some(event.class),
            ts: event.ts,
            status: Some(event.status),
            pctag: event.pctag,
            flags,
            encap: event.encap.clone(),
            intf_id: event.intf_id.clone(),
            intf_name: event.intf_id.clone(),
            rewrite_mac: event.rewrite_mac.clone(),
            rewrite_bd: event.rewrite_bd,
            ..Default::default()
        };

        let vnid = self.cache.get_vnid(event.vnid).await?;
        if let Some(vnid) = &vnid {
            entry.vnid_name = vnid.name.clone();
        }
        if event.status == EventStatus::Deleted || event.class == EventClass::IpRewriteAssoc {
            return Ok(entry);
        }

        self.resolve_interface(event.node, &mut entry).await?;

        let vrf = if event.addr_type.is_ip() {
            event.vnid
        } else {
            vnid.map_or(0, |v| v.vrf)
        };
        if entry.pctag != 0 && vrf != 0 {
            if let Some(epg) = self.cache.get_epg(vrf, entry.pctag).await? {
                entry.epg_name = epg.name;
            }
        }
        Ok(entry)
    }

    async fn resolve_interface(&mut self, node: u32, entry: &mut HistoryEvent) -> Result<()> {
        let vpc_attached = entry.has_flag(FLAG_VPC_ATTACHED);
        if vpc_attached {
            entry.remote = self.cache.get_peer_node(node).await?.unwrap_or(0);
        }

        let intf = entry.intf_id.to_ascii_lowercase();
        if intf.is_empty() || UNRESOLVED_INTERFACES.contains(&intf.as_str()) {
            return Ok(());
        }

        if intf.starts_with("tunnel") {
            if let Some(tunnel) = self.cache.get_tunnel(node, &entry.intf_id).await? {
                if !vpc_attached {
                    entry.remote = tunnel.remote;
                }
                if tunnel.encap == "vxlan" {
                    entry.intf_name = format!("vl-{}", tunnel.dst);
                }
            }
        } else if intf.starts_with("po") {
            if let Some(pc) = self.cache.get_port_channel(node, &entry.intf_id).await? {
                entry.intf_name = pc.name;
            }
            if entry.has_flag(FLAG_LOCAL) {
                if let Some(vpc) = self.cache.get_vpc(node, &entry.intf_id).await? {
                    entry.intf_name = format!("vpc-{}", vpc.vpc);
                }
            }
        }
        Ok(())
    }
}

/// First events that cannot change the canonical record
fn is_no_impact(event: &EndpointEvent, entry: &HistoryEvent) -> bool {
    match event.class {
        EventClass::IpRewriteAssoc => true,
        EventClass::Ip => entry.has_flag(FLAG_LOCAL) && !entry.has_rewrite(),
        EventClass::Mac => false,
    }
}
