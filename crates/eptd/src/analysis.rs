//! Endpoint analysis: local resolution, canonical record, derived findings
//!
//! Runs after an event has been accepted into a per-node history. The
//! endpoint's latest per-node entries decide where it is local; the
//! canonical record tracks that location over time, and moves, stale remote
//! learns and off-subnet learns are derived from it. Every derived record is
//! deduplicated against its newest stored entry so replays never append.

use crate::config_file::EngineConfig;
use crate::error::{EptError, Result};
use crate::history::{endpoint_filter, HistoryEngine, Outcome};
use crate::store::Collection;
use crate::types::{
    vpc_members, vpc_pseudo_node, AddressType, CanonicalEvent, CanonicalRecord, EndpointKey,
    EndpointRecord, HistoryEvent, MoveEvent, MoveRecord, NodeFinding, NodeHistory, NotifyJob,
    NotifyKind, OffSubnetRecord, RapidCounters, StaleRecord, FLAG_BOUNCE_TO_PROXY, FLAG_LOCAL,
    FLAG_VPC_ATTACHED,
};
use tracing::{debug, info};

/// Most recent locally learned entry among the per-node heads.
///
/// Ties on timestamp go to the lowest node id.
pub fn best_local(addr_type: AddressType, histories: &[NodeHistory]) -> Option<(u32, &HistoryEvent)> {
    histories
        .iter()
        .filter_map(|h| {
            h.history
                .head()
                .filter(|e| e.qualifies_local(addr_type))
                .map(|e| (h.node, e))
        })
        .fold(None, |best, (node, event)| match best {
            Some((best_node, best_event)) => {
                let newer = event.ts > best_event.ts
                    || (event.ts == best_event.ts && node < best_node);
                if newer {
                    Some((node, event))
                } else {
                    Some((best_node, best_event))
                }
            }
            None => Some((node, event)),
        })
}

/// Apply the resolved local presence to the canonical record.
///
/// Returns true when the record changed. With no local presence a synthetic
/// delete is appended once; a re-learn within the transitory window of a
/// delete overwrites that delete instead of appending. The history stays
/// newest first: a transition older than the head is stamped with the
/// triggering event's time, or ignored when that is older too.
pub fn update_canonical(
    record: &mut CanonicalRecord,
    local: Option<CanonicalEvent>,
    ts: f64,
    settings: &EngineConfig,
) -> bool {
    let prior = record.history.head().cloned();
    let mut next = match (local, &prior) {
        (Some(event), _) => event,
        (None, Some(head)) if !head.is_deleted() => CanonicalEvent::synthetic_delete(ts, &head.vnid_name),
        (None, _) => return false,
    };

    if let Some(head) = &prior {
        if head.is_deleted() == next.is_deleted() && head.location() == next.location() {
            return false;
        }
        if next.ts < head.ts {
            if ts < head.ts {
                return false;
            }
            next.ts = ts;
        }
    }

    let collapse = prior.as_ref().is_some_and(|head| {
        head.is_deleted()
            && !next.is_deleted()
            && next.ts >= head.ts
            && next.ts - head.ts <= settings.transitory_delete_secs
    });
    if collapse {
        record
            .history
            .replace_head(next, settings.max_endpoint_events);
    } else {
        record.history.push(next, settings.max_endpoint_events);
    }
    true
}

/// Move between the two newest canonical entries, if any
pub fn derive_move(record: &CanonicalRecord) -> Option<MoveEvent> {
    let [dst, src, ..] = record.history.events.as_slice() else {
        return None;
    };
    if dst.is_deleted() || src.is_deleted() || dst.location() == src.location() {
        return None;
    }
    Some(MoveEvent {
        src: src.clone(),
        dst: dst.clone(),
    })
}

/// Remote learns that point away from the canonical location
pub fn find_stale(record: &CanonicalRecord, histories: &[NodeHistory]) -> Vec<NodeFinding> {
    let Some(canonical) = record.history.head() else {
        return Vec::new();
    };
    let members = vpc_members(canonical.node);

    histories
        .iter()
        .filter_map(|h| {
            let event = h.history.head()?;
            if event.is_deleted()
                || event.has_flag(FLAG_LOCAL)
                || event.has_flag(FLAG_BOUNCE_TO_PROXY)
                || event.remote == 0
            {
                return None;
            }
            let expected = !canonical.is_deleted()
                && (event.remote == canonical.node
                    || members.is_some_and(|(a, b)| event.remote == a || event.remote == b));
            if expected {
                return None;
            }
            let mut finding = NodeFinding::from_history(h.node, event);
            finding.expected_node = if canonical.is_deleted() { 0 } else { canonical.node };
            Some(finding)
        })
        .collect()
}

/// Append `finding` unless the newest entry for its node matches it
pub fn record_finding(record: &mut EndpointRecord<NodeFinding>, finding: NodeFinding, max_len: usize) -> bool {
    let duplicate = record
        .history
        .events
        .iter()
        .find(|prior| prior.node == finding.node)
        .is_some_and(|prior| prior.same_as(&finding));
    if duplicate {
        return false;
    }
    record.history.push(finding, max_len);
    true
}

/// Count one accepted event. Returns true when the endpoint enters the
/// rapid state.
pub fn bump_rapid(counters: &mut RapidCounters, ts: f64, settings: &EngineConfig) -> bool {
    if counters.window_count == 0 || ts - counters.window_start > settings.rapid_window_secs {
        counters.window_start = ts;
        counters.window_count = 0;
    }
    counters.window_count += 1;
    counters.total += 1;

    if counters.is_rapid && ts > counters.rapid_until {
        counters.is_rapid = false;
    }
    if !counters.is_rapid && counters.window_count > settings.rapid_threshold {
        counters.is_rapid = true;
        counters.rapid_until = ts + settings.rapid_holdtime_secs;
        return true;
    }
    false
}

fn notify_job(kind: NotifyKind, key: &EndpointKey, node: u32, ts: f64, detail: String) -> NotifyJob {
    NotifyJob {
        kind,
        key: key.clone(),
        node,
        ts,
        detail,
    }
}

impl HistoryEngine {
    /// Update rapid counters for an accepted event; true while rapid
    pub(crate) async fn update_rapid(&mut self, key: &EndpointKey, ts: f64, outcome: &mut Outcome) -> Result<bool> {
        let mut counters = self.cache.rapid_counters(key.vnid, &key.addr).await?;
        let entered = bump_rapid(&mut counters, ts, &self.settings);
        let rapid = counters.is_rapid;
        if entered {
            info!(
                endpoint = %key,
                count = counters.window_count,
                until = counters.rapid_until,
                "Endpoint flagged rapid"
            );
            outcome.detections.push(NotifyKind::Rapid);
            if self.settings.notify_rapid {
                let detail = format!(
                    "{} events within {}s",
                    counters.window_count, self.settings.rapid_window_secs
                );
                outcome
                    .notifications
                    .push(notify_job(NotifyKind::Rapid, key, 0, ts, detail));
            }
        }
        self.cache.put_rapid_counters(counters);
        Ok(rapid)
    }

    /// Local resolution, canonical update and derivations for one endpoint
    pub(crate) async fn analyze(
        &mut self,
        key: &EndpointKey,
        node: u32,
        entry: &HistoryEvent,
        ts: f64,
        outcome: &mut Outcome,
    ) -> Result<()> {
        let by_endpoint = endpoint_filter(key);
        let histories: Vec<NodeHistory> = self
            .cache
            .db()
            .find(Collection::History, &by_endpoint)
            .await?;

        let local = self.resolve_local(key.addr_type, &histories).await?;
        let mut canonical: CanonicalRecord = self
            .cache
            .db()
            .find_one(Collection::Endpoint, &by_endpoint)
            .await?
            .unwrap_or_else(|| EndpointRecord::new(key.clone()));

        if update_canonical(&mut canonical, local, ts, &self.settings) {
            self.cache
                .db()
                .upsert(Collection::Endpoint, &by_endpoint, &canonical)
                .await?;
            outcome.canonical_changed = true;
            debug!(endpoint = %key, node = canonical.history.head().map_or(0, |h| h.node), "Canonical record updated");
            self.detect_move(key, &canonical, outcome).await?;
        }

        self.detect_stale(key, &canonical, &histories, ts, outcome)
            .await?;
        self.detect_offsubnet(key, node, entry, outcome).await?;
        Ok(())
    }

    async fn resolve_local(
        &mut self,
        addr_type: AddressType,
        histories: &[NodeHistory],
    ) -> Result<Option<CanonicalEvent>> {
        let Some((node, event)) = best_local(addr_type, histories) else {
            return Ok(None);
        };
        if !event.has_flag(FLAG_VPC_ATTACHED) {
            return Ok(Some(CanonicalEvent::from_history(node, event)));
        }
        let peer = self
            .cache
            .get_peer_node(node)
            .await?
            .ok_or_else(|| EptError::PeerLookupFailed {
                fabric: self.fabric.clone(),
                node,
            })?;
        Ok(Some(CanonicalEvent::from_history(
            vpc_pseudo_node(node, peer),
            event,
        )))
    }

    async fn detect_move(&mut self, key: &EndpointKey, canonical: &CanonicalRecord, outcome: &mut Outcome) -> Result<()> {
        let Some(found) = derive_move(canonical) else {
            return Ok(());
        };
        let by_endpoint = endpoint_filter(key);
        let mut record: MoveRecord = self
            .cache
            .db()
            .find_one(Collection::Move, &by_endpoint)
            .await?
            .unwrap_or_else(|| EndpointRecord::new(key.clone()));
        if record.history.head().is_some_and(|prior| prior.same_as(&found)) {
            debug!(endpoint = %key, "Duplicate move suppressed");
            return Ok(());
        }

        info!(
            endpoint = %key,
            src_node = found.src.node,
            src_intf = %found.src.intf_name,
            dst_node = found.dst.node,
            dst_intf = %found.dst.intf_name,
            "Endpoint move detected"
        );
        let job = notify_job(
            NotifyKind::Move,
            key,
            found.dst.node,
            found.dst.ts,
            format!(
                "moved from node {} intf {} to node {} intf {}",
                found.src.node, found.src.intf_name, found.dst.node, found.dst.intf_name
            ),
        );
        record.history.push(found, self.settings.max_move_events);
        self.cache
            .db()
            .upsert(Collection::Move, &by_endpoint, &record)
            .await?;

        outcome.detections.push(NotifyKind::Move);
        if self.settings.notify_move {
            outcome.notifications.push(job);
        }
        Ok(())
    }

    async fn detect_stale(
        &mut self,
        key: &EndpointKey,
        canonical: &CanonicalRecord,
        histories: &[NodeHistory],
        ts: f64,
        outcome: &mut Outcome,
    ) -> Result<()> {
        let findings = find_stale(canonical, histories);
        if findings.is_empty() {
            return Ok(());
        }
        let by_endpoint = endpoint_filter(key);
        let mut record: StaleRecord = self
            .cache
            .db()
            .find_one(Collection::Stale, &by_endpoint)
            .await?
            .unwrap_or_else(|| EndpointRecord::new(key.clone()));

        let mut changed = false;
        for finding in findings {
            let (node, remote, expected) = (finding.node, finding.remote, finding.expected_node);
            if !record_finding(&mut record, finding, self.settings.max_stale_events) {
                continue;
            }
            changed = true;
            info!(endpoint = %key, node, remote, expected, "Stale endpoint detected");
            outcome.detections.push(NotifyKind::Stale);
            if self.settings.notify_stale {
                outcome.notifications.push(notify_job(
                    NotifyKind::Stale,
                    key,
                    node,
                    ts,
                    format!("points to node {} expected node {}", remote, expected),
                ));
            }
        }
        if changed {
            self.cache
                .db()
                .upsert(Collection::Stale, &by_endpoint, &record)
                .await?;
        }
        Ok(())
    }

    pub(crate) async fn detect_offsubnet(
        &mut self,
        key: &EndpointKey,
        node: u32,
        entry: &HistoryEvent,
        outcome: &mut Outcome,
    ) -> Result<()> {
        if !key.addr_type.is_ip() || entry.is_deleted() || entry.pctag == 0 {
            return Ok(());
        }
        if !self.cache.is_offsubnet(key.vnid, entry.pctag, &key.addr).await? {
            return Ok(());
        }

        let mut finding = NodeFinding::from_history(node, entry);
        finding.bd = self
            .cache
            .get_epg(key.vnid, entry.pctag)
            .await?
            .map_or(0, |epg| epg.bd);
        let bd = finding.bd;

        let by_endpoint = endpoint_filter(key);
        let mut record: OffSubnetRecord = self
            .cache
            .db()
            .find_one(Collection::OffSubnet, &by_endpoint)
            .await?
            .unwrap_or_else(|| EndpointRecord::new(key.clone()));
        if !record_finding(&mut record, finding, self.settings.max_offsubnet_events) {
            return Ok(());
        }
        self.cache
            .db()
            .upsert(Collection::OffSubnet, &by_endpoint, &record)
            .await?;

        info!(endpoint = %key, node, pctag = entry.pctag, bd, "Off-subnet endpoint detected");
        outcome.detections.push(NotifyKind::OffSubnet);
        if self.settings.notify_offsubnet {
            outcome.notifications.push(notify_job(
                NotifyKind::OffSubnet,
                key,
                node,
                entry.ts,
                format!("learned with pctag {} outside subnets of bd {}", entry.pctag, bd),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventClass, EventStatus, History};
    use pretty_assertions::assert_eq;

    fn key() -> EndpointKey {
        EndpointKey::new("fab1", 2949120, "10.0.0.5", AddressType::Ipv4)
    }

    fn local(ts: f64, intf: &str) -> HistoryEvent {
        HistoryEvent {
            class: Some(EventClass::Ip),
            ts,
            status: Some(EventStatus::Created),
            pctag: 49153,
            flags: vec![FLAG_LOCAL.to_string()],
            intf_id: intf.into(),
            intf_name: intf.into(),
            rewrite_mac: "00:11:22:33:44:55".into(),
            rewrite_bd: 15001,
            ..Default::default()
        }
    }

    fn remote(ts: f64, remote: u32) -> HistoryEvent {
        HistoryEvent {
            class: Some(EventClass::Ip),
            ts,
            status: Some(EventStatus::Created),
            remote,
            intf_id: "tunnel5".into(),
            ..Default::default()
        }
    }

    fn node_history(node: u32, head: HistoryEvent) -> NodeHistory {
        let mut history = History::default();
        history.push(head, 8);
        NodeHistory {
            key: key(),
            node,
            history,
        }
    }

    #[test]
    fn test_best_local_prefers_newest_then_lowest_node() {
        let histories = vec![
            node_history(103, local(10.0, "eth1/3")),
            node_history(101, local(12.0, "eth1/1")),
            node_history(102, local(12.0, "eth1/2")),
            node_history(104, remote(20.0, 101)),
        ];
        let (node, event) = best_local(AddressType::Ipv4, &histories).unwrap();
        assert_eq!(node, 101);
        assert_eq!(event.intf_id, "eth1/1");
    }

    #[test]
    fn test_best_local_ignores_ip_without_rewrite() {
        let mut no_rewrite = local(10.0, "eth1/1");
        no_rewrite.rewrite_mac.clear();
        no_rewrite.rewrite_bd = 0;
        let histories = vec![node_history(101, no_rewrite)];
        assert!(best_local(AddressType::Ipv4, &histories).is_none());
    }

    #[test]
    fn test_canonical_synthetic_delete_once() {
        let settings = EngineConfig::default();
        let mut record: CanonicalRecord = EndpointRecord::new(key());
        assert!(!update_canonical(&mut record, None, 5.0, &settings));

        let present = CanonicalEvent::from_history(101, &local(10.0, "eth1/1"));
        assert!(update_canonical(&mut record, Some(present.clone()), 10.0, &settings));
        assert!(!update_canonical(&mut record, Some(present), 11.0, &settings));

        assert!(update_canonical(&mut record, None, 20.0, &settings));
        let head = record.history.head().unwrap();
        assert!(head.is_deleted());
        assert_eq!(head.node, 0);
        assert_eq!(head.ts, 20.0);
        assert!(!update_canonical(&mut record, None, 21.0, &settings));
        assert_eq!(record.history.len(), 2);
    }

    #[test]
    fn test_transitory_delete_is_collapsed() {
        let settings = EngineConfig {
            transitory_delete_secs: 3.0,
            ..Default::default()
        };
        let mut record: CanonicalRecord = EndpointRecord::new(key());
        update_canonical(&mut record, Some(CanonicalEvent::from_history(101, &local(10.0, "eth1/1"))), 10.0, &settings);
        update_canonical(&mut record, None, 20.0, &settings);

        let relearn = CanonicalEvent::from_history(102, &local(21.0, "eth1/2"));
        assert!(update_canonical(&mut record, Some(relearn), 21.0, &settings));
        assert_eq!(record.history.len(), 2);
        assert_eq!(record.history.head().unwrap().node, 102);

        // the collapsed flap still shows as a move
        let found = derive_move(&record).unwrap();
        assert_eq!(found.src.node, 101);
        assert_eq!(found.dst.node, 102);
    }

    #[test]
    fn test_relearn_after_window_appends() {
        let settings = EngineConfig::default();
        let mut record: CanonicalRecord = EndpointRecord::new(key());
        update_canonical(&mut record, Some(CanonicalEvent::from_history(101, &local(10.0, "eth1/1"))), 10.0, &settings);
        update_canonical(&mut record, None, 20.0, &settings);
        update_canonical(&mut record, Some(CanonicalEvent::from_history(101, &local(60.0, "eth1/1"))), 60.0, &settings);
        assert_eq!(record.history.len(), 3);
        assert!(derive_move(&record).is_none());
    }

    #[test]
    fn test_canonical_history_stays_newest_first() {
        let settings = EngineConfig::default();
        let mut record: CanonicalRecord = EndpointRecord::new(key());
        update_canonical(&mut record, Some(CanonicalEvent::from_history(101, &local(10.0, "eth1/1"))), 10.0, &settings);
        update_canonical(&mut record, Some(CanonicalEvent::from_history(102, &local(12.0, "eth1/2"))), 12.0, &settings);

        // late event from before the head changes nothing
        let stale = CanonicalEvent::from_history(101, &local(10.0, "eth1/1"));
        assert!(!update_canonical(&mut record, Some(stale.clone()), 11.0, &settings));
        assert_eq!(record.history.len(), 2);
        assert_eq!(record.history.head().unwrap().node, 102);

        // 102 went away at 15, so 101 owns the endpoint again from then on
        assert!(update_canonical(&mut record, Some(stale), 15.0, &settings));
        let ts: Vec<f64> = record.history.events.iter().map(|e| e.ts).collect();
        assert_eq!(ts, vec![15.0, 12.0, 10.0]);
        assert_eq!(record.history.head().unwrap().node, 101);
    }

    #[test]
    fn test_move_needs_two_live_entries() {
        let settings = EngineConfig::default();
        let mut record: CanonicalRecord = EndpointRecord::new(key());
        update_canonical(&mut record, Some(CanonicalEvent::from_history(101, &local(10.0, "eth1/1"))), 10.0, &settings);
        assert!(derive_move(&record).is_none());
        update_canonical(&mut record, Some(CanonicalEvent::from_history(101, &local(11.0, "eth1/7"))), 11.0, &settings);
        let found = derive_move(&record).unwrap();
        assert_eq!(found.src.intf_id, "eth1/1");
        assert_eq!(found.dst.intf_id, "eth1/7");
    }

    #[test]
    fn test_stale_detection() {
        let settings = EngineConfig::default();
        let mut record: CanonicalRecord = EndpointRecord::new(key());
        update_canonical(&mut record, Some(CanonicalEvent::from_history(101, &local(10.0, "eth1/1"))), 10.0, &settings);

        let histories = vec![
            node_history(101, local(10.0, "eth1/1")),
            node_history(102, remote(11.0, 101)),
            node_history(103, remote(11.0, 104)),
            node_history(105, {
                let mut e = remote(11.0, 104);
                e.flags = vec![FLAG_BOUNCE_TO_PROXY.to_string()];
                e
            }),
        ];
        let stale = find_stale(&record, &histories);
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].node, 103);
        assert_eq!(stale[0].remote, 104);
        assert_eq!(stale[0].expected_node, 101);
    }

    #[test]
    fn test_stale_accepts_vpc_members() {
        let settings = EngineConfig::default();
        let mut record: CanonicalRecord = EndpointRecord::new(key());
        let pseudo = vpc_pseudo_node(101, 102);
        update_canonical(&mut record, Some(CanonicalEvent::from_history(pseudo, &local(10.0, "po1"))), 10.0, &settings);

        let histories = vec![
            node_history(103, remote(11.0, 101)),
            node_history(104, remote(11.0, 102)),
            node_history(105, remote(11.0, pseudo)),
        ];
        assert!(find_stale(&record, &histories).is_empty());
    }

    #[test]
    fn test_stale_when_local_nowhere() {
        let settings = EngineConfig::default();
        let mut record: CanonicalRecord = EndpointRecord::new(key());
        update_canonical(&mut record, Some(CanonicalEvent::from_history(101, &local(10.0, "eth1/1"))), 10.0, &settings);
        update_canonical(&mut record, None, 20.0, &settings);

        let stale = find_stale(&record, &[node_history(102, remote(21.0, 101))]);
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].expected_node, 0);
    }

    #[test]
    fn test_record_finding_dedupes_per_node() {
        let mut record: StaleRecord = EndpointRecord::new(key());
        let finding = NodeFinding::from_history(103, &remote(11.0, 104));
        assert!(record_finding(&mut record, finding.clone(), 8));

        let mut replay = finding.clone();
        replay.ts = 30.0;
        assert!(!record_finding(&mut record, replay, 8));

        let other_node = NodeFinding::from_history(105, &remote(11.0, 104));
        assert!(record_finding(&mut record, other_node, 8));
        // node 103 again, still matching its own newest entry
        assert!(!record_finding(&mut record, finding, 8));

        let changed = NodeFinding::from_history(103, &remote(40.0, 106));
        assert!(record_finding(&mut record, changed, 8));
        assert_eq!(record.history.len(), 3);
    }

    #[test]
    fn test_bump_rapid_threshold_and_holdtime() {
        let settings = EngineConfig {
            rapid_threshold: 3,
            rapid_window_secs: 10.0,
            rapid_holdtime_secs: 100.0,
            ..Default::default()
        };
        let mut counters = RapidCounters::default();
        for ts in [1.0, 2.0, 3.0] {
            assert!(!bump_rapid(&mut counters, ts, &settings));
        }
        assert!(bump_rapid(&mut counters, 4.0, &settings));
        assert!(counters.is_rapid);
        assert_eq!(counters.rapid_until, 104.0);
        // already rapid: not entered again
        assert!(!bump_rapid(&mut counters, 5.0, &settings));

        // window restarts after it expires and the hold time clears the flag
        assert!(!bump_rapid(&mut counters, 200.0, &settings));
        assert!(!counters.is_rapid);
        assert_eq!(counters.window_count, 1);
        assert_eq!(counters.total, 6);
    }
}
