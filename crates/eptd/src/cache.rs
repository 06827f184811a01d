//! Per-fabric metadata caches
//!
//! A [`FabricCache`] bundles the seven topology sub-caches (node, tunnel,
//! vpc, port-channel, vnid, epg, subnet) with the off-subnet decision cache
//! and the rapid-learn counter cache. It is owned by exactly one task and
//! needs no locking.
//!
//! Topology sub-caches hold `serde_json::Value` documents. `Value::Null`
//! records "confirmed absent in the store" and is served like any other
//! hit; an uncached key is the not-found sentinel (`None`).

use crate::config_file::CacheConfig;
use crate::error::Result;
use crate::prefix::Prefix;
use crate::store::{filter, Collection, Db, Filter};
use crate::tables::{EpgRecord, NodeRecord, PortChannelRecord, SubnetRecord, TunnelRecord, VnidRecord, VpcRecord};
use crate::types::RapidCounters;
use ept_common::{CacheStats, LruCache};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Separator for cache key strings; never appears in names or addresses
const KEY_DELIMITER: char = '\u{1f}';

/// Cached off-subnet decision, tagged with the bd it was computed from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffSubnetEntry {
    pub bd: u32,
    pub off: bool,
}

type DocCache = LruCache<String, Value>;
type OffSubnetKey = (u32, u32, String);
type RapidKey = (u32, String);

/// Fields identifying a cached row for name-indexed eviction
fn name_fields(coll: Collection) -> &'static [&'static str] {
    match coll {
        Collection::Node => &["node_id"],
        Collection::Tunnel | Collection::Vpc | Collection::Pc => &["node", "intf"],
        Collection::Vnid => &["vnid"],
        Collection::Epg => &["vrf", "pctag"],
        Collection::Subnet => &["bd"],
        _ => &[],
    }
}

fn field_str(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Reverse-lookup name of a row or lookup filter, e.g. `101|po1`
pub fn cache_name(coll: Collection, doc: &Filter) -> String {
    name_fields(coll)
        .iter()
        .filter_map(|f| doc.get(*f).map(field_str))
        .collect::<Vec<_>>()
        .join("|")
}

/// `(vrf, pctag)` of an epg cache name such as `100|32770`
fn parse_epg_name(name: &str) -> Option<(u32, u32)> {
    let (vrf, pctag) = name.split_once('|')?;
    Some((vrf.parse().ok()?, pctag.parse().ok()?))
}

/// Deterministic key string: sorted `key=value` pairs
fn key_string(keys: &Filter) -> String {
    let mut pairs: Vec<String> = keys
        .iter()
        .map(|(k, v)| format!("{}={}", k, field_str(v)))
        .collect();
    pairs.sort();
    pairs.join(&KEY_DELIMITER.to_string())
}

fn decode<T: DeserializeOwned>(coll: Collection, value: Value) -> Option<T> {
    if value.is_null() {
        return None;
    }
    match serde_json::from_value(value) {
        Ok(row) => Some(row),
        Err(e) => {
            warn!(collection = %coll, error = %e, "Ignoring undecodable cached row");
            None
        }
    }
}

/// Metadata caches for one fabric
pub struct FabricCache {
    fabric: String,
    db: Db,
    node: DocCache,
    tunnel: DocCache,
    vpc: DocCache,
    pc: DocCache,
    vnid: DocCache,
    epg: DocCache,
    subnet: DocCache,
    offsubnet: LruCache<OffSubnetKey, OffSubnetEntry>,
    rapid: LruCache<RapidKey, RapidCounters>,
    /// Rapid counters evicted but not yet persisted
    write_back: Arc<Mutex<Vec<RapidCounters>>>,
}

impl FabricCache {
    pub fn new(fabric: impl Into<String>, db: Db, config: &CacheConfig) -> Self {
        let write_back = Arc::new(Mutex::new(Vec::new()));
        let staged = write_back.clone();
        let rapid = LruCache::new("rapid", config.rapid).with_evict_callback(Box::new(
            move |_key: &RapidKey, counters: &RapidCounters| {
                staged.lock().push(counters.clone());
                Ok(())
            },
        ));

        Self {
            fabric: fabric.into(),
            db,
            node: LruCache::new("node", config.node),
            tunnel: LruCache::new("tunnel", config.tunnel),
            vpc: LruCache::new("vpc", config.vpc),
            pc: LruCache::new("pc", config.pc),
            vnid: LruCache::new("vnid", config.vnid),
            epg: LruCache::new("epg", config.epg),
            subnet: LruCache::new("subnet", config.subnet),
            offsubnet: LruCache::new("offsubnet", config.offsubnet),
            rapid,
            write_back,
        }
    }

    pub fn fabric(&self) -> &str {
        &self.fabric
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    fn doc_cache(&mut self, coll: Collection) -> Option<&mut DocCache> {
        match coll {
            Collection::Node => Some(&mut self.node),
            Collection::Tunnel => Some(&mut self.tunnel),
            Collection::Vpc => Some(&mut self.vpc),
            Collection::Pc => Some(&mut self.pc),
            Collection::Vnid => Some(&mut self.vnid),
            Collection::Epg => Some(&mut self.epg),
            Collection::Subnet => Some(&mut self.subnet),
            _ => None,
        }
    }

    /// Cache-fronted store lookup.
    ///
    /// `keys` are equality filters (the fabric is added automatically).
    /// With `find_one` the cached value is the first matching document or
    /// null; otherwise it is the array of all matches. On a miss the store
    /// is queried only if `db_lookup` is set; the result, including an
    /// explicit null, is then cached. Returns `None` for a miss that was not
    /// looked up.
    pub async fn generic_lookup(
        &mut self,
        coll: Collection,
        mut keys: Filter,
        find_one: bool,
        db_lookup: bool,
    ) -> Result<Option<Value>> {
        keys.insert("fabric".to_string(), Value::from(self.fabric.as_str()));
        let key = key_string(&keys);
        let name = cache_name(coll, &keys);

        let Some(cache) = self.doc_cache(coll) else {
            return Ok(None);
        };
        if let Some(hit) = cache.search(key.as_str()) {
            return Ok(Some(hit.clone()));
        }
        if !db_lookup {
            return Ok(None);
        }

        let value = if find_one {
            self.db.find_one_raw(coll, &keys).await?.unwrap_or(Value::Null)
        } else {
            Value::Array(self.db.find_raw(coll, &keys).await?)
        };
        debug!(fabric = %self.fabric, collection = %coll, key = %name, "Cached store lookup");
        if let Some(cache) = self.doc_cache(coll) {
            cache.push_named(key, value.clone(), vec![name]);
        }
        Ok(Some(value))
    }

    async fn lookup_one<T: DeserializeOwned>(&mut self, coll: Collection, keys: Filter) -> Result<Option<T>> {
        let value = self.generic_lookup(coll, keys, true, true).await?;
        Ok(value.and_then(|v| decode(coll, v)))
    }

    pub async fn get_node(&mut self, node_id: u32) -> Result<Option<NodeRecord>> {
        self.lookup_one(Collection::Node, filter([("node_id", Value::from(node_id))]))
            .await
    }

    /// vpc peer of a node, `None` when the node is unknown or has no peer
    pub async fn get_peer_node(&mut self, node_id: u32) -> Result<Option<u32>> {
        Ok(self
            .get_node(node_id)
            .await?
            .map(|n| n.peer)
            .filter(|peer| *peer != 0))
    }

    pub async fn get_tunnel(&mut self, node: u32, intf: &str) -> Result<Option<TunnelRecord>> {
        self.lookup_one(
            Collection::Tunnel,
            filter([("node", Value::from(node)), ("intf", Value::from(intf))]),
        )
        .await
    }

    pub async fn get_vpc(&mut self, node: u32, intf: &str) -> Result<Option<VpcRecord>> {
        self.lookup_one(
            Collection::Vpc,
            filter([("node", Value::from(node)), ("intf", Value::from(intf))]),
        )
        .await
    }

    pub async fn get_port_channel(&mut self, node: u32, intf: &str) -> Result<Option<PortChannelRecord>> {
        self.lookup_one(
            Collection::Pc,
            filter([("node", Value::from(node)), ("intf", Value::from(intf))]),
        )
        .await
    }

    pub async fn get_vnid(&mut self, vnid: u32) -> Result<Option<VnidRecord>> {
        self.lookup_one(Collection::Vnid, filter([("vnid", Value::from(vnid))]))
            .await
    }

    pub async fn get_epg(&mut self, vrf: u32, pctag: u32) -> Result<Option<EpgRecord>> {
        self.lookup_one(
            Collection::Epg,
            filter([("vrf", Value::from(vrf)), ("pctag", Value::from(pctag))]),
        )
        .await
    }

    pub async fn get_subnets(&mut self, bd: u32) -> Result<Vec<SubnetRecord>> {
        let value = self
            .generic_lookup(Collection::Subnet, filter([("bd", Value::from(bd))]), false, true)
            .await?;
        let rows = match value {
            Some(Value::Array(rows)) => rows,
            _ => return Ok(Vec::new()),
        };
        Ok(rows
            .into_iter()
            .filter_map(|row| decode(Collection::Subnet, row))
            .collect())
    }

    /// True if `addr` is outside every subnet of the epg's bridge domain.
    ///
    /// Fails open (returns false) when the epg is unknown, the address does
    /// not parse, or the bridge domain has no subnets.
    pub async fn is_offsubnet(&mut self, vrf: u32, pctag: u32, addr: &str) -> Result<bool> {
        let key = (vrf, pctag, addr.to_string());
        if let Some(entry) = self.offsubnet.search(&key) {
            return Ok(entry.off);
        }

        let Some(epg) = self.get_epg(vrf, pctag).await? else {
            debug!(fabric = %self.fabric, vrf, pctag, "No epg for off-subnet check");
            return Ok(false);
        };
        let Some(ip) = Prefix::parse(addr) else {
            warn!(fabric = %self.fabric, addr, "Unparsable address for off-subnet check");
            return Ok(false);
        };
        let subnets: Vec<Prefix> = self
            .get_subnets(epg.bd)
            .await?
            .iter()
            .filter_map(|s| Prefix::parse(&s.ip))
            .collect();
        if subnets.is_empty() {
            debug!(fabric = %self.fabric, bd = epg.bd, "No subnets for off-subnet check");
            return Ok(false);
        }

        let off = !subnets.iter().any(|s| s.contains(&ip));
        self.offsubnet.push(key, OffSubnetEntry { bd: epg.bd, off });
        Ok(off)
    }

    /// Rapid counters for an endpoint, loaded from the store on a miss
    pub async fn rapid_counters(&mut self, vnid: u32, addr: &str) -> Result<RapidCounters> {
        let key = (vnid, addr.to_string());
        if let Some(counters) = self.rapid.search(&key) {
            return Ok(counters.clone());
        }
        let stored: Option<RapidCounters> = self
            .db
            .find_one(
                Collection::Rapid,
                &filter([
                    ("fabric", Value::from(self.fabric.as_str())),
                    ("vnid", Value::from(vnid)),
                    ("addr", Value::from(addr)),
                ]),
            )
            .await?;
        Ok(stored.unwrap_or_else(|| RapidCounters {
            fabric: self.fabric.clone(),
            vnid,
            addr: addr.to_string(),
            ..Default::default()
        }))
    }

    /// Cache updated counters. May evict another endpoint's counters into
    /// the write-back buffer.
    pub fn put_rapid_counters(&mut self, counters: RapidCounters) {
        self.rapid.push((counters.vnid, counters.addr.clone()), counters);
    }

    /// Evicted counters waiting to be persisted
    pub fn pending_write_back(&self) -> usize {
        self.write_back.lock().len()
    }

    /// Persist every evicted counter. Entries that fail to save stay staged.
    pub async fn persist_write_back(&mut self) -> Result<usize> {
        let staged: Vec<RapidCounters> = std::mem::take(&mut *self.write_back.lock());
        let total = staged.len();
        let mut iter = staged.into_iter();
        while let Some(counters) = iter.next() {
            let by_key = filter([
                ("fabric", Value::from(counters.fabric.as_str())),
                ("vnid", Value::from(counters.vnid)),
                ("addr", Value::from(counters.addr.as_str())),
            ]);
            if let Err(e) = self.db.upsert(Collection::Rapid, &by_key, &counters).await {
                let mut buffer = self.write_back.lock();
                buffer.push(counters);
                buffer.extend(iter);
                return Err(e);
            }
        }
        Ok(total)
    }

    /// Drop cached entries for a collection; `name` limits it to one row.
    ///
    /// Node and tunnel always flush entirely. A named eviction also drops
    /// every cached null of that collection, and epg/subnet evictions purge
    /// off-subnet decisions computed from the affected bridge domain.
    pub async fn flush_collection(&mut self, coll: Collection, name: Option<&str>) -> Result<()> {
        match (coll, name) {
            (Collection::Rapid, _) => {
                self.rapid.evict_all();
                self.persist_write_back().await?;
            }
            (Collection::OffSubnet, _) => self.offsubnet.flush(),
            (Collection::Node | Collection::Tunnel, _) | (_, None) => {
                if let Some(cache) = self.doc_cache(coll) {
                    cache.flush();
                }
                if matches!(coll, Collection::Epg | Collection::Subnet) {
                    self.offsubnet.flush();
                }
            }
            (_, Some(name)) => self.remove_named(coll, name, false),
        }
        info!(fabric = %self.fabric, collection = %coll, name = name.unwrap_or("*"), "Flushed cache");
        Ok(())
    }

    /// Name-indexed point eviction; purges nulls unless `preserve_null`
    pub fn remove_named(&mut self, coll: Collection, name: &str, preserve_null: bool) {
        let Some(cache) = self.doc_cache(coll) else {
            return;
        };
        let mut removed = cache.remove_by_name(name);
        if !preserve_null {
            removed.extend(cache.retain(|_, v| !v.is_null()));
        }

        let bds: Vec<u32> = match coll {
            Collection::Subnet => name.parse().ok().into_iter().collect(),
            Collection::Epg => removed
                .iter()
                .filter_map(|(_, v)| v.get("bd").and_then(Value::as_u64))
                .map(|bd| bd as u32)
                .collect(),
            _ => Vec::new(),
        };
        // the epg row may already be gone from its cache, so also match on the
        // decision key itself
        let epg = match coll {
            Collection::Epg => parse_epg_name(name),
            _ => None,
        };
        if !bds.is_empty() || epg.is_some() {
            let purged = self.offsubnet.retain(|(vrf, pctag, _), entry| {
                !bds.contains(&entry.bd) && epg != Some((*vrf, *pctag))
            });
            debug!(fabric = %self.fabric, bds = ?bds, epg = ?epg, purged = purged.len(), "Purged off-subnet decisions");
        }
    }

    /// Drop every cache; rapid counters are persisted first
    pub async fn flush_all(&mut self) -> Result<()> {
        for coll in Collection::TOPOLOGY {
            if let Some(cache) = self.doc_cache(coll) {
                cache.flush();
            }
        }
        self.offsubnet.flush();
        self.rapid.evict_all();
        self.persist_write_back().await?;
        Ok(())
    }

    /// Counters for every sub-cache
    pub fn stats(&self) -> Vec<(&str, CacheStats)> {
        [
            &self.node,
            &self.tunnel,
            &self.vpc,
            &self.pc,
            &self.vnid,
            &self.epg,
            &self.subnet,
        ]
        .into_iter()
        .map(|c| (c.name(), c.stats()))
        .chain([
            (self.offsubnet.name(), self.offsubnet.stats()),
            (self.rapid.name(), self.rapid.stats()),
        ])
        .collect()
    }

    pub fn log_stats(&self) {
        for (name, stats) in self.stats() {
            info!(
                fabric = %self.fabric,
                cache = name,
                hits = stats.hits,
                misses = stats.misses,
                evictions = stats.evictions,
                flushes = stats.flushes,
                len = stats.len,
                capacity = stats.capacity,
                hit_rate = stats.hit_rate(),
                "Cache stats"
            );
        }
    }
}

impl std::fmt::Debug for FabricCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FabricCache")
            .field("fabric", &self.fabric)
            .finish_non_exhaustive()
    }
}
