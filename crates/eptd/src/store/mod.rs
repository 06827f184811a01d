//! Document store used for history, derived records and topology tables
//!
//! The store offers find / upsert / bulk insert / delete-by-filter on JSON
//! documents grouped in collections. There are no multi-document
//! transactions: every write stands alone. [`Db`] wraps a [`Store`] with the
//! bounded fixed-backoff retry policy and typed (serde) accessors.

mod memory;
mod redis_backend;

pub use memory::MemoryStore;
pub use redis_backend::RedisStore;

use crate::error::{EptError, Result};
use async_trait::async_trait;
use ept_common::RetryPolicy;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Equality filter on top-level document fields
pub type Filter = Map<String, Value>;

/// Build a filter from `(field, value)` pairs
pub fn filter<I, K>(pairs: I) -> Filter
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

/// Returns true if every filter field equals the document field
pub fn matches(doc: &Value, filter: &Filter) -> bool {
    filter.iter().all(|(k, v)| doc.get(k) == Some(v))
}

/// Store collections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Node,
    Tunnel,
    Vpc,
    Pc,
    Vnid,
    Epg,
    Subnet,
    History,
    Endpoint,
    Move,
    Stale,
    OffSubnet,
    Rapid,
}

impl Collection {
    /// Topology reference tables, replaced wholesale on rebuild
    pub const TOPOLOGY: [Collection; 7] = [
        Collection::Node,
        Collection::Tunnel,
        Collection::Vpc,
        Collection::Pc,
        Collection::Vnid,
        Collection::Epg,
        Collection::Subnet,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Node => "node",
            Self::Tunnel => "tunnel",
            Self::Vpc => "vpc",
            Self::Pc => "pc",
            Self::Vnid => "vnid",
            Self::Epg => "epg",
            Self::Subnet => "subnet",
            Self::History => "history",
            Self::Endpoint => "endpoint",
            Self::Move => "move",
            Self::Stale => "stale",
            Self::OffSubnet => "offsubnet",
            Self::Rapid => "rapid",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let coll = match s {
            "node" => Self::Node,
            "tunnel" => Self::Tunnel,
            "vpc" => Self::Vpc,
            "pc" => Self::Pc,
            "vnid" => Self::Vnid,
            "epg" => Self::Epg,
            "subnet" => Self::Subnet,
            "history" => Self::History,
            "endpoint" => Self::Endpoint,
            "move" => Self::Move,
            "stale" => Self::Stale,
            "offsubnet" => Self::OffSubnet,
            "rapid" => Self::Rapid,
            _ => return None,
        };
        Some(coll)
    }

    /// Fields that uniquely identify a document within the collection
    pub fn key_fields(&self) -> &'static [&'static str] {
        match self {
            Self::Node => &["fabric", "node_id"],
            Self::Tunnel | Self::Vpc | Self::Pc => &["fabric", "node", "intf"],
            Self::Vnid => &["fabric", "vnid"],
            Self::Epg => &["fabric", "vrf", "pctag"],
            Self::Subnet => &["fabric", "bd", "ip"],
            Self::History => &["fabric", "node", "vnid", "addr"],
            Self::Endpoint | Self::Move | Self::Stale | Self::OffSubnet | Self::Rapid => {
                &["fabric", "vnid", "addr"]
            }
        }
    }

    /// Key fields grouping documents into one physical table; always a
    /// subset of [`Collection::key_fields`]
    pub fn partition_fields(&self) -> &'static [&'static str] {
        match self {
            Self::History => &["fabric", "vnid", "addr"],
            _ => &["fabric"],
        }
    }

    /// Identity string of a document in this collection
    pub fn doc_id(&self, doc: &Value) -> String {
        join_fields(self.key_fields(), |f| doc.get(f))
    }

    /// Partition string of a document in this collection
    pub fn doc_partition(&self, doc: &Value) -> String {
        join_fields(self.partition_fields(), |f| doc.get(f))
    }

    /// `fields` of a filter joined like [`Collection::doc_id`], or `None`
    /// unless the filter pins every one of them
    pub fn filter_id(fields: &[&str], filter: &Filter) -> Option<String> {
        if !fields.iter().all(|f| filter.contains_key(*f)) {
            return None;
        }
        Some(join_fields(fields, |f| filter.get(f)))
    }
}

fn join_fields<'a, F>(fields: &[&str], get: F) -> String
where
    F: Fn(&str) -> Option<&'a Value>,
{
    fields
        .iter()
        .map(|f| match get(f) {
            Some(Value::String(s)) => s.clone(),
            Some(v) => v.to_string(),
            None => String::new(),
        })
        .collect::<Vec<_>>()
        .join("|")
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persistence primitives the tracker relies on
#[async_trait]
pub trait Store: Send + Sync {
    /// All documents matching `filter`
    async fn find(&self, coll: Collection, filter: &Filter) -> Result<Vec<Value>>;

    /// First document matching `filter`
    async fn find_one(&self, coll: Collection, filter: &Filter) -> Result<Option<Value>> {
        Ok(self.find(coll, filter).await?.into_iter().next())
    }

    /// Replace the document matching `filter`, or insert it
    async fn upsert(&self, coll: Collection, filter: &Filter, doc: Value) -> Result<()>;

    /// Insert documents without checking for existing ones
    async fn insert_many(&self, coll: Collection, docs: Vec<Value>) -> Result<()>;

    /// Delete every document matching `filter`, returning the count
    async fn delete(&self, coll: Collection, filter: &Filter) -> Result<u64>;
}

/// Typed, retrying handle over a [`Store`]
#[derive(Clone)]
pub struct Db {
    inner: Arc<dyn Store>,
    retry: RetryPolicy,
}

impl Db {
    pub fn new(inner: Arc<dyn Store>, retry: RetryPolicy) -> Self {
        Self { inner, retry }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub async fn find_raw(&self, coll: Collection, filter: &Filter) -> Result<Vec<Value>> {
        Ok(self.retry.run("find", || self.inner.find(coll, filter)).await?)
    }

    pub async fn find_one_raw(&self, coll: Collection, filter: &Filter) -> Result<Option<Value>> {
        Ok(self
            .retry
            .run("find_one", || self.inner.find_one(coll, filter))
            .await?)
    }

    pub async fn find<T: DeserializeOwned>(&self, coll: Collection, filter: &Filter) -> Result<Vec<T>> {
        self.find_raw(coll, filter)
            .await?
            .into_iter()
            .map(|doc| serde_json::from_value(doc).map_err(EptError::from))
            .collect()
    }

    pub async fn find_one<T: DeserializeOwned>(
        &self,
        coll: Collection,
        filter: &Filter,
    ) -> Result<Option<T>> {
        match self.find_one_raw(coll, filter).await? {
            Some(doc) => Ok(Some(serde_json::from_value(doc)?)),
            None => Ok(None),
        }
    }

    pub async fn upsert<T: Serialize + ?Sized>(
        &self,
        coll: Collection,
        filter: &Filter,
        doc: &T,
    ) -> Result<()> {
        let doc = serde_json::to_value(doc)?;
        Ok(self
            .retry
            .run("upsert", || self.inner.upsert(coll, filter, doc.clone()))
            .await?)
    }

    pub async fn delete(&self, coll: Collection, filter: &Filter) -> Result<u64> {
        Ok(self.retry.run("delete", || self.inner.delete(coll, filter)).await?)
    }

    /// Replace every row of a collection for one fabric (delete-all + bulk insert)
    pub async fn replace_all<T: Serialize>(
        &self,
        coll: Collection,
        fabric: &str,
        rows: &[T],
    ) -> Result<()> {
        let docs = rows
            .iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let by_fabric = filter([("fabric", Value::from(fabric))]);
        self.delete(coll, &by_fabric).await?;
        if docs.is_empty() {
            return Ok(());
        }
        Ok(self
            .retry
            .run("insert_many", || self.inner.insert_many(coll, docs.clone()))
            .await?)
    }
}
