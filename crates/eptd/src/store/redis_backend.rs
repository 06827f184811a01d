//! Redis store backend
//!
//! Each collection partition is a Redis hash `EPT_<COLLECTION>:<partition>`
//! whose fields are document ids (the collection key fields joined with `|`)
//! and whose values are JSON documents. Partitions are per fabric, and per
//! endpoint for per-node history. A filter pinning every key field is a
//! single HGET, one pinning the partition reads one hash; anything wider
//! walks the collection's hashes and filters client side.

use super::{matches, Collection, Filter, Store};
use crate::error::Result;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, instrument, warn};

const TABLE_PREFIX: &str = "EPT_";

/// Document store on top of a Redis database
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect to `redis://host:port/db`
    #[instrument(skip_all, fields(host, port, db))]
    pub async fn connect(host: &str, port: u16, db: u32) -> Result<Self> {
        let url = format!("redis://{}:{}/{}", host, port, db);
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        debug!("Connected to store database");
        Ok(Self { conn })
    }

    fn table(coll: Collection, partition: &str) -> String {
        format!("{}{}:{}", TABLE_PREFIX, coll.as_str().to_uppercase(), partition)
    }

    fn pattern(coll: Collection) -> String {
        format!("{}{}:*", TABLE_PREFIX, coll.as_str().to_uppercase())
    }

    /// Hashes that may hold documents matching `filter`
    async fn tables(&self, coll: Collection, filter: &Filter) -> Result<Vec<String>> {
        if let Some(partition) = Collection::filter_id(coll.partition_fields(), filter) {
            return Ok(vec![Self::table(coll, &partition)]);
        }
        let mut conn = self.conn.clone();
        let tables: Vec<String> = conn.keys(Self::pattern(coll)).await?;
        debug!(collection = %coll, tables = tables.len(), "Unpartitioned lookup");
        Ok(tables)
    }

    fn decode(coll: Collection, id: &str, body: &str) -> Option<Value> {
        match serde_json::from_str(body) {
            Ok(doc) => Some(doc),
            Err(e) => {
                warn!(collection = %coll, id, error = %e, "Skipping undecodable document");
                None
            }
        }
    }

    /// `(table, id, document)` for every document matching `filter`
    async fn matching(&self, coll: Collection, filter: &Filter) -> Result<Vec<(String, String, Value)>> {
        let mut conn = self.conn.clone();
        let direct = Collection::filter_id(coll.key_fields(), filter);
        let mut found = Vec::new();
        for table in self.tables(coll, filter).await? {
            if let Some(id) = &direct {
                let body: Option<String> = conn.hget(&table, id).await?;
                if let Some(doc) = body.and_then(|body| Self::decode(coll, id, &body)) {
                    if matches(&doc, filter) {
                        found.push((table, id.clone(), doc));
                    }
                }
                continue;
            }
            let raw: Vec<(String, String)> = conn.hgetall(&table).await?;
            for (id, body) in raw {
                if let Some(doc) = Self::decode(coll, &id, &body) {
                    if matches(&doc, filter) {
                        found.push((table.clone(), id, doc));
                    }
                }
            }
        }
        Ok(found)
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn find(&self, coll: Collection, filter: &Filter) -> Result<Vec<Value>> {
        Ok(self
            .matching(coll, filter)
            .await?
            .into_iter()
            .map(|(_, _, doc)| doc)
            .collect())
    }

    async fn upsert(&self, coll: Collection, _filter: &Filter, doc: Value) -> Result<()> {
        let table = Self::table(coll, &coll.doc_partition(&doc));
        let id = coll.doc_id(&doc);
        let body = serde_json::to_string(&doc)?;
        let mut conn = self.conn.clone();
        let _: () = conn.hset(table, id, body).await?;
        Ok(())
    }

    async fn insert_many(&self, coll: Collection, docs: Vec<Value>) -> Result<()> {
        if docs.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        for doc in &docs {
            pipe.hset(
                Self::table(coll, &coll.doc_partition(doc)),
                coll.doc_id(doc),
                serde_json::to_string(doc)?,
            )
            .ignore();
        }
        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        debug!(collection = %coll, count = docs.len(), "Bulk inserted documents");
        Ok(())
    }

    async fn delete(&self, coll: Collection, filter: &Filter) -> Result<u64> {
        let mut by_table: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (table, id, _) in self.matching(coll, filter).await? {
            by_table.entry(table).or_default().push(id);
        }
        let mut conn = self.conn.clone();
        let mut removed = 0;
        for (table, ids) in by_table {
            let count: u64 = conn.hdel(table, &ids).await?;
            removed += count;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_names() {
        assert_eq!(RedisStore::table(Collection::OffSubnet, "fab1"), "EPT_OFFSUBNET:fab1");
        assert_eq!(
            RedisStore::table(Collection::History, "fab1|5|10.0.0.5"),
            "EPT_HISTORY:fab1|5|10.0.0.5"
        );
        assert_eq!(RedisStore::pattern(Collection::Node), "EPT_NODE:*");
    }
}
