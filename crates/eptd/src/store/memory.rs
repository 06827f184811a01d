//! In-process store backend
//!
//! Used by the standalone role and by tests. Supports injecting transient
//! timeouts to exercise the retry path.

use super::{matches, Collection, Filter, Store};
use crate::error::{EptError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// HashMap-backed document store
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<Collection, Vec<Value>>>,
    pending_timeouts: AtomicUsize,
    requests: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` requests fail with a transient timeout
    pub fn inject_timeouts(&self, count: usize) {
        self.pending_timeouts.store(count, Ordering::SeqCst);
    }

    /// Total requests served (including injected failures)
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Number of documents in a collection
    pub fn count(&self, coll: Collection) -> usize {
        self.collections.read().get(&coll).map_or(0, Vec::len)
    }

    fn check_fault(&self, op: &str) -> Result<()> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .pending_timeouts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match injected {
            Ok(_) => Err(EptError::StoreTimeout(op.to_string())),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn find(&self, coll: Collection, filter: &Filter) -> Result<Vec<Value>> {
        self.check_fault("find")?;
        let collections = self.collections.read();
        Ok(collections
            .get(&coll)
            .map(|docs| docs.iter().filter(|d| matches(d, filter)).cloned().collect())
            .unwrap_or_default())
    }

    async fn upsert(&self, coll: Collection, filter: &Filter, doc: Value) -> Result<()> {
        self.check_fault("upsert")?;
        let mut collections = self.collections.write();
        let docs = collections.entry(coll).or_default();
        match docs.iter_mut().find(|d| matches(d, filter)) {
            Some(existing) => *existing = doc,
            None => docs.push(doc),
        }
        Ok(())
    }

    async fn insert_many(&self, coll: Collection, docs: Vec<Value>) -> Result<()> {
        self.check_fault("insert_many")?;
        self.collections.write().entry(coll).or_default().extend(docs);
        Ok(())
    }

    async fn delete(&self, coll: Collection, filter: &Filter) -> Result<u64> {
        self.check_fault("delete")?;
        let mut collections = self.collections.write();
        let Some(docs) = collections.get_mut(&coll) else {
            return Ok(0);
        };
        let before = docs.len();
        docs.retain(|d| !matches(d, filter));
        Ok((before - docs.len()) as u64)
    }
}
