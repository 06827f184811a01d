//! Common building blocks for the fabric endpoint tracker.
//!
//! This crate provides the pieces shared by every tracker role:
//!
//! - [`LruCache`]: Fixed-capacity LRU with O(1) hit/insert/evict, a
//!   not-found sentinel distinct from a cached null, name-indexed point
//!   eviction and an optional eviction callback
//! - [`RetryPolicy`]: Bounded fixed-backoff retry for transient store errors
//! - [`ShardRouter`]: Deterministic hash-to-worker-and-queue routing
//!
//! # Architecture
//!
//! The tracker runs as one distributor, N workers and one watcher:
//!
//! 1. Controller events are submitted to the distributor
//! 2. The distributor shards each event by endpoint address
//! 3. Workers merge events into history using per-fabric [`LruCache`]s
//! 4. Store calls are wrapped in a [`RetryPolicy`]

mod lru;
mod retry;
mod shard;

pub use lru::{CacheStats, EvictCallback, LruCache};
pub use retry::{RetryError, RetryPolicy, Transient};
pub use shard::{shard_hash, ShardRouter};
