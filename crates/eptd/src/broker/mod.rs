//! Queue and pub/sub transport between distributor, workers and watcher
//!
//! Work travels on named FIFO queues (`q0_<id>`, `q1_<id>`, `ept_submit`,
//! `ept_topology_<fabric>`). Hellos and control messages are broadcast on
//! pub/sub channels (`ept_hello`, `ept_control`). A single [`Broker::pop`]
//! over an ordered queue list gives strict priority: the first non-empty
//! queue in the list is always served first.

mod memory;
mod redis_backend;

pub use memory::MemoryBroker;
pub use redis_backend::RedisBroker;

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

/// Shared submission queue read by the distributor
pub const SUBMIT_QUEUE: &str = "ept_submit";
/// Broadcast channel for flush / resubscribe / restart
pub const CONTROL_CHANNEL: &str = "ept_control";
/// Channel carrying worker hellos to the distributor
pub const HELLO_CHANNEL: &str = "ept_hello";
/// Number of priority queues each worker owns
pub const WORKER_QUEUE_COUNT: usize = 2;

/// Name of a worker's priority queue (index 0 is drained first)
pub fn worker_queue(worker_id: &str, index: usize) -> String {
    format!("q{}_{}", index.min(WORKER_QUEUE_COUNT - 1), worker_id)
}

/// Ordered queue list a worker pops from
pub fn worker_queues(worker_id: &str) -> Vec<String> {
    (0..WORKER_QUEUE_COUNT)
        .map(|i| worker_queue(worker_id, i))
        .collect()
}

/// Queue carrying structural events for one fabric
pub fn topology_queue(fabric: &str) -> String {
    format!("ept_topology_{}", fabric)
}

/// Subscription handle; yields raw message bodies
pub type Subscription = mpsc::UnboundedReceiver<String>;

/// Message transport
#[async_trait]
pub trait Broker: Send + Sync {
    /// Append a message to the tail of a queue
    async fn push(&self, queue: &str, body: String) -> Result<()>;

    /// Pop the head of the first non-empty queue in `queues`, waiting up to
    /// `timeout`. Returns the queue name with the body.
    async fn pop(&self, queues: &[String], timeout: Duration) -> Result<Option<(String, String)>>;

    /// Number of messages waiting on a queue
    async fn queue_len(&self, queue: &str) -> Result<usize>;

    /// Publish to every current subscriber of a channel
    async fn publish(&self, channel: &str, body: String) -> Result<()>;

    /// Subscribe to a channel
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;
}
