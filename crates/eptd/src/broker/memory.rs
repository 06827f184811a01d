//! In-process broker for the standalone role and tests
//!
//! Pushes can be made to fail on demand to exercise the error paths.

use super::{Broker, Subscription};
use crate::error::{EptError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::trace;

/// Queues and channels held in process memory
#[derive(Debug, Default)]
pub struct MemoryBroker {
    queues: Mutex<HashMap<String, VecDeque<String>>>,
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<String>>>>,
    pushed: Notify,
    pending_push_failures: AtomicUsize,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` pushes fail with a transport error
    pub fn fail_pushes(&self, count: usize) {
        self.pending_push_failures.store(count, Ordering::SeqCst);
    }

    fn try_pop(&self, queues: &[String]) -> Option<(String, String)> {
        let mut all = self.queues.lock();
        queues.iter().find_map(|name| {
            all.get_mut(name)
                .and_then(VecDeque::pop_front)
                .map(|body| (name.clone(), body))
        })
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn push(&self, queue: &str, body: String) -> Result<()> {
        let injected = self
            .pending_push_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(EptError::Transport(format!("push to {queue} refused")));
        }
        self.queues
            .lock()
            .entry(queue.to_string())
            .or_default()
            .push_back(body);
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn pop(&self, queues: &[String], timeout: Duration) -> Result<Option<(String, String)>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            // register interest before checking so a concurrent push is not missed
            notified.as_mut().enable();

            if let Some(found) = self.try_pop(queues) {
                return Ok(Some(found));
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    async fn queue_len(&self, queue: &str) -> Result<usize> {
        Ok(self.queues.lock().get(queue).map_or(0, VecDeque::len))
    }

    async fn publish(&self, channel: &str, body: String) -> Result<()> {
        let mut subs = self.subscribers.lock();
        if let Some(senders) = subs.get_mut(channel) {
            senders.retain(|tx| tx.send(body.clone()).is_ok());
            trace!(channel, receivers = senders.len(), "Published message");
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}
