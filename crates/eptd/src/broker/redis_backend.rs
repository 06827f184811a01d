//! Redis broker: lists for queues, pub/sub for broadcast channels

use super::{Broker, Subscription};
use crate::error::Result;
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

/// Smallest BLPOP timeout; zero would block forever
const MIN_BLOCK_SECS: f64 = 0.01;

/// Broker backed by Redis lists and channels
#[derive(Clone)]
pub struct RedisBroker {
    client: Client,
    conn: ConnectionManager,
    /// Idle blocking connections keyed by the queue list they serve
    blocking: Arc<Mutex<HashMap<String, MultiplexedConnection>>>,
}

impl RedisBroker {
    #[instrument(skip_all, fields(host, port, db))]
    pub async fn connect(host: &str, port: u16, db: u32) -> Result<Self> {
        let client = Client::open(format!("redis://{}:{}/{}", host, port, db))?;
        let conn = ConnectionManager::new(client.clone()).await?;
        debug!("Connected to broker database");
        Ok(Self {
            client,
            conn,
            blocking: Arc::new(Mutex::new(HashMap::new())),
        })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn push(&self, queue: &str, body: String) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.rpush(queue, body).await?;
        Ok(())
    }

    async fn pop(&self, queues: &[String], timeout: Duration) -> Result<Option<(String, String)>> {
        if queues.is_empty() {
            return Ok(None);
        }
        // BLPOP holds its connection for the whole wait, so each reader gets
        // its own, kept across calls. A failed one is dropped and reopened.
        let key = queues.join(",");
        let idle = self.blocking.lock().remove(&key);
        let mut conn = match idle {
            Some(conn) => conn,
            None => {
                debug!(queues = %key, "Opening blocking connection");
                self.client.get_multiplexed_async_connection().await?
            }
        };
        let secs = timeout.as_secs_f64().max(MIN_BLOCK_SECS);
        let popped: Option<(String, String)> = conn.blpop(queues, secs).await?;
        self.blocking.lock().insert(key, conn);
        Ok(popped)
    }

    async fn queue_len(&self, queue: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let len: usize = conn.llen(queue).await?;
        Ok(len)
    }

    async fn publish(&self, channel: &str, body: String) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.publish(channel, body).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = channel.to_string();

        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let body: String = match msg.get_payload() {
                    Ok(body) => body,
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "Dropping non-text payload");
                        continue;
                    }
                };
                if tx.send(body).is_err() {
                    break;
                }
            }
            debug!(channel = %channel, "Subscription closed");
        });

        Ok(rx)
    }
}

