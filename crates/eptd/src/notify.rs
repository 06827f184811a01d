//! Notification sinks used by the watcher role

use crate::error::Result;
use crate::types::NotifyJob;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;

/// Delivers notify jobs to an operator-facing channel
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, job: &NotifyJob) -> Result<()>;
}

/// Writes each notification to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, job: &NotifyJob) -> Result<()> {
        info!(
            kind = job.kind.as_str(),
            endpoint = %job.key,
            node = job.node,
            ts = job.ts,
            detail = %job.detail,
            "Endpoint notification"
        );
        Ok(())
    }
}

/// Keeps every notification in memory
#[derive(Debug, Default, Clone)]
pub struct RecordingNotifier {
    jobs: Arc<Mutex<Vec<NotifyJob>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn jobs(&self) -> Vec<NotifyJob> {
        self.jobs.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, job: &NotifyJob) -> Result<()> {
        self.jobs.lock().push(job.clone());
        Ok(())
    }
}
