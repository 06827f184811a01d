//! Worker process
//!
//! A worker owns two priority queues and hosts one [`HistoryEngine`] per
//! fabric, created on first use. The main loop is the only task touching the
//! engines and their caches. Two timer loops run beside it: the heartbeat
//! (hello) loop and the stats loop, sharing one lock over [`WorkerStats`].

use crate::broker::{worker_queues, Broker, CONTROL_CHANNEL, HELLO_CHANNEL, SUBMIT_QUEUE};
use crate::cache::FabricCache;
use crate::config_file::EptdConfig;
use crate::distributor::spawn_reader;
use crate::error::{EptError, Result};
use crate::history::HistoryEngine;
use crate::message::{HelloData, Message, Sequencer, WorkData, WorkPayload, WorkerRole};
use crate::metrics::MetricsCollector;
use crate::notify::{LogNotifier, Notifier};
use crate::store::Db;
use crate::types::{EndpointEvent, NotifyKind};
use ept_common::CacheStats;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Counters shared between the main loop and the timer loops
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    pub processed: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub failed: u64,
    pub control: u64,
    pub notifications: u64,
    pub notify_failed: u64,
    pub hellos_sent: u64,
    /// Latest cache counters per fabric
    pub caches: Vec<(String, Vec<(String, CacheStats)>)>,
}

/// Seconds since the epoch as a float
pub fn epoch_now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Worker main loop state
pub struct Worker {
    worker_id: String,
    role: WorkerRole,
    broker: Arc<dyn Broker>,
    db: Db,
    config: Arc<EptdConfig>,
    engines: HashMap<String, HistoryEngine>,
    notifier: Arc<dyn Notifier>,
    metrics: MetricsCollector,
    stats: Arc<Mutex<WorkerStats>>,
    sequencer: Sequencer,
    start_time: f64,
    last_stats_refresh: Option<Instant>,
}

impl Worker {
    pub fn new(
        worker_id: impl Into<String>,
        role: WorkerRole,
        broker: Arc<dyn Broker>,
        db: Db,
        config: Arc<EptdConfig>,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            role,
            broker,
            db,
            config,
            engines: HashMap::new(),
            notifier: Arc::new(LogNotifier),
            metrics,
            stats: Arc::new(Mutex::new(WorkerStats::default())),
            sequencer: Sequencer::new(),
            start_time: epoch_now(),
            last_stats_refresh: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn queues(&self) -> Vec<String> {
        worker_queues(&self.worker_id)
    }

    pub fn stats(&self) -> Arc<Mutex<WorkerStats>> {
        self.stats.clone()
    }

    pub fn hello(&self) -> HelloData {
        HelloData {
            worker_id: self.worker_id.clone(),
            role: self.role,
            queues: self.queues(),
            start_time: self.start_time,
        }
    }

    /// Fabrics with a loaded engine
    pub fn fabrics(&self) -> Vec<&str> {
        self.engines.keys().map(String::as_str).collect()
    }

    fn engine(&mut self, fabric: &str) -> &mut HistoryEngine {
        let Self {
            engines,
            db,
            config,
            metrics,
            worker_id,
            ..
        } = self;
        let loaded = engines.len();
        engines.entry(fabric.to_string()).or_insert_with(|| {
            info!(worker = %worker_id, fabric, "Loading history engine");
            metrics.set_active_fabrics(loaded + 1);
            let cache = FabricCache::new(fabric, db.clone(), &config.cache);
            HistoryEngine::new(cache, config.engine.clone())
        })
    }

    /// Process one endpoint event and forward its notify jobs
    #[instrument(skip_all, fields(worker = %self.worker_id))]
    pub async fn handle_event(&mut self, event: &EndpointEvent) -> Result<()> {
        let started = Instant::now();
        let outcome = self.engine(&event.fabric).process(event).await?;
        self.metrics
            .observe_event_latency(started.elapsed().as_secs_f64());
        self.metrics.record_event(outcome.accepted);
        if outcome.analyzed {
            self.metrics.analyses_total.inc();
        }
        if outcome.aborted {
            self.metrics.analysis_failures_total.inc();
        }
        for kind in &outcome.detections {
            match kind {
                NotifyKind::Move => self.metrics.moves_total.inc(),
                NotifyKind::Stale => self.metrics.stale_total.inc(),
                NotifyKind::OffSubnet => self.metrics.offsubnet_total.inc(),
                NotifyKind::Rapid => self.metrics.rapid_total.inc(),
            }
        }
        {
            let mut stats = self.stats.lock();
            stats.processed += 1;
            if outcome.accepted {
                stats.accepted += 1;
            } else {
                stats.rejected += 1;
            }
        }

        // history is already committed, so a lost job must not fail the event
        let retry = self.db.retry_policy();
        for job in outcome.notifications {
            let kind = job.kind;
            let body = self.sequencer.encode(&Message::Work(WorkData::notify(job)))?;
            let pushed = retry
                .run("notify push", || self.broker.push(SUBMIT_QUEUE, body.clone()))
                .await;
            match pushed {
                Ok(()) => self.metrics.notify_jobs_total.inc(),
                Err(e) => {
                    error!(worker = %self.worker_id, kind = ?kind, error = %e, "Notify job lost");
                    self.metrics.notify_failures_total.inc();
                    self.stats.lock().notify_failed += 1;
                }
            }
        }
        Ok(())
    }

    async fn handle_work(&mut self, work: WorkData) -> Result<()> {
        match (self.role, work.payload) {
            (WorkerRole::Worker, WorkPayload::Event(event)) => self.handle_event(&event).await,
            (WorkerRole::Watcher, WorkPayload::Notify(job)) => {
                self.notifier.notify(&job).await?;
                self.stats.lock().notifications += 1;
                Ok(())
            }
            (role, payload) => {
                warn!(worker = %self.worker_id, role = %role, payload = ?payload, "Work for another role, dropping");
                Ok(())
            }
        }
    }

    /// Apply a broadcast control message
    pub async fn handle_control(&mut self, message: Message) -> Result<()> {
        self.stats.lock().control += 1;
        match message {
            Message::FlushCache(flush) => {
                if let Some(engine) = self.engines.get_mut(&flush.fabric) {
                    engine
                        .cache_mut()
                        .flush_collection(flush.collection, flush.name.as_deref())
                        .await?;
                }
            }
            Message::FlushFabric(target) => {
                if let Some(mut engine) = self.engines.remove(&target.fabric) {
                    engine.cache().log_stats();
                    engine.cache_mut().flush_all().await?;
                    info!(worker = %self.worker_id, fabric = %target.fabric, "Dropped history engine");
                }
                self.metrics.set_active_fabrics(self.engines.len());
            }
            Message::Resubscribe(target) => {
                debug!(fabric = %target.fabric, "Resubscribe is handled by the ingestion layer");
            }
            Message::Restart(restart) => {
                warn!(fabric = %restart.fabric, reason = %restart.reason, "Hard restart requested");
                return Err(EptError::HardRestart {
                    fabric: restart.fabric,
                    reason: restart.reason,
                });
            }
            other => debug!(msg_type = other.msg_type(), "Ignoring message on control channel"),
        }
        Ok(())
    }

    /// Decode and handle one body from a work queue
    pub async fn on_work(&mut self, body: &str) -> Result<()> {
        let work = match Message::decode(body) {
            Ok((_, Message::Work(work))) => work,
            Ok((_, other)) => {
                warn!(msg_type = other.msg_type(), "Unexpected message on work queue");
                return Ok(());
            }
            Err(e) => {
                warn!(error = %e, "Dropping undecodable work");
                self.metrics.decode_failures_total.inc();
                return Ok(());
            }
        };
        if let Err(e) = self.handle_work(work).await {
            error!(worker = %self.worker_id, error = %e, "Work item failed");
            self.metrics.store_errors_total.inc();
            self.stats.lock().failed += 1;
        }
        self.refresh_cache_stats();
        Ok(())
    }

    /// Decode and handle one body from the control channel
    pub async fn on_control(&mut self, body: &str) -> Result<()> {
        match Message::decode(body) {
            Ok((_, message)) if !message.is_control() => {
                debug!(msg_type = message.msg_type(), "Ignoring message on control channel");
                Ok(())
            }
            Ok((_, message)) => match self.handle_control(message).await {
                Err(e @ EptError::HardRestart { .. }) => Err(e),
                Err(e) => {
                    error!(worker = %self.worker_id, error = %e, "Control message failed");
                    Ok(())
                }
                Ok(()) => Ok(()),
            },
            Err(e) => {
                warn!(error = %e, "Dropping undecodable control message");
                self.metrics.decode_failures_total.inc();
                Ok(())
            }
        }
    }

    fn refresh_cache_stats(&mut self) {
        let interval = self.config.stats_interval();
        if self
            .last_stats_refresh
            .is_some_and(|last| last.elapsed() < interval)
        {
            return;
        }
        self.last_stats_refresh = Some(Instant::now());
        let caches = self
            .engines
            .iter()
            .map(|(fabric, engine)| {
                let stats = engine
                    .cache()
                    .stats()
                    .into_iter()
                    .map(|(name, s)| (name.to_string(), s))
                    .collect();
                (fabric.clone(), stats)
            })
            .collect();
        self.stats.lock().caches = caches;
    }

    /// Main loop; control is always drained before work
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut control = self.broker.subscribe(CONTROL_CHANNEL).await?;
        let mut work = spawn_reader(self.broker.clone(), self.queues(), self.config.pop_timeout());
        let heartbeat = spawn_heartbeat(
            self.broker.clone(),
            self.hello(),
            self.config.hello_interval(),
            self.stats.clone(),
            shutdown.clone(),
        );
        let stats_loop = spawn_stats_loop(
            self.worker_id.clone(),
            self.stats.clone(),
            self.metrics.clone(),
            self.config.stats_interval(),
            shutdown.clone(),
        );
        info!(worker = %self.worker_id, role = %self.role, queues = ?self.queues(), "Worker started");

        let result = loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break Ok(()),
                Some(body) = control.recv() => {
                    if let Err(e) = self.on_control(&body).await {
                        break Err(e);
                    }
                }
                Some(body) = work.recv() => {
                    if let Err(e) = self.on_work(&body).await {
                        break Err(e);
                    }
                }
                else => break Err(EptError::Transport("worker inputs closed".to_string())),
            }
        };

        for engine in self.engines.values_mut() {
            if let Err(e) = engine.cache_mut().flush_all().await {
                warn!(fabric = %engine.fabric(), error = %e, "Failed to persist rapid counters on exit");
            }
        }
        heartbeat.abort();
        stats_loop.abort();
        info!(worker = %self.worker_id, "Worker stopped");
        result
    }
}

/// Publish a hello every `interval`
pub fn spawn_heartbeat(
    broker: Arc<dyn Broker>,
    hello: HelloData,
    interval: Duration,
    stats: Arc<Mutex<WorkerStats>>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let sequencer = Sequencer::new();
        let message = Message::Hello(hello);
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let sent = match sequencer.encode(&message) {
                        Ok(body) => broker.publish(HELLO_CHANNEL, body).await,
                        Err(e) => Err(e),
                    };
                    match sent {
                        Ok(()) => stats.lock().hellos_sent += 1,
                        Err(e) => warn!(error = %e, "Failed to send hello"),
                    }
                }
            }
        }
    })
}

/// Log worker counters, metrics and cache stats every `interval`
pub fn spawn_stats_loop(
    worker_id: String,
    stats: Arc<Mutex<WorkerStats>>,
    metrics: MetricsCollector,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let snapshot = stats.lock().clone();
                    info!(
                        worker = %worker_id,
                        processed = snapshot.processed,
                        accepted = snapshot.accepted,
                        rejected = snapshot.rejected,
                        failed = snapshot.failed,
                        control = snapshot.control,
                        notifications = snapshot.notifications,
                        notify_failed = snapshot.notify_failed,
                        hellos = snapshot.hellos_sent,
                        "Worker stats"
                    );
                    info!(
                        worker = %worker_id,
                        analyses = metrics.analyses_total.get(),
                        analysis_failures = metrics.analysis_failures_total.get(),
                        moves = metrics.moves_total.get(),
                        stale = metrics.stale_total.get(),
                        offsubnet = metrics.offsubnet_total.get(),
                        rapid = metrics.rapid_total.get(),
                        notify_jobs = metrics.notify_jobs_total.get(),
                        notify_failures = metrics.notify_failures_total.get(),
                        decode_failures = metrics.decode_failures_total.get(),
                        store_errors = metrics.store_errors_total.get(),
                        "Worker metrics"
                    );
                    for (fabric, caches) in &snapshot.caches {
                        for (cache, s) in caches {
                            info!(
                                worker = %worker_id,
                                fabric = %fabric,
                                cache = %cache,
                                hits = s.hits,
                                misses = s.misses,
                                evictions = s.evictions,
                                flushes = s.flushes,
                                len = s.len,
                                "Cache stats"
                            );
                        }
                    }
                }
            }
        }
    })
}
