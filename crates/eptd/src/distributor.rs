//! Work distribution
//!
//! The distributor reads the shared submission queue and the hello channel.
//! Hellos register workers (and double as heartbeats); work is routed to
//! `q<index>_<worker>` of the worker owning the shard key, so every event of
//! an endpoint is serialized through one worker. Control messages submitted
//! by the topology monitor are rebroadcast on the control channel.
//!
//! Work that cannot be forwarded yet (no live worker for its role, or a
//! failed push) is held in arrival order and retried once a worker
//! registers and on every expiry tick.

use crate::broker::{Broker, CONTROL_CHANNEL, HELLO_CHANNEL, SUBMIT_QUEUE};
use crate::error::{EptError, Result};
use crate::message::{HelloData, Message, Sequencer, WorkData, WorkerRole};
use crate::metrics::MetricsCollector;
use crate::types::EndpointEvent;
use ept_common::{RetryPolicy, ShardRouter};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Work items held per role while no worker can take them
pub const MAX_HELD_WORK: usize = 65_536;

/// Registration state of one worker
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    pub worker_id: String,
    pub role: WorkerRole,
    pub queues: Vec<String>,
    pub start_time: f64,
    pub last_sequence: u64,
    pub last_seen: Instant,
}

/// Routes submitted work onto worker queues
pub struct Distributor {
    broker: Arc<dyn Broker>,
    dead_interval: Duration,
    pop_timeout: Duration,
    workers: BTreeMap<String, WorkerInfo>,
    routers: HashMap<WorkerRole, ShardRouter>,
    routed: HashMap<WorkerRole, u64>,
    held: HashMap<WorkerRole, VecDeque<WorkData>>,
    dropped: u64,
    sequencer: Sequencer,
    retry: RetryPolicy,
    metrics: Option<MetricsCollector>,
}

impl Distributor {
    pub fn new(broker: Arc<dyn Broker>, dead_interval: Duration, pop_timeout: Duration) -> Self {
        Self {
            broker,
            dead_interval,
            pop_timeout,
            workers: BTreeMap::new(),
            routers: HashMap::new(),
            routed: HashMap::new(),
            held: HashMap::new(),
            dropped: 0,
            sequencer: Sequencer::new(),
            retry: RetryPolicy::default(),
            metrics: None,
        }
    }

    /// Retry policy for control rebroadcasts
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn workers(&self) -> impl Iterator<Item = &WorkerInfo> {
        self.workers.values()
    }

    /// Work items routed so far for a role
    pub fn routed(&self, role: WorkerRole) -> u64 {
        self.routed.get(&role).copied().unwrap_or(0)
    }

    /// Work items waiting for a live worker or a successful push
    pub fn held(&self) -> usize {
        self.held.values().map(VecDeque::len).sum()
    }

    /// Work items dropped because the hold queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Register a worker or refresh its heartbeat
    pub fn handle_hello(&mut self, hello: HelloData, sequence: u64, now: Instant) {
        match self.workers.get_mut(&hello.worker_id) {
            Some(known) if known.start_time == hello.start_time => {
                if sequence <= known.last_sequence {
                    debug!(worker = %hello.worker_id, sequence, last = known.last_sequence, "Out of order hello");
                }
                known.last_sequence = known.last_sequence.max(sequence);
                known.last_seen = now;
                return;
            }
            Some(_) => info!(worker = %hello.worker_id, role = %hello.role, "Worker re-registered after restart"),
            None => info!(worker = %hello.worker_id, role = %hello.role, queues = ?hello.queues, "Worker registered"),
        }
        let info = WorkerInfo {
            worker_id: hello.worker_id.clone(),
            role: hello.role,
            queues: hello.queues,
            start_time: hello.start_time,
            last_sequence: sequence,
            last_seen: now,
        };
        self.workers.insert(hello.worker_id, info);
        self.rebuild_routes();
    }

    /// Drop workers silent for longer than the dead interval
    pub fn expire(&mut self, now: Instant) -> Vec<String> {
        let dead: Vec<String> = self
            .workers
            .values()
            .filter(|w| now.duration_since(w.last_seen) > self.dead_interval)
            .map(|w| w.worker_id.clone())
            .collect();
        for worker in &dead {
            self.workers.remove(worker);
            warn!(worker = %worker, "Worker declared dead");
        }
        if !dead.is_empty() {
            self.rebuild_routes();
        }
        dead
    }

    fn rebuild_routes(&mut self) {
        let mut by_role: HashMap<WorkerRole, Vec<String>> = HashMap::new();
        for worker in self.workers.values() {
            by_role
                .entry(worker.role)
                .or_default()
                .push(worker.worker_id.clone());
        }
        self.routers = by_role
            .into_iter()
            .map(|(role, members)| (role, ShardRouter::new(members)))
            .collect();
    }

    /// Destination queue for a work item, `None` when no worker is live
    pub fn route(&self, work: &WorkData) -> Option<String> {
        let worker_id = self.routers.get(&work.role)?.route(&work.shard)?;
        let worker = self.workers.get(worker_id)?;
        let index = work.queue_index.min(worker.queues.len().checked_sub(1)?);
        worker.queues.get(index).cloned()
    }

    /// Push a work item onto its worker queue. Returns false if it was held.
    ///
    /// Held work of the same role goes out first so items of one shard keep
    /// their order; a failed push leaves the item held and returns the error.
    pub async fn dispatch(&mut self, work: WorkData) -> Result<bool> {
        if let Err(e) = self.flush_role(work.role).await {
            self.hold(work);
            return Err(e);
        }
        let waiting = self.held.get(&work.role).is_some_and(|q| !q.is_empty());
        let queue = match self.route(&work) {
            Some(queue) if !waiting => queue,
            _ => {
                debug!(role = %work.role, shard = %work.shard, "No live worker for role, holding work");
                self.hold(work);
                return Ok(false);
            }
        };
        if let Err(e) = self.send(&queue, &work).await {
            self.hold(work);
            return Err(e);
        }
        Ok(true)
    }

    /// Forward held work that has become routable. Returns the number sent.
    pub async fn flush_held(&mut self) -> Result<usize> {
        let roles: Vec<WorkerRole> = self.held.keys().copied().collect();
        let mut sent = 0;
        for role in roles {
            sent += self.flush_role(role).await?;
        }
        if sent > 0 {
            info!(sent, held = self.held(), "Forwarded held work");
        }
        Ok(sent)
    }

    async fn flush_role(&mut self, role: WorkerRole) -> Result<usize> {
        if !self.routers.contains_key(&role) {
            return Ok(0);
        }
        let mut sent = 0;
        while let Some(work) = self.held.get_mut(&role).and_then(VecDeque::pop_front) {
            let routed = match self.route(&work) {
                Some(queue) => self.send(&queue, &work).await.map(|()| true),
                None => Ok(false),
            };
            match routed {
                Ok(true) => sent += 1,
                Ok(false) => {
                    self.held.entry(role).or_default().push_front(work);
                    break;
                }
                Err(e) => {
                    self.held.entry(role).or_default().push_front(work);
                    return Err(e);
                }
            }
        }
        Ok(sent)
    }

    fn hold(&mut self, work: WorkData) {
        let queue = self.held.entry(work.role).or_default();
        if queue.len() >= MAX_HELD_WORK {
            if let Some(oldest) = queue.pop_front() {
                self.dropped += 1;
                warn!(role = %oldest.role, shard = %oldest.shard, "Hold queue full, dropping oldest work");
            }
        }
        queue.push_back(work);
    }

    async fn send(&mut self, queue: &str, work: &WorkData) -> Result<()> {
        let body = self.sequencer.encode(&Message::Work(work.clone()))?;
        self.broker.push(queue, body).await?;
        *self.routed.entry(work.role).or_default() += 1;
        Ok(())
    }

    /// Handle one message from the submission queue
    pub async fn handle_submission(&mut self, body: &str) -> Result<()> {
        let message = match Message::decode(body) {
            Ok((_, message)) => message,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable submission");
                if let Some(metrics) = &self.metrics {
                    metrics.decode_failures_total.inc();
                }
                return Ok(());
            }
        };
        match message {
            Message::Work(work) => {
                self.dispatch(work).await?;
            }
            Message::Hello(hello) => {
                self.handle_hello(hello, 0, Instant::now());
                self.flush_held().await?;
            }
            control => {
                let body = self.sequencer.encode(&control)?;
                let published = self
                    .retry
                    .run("control publish", || self.broker.publish(CONTROL_CHANNEL, body.clone()))
                    .await;
                match published {
                    Ok(()) => info!(msg_type = control.msg_type(), "Rebroadcast control message"),
                    Err(e) if !matches!(control, Message::Restart(_)) => return Err(e.into()),
                    Err(e) => warn!(error = %e, "Restart not rebroadcast"),
                }
                // this process restarts even if the rebroadcast failed
                if let Message::Restart(restart) = control {
                    return Err(EptError::HardRestart {
                        fabric: restart.fabric,
                        reason: restart.reason,
                    });
                }
            }
        }
        Ok(())
    }

    /// Handle one submission; only a hard restart is surfaced
    pub async fn on_submission(&mut self, body: &str) -> Result<()> {
        match self.handle_submission(body).await {
            Err(e @ EptError::HardRestart { .. }) => Err(e),
            Err(e) => {
                error!(error = %e, held = self.held(), "Submission not forwarded");
                if let Some(metrics) = &self.metrics {
                    metrics.dispatch_errors_total.inc();
                }
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    async fn retry_held(&mut self) {
        if self.held() == 0 {
            return;
        }
        if let Err(e) = self.flush_held().await {
            warn!(error = %e, held = self.held(), "Held work not forwarded");
            if let Some(metrics) = &self.metrics {
                metrics.dispatch_errors_total.inc();
            }
        }
    }

    fn on_hello(&mut self, body: &str) {
        match Message::decode(body) {
            Ok((sequence, Message::Hello(hello))) => self.handle_hello(hello, sequence, Instant::now()),
            Ok((_, other)) => debug!(msg_type = other.msg_type(), "Ignoring non-hello on hello channel"),
            Err(e) => {
                warn!(error = %e, "Dropping undecodable hello");
                if let Some(metrics) = &self.metrics {
                    metrics.decode_failures_total.inc();
                }
            }
        }
    }

    /// Main loop; returns on shutdown or hard restart
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut hellos = self.broker.subscribe(HELLO_CHANNEL).await?;
        let mut submissions = spawn_reader(self.broker.clone(), vec![SUBMIT_QUEUE.to_string()], self.pop_timeout);
        let mut expiry = tokio::time::interval(self.dead_interval.max(Duration::from_millis(10)) / 2);
        info!("Distributor started");

        let result = loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break Ok(()),
                Some(body) = hellos.recv() => {
                    self.on_hello(&body);
                    self.retry_held().await;
                }
                Some(body) = submissions.recv() => {
                    if let Err(e) = self.on_submission(&body).await {
                        break Err(e);
                    }
                }
                _ = expiry.tick() => {
                    self.expire(Instant::now());
                    self.retry_held().await;
                    if let Some(metrics) = &self.metrics {
                        match self.broker.queue_len(SUBMIT_QUEUE).await {
                            Ok(depth) => metrics.set_queue_depth(depth),
                            Err(e) => debug!(error = %e, "Queue depth unavailable"),
                        }
                    }
                }
                else => {
                    error!("Distributor inputs closed");
                    break Ok(());
                }
            }
        };
        info!(held = self.held(), dropped = self.dropped, "Distributor stopped");
        result
    }
}

/// Forward popped messages into a channel so the dequeue is never cancelled
/// mid-flight by `select!`
pub fn spawn_reader(
    broker: Arc<dyn Broker>,
    queues: Vec<String>,
    timeout: Duration,
) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        loop {
            match broker.pop(&queues, timeout).await {
                Ok(Some((_, body))) => {
                    if tx.send(body).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    if tx.is_closed() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(queues = ?queues, error = %e, "Dequeue failed");
                    tokio::time::sleep(timeout).await;
                }
            }
        }
    });
    rx
}

/// Submit an endpoint event for distribution
pub async fn submit_event(
    broker: &dyn Broker,
    sequencer: &Sequencer,
    event: EndpointEvent,
    queue_index: usize,
) -> Result<()> {
    let body = sequencer.encode(&Message::Work(WorkData::event(event, queue_index)))?;
    broker.push(SUBMIT_QUEUE, body).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{worker_queues, MemoryBroker};
    use crate::message::{FlushCacheData, WorkPayload};
    use crate::store::Collection;
    use crate::types::{AddressType, EventClass, EventStatus};
    use pretty_assertions::assert_eq;

    fn hello(worker: &str, role: WorkerRole, start: f64) -> HelloData {
        HelloData {
            worker_id: worker.into(),
            role,
            queues: worker_queues(worker),
            start_time: start,
        }
    }

    fn event(addr: &str) -> EndpointEvent {
        EndpointEvent {
            fabric: "fab1".into(),
            node: 101,
            vnid: 1,
            addr: addr.into(),
            addr_type: AddressType::Ipv4,
            class: EventClass::Ip,
            status: EventStatus::Created,
            ts: 1.0,
            pctag: 0,
            flags: vec![],
            intf_id: String::new(),
            encap: String::new(),
            rewrite_mac: String::new(),
            rewrite_bd: 0,
        }
    }

    fn distributor(broker: Arc<MemoryBroker>) -> Distributor {
        Distributor::new(broker, Duration::from_secs(3), Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_routing_is_deterministic_per_shard() {
        let broker = Arc::new(MemoryBroker::new());
        let mut dist = distributor(broker.clone());
        let now = Instant::now();
        for w in ["w1", "w2", "w3"] {
            dist.handle_hello(hello(w, WorkerRole::Worker, 1.0), 1, now);
        }

        let first = dist.route(&WorkData::event(event("10.0.0.5"), 0)).unwrap();
        for _ in 0..10 {
            assert_eq!(dist.route(&WorkData::event(event("10.0.0.5"), 0)).unwrap(), first);
        }
        // priority index selects the queue of the same worker
        let low = dist.route(&WorkData::event(event("10.0.0.5"), 1)).unwrap();
        assert_eq!(&low[2..], &first[2..]);
        assert!(first.starts_with("q0_"));
        assert!(low.starts_with("q1_"));
        // out of range index is clamped
        let clamped = dist.route(&WorkData::event(event("10.0.0.5"), 9)).unwrap();
        assert_eq!(clamped, low);
    }

    #[tokio::test]
    async fn test_roles_route_separately() {
        let broker = Arc::new(MemoryBroker::new());
        let mut dist = distributor(broker.clone());
        let now = Instant::now();
        dist.handle_hello(hello("w1", WorkerRole::Worker, 1.0), 1, now);

        let job = crate::types::NotifyJob {
            kind: crate::types::NotifyKind::Move,
            key: event("10.0.0.5").key(),
            node: 101,
            ts: 1.0,
            detail: String::new(),
        };
        assert_eq!(dist.route(&WorkData::notify(job.clone())), None);
        assert!(!dist.dispatch(WorkData::notify(job.clone())).await.unwrap());
        assert_eq!(dist.held(), 1);
        assert_eq!(dist.dropped(), 0);

        dist.handle_hello(hello("watcher", WorkerRole::Watcher, 1.0), 1, now);
        assert_eq!(dist.route(&WorkData::notify(job)), Some("q1_watcher".to_string()));
        assert_eq!(dist.flush_held().await.unwrap(), 1);
        assert_eq!(dist.held(), 0);
        assert_eq!(broker.queue_len("q1_watcher").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_work_before_first_hello_is_forwarded_in_order() {
        let broker = Arc::new(MemoryBroker::new());
        let mut dist = distributor(broker.clone());
        let seq = Sequencer::new();
        for ts in [1.0, 2.0, 3.0] {
            let mut early = event("10.0.0.5");
            early.ts = ts;
            let body = seq.encode(&Message::Work(WorkData::event(early, 0))).unwrap();
            dist.handle_submission(&body).await.unwrap();
        }
        assert_eq!(dist.held(), 3);

        // a hello arriving through the submission queue releases the backlog
        let body = seq
            .encode(&Message::Hello(hello("w1", WorkerRole::Worker, 1.0)))
            .unwrap();
        dist.handle_submission(&body).await.unwrap();
        assert_eq!(dist.held(), 0);
        let mut order = Vec::new();
        while let Some((_, body)) = broker
            .pop(&["q0_w1".to_string()], Duration::from_millis(1))
            .await
            .unwrap()
        {
            let Ok((_, Message::Work(work))) = Message::decode(&body) else {
                panic!("expected work");
            };
            let WorkPayload::Event(event) = work.payload else {
                panic!("expected event");
            };
            order.push(event.ts);
        }
        assert_eq!(order, vec![1.0, 2.0, 3.0]);
    }

    #[tokio::test]
    async fn test_failed_push_is_held_and_not_fatal() {
        let broker = Arc::new(MemoryBroker::new());
        let metrics = MetricsCollector::new().unwrap();
        let mut dist = distributor(broker.clone()).with_metrics(metrics.clone());
        dist.handle_hello(hello("w1", WorkerRole::Worker, 1.0), 1, Instant::now());
        let seq = Sequencer::new();
        let body = seq
            .encode(&Message::Work(WorkData::event(event("10.0.0.5"), 0)))
            .unwrap();

        broker.fail_pushes(1);
        dist.on_submission(&body).await.unwrap();
        assert_eq!(metrics.dispatch_errors_total.get(), 1.0);
        assert_eq!(dist.held(), 1);
        assert_eq!(broker.queue_len("q0_w1").await.unwrap(), 0);

        // the next submission pushes the held item first
        dist.on_submission(&body).await.unwrap();
        assert_eq!(dist.held(), 0);
        assert_eq!(broker.queue_len("q0_w1").await.unwrap(), 2);
        assert_eq!(dist.routed(WorkerRole::Worker), 2);
    }

    #[tokio::test]
    async fn test_run_survives_push_failure() {
        let broker = Arc::new(MemoryBroker::new());
        let seq = Sequencer::new();
        for addr in ["10.0.0.5", "10.0.0.6"] {
            submit_event(broker.as_ref(), &seq, event(addr), 0).await.unwrap();
        }
        let mut dist = distributor(broker.clone());
        dist.handle_hello(hello("w1", WorkerRole::Worker, 1.0), 1, Instant::now());

        // first forward fails; the loop keeps going and the item is retried
        broker.fail_pushes(1);
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(dist.run(rx));

        let deadline = Instant::now() + Duration::from_secs(5);
        while broker.queue_len("q0_w1").await.unwrap() < 2 {
            assert!(Instant::now() < deadline, "timed out waiting for dispatch");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tx.send(true).unwrap();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_worker_is_removed() {
        let broker = Arc::new(MemoryBroker::new());
        let mut dist = distributor(broker.clone());
        let start = Instant::now();
        dist.handle_hello(hello("w1", WorkerRole::Worker, 1.0), 1, start);
        dist.handle_hello(hello("w2", WorkerRole::Worker, 1.0), 1, start);

        tokio::time::advance(Duration::from_secs(2)).await;
        dist.handle_hello(hello("w2", WorkerRole::Worker, 1.0), 2, Instant::now());
        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(dist.expire(Instant::now()), vec!["w1".to_string()]);
        // every shard now lands on the survivor
        for addr in ["a", "b", "c", "d"] {
            assert_eq!(
                dist.route(&WorkData::event(event(addr), 0)).as_deref(),
                Some("q0_w2")
            );
        }
    }

    #[tokio::test]
    async fn test_restarted_worker_reregisters() {
        let broker = Arc::new(MemoryBroker::new());
        let mut dist = distributor(broker.clone());
        let now = Instant::now();
        dist.handle_hello(hello("w1", WorkerRole::Worker, 1.0), 5, now);
        dist.handle_hello(hello("w1", WorkerRole::Worker, 2.0), 1, now);
        let info = dist.workers().next().unwrap();
        assert_eq!(info.start_time, 2.0);
        assert_eq!(info.last_sequence, 1);
    }

    #[tokio::test]
    async fn test_submission_dispatch_and_rebroadcast() {
        let broker = Arc::new(MemoryBroker::new());
        let mut control = broker.subscribe(CONTROL_CHANNEL).await.unwrap();
        let mut dist = distributor(broker.clone());
        dist.handle_hello(hello("w1", WorkerRole::Worker, 1.0), 1, Instant::now());

        let seq = Sequencer::new();
        submit_event(broker.as_ref(), &seq, event("10.0.0.5"), 0)
            .await
            .unwrap();
        let (_, body) = broker
            .pop(&[SUBMIT_QUEUE.to_string()], Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        dist.handle_submission(&body).await.unwrap();
        assert_eq!(broker.queue_len("q0_w1").await.unwrap(), 1);
        assert_eq!(dist.routed(WorkerRole::Worker), 1);

        let flush = Message::FlushCache(FlushCacheData {
            fabric: "fab1".into(),
            collection: Collection::Epg,
            name: Some("100|32770".into()),
        });
        dist.handle_submission(&flush.encode(1).unwrap()).await.unwrap();
        let (_, rebroadcast) = Message::decode(&control.recv().await.unwrap()).unwrap();
        assert_eq!(rebroadcast, flush);

        // garbage is dropped, not fatal
        dist.handle_submission(r#"{"msgType":"bogus"}"#).await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_is_rebroadcast_then_surfaced() {
        let broker = Arc::new(MemoryBroker::new());
        let mut control = broker.subscribe(CONTROL_CHANNEL).await.unwrap();
        let mut dist = distributor(broker.clone());
        let restart = Message::Restart(crate::message::RestartData {
            fabric: "fab1".into(),
            reason: "peering policy changed".into(),
        });
        let result = dist.handle_submission(&restart.encode(1).unwrap()).await;
        assert!(matches!(result, Err(EptError::HardRestart { .. })));
        assert!(control.recv().await.is_some());
    }
}
