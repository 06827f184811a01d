//! Topology monitor
//!
//! Consumes structural events for one fabric from `ept_topology_<fabric>`.
//! Point updates rewrite a single topology row and broadcast a targeted cache
//! flush. vpc-domain and node-activation changes trigger a soft restart
//! (rebuild of every topology table). A peering policy change forces a hard
//! restart of every process.

use crate::broker::{topology_queue, Broker, SUBMIT_QUEUE};
use crate::cache::cache_name;
use crate::distributor::spawn_reader;
use crate::error::{EptError, Result};
use crate::message::{FabricData, FlushCacheData, Message, RestartData, Sequencer};
use crate::store::{filter, Collection, Db};
use crate::tables::TopologySnapshot;
use crate::worker::epoch_now;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

/// Source of full topology snapshots
#[async_trait]
pub trait ControllerSession: Send + Sync {
    async fn snapshot(&self, fabric: &str) -> Result<TopologySnapshot>;
}

/// Reads `<dir>/<fabric>.json`
#[derive(Debug, Clone)]
pub struct FileSession {
    dir: PathBuf,
}

impl FileSession {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self, fabric: &str) -> PathBuf {
        self.dir.join(format!("{fabric}.json"))
    }
}

#[async_trait]
impl ControllerSession for FileSession {
    async fn snapshot(&self, fabric: &str) -> Result<TopologySnapshot> {
        let path = self.path(fabric);
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| EptError::Snapshot {
                fabric: fabric.to_string(),
                reason: format!("{}: {}", path.display(), e),
            })?;
        let mut snapshot: TopologySnapshot =
            serde_json::from_str(&content).map_err(|e| EptError::Snapshot {
                fabric: fabric.to_string(),
                reason: format!("{}: {}", path.display(), e),
            })?;
        snapshot.set_fabric(fabric);
        Ok(snapshot)
    }
}

/// Structural object classes the monitor watches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StructuralClass {
    /// Fabric peering policy; immutable while the tracker runs
    PeeringPolicy,
    VpcDomain,
    NodeActivation,
    /// Port-channel to vpc id mapping
    VpcMapping,
    PortChannel,
    Tunnel,
    /// VRF/BD to vnid name mapping
    Vnid,
    Epg,
    Subnet,
}

impl StructuralClass {
    /// Table rewritten by a point update, `None` for restart classes
    pub fn collection(&self) -> Option<Collection> {
        match self {
            Self::PeeringPolicy | Self::VpcDomain | Self::NodeActivation => None,
            Self::VpcMapping => Some(Collection::Vpc),
            Self::PortChannel => Some(Collection::Pc),
            Self::Tunnel => Some(Collection::Tunnel),
            Self::Vnid => Some(Collection::Vnid),
            Self::Epg => Some(Collection::Epg),
            Self::Subnet => Some(Collection::Subnet),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StructuralAction {
    #[default]
    Upsert,
    Delete,
}

/// One structural change reported by the controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuralEvent {
    pub class: StructuralClass,
    pub ts: f64,
    #[serde(default)]
    pub action: StructuralAction,
    /// Table row for point updates
    #[serde(default)]
    pub record: Value,
}

/// What the monitor did with an event
#[derive(Debug, Clone, PartialEq)]
pub enum Reaction {
    /// Older than the last rebuild
    Dropped,
    Rebuilt,
    Updated { collection: Collection, name: String },
    /// Point update without a usable record
    Ignored,
}

/// Per-fabric structural event handler
pub struct TopologyMonitor {
    fabric: String,
    db: Db,
    broker: Arc<dyn Broker>,
    session: Arc<dyn ControllerSession>,
    sequencer: Sequencer,
    last_rebuild_ts: f64,
    rebuilds: u64,
}

impl TopologyMonitor {
    pub fn new(
        fabric: impl Into<String>,
        db: Db,
        broker: Arc<dyn Broker>,
        session: Arc<dyn ControllerSession>,
    ) -> Self {
        Self {
            fabric: fabric.into(),
            db,
            broker,
            session,
            sequencer: Sequencer::new(),
            last_rebuild_ts: 0.0,
            rebuilds: 0,
        }
    }

    pub fn fabric(&self) -> &str {
        &self.fabric
    }

    pub fn last_rebuild_ts(&self) -> f64 {
        self.last_rebuild_ts
    }

    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }

    async fn submit(&self, message: Message) -> Result<()> {
        let body = self.sequencer.encode(&message)?;
        self.broker.push(SUBMIT_QUEUE, body).await
    }

    /// Apply one structural event
    #[instrument(skip_all, fields(fabric = %self.fabric, class = ?event.class, ts = event.ts))]
    pub async fn handle(&mut self, event: &StructuralEvent) -> Result<Reaction> {
        match event.class {
            StructuralClass::PeeringPolicy => {
                let reason = "peering policy changed".to_string();
                warn!(reason = %reason, "Requesting hard restart");
                self.submit(Message::Restart(RestartData {
                    fabric: self.fabric.clone(),
                    reason: reason.clone(),
                }))
                .await?;
                Err(EptError::HardRestart {
                    fabric: self.fabric.clone(),
                    reason,
                })
            }
            StructuralClass::VpcDomain | StructuralClass::NodeActivation => {
                if event.ts <= self.last_rebuild_ts {
                    debug!(last_rebuild_ts = self.last_rebuild_ts, "Dropping event older than last rebuild");
                    return Ok(Reaction::Dropped);
                }
                self.rebuild(event.ts).await?;
                Ok(Reaction::Rebuilt)
            }
            _ => self.point_update(event).await,
        }
    }

    /// Soft restart: replace every topology table, then flush and resubscribe
    pub async fn rebuild(&mut self, ts: f64) -> Result<()> {
        let snapshot = self.session.snapshot(&self.fabric).await?;
        for coll in Collection::TOPOLOGY {
            let rows = snapshot.rows(coll)?;
            self.db.replace_all(coll, &self.fabric, &rows).await?;
            debug!(collection = %coll, rows = rows.len(), "Replaced topology table");
        }
        for coll in Collection::TOPOLOGY {
            self.submit(Message::FlushCache(FlushCacheData {
                fabric: self.fabric.clone(),
                collection: coll,
                name: None,
            }))
            .await?;
        }
        self.submit(Message::Resubscribe(FabricData {
            fabric: self.fabric.clone(),
        }))
        .await?;

        self.last_rebuild_ts = ts;
        self.rebuilds += 1;
        info!(
            fabric = %self.fabric,
            nodes = snapshot.nodes.len(),
            subnets = snapshot.subnets.len(),
            "Topology rebuilt"
        );
        Ok(())
    }

    async fn point_update(&mut self, event: &StructuralEvent) -> Result<Reaction> {
        let Some(coll) = event.class.collection() else {
            return Ok(Reaction::Ignored);
        };
        let Some(row) = event.record.as_object() else {
            warn!(collection = %coll, "Structural event without a record");
            return Ok(Reaction::Ignored);
        };
        let mut row = row.clone();
        row.insert("fabric".to_string(), Value::from(self.fabric.as_str()));

        let by_key = filter(
            coll.key_fields()
                .iter()
                .filter_map(|f| row.get(*f).map(|v| (*f, v.clone()))),
        );
        if by_key.len() != coll.key_fields().len() {
            warn!(collection = %coll, "Structural record missing key fields");
            return Ok(Reaction::Ignored);
        }

        match event.action {
            StructuralAction::Upsert => {
                self.db
                    .upsert(coll, &by_key, &Value::Object(row.clone()))
                    .await?
            }
            StructuralAction::Delete => {
                self.db.delete(coll, &by_key).await?;
            }
        }

        let name = cache_name(coll, &row);
        self.submit(Message::FlushCache(FlushCacheData {
            fabric: self.fabric.clone(),
            collection: coll,
            name: Some(name.clone()),
        }))
        .await?;
        info!(collection = %coll, name = %name, action = ?event.action, "Topology row updated");
        Ok(Reaction::Updated {
            collection: coll,
            name,
        })
    }

    /// Build the tables, then consume structural events until shutdown
    pub async fn run(mut self, pop_timeout: Duration, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        if let Err(e) = self.rebuild(epoch_now()).await {
            warn!(fabric = %self.fabric, error = %e, "Initial topology build failed");
        }
        let mut events = spawn_reader(
            self.broker.clone(),
            vec![topology_queue(&self.fabric)],
            pop_timeout,
        );
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                Some(body) = events.recv() => {
                    let event: StructuralEvent = match serde_json::from_str(&body) {
                        Ok(event) => event,
                        Err(e) => {
                            warn!(fabric = %self.fabric, error = %e, "Dropping undecodable structural event");
                            continue;
                        }
                    };
                    match self.handle(&event).await {
                        Ok(_) => {}
                        Err(e @ EptError::HardRestart { .. }) => return Err(e),
                        Err(e) => error!(fabric = %self.fabric, error = %e, "Structural event failed"),
                    }
                }
                else => break,
            }
        }
        info!(fabric = %self.fabric, "Topology monitor stopped");
        Ok(())
    }
}
