//! Fabric endpoint tracker daemon
//!
//! One binary, four roles: `manager` runs the distributor, `worker` runs a
//! history worker, `watcher` delivers notifications and hosts the topology
//! monitors, `standalone` runs all of them in one process.

use anyhow::Context;
use clap::{Parser, ValueEnum};
use sonic_eptd::broker::{Broker, MemoryBroker, RedisBroker};
use sonic_eptd::config_file::{EptdConfig, DEFAULT_CONFIG_PATH};
use sonic_eptd::distributor::{submit_event, Distributor};
use sonic_eptd::message::{Sequencer, WorkerRole};
use sonic_eptd::metrics::MetricsCollector;
use sonic_eptd::store::{Db, MemoryStore, RedisStore};
use sonic_eptd::topology::{ControllerSession, FileSession, TopologyMonitor};
use sonic_eptd::types::EndpointEvent;
use sonic_eptd::worker::Worker;
use sonic_eptd::EptError;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit status asking the supervisor to respawn every eptd process
const HARD_RESTART_EXIT: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Role {
    Manager,
    Worker,
    Watcher,
    Standalone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    Memory,
    Redis,
}

/// SONiC fabric endpoint tracker
#[derive(Parser, Debug)]
#[command(name = "eptd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Process role
    #[arg(value_enum)]
    role: Role,

    /// Worker id (worker and watcher roles)
    #[arg(short = 'w', long)]
    worker_id: Option<String>,

    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Store and transport backend
    #[arg(short = 'b', long, value_enum, default_value = "redis")]
    backend: Backend,

    /// JSON-lines file of endpoint events to submit (standalone role)
    #[arg(long)]
    replay: Option<PathBuf>,

    /// Log level used when RUST_LOG is unset
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = init_logging(&args.log_level) {
        eprintln!("eptd: {e:#}");
        return ExitCode::FAILURE;
    }

    match run(args).await {
        Ok(()) => {
            info!("eptd: exiting normally");
            ExitCode::SUCCESS
        }
        Err(e) => match e.downcast_ref::<EptError>() {
            Some(EptError::HardRestart { fabric, reason }) => {
                warn!(fabric = %fabric, reason = %reason, "eptd: exiting for hard restart");
                ExitCode::from(HARD_RESTART_EXIT)
            }
            _ => {
                error!(error = ?e, "eptd: exiting with error");
                ExitCode::FAILURE
            }
        },
    }
}

fn init_logging(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .compact()
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to set logger: {e}"))
}

fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("eptd: received SIGINT/SIGTERM");
            let _ = tx.send(true);
        }
    });
    rx
}

async fn connect(backend: Backend, config: &EptdConfig) -> anyhow::Result<(Arc<dyn Broker>, Db)> {
    let db = &config.database;
    match backend {
        Backend::Memory => Ok((
            Arc::new(MemoryBroker::new()),
            Db::new(Arc::new(MemoryStore::new()), config.retry_policy()),
        )),
        Backend::Redis => {
            let broker = RedisBroker::connect(&db.redis_host, db.redis_port, db.db_number)
                .await
                .context("connecting redis transport")?;
            let store = RedisStore::connect(&db.redis_host, db.redis_port, db.db_number)
                .await
                .context("connecting redis store")?;
            Ok((Arc::new(broker), Db::new(Arc::new(store), config.retry_policy())))
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = EptdConfig::load_or_default(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    config.validate()?;
    let config = Arc::new(config);
    let metrics = MetricsCollector::new()?;
    let shutdown = shutdown_signal();

    info!(role = ?args.role, backend = ?args.backend, "eptd: starting");
    let worker_id = args
        .worker_id
        .clone()
        .unwrap_or_else(|| format!("{:?}-{}", args.role, std::process::id()).to_lowercase());

    match args.role {
        Role::Manager => {
            let (broker, _db) = connect(args.backend, &config).await?;
            Distributor::new(broker, config.dead_interval(), config.pop_timeout())
                .with_retry(config.retry_policy())
                .with_metrics(metrics)
                .run(shutdown)
                .await?;
        }
        Role::Worker => {
            let (broker, db) = connect(args.backend, &config).await?;
            Worker::new(worker_id, WorkerRole::Worker, broker, db, config, metrics)
                .run(shutdown)
                .await?;
        }
        Role::Watcher => {
            let (broker, db) = connect(args.backend, &config).await?;
            run_watcher(worker_id, broker, db, config, metrics, shutdown).await?;
        }
        Role::Standalone => {
            run_standalone(args.backend, args.replay.as_deref(), config, metrics, shutdown).await?;
        }
    }
    Ok(())
}

/// Watcher worker plus one topology monitor per configured fabric
async fn run_watcher(
    worker_id: String,
    broker: Arc<dyn Broker>,
    db: Db,
    config: Arc<EptdConfig>,
    metrics: MetricsCollector,
    shutdown: watch::Receiver<bool>,
) -> sonic_eptd::Result<()> {
    let session: Arc<dyn ControllerSession> =
        Arc::new(FileSession::new(&config.topology.snapshot_dir));
    let mut monitors = JoinSet::new();
    for fabric in &config.topology.fabrics {
        let monitor = TopologyMonitor::new(fabric.clone(), db.clone(), broker.clone(), session.clone());
        monitors.spawn(monitor.run(config.pop_timeout(), shutdown.clone()));
    }

    let watcher = Worker::new(worker_id, WorkerRole::Watcher, broker, db, config, metrics);
    let watcher = watcher.run(shutdown);
    tokio::pin!(watcher);
    loop {
        tokio::select! {
            result = &mut watcher => {
                monitors.abort_all();
                return result;
            }
            Some(joined) = monitors.join_next() => match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    monitors.abort_all();
                    return Err(e);
                }
                Err(e) => warn!(error = %e, "Topology monitor task failed"),
            }
        }
    }
}

/// Distributor, workers and watcher in one process over the in-memory broker
async fn run_standalone(
    backend: Backend,
    replay: Option<&Path>,
    config: Arc<EptdConfig>,
    metrics: MetricsCollector,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let (_, db) = connect(backend, &config).await?;
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let mut tasks = JoinSet::new();

    tasks.spawn(
        Distributor::new(broker.clone(), config.dead_interval(), config.pop_timeout())
            .with_retry(config.retry_policy())
            .with_metrics(metrics.clone())
            .run(shutdown.clone()),
    );
    for i in 0..config.cluster.worker_count {
        let worker = Worker::new(
            format!("worker-{i}"),
            WorkerRole::Worker,
            broker.clone(),
            db.clone(),
            config.clone(),
            metrics.clone(),
        );
        tasks.spawn(worker.run(shutdown.clone()));
    }
    tasks.spawn(run_watcher(
        "watcher-0".to_string(),
        broker.clone(),
        db,
        config.clone(),
        metrics,
        shutdown.clone(),
    ));

    // the distributor holds replayed work until the workers have said hello
    if let Some(path) = replay {
        let submitted = replay_events(broker.as_ref(), path).await?;
        info!(path = %path.display(), submitted, "eptd: replay submitted");
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tasks.abort_all();
                return Err(e.into());
            }
            Err(e) => warn!(error = %e, "eptd: task failed"),
        }
    }
    Ok(())
}

/// Submit every event of a JSON-lines file; undecodable lines are skipped
async fn replay_events(broker: &dyn Broker, path: &Path) -> anyhow::Result<usize> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let sequencer = Sequencer::new();
    let mut submitted = 0;
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match serde_json::from_str::<EndpointEvent>(line) {
            Ok(event) => {
                submit_event(broker, &sequencer, event, 0).await?;
                submitted += 1;
            }
            Err(e) => warn!(line = lineno + 1, error = %e, "eptd: skipping replay line"),
        }
    }
    Ok(submitted)
}
