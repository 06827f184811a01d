//! Configuration file support for eptd
//!
//! Loads and validates tracker configuration from TOML files.
//! Default location: /etc/sonic/eptd.conf

use crate::error::{EptError, Result};
use ept_common::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Default configuration path
pub const DEFAULT_CONFIG_PATH: &str = "/etc/sonic/eptd.conf";

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Redis host
    #[serde(default = "default_redis_host")]
    pub redis_host: String,

    /// Redis port
    #[serde(default = "default_redis_port")]
    pub redis_port: u16,

    /// Redis database number holding tracker collections and queues
    #[serde(default = "default_db_number")]
    pub db_number: u32,

    /// Attempts per store request before the failure is surfaced
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Fixed backoff between attempts in milliseconds
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
}

/// Distributor / worker cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Interval between worker hellos in milliseconds
    #[serde(default = "default_hello_interval")]
    pub hello_interval_ms: u64,

    /// Missed hello intervals before a worker is declared dead
    #[serde(default = "default_miss_multiplier")]
    pub miss_multiplier: u32,

    /// Worker tasks started by the standalone role
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Interval between stats log lines in seconds
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,

    /// Blocking dequeue timeout in milliseconds
    #[serde(default = "default_pop_timeout")]
    pub pop_timeout_ms: u64,
}

/// History engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Max events kept per (node, endpoint) history
    #[serde(default = "default_max_history")]
    pub max_node_events: usize,

    /// Max events kept in the canonical endpoint record
    #[serde(default = "default_max_history")]
    pub max_endpoint_events: usize,

    /// Max entries kept in move records
    #[serde(default = "default_max_derived")]
    pub max_move_events: usize,

    /// Max entries kept in stale records
    #[serde(default = "default_max_derived")]
    pub max_stale_events: usize,

    /// Max entries kept in off-subnet records
    #[serde(default = "default_max_derived")]
    pub max_offsubnet_events: usize,

    #[serde(default = "default_true")]
    pub notify_move: bool,

    #[serde(default)]
    pub notify_stale: bool,

    #[serde(default)]
    pub notify_offsubnet: bool,

    #[serde(default)]
    pub notify_rapid: bool,

    /// Window in seconds within which a re-learn overwrites a canonical delete
    #[serde(default = "default_transitory_delete")]
    pub transitory_delete_secs: f64,

    /// Accepted events per window above which an endpoint is rapid
    #[serde(default = "default_rapid_threshold")]
    pub rapid_threshold: u64,

    /// Rapid counting window in seconds
    #[serde(default = "default_rapid_window")]
    pub rapid_window_secs: f64,

    /// Seconds an endpoint stays rapid once flagged
    #[serde(default = "default_rapid_holdtime")]
    pub rapid_holdtime_secs: f64,
}

/// Per sub-cache capacities
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_small_cache")]
    pub node: usize,
    #[serde(default = "default_cache")]
    pub tunnel: usize,
    #[serde(default = "default_cache")]
    pub vpc: usize,
    #[serde(default = "default_cache")]
    pub pc: usize,
    #[serde(default = "default_cache")]
    pub vnid: usize,
    #[serde(default = "default_cache")]
    pub epg: usize,
    #[serde(default = "default_cache")]
    pub subnet: usize,
    #[serde(default = "default_large_cache")]
    pub offsubnet: usize,
    #[serde(default = "default_large_cache")]
    pub rapid: usize,
}

/// Topology monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Fabrics monitored by the watcher
    #[serde(default)]
    pub fabrics: Vec<String>,

    /// Directory holding `<fabric>.json` topology snapshots
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: String,
}

/// Complete eptd configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EptdConfig {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub topology: TopologyConfig,
}

// Default functions
fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_db_number() -> u32 {
    0
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_backoff() -> u64 {
    100
}

fn default_hello_interval() -> u64 {
    1000
}

fn default_miss_multiplier() -> u32 {
    3
}

fn default_worker_count() -> usize {
    4
}

fn default_stats_interval() -> u64 {
    60
}

fn default_pop_timeout() -> u64 {
    1000
}

fn default_max_history() -> usize {
    64
}

fn default_max_derived() -> usize {
    32
}

fn default_true() -> bool {
    true
}

fn default_transitory_delete() -> f64 {
    3.0
}

fn default_rapid_threshold() -> u64 {
    1024
}

fn default_rapid_window() -> f64 {
    60.0
}

fn default_rapid_holdtime() -> f64 {
    600.0
}

fn default_small_cache() -> usize {
    512
}

fn default_cache() -> usize {
    1024
}

fn default_large_cache() -> usize {
    4096
}

fn default_snapshot_dir() -> String {
    "/var/lib/eptd/snapshots".to_string()
}

// Default implementations
impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            redis_host: default_redis_host(),
            redis_port: default_redis_port(),
            db_number: default_db_number(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_ms: default_retry_backoff(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            hello_interval_ms: default_hello_interval(),
            miss_multiplier: default_miss_multiplier(),
            worker_count: default_worker_count(),
            stats_interval_secs: default_stats_interval(),
            pop_timeout_ms: default_pop_timeout(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_node_events: default_max_history(),
            max_endpoint_events: default_max_history(),
            max_move_events: default_max_derived(),
            max_stale_events: default_max_derived(),
            max_offsubnet_events: default_max_derived(),
            notify_move: true,
            notify_stale: false,
            notify_offsubnet: false,
            notify_rapid: false,
            transitory_delete_secs: default_transitory_delete(),
            rapid_threshold: default_rapid_threshold(),
            rapid_window_secs: default_rapid_window(),
            rapid_holdtime_secs: default_rapid_holdtime(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            node: default_small_cache(),
            tunnel: default_cache(),
            vpc: default_cache(),
            pc: default_cache(),
            vnid: default_cache(),
            epg: default_cache(),
            subnet: default_cache(),
            offsubnet: default_large_cache(),
            rapid: default_large_cache(),
        }
    }
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            fabrics: Vec::new(),
            snapshot_dir: default_snapshot_dir(),
        }
    }
}

impl CacheConfig {
    fn capacities(&self) -> [(&'static str, usize); 9] {
        [
            ("node", self.node),
            ("tunnel", self.tunnel),
            ("vpc", self.vpc),
            ("pc", self.pc),
            ("vnid", self.vnid),
            ("epg", self.epg),
            ("subnet", self.subnet),
            ("offsubnet", self.offsubnet),
            ("rapid", self.rapid),
        ]
    }
}

impl EptdConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|e| {
                EptError::Config(format!(
                    "Failed to parse config file {}: {}",
                    path.display(),
                    e
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(EptError::Io(e)),
        }
    }

    /// Load from default location or defaults
    pub fn load() -> Result<Self> {
        Self::load_or_default(DEFAULT_CONFIG_PATH)
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| EptError::Config(format!("Failed to serialize config: {}", e)))?;
        fs::write(path.as_ref(), content)?;
        Ok(())
    }

    /// Store retry policy
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.database.retry_attempts,
            Duration::from_millis(self.database.retry_backoff_ms),
        )
    }

    pub fn hello_interval(&self) -> Duration {
        Duration::from_millis(self.cluster.hello_interval_ms)
    }

    /// Silence after which a worker is declared dead
    pub fn dead_interval(&self) -> Duration {
        self.hello_interval() * self.cluster.miss_multiplier
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.cluster.stats_interval_secs)
    }

    pub fn pop_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.pop_timeout_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.database.redis_port == 0 {
            return Err(EptError::Config("redis_port must be > 0".to_string()));
        }

        if self.database.retry_attempts == 0 {
            return Err(EptError::Config("retry_attempts must be >= 1".to_string()));
        }

        if self.cluster.hello_interval_ms == 0 {
            return Err(EptError::Config("hello_interval_ms must be > 0".to_string()));
        }

        if self.cluster.miss_multiplier == 0 {
            return Err(EptError::Config("miss_multiplier must be >= 1".to_string()));
        }

        if self.cluster.worker_count == 0 {
            return Err(EptError::Config("worker_count must be >= 1".to_string()));
        }

        let lengths = [
            ("max_node_events", self.engine.max_node_events),
            ("max_endpoint_events", self.engine.max_endpoint_events),
            ("max_move_events", self.engine.max_move_events),
            ("max_stale_events", self.engine.max_stale_events),
            ("max_offsubnet_events", self.engine.max_offsubnet_events),
        ];
        if let Some((name, _)) = lengths.iter().find(|(_, len)| *len == 0) {
            return Err(EptError::Config(format!("{} must be > 0", name)));
        }

        if self.engine.rapid_window_secs <= 0.0 || self.engine.transitory_delete_secs < 0.0 {
            return Err(EptError::Config(
                "rapid_window_secs must be > 0 and transitory_delete_secs >= 0".to_string(),
            ));
        }

        if let Some((name, _)) = self.cache.capacities().iter().find(|(_, cap)| *cap == 0) {
            return Err(EptError::Config(format!("cache.{} capacity must be > 0", name)));
        }

        Ok(())
    }
}
