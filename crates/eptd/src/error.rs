//! Error types for eptd

use ept_common::{RetryError, Transient};
use thiserror::Error;

/// Errors that can occur in the endpoint tracker
#[derive(Debug, Error)]
pub enum EptError {
    /// Redis connection or command failed
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Store request timed out (transient, retried)
    #[error("Store timeout: {0}")]
    StoreTimeout(String),

    /// Store rejected or failed a request
    #[error("Store error: {0}")]
    Store(String),

    /// A document could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// A queue message carried an unrecognized msgType
    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    /// Transport (queue or channel) failure (transient, retried)
    #[error("Transport error: {0}")]
    Transport(String),

    /// vpc peer lookup failed while remapping a node id
    #[error("Peer lookup failed for node {node} in fabric {fabric}")]
    PeerLookupFailed { fabric: String, node: u32 },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Controller session could not provide a topology snapshot
    #[error("Topology snapshot unavailable for fabric {fabric}: {reason}")]
    Snapshot { fabric: String, reason: String },

    /// Unrecoverable structural change; the process must be respawned
    #[error("Hard restart required for fabric {fabric}: {reason}")]
    HardRestart { fabric: String, reason: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Transient for EptError {
    fn is_transient(&self) -> bool {
        match self {
            EptError::StoreTimeout(_) | EptError::Transport(_) => true,
            EptError::Redis(e) => e.is_timeout() || e.is_connection_dropped() || e.is_io_error(),
            _ => false,
        }
    }
}

impl From<RetryError<EptError>> for EptError {
    fn from(e: RetryError<EptError>) -> Self {
        e.into_inner()
    }
}

/// Result type alias for eptd operations
pub type Result<T> = std::result::Result<T, EptError>;
