//! Bounded retry with fixed backoff.
//!
//! Store calls that fail with a transient error (timeouts, dropped
//! connections) are retried a fixed number of times with a fixed pause in
//! between. Permanent errors are surfaced immediately.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Classifies errors as worth retrying.
pub trait Transient {
    /// Returns true if the operation may succeed when repeated.
    fn is_transient(&self) -> bool;
}

/// Failure returned by [`RetryPolicy::run`].
#[derive(Debug, Error)]
pub enum RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// Every attempt failed with a transient error
    #[error("{op} failed after {attempts} attempts: {source}")]
    Exhausted {
        op: String,
        attempts: u32,
        #[source]
        source: E,
    },

    /// The operation failed with a non-transient error
    #[error("{op} failed: {source}")]
    Permanent {
        op: String,
        #[source]
        source: E,
    },
}

impl<E> RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// Returns the underlying error.
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { source, .. } => source,
            RetryError::Permanent { source, .. } => source,
        }
    }
}

/// Fixed-count, fixed-backoff retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub attempts: u32,
    /// Pause between attempts
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy. Zero attempts is treated as one.
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Runs `f` until it succeeds, fails permanently, or attempts run out.
    pub async fn run<T, E, F, Fut>(&self, op: &str, mut f: F) -> Result<T, RetryError<E>>
    where
        E: std::error::Error + Transient + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match f().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(op, attempt, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if !e.is_transient() => {
                    return Err(RetryError::Permanent {
                        op: op.to_string(),
                        source: e,
                    });
                }
                Err(e) if attempt >= attempts => {
                    return Err(RetryError::Exhausted {
                        op: op.to_string(),
                        attempts,
                        source: e,
                    });
                }
                Err(e) => {
                    warn!(op, attempt, error = %e, "transient failure, retrying");
                    attempt += 1;
                    tokio::time::sleep(self.backoff).await;
                }
            }
        }
    }
}
