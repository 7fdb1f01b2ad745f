//! Configuration for category writers.
//!
//! Queue capacity, overflow handling and flush timeouts are shared between
//! the writer handle and its worker thread.

use std::time::Duration;

use thiserror::Error;

use crate::rate_limited_warner::DEFAULT_WARN_INTERVAL;

/// Default bounded channel capacity for a category queue.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;
/// Default time a flush waits for the worker to acknowledge.
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

const VALID_POLICIES: &str = "drop, block, timeout:N";

/// Determines how a writer reacts when its queue is full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Drop new records, preserving existing ones.
    #[default]
    Drop,
    /// Block the caller until space becomes available.
    Block,
    /// Block up to the specified duration before giving up.
    Timeout(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyParseError {
    #[error("timeout must be a positive integer number of milliseconds ('timeout:N')")]
    InvalidTimeout,
    #[error("invalid overflow policy '{0}'. Valid options are: {VALID_POLICIES}")]
    Unknown(String),
}

impl std::str::FromStr for OverflowPolicy {
    type Err = PolicyParseError;

    /// Parse `drop`, `block` or `timeout:N` (milliseconds), ignoring case
    /// and surrounding whitespace.
    fn from_str(policy: &str) -> Result<Self, Self::Err> {
        let normalized = policy.trim().to_ascii_lowercase();
        if let Some(rest) = normalized.strip_prefix("timeout:") {
            let ms: u64 = rest
                .trim()
                .parse()
                .map_err(|_| PolicyParseError::InvalidTimeout)?;
            if ms == 0 {
                return Err(PolicyParseError::InvalidTimeout);
            }
            return Ok(Self::Timeout(Duration::from_millis(ms)));
        }
        match normalized.as_str() {
            "drop" => Ok(Self::Drop),
            "block" => Ok(Self::Block),
            _ => Err(PolicyParseError::Unknown(normalized)),
        }
    }
}

/// Options for constructing a [`CategoryWriter`](super::CategoryWriter).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriterConfig {
    /// Bounded queue size for commands waiting to be applied.
    pub capacity: usize,
    /// Policy to apply when the queue is full.
    pub overflow_policy: OverflowPolicy,
    /// Upper bound on [`flush`](super::CategoryWriter::flush) and shutdown waits.
    pub flush_timeout: Duration,
    /// Interval between rate-limited drop warnings.
    pub warn_interval: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CHANNEL_CAPACITY,
            overflow_policy: OverflowPolicy::Drop,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
            warn_interval: DEFAULT_WARN_INTERVAL,
        }
    }
}
