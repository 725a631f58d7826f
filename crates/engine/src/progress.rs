//! Coalesced copy-progress checkpoints
//!
//! Progress is persisted for operator visibility only; a crash during a copy
//! restarts that disk from zero. Persisting on every chunk would turn a
//! multi-hour copy into millions of log writes, so reports are coalesced by
//! byte count and elapsed time, whichever threshold is hit first.

use crate::config::ProgressConfig;
use std::time::{Duration, Instant};

/// Decides when a progress report is worth persisting
#[derive(Debug)]
pub struct ProgressCheckpointer {
    bytes_threshold: u64,
    interval: Duration,
    last_bytes: u64,
    last_at: Instant,
}

impl ProgressCheckpointer {
    /// Start tracking from zero bytes
    pub fn new(config: &ProgressConfig) -> Self {
        Self {
            bytes_threshold: config.checkpoint_bytes,
            interval: config.interval(),
            last_bytes: 0,
            last_at: Instant::now(),
        }
    }

    /// True if `bytes_copied` should be persisted now
    pub fn should_checkpoint(&self, bytes_copied: u64) -> bool {
        if bytes_copied <= self.last_bytes {
            return false;
        }
        bytes_copied - self.last_bytes >= self.bytes_threshold
            || self.last_at.elapsed() >= self.interval
    }

    /// Record that `bytes_copied` was persisted
    pub fn mark(&mut self, bytes_copied: u64) {
        self.last_bytes = bytes_copied;
        self.last_at = Instant::now();
    }
}
