//! Session configuration

use std::sync::Arc;
use std::time::Duration;

use crate::peer::DEFAULT_FAILURE_WINDOW;
use crate::sync::{Clock, SystemClock};
use crate::transfer::{DEFAULT_CHUNK_SIZE, DEFAULT_MAX_TRANSFER_BYTES};

/// Tunables for one room session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long to wait for the relay to admit us
    pub join_timeout: Duration,
    /// Raw bytes per chunk, before base64
    pub chunk_size: usize,
    /// Delay between outbound chunks
    pub chunk_pace: Duration,
    /// Depth of the outbound bulk lane
    pub bulk_queue_depth: usize,
    pub max_transfer_bytes: u64,
    /// Give up on an inbound transfer after this long without a chunk.
    /// Off by default.
    pub transfer_idle_timeout: Option<Duration>,
    pub snapshot_retry_attempts: u32,
    /// First retry delay, doubled after each attempt
    pub snapshot_retry_backoff: Duration,
    pub drift_threshold_secs: f64,
    pub peer_failure_window: Duration,
    pub clock: Arc<dyn Clock>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            join_timeout: Duration::from_secs(10),
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_pace: Duration::from_millis(20),
            bulk_queue_depth: 64,
            max_transfer_bytes: DEFAULT_MAX_TRANSFER_BYTES,
            transfer_idle_timeout: None,
            snapshot_retry_attempts: 4,
            snapshot_retry_backoff: Duration::from_millis(500),
            drift_threshold_secs: 2.0,
            peer_failure_window: DEFAULT_FAILURE_WINDOW,
            clock: Arc::new(SystemClock),
        }
    }
}

impl SessionConfig {
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    pub fn with_chunking(mut self, chunk_size: usize, pace: Duration) -> Self {
        self.chunk_size = chunk_size;
        self.chunk_pace = pace;
        self
    }

    pub fn with_transfer_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.transfer_idle_timeout = timeout;
        self
    }

    pub fn with_snapshot_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.snapshot_retry_attempts = attempts;
        self.snapshot_retry_backoff = backoff;
        self
    }

    /// Backoff before attempt `attempt` (1-based) is retried
    pub(crate) fn retry_delay(&self, attempt: u32) -> Duration {
        self.snapshot_retry_backoff * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_backoff_doubles() {
        let config = SessionConfig::default();
        assert_eq!(config.retry_delay(1), Duration::from_millis(500));
        assert_eq!(config.retry_delay(2), Duration::from_millis(1000));
        assert_eq!(config.retry_delay(3), Duration::from_millis(2000));
    }
}
