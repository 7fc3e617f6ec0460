//! Engine tuning knobs.
//!
//! Nothing here is persisted; callers build an `EngineConfig` from their own
//! flags or environment and hand it to the coordinator.

use std::time::Duration;

use crate::checksums::ChecksumAlgorithm;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long to wait for an application to exit after asking it to stop
    pub termination_timeout: Duration,

    /// Interval between process-table polls while waiting for exit
    pub poll_interval: Duration,

    /// Emit a mid-file progress snapshot every this many bytes
    pub progress_interval_bytes: u64,

    /// Read/write buffer size for file copies
    pub buffer_size: usize,

    /// Compare digests of source and copy before finalizing (sizes are always compared)
    pub verify: Option<ChecksumAlgorithm>,

    /// Force-kill processes that ignore the graceful stop request
    pub force_kill_after_timeout: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            termination_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(200),
            progress_interval_bytes: 1024 * 1024,
            buffer_size: 64 * 1024,
            verify: None,
            force_kill_after_timeout: false,
        }
    }
}

impl EngineConfig {
    pub fn with_termination_timeout(mut self, timeout: Duration) -> Self {
        self.termination_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_progress_interval_bytes(mut self, bytes: u64) -> Self {
        self.progress_interval_bytes = bytes.max(1);
        self
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size.max(512);
        self
    }

    pub fn with_verify(mut self, algorithm: Option<ChecksumAlgorithm>) -> Self {
        self.verify = algorithm;
        self
    }

    pub fn with_force_kill(mut self, enabled: bool) -> Self {
        self.force_kill_after_timeout = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders_clamp_degenerate_values() {
        let config = EngineConfig::default()
            .with_progress_interval_bytes(0)
            .with_buffer_size(1);
        assert_eq!(config.progress_interval_bytes, 1);
        assert_eq!(config.buffer_size, 512);
    }
}
