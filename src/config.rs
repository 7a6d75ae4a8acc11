//! Configuration for the agent core.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration shared by the components of one process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Directory holding the event database and session manifests
    pub data_dir: PathBuf,
    /// Shared content-addressed blob directory
    pub blob_dir: PathBuf,
    /// Bounded worker pool size for parallel tool calls (default: 4)
    pub max_parallel_calls: usize,
    /// Default per-call deadline in seconds (default: 60)
    pub default_deadline_secs: u64,
    /// Grace period after cancellation before a worker is detached
    pub cancel_grace_ms: u64,
    /// Maximum consecutive think calls (default: 3)
    pub think_limit: u32,
    /// Turns without a state-changing call before one is required (default: 2)
    pub latency_limit: u32,
    /// Sliding window for stuckness detection (default: 6)
    pub stuckness_window: usize,
    /// Maximum turns before the loop gives up (safety valve)
    pub max_turns: u32,
}

impl CoreConfig {
    /// Configuration rooted at a data directory, everything else default.
    pub fn rooted(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let blob_dir = data_dir.join("blobs");
        Self {
            data_dir,
            blob_dir,
            ..Self::default()
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("compymac.db")
    }

    pub fn default_deadline(&self) -> Duration {
        Duration::from_secs(self.default_deadline_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn with_max_parallel(mut self, n: usize) -> Self {
        self.max_parallel_calls = n.max(1);
        self
    }

    pub fn with_deadline_secs(mut self, secs: u64) -> Self {
        self.default_deadline_secs = secs;
        self
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".compymac"),
            blob_dir: PathBuf::from(".compymac/blobs"),
            max_parallel_calls: 4,
            default_deadline_secs: 60,
            cancel_grace_ms: 500,
            think_limit: 3,
            latency_limit: 2,
            stuckness_window: 6,
            max_turns: 200,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rooted_paths() {
        let config = CoreConfig::rooted("/var/lib/compymac");
        assert_eq!(
            config.database_path(),
            PathBuf::from("/var/lib/compymac/compymac.db")
        );
        assert_eq!(config.blob_dir, PathBuf::from("/var/lib/compymac/blobs"));
    }

    #[test]
    fn test_builder_clamps_parallelism() {
        let config = CoreConfig::default().with_max_parallel(0);
        assert_eq!(config.max_parallel_calls, 1);
    }
}
