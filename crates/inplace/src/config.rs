//! Runtime configuration for the in-place update subsystem.

use std::time::Duration;

use blocks::DEFAULT_BLOCK_SIZE;
use serde::{Deserialize, Serialize};

/// Default number of pipeline workers.
pub const DEFAULT_WORKERS: usize = 2;

/// Default bounded-queue capacity for pending update requests.
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

/// Default bound on waiting for the full lock set of one update.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound on waiting for network pulls of one update.
pub const DEFAULT_PULL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on rollback data staged for one update.
pub const DEFAULT_MAX_SCRATCH_BYTES: u64 = 256 * 1024 * 1024;

/// Default name of the per-folder scratch directory.
pub const DEFAULT_SCRATCH_DIR: &str = ".inplace";

/// Configuration shared by the planner, the apply engine and the pipeline.
///
/// Deserializes from JSON with every field optional; durations are expressed
/// in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InPlaceConfig {
    /// Number of worker threads in the pipeline.
    pub workers: usize,
    /// Capacity of the bounded request queue.
    pub queue_capacity: usize,
    /// Bounded wait for acquiring every lock an update needs.
    #[serde(rename = "lock_timeout_ms", with = "duration_ms")]
    pub lock_timeout: Duration,
    /// Bounded wait for all pulls of an update to be delivered.
    #[serde(rename = "pull_timeout_ms", with = "duration_ms")]
    pub pull_timeout: Duration,
    /// Largest scratch area one update may stage.
    pub max_scratch_bytes: u64,
    /// Name of the scratch directory created under each folder root.
    pub scratch_dir_name: String,
    /// Whether scratch, marker and destination writes are fsynced.
    ///
    /// Disabling this keeps the ordering of the protocol but gives up crash
    /// durability; it exists for tests and throwaway folders.
    pub fsync: bool,
    /// Block size used when hashing local files.
    pub block_size: u32,
}

impl Default for InPlaceConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            pull_timeout: DEFAULT_PULL_TIMEOUT,
            max_scratch_bytes: DEFAULT_MAX_SCRATCH_BYTES,
            scratch_dir_name: DEFAULT_SCRATCH_DIR.to_owned(),
            fsync: true,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl InPlaceConfig {
    /// Sets the worker count (at least one).
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Sets the request queue capacity (at least one).
    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Sets the lock acquisition bound.
    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sets the pull delivery bound.
    #[must_use]
    pub fn with_pull_timeout(mut self, timeout: Duration) -> Self {
        self.pull_timeout = timeout;
        self
    }

    /// Sets the scratch area bound.
    #[must_use]
    pub fn with_max_scratch_bytes(mut self, bytes: u64) -> Self {
        self.max_scratch_bytes = bytes;
        self
    }

    /// Enables or disables fsync.
    #[must_use]
    pub fn with_fsync(mut self, fsync: bool) -> Self {
        self.fsync = fsync;
        self
    }

    /// Sets the hashing block size (at least one byte).
    #[must_use]
    pub fn with_block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size.max(1);
        self
    }

    /// Parses a JSON configuration document.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(
        value: &Duration,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = InPlaceConfig::from_json("{}").expect("parse");
        assert_eq!(config, InPlaceConfig::default());
    }

    #[test]
    fn durations_are_milliseconds() {
        let config =
            InPlaceConfig::from_json(r#"{"lock_timeout_ms": 250, "workers": 4}"#).expect("parse");
        assert_eq!(config.lock_timeout, Duration::from_millis(250));
        assert_eq!(config.workers, 4);
        assert_eq!(config.pull_timeout, DEFAULT_PULL_TIMEOUT);

        let json = serde_json::to_value(&config).expect("serialize");
        assert_eq!(json["lock_timeout_ms"], 250);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(InPlaceConfig::from_json(r#"{"wokers": 4}"#).is_err());
    }

    #[test]
    fn builders_clamp_counts() {
        let config = InPlaceConfig::default()
            .with_workers(0)
            .with_queue_capacity(0)
            .with_block_size(0);
        assert_eq!(config.workers, 1);
        assert_eq!(config.queue_capacity, 1);
        assert_eq!(config.block_size, 1);
    }
}
