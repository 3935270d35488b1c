use serde::{Deserialize, Serialize};

/// Top-level dispatch configuration, deserialized from system.toml.
///
/// Every field has a serde default so a partial (or absent) file yields a
/// working configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Interval between pending-queue drain ticks, in seconds.
    pub pending_drain_interval_seconds: u64,
    /// Interval between stuck-task reclaim sweeps, in seconds.
    /// Also used as the initial delay before the first sweep.
    pub reclaimer_interval_seconds: u64,
    /// A PROCESSING task whose updated_at is older than this is stuck.
    pub stuck_threshold_minutes: i64,
    /// Max concurrent PROCESSING tasks the dispatcher assigns to one node.
    pub node_capacity: i64,
    /// Retry ceiling shared by pending requeues and stuck-task recovery.
    pub max_retry_attempts: i32,
    /// A node whose last heartbeat is older than this is not eligible.
    pub liveness_window_seconds: i64,
    /// Number of shards for the node-selection lock.
    pub selection_shards: u64,
    pub lock: LockConfig,
}

/// Default TTL and wait for locks taken without explicit bounds.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub default_ttl_seconds: u64,
    pub default_wait_seconds: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            pending_drain_interval_seconds: 30,
            reclaimer_interval_seconds: 300,
            stuck_threshold_minutes: 30,
            node_capacity: 10,
            max_retry_attempts: 10,
            liveness_window_seconds: 300,
            selection_shards: 5,
            lock: LockConfig::default(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: 30,
            default_wait_seconds: 5,
        }
    }
}
