use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use polyvox_common::config::LockConfig;

use crate::broker::BrokerClient;

/// Poll cadence while waiting for a contended lock.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Short-lived mutual exclusion over broker keys.
///
/// Locks auto-release after their TTL even if the owner never unlocks, so a
/// crashed holder cannot deadlock the fleet. `unlock` deletes the key without
/// verifying the owner token — a deliberate simplification; callers choose
/// TTLs generously longer than their critical sections.
pub struct LockService {
    broker: Arc<BrokerClient>,
    /// Caller identity baked into each owner token.
    owner: String,
    defaults: LockConfig,
}

impl LockService {
    pub fn new(broker: Arc<BrokerClient>, owner: String, defaults: LockConfig) -> Self {
        Self {
            broker,
            owner,
            defaults,
        }
    }

    /// Acquire `key` with the configured default TTL and wait.
    pub async fn try_lock(&self, key: &str) -> bool {
        self.try_lock_with(
            key,
            Duration::from_secs(self.defaults.default_ttl_seconds),
            Duration::from_secs(self.defaults.default_wait_seconds),
        )
        .await
    }

    /// Acquire `key`, busy-polling every 50 ms until `wait` elapses.
    ///
    /// Returns false when the lock stayed contended for the whole wait, and
    /// also on broker errors — an unreachable broker is indistinguishable
    /// from contention to the caller, and both are treated as "someone else
    /// owns it".
    pub async fn try_lock_with(&self, key: &str, ttl: Duration, wait: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + wait;
        let token = format!("{}:{}", self.owner, Utc::now().timestamp_millis());
        let ttl_ms = ttl.as_millis() as u64;

        loop {
            match self.broker.acquire_lock_key(key, &token, ttl_ms).await {
                Ok(true) => {
                    tracing::debug!(key = key, "Lock acquired");
                    return true;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(key = key, error = %e, "Lock acquire failed");
                }
            }

            if tokio::time::Instant::now() + LOCK_POLL_INTERVAL > deadline {
                tracing::debug!(key = key, "Lock unavailable within wait");
                return false;
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
        }
    }

    /// Best-effort, idempotent release.
    pub async fn unlock(&self, key: &str) {
        if let Err(e) = self.broker.release_lock_key(key).await {
            tracing::warn!(key = key, error = %e, "Lock release failed, TTL will expire it");
        }
    }

    /// Run `op` under `key`; release on every exit path.
    ///
    /// Returns `None` when the lock could not be acquired — the operation was
    /// not run at all.
    pub async fn with_lock<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        wait: Duration,
        op: F,
    ) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if !self.try_lock_with(key, ttl, wait).await {
            return None;
        }

        let result = op().await;
        self.unlock(key).await;
        Some(result)
    }
}

/// Lock key for the per-task dispatch critical section.
pub fn task_dispatch_key(task_id: &polyvox_common::TaskId) -> String {
    format!("task_dispatch:{}", task_id)
}

/// Lock key serializing capacity decisions for one node.
pub fn node_dispatch_key(node_id: &str) -> String {
    format!("node_dispatch:{}", node_id)
}

/// Sharded lock key capping concurrent node selections across the fleet.
pub fn node_selection_key(shard: u64) -> String {
    format!("node_selection:{}", shard)
}

/// Lock key for one envelope's drain tick.
pub fn pending_task_key(task_id: &polyvox_common::TaskId) -> String {
    format!("pending_task_process:{}", task_id)
}

/// Lock key for one task's stuck-recovery.
pub fn task_recover_key(task_id: &polyvox_common::TaskId) -> String {
    format!("task_recover:{}", task_id)
}

/// Global lock ensuring at most one reclaim sweep across all instances.
pub const RECOVER_STUCK_TASKS_LOCK: &str = "recover_stuck_tasks_lock";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_key_namespacing() {
        let id = polyvox_common::TaskId::new();
        assert_eq!(task_dispatch_key(&id), format!("task_dispatch:{}", id));
        assert_eq!(pending_task_key(&id), format!("pending_task_process:{}", id));
        assert_eq!(task_recover_key(&id), format!("task_recover:{}", id));
        assert_eq!(node_dispatch_key("n1"), "node_dispatch:n1");
        assert_eq!(node_selection_key(3), "node_selection:3");
    }
}
