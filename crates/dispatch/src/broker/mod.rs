use std::collections::HashMap;

use redis::aio::MultiplexedConnection;

use polyvox_common::types::{ControlMessage, PendingTaskEnvelope, TaskMessage};

/// Set of node identifiers claimed as alive by the workers.
pub const ACTIVE_NODES_KEY: &str = "active_nodes";

/// Ordered set of node ids scored by worker-advertised priority (lower is better).
pub const NODE_RANKINGS_KEY: &str = "node_rankings";

/// Global list of envelopes for tasks that could not be placed on creation.
pub const PENDING_TASKS_KEY: &str = "pending_tasks";

/// Hash prefix carrying each worker's advertised resources and status.
pub const WORKER_NODE_PREFIX: &str = "worker_nodes:";

/// Per-node work queue prefix. Dispatcher pushes at the head, workers pop the tail.
pub const TASK_QUEUE_PREFIX: &str = "task_queue:";

/// Per-node control queue prefix, same push/pop convention as the work queue.
pub const CONTROL_QUEUE_PREFIX: &str = "control_queue:";

/// Prefix for distributed lock keys.
pub const LOCK_PREFIX: &str = "lock:";

/// Redis client for the shared broker: node registry hints, per-node queues,
/// the global pending queue, and lock keys.
///
/// Everything held here is a hint — the task repository stays the source of
/// truth for task state.
pub struct BrokerClient {
    conn: MultiplexedConnection,
}

impl BrokerClient {
    /// Connect to Redis.
    pub async fn connect(redis_url: &str) -> Result<Self, BrokerError> {
        tracing::info!("Connecting to Redis");

        let client =
            redis::Client::open(redis_url).map_err(|e| BrokerError::Connection(e.to_string()))?;

        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let broker = Self { conn };
        broker.health_check().await?;
        tracing::info!("Redis connection established");

        Ok(broker)
    }

    /// Verify the connection is alive (PING).
    pub async fn health_check(&self) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Command(e.to_string()))?;

        if pong != "PONG" {
            return Err(BrokerError::Command(format!(
                "Unexpected PING response: {}",
                pong
            )));
        }
        Ok(())
    }

    /// Get a clone of the multiplexed connection for direct use.
    #[allow(dead_code)]
    pub fn connection(&self) -> MultiplexedConnection {
        self.conn.clone()
    }

    // -----------------------------------------------------------------------
    // Node registry keys
    // -----------------------------------------------------------------------

    /// All node ids currently claiming liveness (SMEMBERS active_nodes).
    pub async fn active_nodes(&self) -> Result<Vec<String>, BrokerError> {
        let mut conn = self.conn.clone();
        redis::cmd("SMEMBERS")
            .arg(ACTIVE_NODES_KEY)
            .query_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Command(e.to_string()))
    }

    /// Whether a node id is in the active set.
    pub async fn is_active_node(&self, node_id: &str) -> Result<bool, BrokerError> {
        let mut conn = self.conn.clone();
        redis::cmd("SISMEMBER")
            .arg(ACTIVE_NODES_KEY)
            .arg(node_id)
            .query_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Command(e.to_string()))
    }

    /// Full hash for one worker node. Empty map if the key is missing.
    pub async fn node_hash(&self, node_id: &str) -> Result<HashMap<String, String>, BrokerError> {
        let mut conn = self.conn.clone();
        redis::cmd("HGETALL")
            .arg(format!("{}{}", WORKER_NODE_PREFIX, node_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Command(e.to_string()))
    }

    /// All ranking members, best (lowest score) first.
    pub async fn ranking_members(&self) -> Result<Vec<String>, BrokerError> {
        let mut conn = self.conn.clone();
        redis::cmd("ZRANGE")
            .arg(NODE_RANKINGS_KEY)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Command(e.to_string()))
    }

    /// Priority score for one ranking member, if present.
    pub async fn ranking_score(&self, node_id: &str) -> Result<Option<f64>, BrokerError> {
        let mut conn = self.conn.clone();
        redis::cmd("ZSCORE")
            .arg(NODE_RANKINGS_KEY)
            .arg(node_id)
            .query_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Command(e.to_string()))
    }

    /// Drop a node from the ranking only.
    pub async fn remove_from_ranking(&self, node_id: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("ZREM")
            .arg(NODE_RANKINGS_KEY)
            .arg(node_id)
            .query_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Command(e.to_string()))?;
        Ok(())
    }

    /// Drop a node from the active set and delete its hash.
    pub async fn remove_node_entry(&self, node_id: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("SREM")
            .arg(ACTIVE_NODES_KEY)
            .arg(node_id)
            .query_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Command(e.to_string()))?;

        let _: i64 = redis::cmd("DEL")
            .arg(format!("{}{}", WORKER_NODE_PREFIX, node_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Command(e.to_string()))?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Per-node queues
    // -----------------------------------------------------------------------

    /// Push a work message onto the head of a node's task queue.
    pub async fn push_work(&self, node_id: &str, msg: &TaskMessage) -> Result<(), BrokerError> {
        let data = serde_json::to_string(msg).map_err(|e| BrokerError::Command(e.to_string()))?;
        self.lpush(&format!("{}{}", TASK_QUEUE_PREFIX, node_id), &data)
            .await?;

        tracing::debug!(node_id = node_id, task_id = %msg.task_id, "Pushed work message");
        Ok(())
    }

    /// Push a control message onto the head of a node's control queue.
    pub async fn push_control(
        &self,
        node_id: &str,
        msg: &ControlMessage,
    ) -> Result<(), BrokerError> {
        let data = serde_json::to_string(msg).map_err(|e| BrokerError::Command(e.to_string()))?;
        self.lpush(&format!("{}{}", CONTROL_QUEUE_PREFIX, node_id), &data)
            .await?;

        tracing::debug!(
            node_id = node_id,
            task_id = %msg.task_id,
            action = ?msg.action,
            "Pushed control message"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Global pending queue
    // -----------------------------------------------------------------------

    /// Enqueue a new envelope at the arrival end of the pending queue.
    pub async fn enqueue_pending(&self, env: &PendingTaskEnvelope) -> Result<(), BrokerError> {
        let data = serde_json::to_string(env).map_err(|e| BrokerError::Command(e.to_string()))?;
        self.lpush(PENDING_TASKS_KEY, &data).await?;

        tracing::debug!(task_id = %env.task_id, retry_count = env.retry_count, "Enqueued pending task");
        Ok(())
    }

    /// Re-enqueue a failing envelope at the consumption end, so it is retried
    /// before older arrivals.
    pub async fn requeue_pending(&self, env: &PendingTaskEnvelope) -> Result<(), BrokerError> {
        let data = serde_json::to_string(env).map_err(|e| BrokerError::Command(e.to_string()))?;
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("RPUSH")
            .arg(PENDING_TASKS_KEY)
            .arg(&data)
            .query_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Command(e.to_string()))?;

        tracing::debug!(task_id = %env.task_id, retry_count = env.retry_count, "Requeued pending task");
        Ok(())
    }

    /// Pop one envelope from the consumption end (FIFO by arrival).
    /// A malformed record is logged and dropped, never propagated.
    pub async fn pop_pending(&self) -> Result<Option<PendingTaskEnvelope>, BrokerError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("RPOP")
            .arg(PENDING_TASKS_KEY)
            .query_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Command(e.to_string()))?;

        let raw = match raw {
            Some(r) => r,
            None => return Ok(None),
        };

        match serde_json::from_str(&raw) {
            Ok(env) => Ok(Some(env)),
            Err(e) => {
                tracing::error!(
                    error = %e,
                    data = %raw,
                    "Dropping malformed pending task envelope"
                );
                Ok(None)
            }
        }
    }

    /// Current depth of the pending queue.
    pub async fn pending_depth(&self) -> Result<i64, BrokerError> {
        let mut conn = self.conn.clone();
        redis::cmd("LLEN")
            .arg(PENDING_TASKS_KEY)
            .query_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Command(e.to_string()))
    }

    // -----------------------------------------------------------------------
    // Lock keys
    // -----------------------------------------------------------------------

    /// Atomically claim a lock key with an owner token and TTL.
    /// SET NX PX — returns false when the key is already held.
    pub async fn acquire_lock_key(
        &self,
        name: &str,
        token: &str,
        ttl_ms: u64,
    ) -> Result<bool, BrokerError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(format!("{}{}", LOCK_PREFIX, name))
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Command(e.to_string()))?;

        Ok(reply.is_some())
    }

    /// Delete a lock key. Does not verify the owner token.
    pub async fn release_lock_key(&self, name: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(format!("{}{}", LOCK_PREFIX, name))
            .query_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Command(e.to_string()))?;
        Ok(())
    }

    async fn lpush(&self, key: &str, data: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("LPUSH")
            .arg(key)
            .arg(data)
            .query_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Command(e.to_string()))?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis command error: {0}")]
    Command(String),
}

impl From<BrokerError> for polyvox_common::PolyvoxError {
    fn from(e: BrokerError) -> Self {
        polyvox_common::PolyvoxError::Redis(e.to_string())
    }
}
