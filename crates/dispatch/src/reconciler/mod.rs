use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use polyvox_common::types::{NodeStatus, WorkerNode};

use crate::broker::BrokerClient;
use crate::lock::{self, LockService};
use crate::registry::NodeRegistry;

/// Sweep cadence. Workers heartbeat at half the liveness window or faster,
/// so 30 seconds keeps the registry at most one refresh behind.
const RECONCILE_INTERVAL: Duration = Duration::from_secs(30);

const NODE_REMOVE_TTL: Duration = Duration::from_secs(5);

/// Periodic sweeper that prunes the registry of nodes that stopped
/// heartbeating or went OFFLINE. Purely reactive — never touches tasks.
pub struct HeartbeatReconciler {
    registry: Arc<NodeRegistry>,
    locks: Arc<LockService>,
    broker: Arc<BrokerClient>,
}

impl HeartbeatReconciler {
    pub fn new(
        registry: Arc<NodeRegistry>,
        locks: Arc<LockService>,
        broker: Arc<BrokerClient>,
    ) -> Self {
        Self {
            registry,
            locks,
            broker,
        }
    }

    /// One sweep over the active-node set. Idempotent on unchanged broker
    /// state: removals only fire for nodes that are already dead.
    pub async fn reconcile_once(&self) {
        let active = match self.broker.active_nodes().await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::error!(error = %e, "Failed to list active nodes for reconciliation");
                return;
            }
        };

        for node_id in active {
            let hash = match self.broker.node_hash(&node_id).await {
                Ok(hash) => hash,
                Err(e) => {
                    tracing::warn!(node_id = %node_id, error = %e, "Failed to read node hash");
                    continue;
                }
            };

            let dead = match WorkerNode::from_hash(&node_id, &hash) {
                None => true,
                // SHUTTING_DOWN and unknown statuses already resolve to Offline.
                Some(node) => node.status == NodeStatus::Offline,
            };

            if !dead {
                continue;
            }

            // Share the node's capacity-accounting lock so removal never
            // interleaves with a handoff's re-count. Contended → next tick.
            let removed = self
                .locks
                .with_lock(
                    &lock::node_dispatch_key(&node_id),
                    NODE_REMOVE_TTL,
                    Duration::ZERO,
                    || self.registry.remove_completely(&node_id),
                )
                .await;

            match removed {
                Some(()) => {
                    tracing::info!(node_id = %node_id, "Removed dead node from registry");
                }
                None => {
                    tracing::debug!(node_id = %node_id, "Node busy dispatching, deferring removal");
                }
            }
        }
    }

    /// Spawn the reconcile loop.
    pub fn start(self: Arc<Self>) -> ReconcilerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            tracing::info!(
                interval_seconds = RECONCILE_INTERVAL.as_secs(),
                "Heartbeat reconciler started"
            );
            loop {
                self.reconcile_once().await;
                tokio::select! {
                    _ = tokio::time::sleep(RECONCILE_INTERVAL) => {}
                    _ = shutdown_rx.changed() => break,
                }
            }
            tracing::info!("Heartbeat reconciler stopped");
        });

        ReconcilerHandle {
            handle,
            shutdown_tx,
        }
    }
}

/// Handle for the reconciler loop.
pub struct ReconcilerHandle {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl ReconcilerHandle {
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn join(self) {
        let _ = self.handle.await;
    }
}
