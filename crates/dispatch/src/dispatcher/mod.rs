use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use polyvox_common::config::DispatchConfig;
use polyvox_common::ids::TaskId;
use polyvox_common::types::{
    ControlMessage, PendingTaskEnvelope, Task, TaskMessage, TaskStatus, WorkerNode,
};

use crate::broker::BrokerClient;
use crate::lock::{self, LockService};
use crate::registry::NodeRegistry;
use crate::store::{NodeAssignment, StoreError, TaskStore, TaskUpdate};

// Lock bounds per critical section. TTLs are chosen generously longer than
// the section they guard because unlock is owner-unchecked.
const TASK_DISPATCH_TTL: Duration = Duration::from_secs(10);
const TASK_DISPATCH_WAIT: Duration = Duration::from_secs(2);
const NODE_DISPATCH_TTL: Duration = Duration::from_secs(5);
const NODE_DISPATCH_WAIT: Duration = Duration::from_secs(1);
const NODE_SELECTION_TTL: Duration = Duration::from_secs(3);
const NODE_SELECTION_WAIT: Duration = Duration::from_secs(1);
const PENDING_PROCESS_TTL: Duration = Duration::from_secs(10);
const PENDING_PROCESS_WAIT: Duration = Duration::from_secs(5);
const RECOVER_SWEEP_TTL: Duration = Duration::from_secs(60);
const RECOVER_TASK_TTL: Duration = Duration::from_secs(10);
const RECOVER_TASK_WAIT: Duration = Duration::from_secs(1);

/// Result of the synchronous dispatch fast-path.
///
/// `Accepted` covers both a delivered and a parked task — callers read the
/// actual state from the task lookup surface. `LockBusy` means another
/// dispatcher owns the task; callers may ignore it, the pending drain will
/// pick the task up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    Accepted,
    LockBusy,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Handoff {
    Delivered,
    Rejected,
}

/// The scheduler: drives task state transitions, selects nodes, and runs
/// the two background sweepers (pending drain, stuck-task reclaimer).
pub struct Dispatcher {
    store: Arc<TaskStore>,
    registry: Arc<NodeRegistry>,
    broker: Arc<BrokerClient>,
    locks: Arc<LockService>,
    config: Arc<DispatchConfig>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<TaskStore>,
        registry: Arc<NodeRegistry>,
        broker: Arc<BrokerClient>,
        locks: Arc<LockService>,
        config: Arc<DispatchConfig>,
    ) -> Self {
        Self {
            store,
            registry,
            broker,
            locks,
            config,
        }
    }

    /// Synchronous fast-path called from the creation path.
    ///
    /// Guarded by `task_dispatch:{task_id}` so concurrent dispatchers make
    /// at most one PENDING → DISPATCHING → PROCESSING transition.
    pub async fn dispatch(&self, task: &Task) -> DispatchOutcome {
        let key = lock::task_dispatch_key(&task.id);
        let ran = self
            .locks
            .with_lock(&key, TASK_DISPATCH_TTL, TASK_DISPATCH_WAIT, || {
                self.dispatch_locked(task.id)
            })
            .await;

        match ran {
            Some(()) => DispatchOutcome::Accepted,
            None => {
                tracing::debug!(task_id = %task.id, "Dispatch lock busy, leaving to its owner");
                DispatchOutcome::LockBusy
            }
        }
    }

    async fn dispatch_locked(&self, task_id: TaskId) {
        // Re-read under the lock; another dispatcher may have progressed it.
        let task = match self.store.get_task(task_id).await {
            Ok(task) => task,
            Err(StoreError::NotFound(_)) => {
                tracing::warn!(task_id = %task_id, "Task vanished before dispatch");
                return;
            }
            Err(e) => {
                tracing::error!(task_id = %task_id, error = %e, "Failed to re-read task");
                return;
            }
        };

        if task.status != TaskStatus::Pending {
            tracing::debug!(
                task_id = %task_id,
                status = task.status.as_db_str(),
                "Task already progressed, nothing to dispatch"
            );
            return;
        }

        // Durable DISPATCHING so the selection window is observable.
        if let Err(e) = self
            .store
            .update_status(task_id, TaskStatus::Dispatching, TaskUpdate::default())
            .await
        {
            tracing::error!(task_id = %task_id, error = %e, "Failed to mark task dispatching");
            return;
        }

        match self.select_node(&task).await {
            Some(node) => {
                if self.handoff(&task, &node).await == Handoff::Rejected {
                    self.park(&task).await;
                }
            }
            None => self.park(&task).await,
        }
    }

    /// Run node selection under the sharded selection lock, bounding how
    /// many dispatchers rank the fleet at once while avoiding herd picks of
    /// the same node. A missed lock is backpressure: no node this time.
    async fn select_node(&self, task: &Task) -> Option<WorkerNode> {
        let shard =
            Utc::now().timestamp_millis().rem_euclid(self.config.selection_shards as i64) as u64;
        let key = lock::node_selection_key(shard);

        self.locks
            .with_lock(&key, NODE_SELECTION_TTL, NODE_SELECTION_WAIT, || {
                self.registry.select_optimal(task)
            })
            .await
            .flatten()
    }

    /// Per-node critical section: re-check capacity against the repository,
    /// push the work message, then record PROCESSING.
    ///
    /// The push precedes the status write on purpose — once the message is
    /// in flight the handoff counts as delivered even if the write fails;
    /// workers tolerate receiving a task still reading DISPATCHING.
    async fn handoff(&self, task: &Task, node: &WorkerNode) -> Handoff {
        let key = lock::node_dispatch_key(&node.node_id);
        self.locks
            .with_lock(&key, NODE_DISPATCH_TTL, NODE_DISPATCH_WAIT, || {
                self.handoff_locked(task, node)
            })
            .await
            .unwrap_or(Handoff::Rejected)
    }

    async fn handoff_locked(&self, task: &Task, node: &WorkerNode) -> Handoff {
        let count = match self.store.count_processing(&node.node_id).await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(node_id = %node.node_id, error = %e, "Capacity re-count failed");
                return Handoff::Rejected;
            }
        };

        if count >= self.config.node_capacity {
            tracing::debug!(
                node_id = %node.node_id,
                active = count,
                "Node filled up since selection, rejecting handoff"
            );
            return Handoff::Rejected;
        }

        if let Err(e) = self
            .broker
            .push_work(&node.node_id, &TaskMessage::from(task))
            .await
        {
            tracing::warn!(
                task_id = %task.id,
                node_id = %node.node_id,
                error = %e,
                "Failed to push work message"
            );
            return Handoff::Rejected;
        }

        if let Err(e) = self
            .store
            .update_status(
                task.id,
                TaskStatus::Processing,
                TaskUpdate {
                    assigned_node: NodeAssignment::Assign(&node.node_id),
                    ..TaskUpdate::default()
                },
            )
            .await
        {
            // Message already in flight; the worker will idempotently move
            // the task to PROCESSING on its first progress report.
            tracing::error!(
                task_id = %task.id,
                node_id = %node.node_id,
                error = %e,
                "Work message pushed but status write failed"
            );
        }

        tracing::info!(task_id = %task.id, node_id = %node.node_id, "Task handed off");
        metrics::counter!("tasks.dispatched").increment(1);
        Handoff::Delivered
    }

    /// Park a task that no node could take: revert it to PENDING (so the
    /// drain's guard accepts the envelope) and enqueue an envelope carrying
    /// its current retry count.
    async fn park(&self, task: &Task) {
        if let Err(e) = self
            .store
            .update_status(task.id, TaskStatus::Pending, TaskUpdate::default())
            .await
        {
            tracing::error!(task_id = %task.id, error = %e, "Failed to return task to pending");
            return;
        }

        let env = PendingTaskEnvelope::new(task.id, task.retry_count);
        if let Err(e) = self.broker.enqueue_pending(&env).await {
            tracing::error!(task_id = %task.id, error = %e, "Failed to enqueue pending envelope");
            return;
        }

        tracing::info!(task_id = %task.id, "No node available, task parked");
        metrics::counter!("tasks.parked").increment(1);
    }

    /// Send a CANCEL_TASK control message to a node. Fire-and-forget: the
    /// caller is responsible for setting CANCELLED in the repository first.
    pub async fn cancel(&self, task_id: TaskId, node_id: &str) -> polyvox_common::Result<()> {
        self.broker
            .push_control(node_id, &ControlMessage::cancel(task_id))
            .await?;

        tracing::info!(task_id = %task_id, node_id = %node_id, "Cancel signal sent");
        metrics::counter!("tasks.cancel_signals").increment(1);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Pending drain
    // -----------------------------------------------------------------------

    /// One drain tick: pop at most one envelope and try to place its task.
    pub async fn drain_pending_once(&self) {
        if let Ok(depth) = self.broker.pending_depth().await {
            metrics::gauge!("pending_tasks.queue_depth").set(depth as f64);
        }

        let env = match self.broker.pop_pending().await {
            Ok(Some(env)) => env,
            Ok(None) => return,
            Err(e) => {
                tracing::error!(error = %e, "Failed to pop pending envelope");
                return;
            }
        };

        let key = lock::pending_task_key(&env.task_id);
        let ran = self
            .locks
            .with_lock(&key, PENDING_PROCESS_TTL, PENDING_PROCESS_WAIT, || {
                self.process_envelope(&env)
            })
            .await;

        if ran.is_none() {
            // A duplicate envelope for the same task is being handled by
            // another instance; ours is redundant.
            tracing::debug!(task_id = %env.task_id, "Envelope lock busy, skipping this tick");
        }
    }

    async fn process_envelope(&self, env: &PendingTaskEnvelope) {
        let task = match self.store.get_task(env.task_id).await {
            Ok(task) => task,
            Err(StoreError::NotFound(_)) => {
                tracing::debug!(task_id = %env.task_id, "Task gone, dropping envelope");
                return;
            }
            Err(e) => {
                // Transient repository failure: keep the envelope alive.
                tracing::warn!(task_id = %env.task_id, error = %e, "Task read failed, re-enqueueing");
                if let Err(e) = self.broker.requeue_pending(env).await {
                    tracing::error!(task_id = %env.task_id, error = %e, "Failed to re-enqueue envelope");
                }
                return;
            }
        };

        if task.status != TaskStatus::Pending {
            tracing::debug!(
                task_id = %task.id,
                status = task.status.as_db_str(),
                "Task no longer pending, dropping envelope"
            );
            return;
        }

        match self.select_node(&task).await {
            Some(node) => {
                if self.handoff(&task, &node).await == Handoff::Rejected {
                    self.requeue(env).await;
                }
            }
            None if env.retry_count < self.config.max_retry_attempts => {
                self.requeue(env).await;
            }
            None => {
                let message = format!(
                    "No available nodes after {} retry attempts",
                    self.config.max_retry_attempts
                );
                tracing::warn!(task_id = %task.id, retry_count = env.retry_count, "{}", message);
                if let Err(e) = self
                    .store
                    .update_status(
                        task.id,
                        TaskStatus::Failed,
                        TaskUpdate {
                            error_message: Some(&message),
                            ..TaskUpdate::default()
                        },
                    )
                    .await
                {
                    tracing::error!(task_id = %task.id, error = %e, "Failed to mark task failed");
                }
                metrics::counter!("tasks.failed_no_nodes").increment(1);
            }
        }
    }

    /// Requeue a failing envelope with a bumped retry count, keeping the
    /// durable counter in step so it never decreases.
    async fn requeue(&self, env: &PendingTaskEnvelope) {
        let next_retry = env.retry_count + 1;

        if let Err(e) = self
            .store
            .update_status(
                env.task_id,
                TaskStatus::Pending,
                TaskUpdate {
                    retry_count: Some(next_retry),
                    ..TaskUpdate::default()
                },
            )
            .await
        {
            tracing::warn!(task_id = %env.task_id, error = %e, "Failed to persist retry count");
        }

        let next = PendingTaskEnvelope::new(env.task_id, next_retry);
        if let Err(e) = self.broker.requeue_pending(&next).await {
            tracing::error!(task_id = %env.task_id, error = %e, "Failed to requeue envelope");
            return;
        }

        tracing::debug!(task_id = %env.task_id, retry_count = next_retry, "Envelope requeued");
        metrics::counter!("tasks.requeued").increment(1);
    }

    // -----------------------------------------------------------------------
    // Stuck-task reclaimer
    // -----------------------------------------------------------------------

    /// One reclaim sweep. At most one instance sweeps at a time — the global
    /// lock is taken with zero wait, so a contended tick is simply skipped.
    pub async fn recover_stuck_once(&self) {
        let ran = self
            .locks
            .with_lock(
                lock::RECOVER_STUCK_TASKS_LOCK,
                RECOVER_SWEEP_TTL,
                Duration::ZERO,
                || self.recover_stuck_locked(),
            )
            .await;

        if ran.is_none() {
            tracing::debug!("Another instance is sweeping stuck tasks, skipping tick");
        }
    }

    async fn recover_stuck_locked(&self) {
        let threshold = Utc::now() - chrono::Duration::minutes(self.config.stuck_threshold_minutes);

        let stuck = match self.store.list_stuck(threshold).await {
            Ok(stuck) => stuck,
            Err(e) => {
                tracing::error!(error = %e, "Failed to list stuck tasks");
                return;
            }
        };

        if stuck.is_empty() {
            return;
        }

        tracing::info!(count = stuck.len(), "Recovering stuck tasks");

        for task in stuck {
            let key = lock::task_recover_key(&task.id);
            let ran = self
                .locks
                .with_lock(&key, RECOVER_TASK_TTL, RECOVER_TASK_WAIT, || {
                    self.recover_task(task.id, threshold)
                })
                .await;

            if ran.is_none() {
                tracing::debug!(task_id = %task.id, "Recovery lock busy, skipping task");
            }
        }
    }

    async fn recover_task(&self, task_id: TaskId, threshold: DateTime<Utc>) {
        // Re-check under the lock: the worker may have reported progress, or
        // a concurrent dispatcher may be mid-handoff on this very task.
        let task = match self.store.get_task(task_id).await {
            Ok(task) => task,
            Err(e) => {
                tracing::warn!(task_id = %task_id, error = %e, "Failed to re-read stuck task");
                return;
            }
        };

        if task.status != TaskStatus::Processing || task.updated_at >= threshold {
            tracing::debug!(task_id = %task_id, "Task no longer stuck, skipping");
            return;
        }

        let new_retry = task.retry_count + 1;

        if new_retry <= self.config.max_retry_attempts {
            if let Err(e) = self
                .store
                .update_status(
                    task_id,
                    TaskStatus::Pending,
                    TaskUpdate {
                        assigned_node: NodeAssignment::Clear,
                        retry_count: Some(new_retry),
                        ..TaskUpdate::default()
                    },
                )
                .await
            {
                tracing::error!(task_id = %task_id, error = %e, "Failed to return stuck task to pending");
                return;
            }

            let env = PendingTaskEnvelope::new(task_id, new_retry);
            if let Err(e) = self.broker.enqueue_pending(&env).await {
                tracing::error!(task_id = %task_id, error = %e, "Failed to enqueue recovered task");
            }

            tracing::warn!(
                task_id = %task_id,
                retry_count = new_retry,
                previous_node = task.assigned_node_id.as_deref().unwrap_or("unknown"),
                "Stuck task returned to pending"
            );
            metrics::counter!("tasks.recovered").increment(1);
        } else {
            let message = format!(
                "Task failed after {} recovery attempts",
                self.config.max_retry_attempts
            );
            if let Err(e) = self
                .store
                .update_status(
                    task_id,
                    TaskStatus::Failed,
                    TaskUpdate {
                        error_message: Some(&message),
                        ..TaskUpdate::default()
                    },
                )
                .await
            {
                tracing::error!(task_id = %task_id, error = %e, "Failed to mark stuck task failed");
                return;
            }

            tracing::error!(task_id = %task_id, retry_count = task.retry_count, "{}", message);
            metrics::counter!("tasks.recovery_failed").increment(1);
        }
    }

    // -----------------------------------------------------------------------
    // Background sweepers
    // -----------------------------------------------------------------------

    /// Spawn the pending drain (immediate start) and the stuck-task
    /// reclaimer (first run after one full interval). Each tick is
    /// error-isolated — a bad tick never stops the schedule.
    pub fn start_sweepers(self: Arc<Self>) -> SweeperHandles {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let drain = {
            let dispatcher = Arc::clone(&self);
            let mut shutdown = shutdown_rx.clone();
            tokio::spawn(async move {
                let interval = Duration::from_secs(dispatcher.config.pending_drain_interval_seconds);
                tracing::info!(interval_seconds = interval.as_secs(), "Pending drain started");
                loop {
                    dispatcher.drain_pending_once().await;
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {}
                        _ = shutdown.changed() => break,
                    }
                }
                tracing::info!("Pending drain stopped");
            })
        };

        let reclaimer = {
            let dispatcher = self;
            let mut shutdown = shutdown_rx;
            tokio::spawn(async move {
                let interval = Duration::from_secs(dispatcher.config.reclaimer_interval_seconds);
                tracing::info!(interval_seconds = interval.as_secs(), "Stuck-task reclaimer started");
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.changed() => return,
                }
                loop {
                    dispatcher.recover_stuck_once().await;
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {}
                        _ = shutdown.changed() => break,
                    }
                }
                tracing::info!("Stuck-task reclaimer stopped");
            })
        };

        SweeperHandles {
            handles: vec![drain, reclaimer],
            shutdown_tx,
        }
    }
}

/// Handles for the two background sweepers.
pub struct SweeperHandles {
    handles: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl SweeperHandles {
    /// Signal both sweepers to stop after their current tick.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        tracing::info!("Sweeper shutdown signaled");
    }

    /// Wait for both sweepers to finish.
    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}
