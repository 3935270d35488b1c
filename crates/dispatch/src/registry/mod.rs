use std::sync::Arc;

use chrono::Local;

use polyvox_common::config::DispatchConfig;
use polyvox_common::types::{NodeStatus, Task, WorkerNode};

use crate::broker::BrokerClient;
use crate::store::TaskStore;

/// View of the live worker fleet: translates the broker's advertised nodes
/// into ranked dispatch candidates and evicts stale entries.
///
/// Broker failures degrade to "no nodes" — callers treat that as
/// backpressure, never as an error.
pub struct NodeRegistry {
    broker: Arc<BrokerClient>,
    store: Arc<TaskStore>,
    liveness_window_seconds: i64,
    node_capacity: i64,
}

impl NodeRegistry {
    pub fn new(broker: Arc<BrokerClient>, store: Arc<TaskStore>, config: &DispatchConfig) -> Self {
        Self {
            broker,
            store,
            liveness_window_seconds: config.liveness_window_seconds,
            node_capacity: config.node_capacity,
        }
    }

    /// Every node currently advertised, regardless of status.
    pub async fn list_all(&self) -> Vec<WorkerNode> {
        let active = match self.broker.active_nodes().await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::error!(error = %e, "Failed to list active nodes");
                return Vec::new();
            }
        };

        let mut nodes = Vec::with_capacity(active.len());
        for node_id in active {
            match self.broker.node_hash(&node_id).await {
                Ok(hash) => {
                    if let Some(node) = WorkerNode::from_hash(&node_id, &hash) {
                        nodes.push(node);
                    }
                }
                Err(e) => {
                    tracing::warn!(node_id = %node_id, error = %e, "Failed to read node hash");
                }
            }
        }
        nodes
    }

    /// ONLINE, member of the active set, and heartbeat within the liveness
    /// window.
    pub async fn is_healthy(&self, node_id: &str) -> bool {
        match self.broker.is_active_node(node_id).await {
            Ok(true) => {}
            _ => return false,
        }

        let hash = match self.broker.node_hash(node_id).await {
            Ok(h) => h,
            Err(_) => return false,
        };

        match WorkerNode::from_hash(node_id, &hash) {
            Some(node) => {
                node.status == NodeStatus::Online
                    && node.heartbeat_within(Local::now().naive_local(), self.liveness_window_seconds)
            }
            None => false,
        }
    }

    /// Eligible nodes only. Performs inline cleanup along the way: ranking
    /// members outside the active set, nodes with an expired hash, and
    /// active nodes failing the health predicate are all fully removed.
    pub async fn list_available(&self) -> Vec<WorkerNode> {
        let active = match self.broker.active_nodes().await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::error!(error = %e, "Failed to list active nodes");
                return Vec::new();
            }
        };

        match self.broker.ranking_members().await {
            Ok(members) => {
                for member in members {
                    if !active.contains(&member) {
                        tracing::info!(node_id = %member, "Ranking member not in active set, removing");
                        self.remove_completely(&member).await;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read node rankings for cleanup");
            }
        }

        let now = Local::now().naive_local();
        let mut nodes = Vec::new();

        for node_id in active {
            let hash = match self.broker.node_hash(&node_id).await {
                Ok(h) => h,
                Err(e) => {
                    tracing::warn!(node_id = %node_id, error = %e, "Failed to read node hash");
                    continue;
                }
            };

            match WorkerNode::from_hash(&node_id, &hash) {
                None => {
                    tracing::info!(node_id = %node_id, "Node hash empty, removing");
                    self.remove_completely(&node_id).await;
                }
                Some(node) => {
                    let eligible = node.status == NodeStatus::Online
                        && node.heartbeat_within(now, self.liveness_window_seconds);
                    if eligible {
                        nodes.push(node);
                    } else {
                        tracing::info!(
                            node_id = %node_id,
                            status = ?node.status,
                            "Node not eligible, removing"
                        );
                        self.remove_completely(&node_id).await;
                    }
                }
            }
        }

        nodes
    }

    /// Pick at most one eligible node for `task` under the load-aware
    /// policy, or `None` when none qualifies.
    ///
    /// Each candidate's active count is re-fetched from the repository,
    /// overwriting the node's self-report, before the capacity filter and
    /// scoring run.
    pub async fn select_optimal(&self, task: &Task) -> Option<WorkerNode> {
        let available = self.list_available().await;
        if available.is_empty() {
            tracing::debug!(task_id = %task.id, "No eligible nodes");
            return None;
        }

        let mut candidates = Vec::with_capacity(available.len());
        for mut node in available {
            let count = match self.store.count_processing(&node.node_id).await {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(node_id = %node.node_id, error = %e, "Failed to count node tasks");
                    continue;
                }
            };
            node.active_task_count = count;

            if count >= self.node_capacity {
                tracing::debug!(
                    node_id = %node.node_id,
                    active = count,
                    "Node at capacity, skipping"
                );
                continue;
            }

            let ranking = match self.broker.ranking_score(&node.node_id).await {
                Ok(Some(score)) => score,
                Ok(None) => f64::INFINITY,
                Err(e) => {
                    tracing::warn!(node_id = %node.node_id, error = %e, "Failed to read ranking score");
                    f64::INFINITY
                }
            };

            candidates.push(Candidate {
                score: dispatch_score(&node),
                ranking,
                node,
            });
        }

        let chosen = choose_candidate(candidates);
        match &chosen {
            Some(node) => {
                tracing::info!(
                    task_id = %task.id,
                    node_id = %node.node_id,
                    active = node.active_task_count,
                    "Selected node"
                );
            }
            None => {
                tracing::debug!(task_id = %task.id, "All eligible nodes at capacity");
            }
        }
        chosen
    }

    /// Targeted eviction from the ranking only.
    pub async fn remove_from_ranking(&self, node_id: &str) {
        if let Err(e) = self.broker.remove_from_ranking(node_id).await {
            tracing::warn!(node_id = %node_id, error = %e, "Failed to remove node from ranking");
        }
    }

    /// Evict a node from the ranking, the active set, and its hash.
    pub async fn remove_completely(&self, node_id: &str) {
        if let Err(e) = self.broker.remove_from_ranking(node_id).await {
            tracing::warn!(node_id = %node_id, error = %e, "Failed to remove node from ranking");
        }
        if let Err(e) = self.broker.remove_node_entry(node_id).await {
            tracing::warn!(node_id = %node_id, error = %e, "Failed to remove node entry");
            return;
        }
        metrics::counter!("nodes.evicted").increment(1);
    }
}

/// Load score for one node. Lower is better.
///
/// A node advertising zero total memory is malformed; it is treated as
/// fully memory-loaded so it only wins when nothing else qualifies.
pub fn dispatch_score(node: &WorkerNode) -> f64 {
    let memory_ratio = if node.memory_total == 0 {
        100.0
    } else {
        node.memory_used as f64 / node.memory_total as f64 * 100.0
    };
    node.cpu_usage + memory_ratio + node.active_task_count as f64 * 10.0
}

struct Candidate {
    node: WorkerNode,
    score: f64,
    /// Worker-advertised priority; `INFINITY` when evicted from the ranking.
    ranking: f64,
}

/// Minimize score, break ties by ranking (lower wins), then node id so
/// repeated runs over the same state are deterministic.
fn choose_candidate(candidates: Vec<Candidate>) -> Option<WorkerNode> {
    candidates
        .into_iter()
        .min_by(|a, b| {
            a.score
                .total_cmp(&b.score)
                .then(a.ranking.total_cmp(&b.ranking))
                .then_with(|| a.node.node_id.cmp(&b.node.node_id))
        })
        .map(|c| c.node)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(node_id: &str, cpu: f64, mem_used: u64, mem_total: u64, active: i64) -> WorkerNode {
        WorkerNode {
            node_id: node_id.to_string(),
            host: "127.0.0.1".to_string(),
            port: 9090,
            memory_total: mem_total,
            memory_used: mem_used,
            cpu_usage: cpu,
            gpu_available: false,
            status: NodeStatus::Online,
            last_heartbeat: Some(Local::now().naive_local()),
            active_task_count: active,
        }
    }

    fn candidate(n: WorkerNode, ranking: f64) -> Candidate {
        Candidate {
            score: dispatch_score(&n),
            ranking,
            node: n,
        }
    }

    #[test]
    fn test_score_weights_cpu_memory_and_load() {
        // 20 cpu + 25 memory + 20 load
        let n = node("n1", 20.0, 4_000, 16_000, 2);
        assert_eq!(dispatch_score(&n), 65.0);
    }

    #[test]
    fn test_zero_total_memory_scores_as_fully_loaded() {
        let n = node("n1", 0.0, 0, 0, 0);
        assert_eq!(dispatch_score(&n), 100.0);
    }

    #[test]
    fn test_lowest_score_wins() {
        let busy = node("busy", 80.0, 12_000, 16_000, 8);
        let idle = node("idle", 10.0, 2_000, 16_000, 1);
        let chosen = choose_candidate(vec![candidate(busy, 1.0), candidate(idle, 2.0)]).unwrap();
        assert_eq!(chosen.node_id, "idle");
    }

    #[test]
    fn test_score_tie_breaks_on_ranking() {
        // Identical resources and load; only the advertised priority differs.
        let a = node("a", 10.0, 4_000, 16_000, 3);
        let b = node("b", 10.0, 4_000, 16_000, 3);
        let chosen = choose_candidate(vec![candidate(a, 5.0), candidate(b, 2.0)]).unwrap();
        assert_eq!(chosen.node_id, "b");
    }

    #[test]
    fn test_full_tie_is_deterministic() {
        let mk = || vec![
            candidate(node("n2", 10.0, 4_000, 16_000, 3), 1.0),
            candidate(node("n1", 10.0, 4_000, 16_000, 3), 1.0),
        ];
        let first = choose_candidate(mk()).unwrap();
        let second = choose_candidate(mk()).unwrap();
        assert_eq!(first.node_id, second.node_id);
        assert_eq!(first.node_id, "n1");
    }

    #[test]
    fn test_unranked_node_loses_ties() {
        let ranked = node("ranked", 10.0, 4_000, 16_000, 3);
        let unranked = node("a-unranked", 10.0, 4_000, 16_000, 3);
        let chosen =
            choose_candidate(vec![candidate(unranked, f64::INFINITY), candidate(ranked, 9.0)])
                .unwrap();
        assert_eq!(chosen.node_id, "ranked");
    }

    #[test]
    fn test_no_candidates_yields_none() {
        assert!(choose_candidate(Vec::new()).is_none());
    }
}
