use std::collections::HashMap;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Worker node status as advertised in the broker hash.
///
/// The wire value `SHUTTING_DOWN` has no state of its own — a node on its
/// way out is treated as OFFLINE, as are unrecognized values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Online,
    Offline,
    Busy,
    Maintenance,
}

impl NodeStatus {
    /// Parse the hash field value, case-insensitively.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "ONLINE" => Self::Online,
            "OFFLINE" | "SHUTTING_DOWN" => Self::Offline,
            "BUSY" => Self::Busy,
            "MAINTENANCE" => Self::Maintenance,
            other => {
                tracing::warn!(status = other, "Unknown node status, treating as OFFLINE");
                Self::Offline
            }
        }
    }
}

/// A live worker as read from `worker_nodes:{node_id}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerNode {
    pub node_id: String,
    pub host: String,
    pub port: u16,
    pub memory_total: u64,
    pub memory_used: u64,
    pub cpu_usage: f64,
    pub gpu_available: bool,
    pub status: NodeStatus,
    /// ISO-8601 local time without zone, as written by the worker.
    pub last_heartbeat: Option<NaiveDateTime>,
    /// As observed by the node itself. The dispatcher re-counts from the
    /// repository before any capacity decision.
    pub active_task_count: i64,
}

impl WorkerNode {
    /// Build a node view from its broker hash. Returns `None` for an empty
    /// hash (the key expired or was never written).
    pub fn from_hash(node_id: &str, fields: &HashMap<String, String>) -> Option<Self> {
        if fields.is_empty() {
            return None;
        }

        let get = |key: &str| fields.get(key).map(String::as_str).unwrap_or("");

        Some(Self {
            node_id: node_id.to_string(),
            host: get("host").to_string(),
            port: get("port").parse().unwrap_or(0),
            memory_total: get("memory_total").parse().unwrap_or(0),
            memory_used: get("memory_used").parse().unwrap_or(0),
            cpu_usage: get("cpu_usage").parse().unwrap_or(0.0),
            gpu_available: parse_bool_field(get("gpu_available")),
            status: NodeStatus::parse(get("status")),
            last_heartbeat: get("last_heartbeat").parse().ok(),
            active_task_count: get("active_task_count").parse().unwrap_or(0),
        })
    }

    /// Whether the last heartbeat is within `window_seconds` of `now`.
    /// A missing or unparseable heartbeat is never fresh.
    pub fn heartbeat_within(&self, now: NaiveDateTime, window_seconds: i64) -> bool {
        match self.last_heartbeat {
            Some(hb) => (now - hb).num_seconds() <= window_seconds,
            None => false,
        }
    }
}

/// Workers write booleans as "1"/"0" or "true"/"false".
fn parse_bool_field(s: &str) -> bool {
    matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Local;

    fn hash(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_node_status_round_trip() {
        assert_eq!(NodeStatus::parse("ONLINE"), NodeStatus::Online);
        assert_eq!(NodeStatus::parse("OFFLINE"), NodeStatus::Offline);
        assert_eq!(NodeStatus::parse("BUSY"), NodeStatus::Busy);
        assert_eq!(NodeStatus::parse("MAINTENANCE"), NodeStatus::Maintenance);
        assert_eq!(NodeStatus::parse("SHUTTING_DOWN"), NodeStatus::Offline);
        assert_eq!(NodeStatus::parse("something_else"), NodeStatus::Offline);
    }

    #[test]
    fn test_node_status_parse_is_case_insensitive() {
        assert_eq!(NodeStatus::parse("online"), NodeStatus::Online);
        assert_eq!(NodeStatus::parse("Shutting_Down"), NodeStatus::Offline);
        assert_eq!(NodeStatus::parse("busy"), NodeStatus::Busy);
    }

    #[test]
    fn test_from_hash_empty_is_none() {
        assert!(WorkerNode::from_hash("n1", &HashMap::new()).is_none());
    }

    #[test]
    fn test_from_hash_parses_fields() {
        let now = Local::now().naive_local();
        let hb = now.format("%Y-%m-%dT%H:%M:%S%.f").to_string();
        let fields = hash(&[
            ("host", "10.0.0.5"),
            ("port", "9090"),
            ("memory_total", "16000"),
            ("memory_used", "4000"),
            ("cpu_usage", "20.5"),
            ("gpu_available", "1"),
            ("active_task_count", "2"),
            ("status", "ONLINE"),
            ("last_heartbeat", &hb),
        ]);

        let node = WorkerNode::from_hash("n1", &fields).unwrap();
        assert_eq!(node.host, "10.0.0.5");
        assert_eq!(node.port, 9090);
        assert_eq!(node.memory_total, 16000);
        assert!(node.gpu_available);
        assert_eq!(node.status, NodeStatus::Online);
        assert!(node.heartbeat_within(now, 300));
    }

    #[test]
    fn test_from_hash_tolerates_malformed_numerics() {
        let fields = hash(&[("status", "ONLINE"), ("port", "not-a-port")]);
        let node = WorkerNode::from_hash("n1", &fields).unwrap();
        assert_eq!(node.port, 0);
        assert_eq!(node.memory_total, 0);
        assert!(node.last_heartbeat.is_none());
    }

    #[test]
    fn test_missing_heartbeat_is_never_fresh() {
        let fields = hash(&[("status", "ONLINE")]);
        let node = WorkerNode::from_hash("n1", &fields).unwrap();
        assert!(!node.heartbeat_within(Local::now().naive_local(), i64::MAX / 2));
    }

    #[test]
    fn test_stale_heartbeat_outside_window() {
        let now = Local::now().naive_local();
        let stale = (now - chrono::Duration::seconds(600))
            .format("%Y-%m-%dT%H:%M:%S%.f")
            .to_string();
        let fields = hash(&[("status", "ONLINE"), ("last_heartbeat", &stale)]);
        let node = WorkerNode::from_hash("n1", &fields).unwrap();
        assert!(!node.heartbeat_within(now, 300));
        assert!(node.heartbeat_within(now, 900));
    }

    #[test]
    fn test_gpu_bool_strings() {
        for (raw, expected) in [("1", true), ("true", true), ("0", false), ("false", false), ("", false)] {
            let fields = hash(&[("status", "ONLINE"), ("gpu_available", raw)]);
            let node = WorkerNode::from_hash("n1", &fields).unwrap();
            assert_eq!(node.gpu_available, expected, "raw = {:?}", raw);
        }
    }
}
