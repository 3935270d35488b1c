use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::ids::TaskId;
use crate::types::Task;

/// Broker record for a task that could not be placed on a node.
///
/// Lives on the global `pending_tasks` list. Not authoritative — the task
/// repository is the source of truth; an envelope whose task is no longer
/// PENDING is discarded by the drain.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingTaskEnvelope {
    pub task_id: TaskId,
    pub retry_count: i32,
    pub added_at: NaiveDateTime,
}

impl PendingTaskEnvelope {
    pub fn new(task_id: TaskId, retry_count: i32) -> Self {
        Self {
            task_id,
            retry_count,
            added_at: Local::now().naive_local(),
        }
    }
}

/// Per-node work message pushed onto `task_queue:{node_id}`.
///
/// Carries everything a worker needs to execute without a repository
/// round-trip.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMessage {
    pub task_id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_content: Option<String>,
    pub source_language: String,
    pub target_languages: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_text: Option<String>,
}

impl From<&Task> for TaskMessage {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id,
            audio_file_path: task.audio_file_path.clone(),
            text_content: task.text_content.clone(),
            source_language: task.source_language.clone(),
            target_languages: task.target_languages.clone(),
            original_text: task.original_text.clone(),
        }
    }
}

/// Out-of-band command interleaved with work on `control_queue:{node_id}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlAction {
    CancelTask,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlMessage {
    pub action: ControlAction,
    pub task_id: TaskId,
    pub timestamp: NaiveDateTime,
}

impl ControlMessage {
    pub fn cancel(task_id: TaskId) -> Self {
        Self {
            action: ControlAction::CancelTask,
            task_id,
            timestamp: Local::now().naive_local(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_wire_shape_is_camel_case() {
        let env = PendingTaskEnvelope::new(TaskId::new(), 3);
        let json = serde_json::to_value(&env).unwrap();
        assert!(json.get("taskId").is_some());
        assert_eq!(json["retryCount"], 3);
        // Naive timestamp: ISO-8601 without a zone suffix.
        let added = json["addedAt"].as_str().unwrap();
        assert!(!added.ends_with('Z'));
        assert!(!added.contains('+'));
    }

    #[test]
    fn test_envelope_round_trip() {
        let env = PendingTaskEnvelope::new(TaskId::new(), 0);
        let json = serde_json::to_string(&env).unwrap();
        let back: PendingTaskEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.task_id, env.task_id);
        assert_eq!(back.retry_count, 0);
        assert_eq!(back.added_at, env.added_at);
    }

    #[test]
    fn test_task_message_from_task() {
        let task = Task::text("en".into(), vec!["zh".into(), "ja".into()], "hello".into());
        let msg = TaskMessage::from(&task);
        assert_eq!(msg.task_id, task.id);
        assert_eq!(msg.text_content.as_deref(), Some("hello"));
        assert!(msg.audio_file_path.is_none());
        assert_eq!(msg.target_languages, vec!["zh", "ja"]);

        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("sourceLanguage").is_some());
        assert!(json.get("targetLanguages").is_some());
    }

    #[test]
    fn test_control_message_action_tag() {
        let msg = ControlMessage::cancel(TaskId::new());
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["action"], "CANCEL_TASK");
        assert!(json.get("taskId").is_some());
        assert!(json.get("timestamp").is_some());
    }
}
