use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::TaskId;

/// Translation task lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Persisted, waiting for a node.
    Pending,
    /// A dispatcher holds the task lock and is selecting a node.
    Dispatching,
    /// Handed off to a node; the work message is on its queue.
    Processing,
    /// Worker reported success. Terminal.
    Completed,
    /// Worker reported an error, or the retry ceiling was reached. Terminal.
    Failed,
    /// Cancelled from the outside. Terminal.
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns the string representation used in PostgreSQL.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Dispatching => "dispatching",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Strict inverse of [`as_db_str`](Self::as_db_str).
    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "dispatching" => Some(Self::Dispatching),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// A unit of translation work: either inline text or a stored audio artifact,
/// translated into one or more target languages.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub status: TaskStatus,
    pub source_language: String,
    /// At least one target language tag. Stored comma-joined in PostgreSQL.
    pub target_languages: Vec<String>,
    /// Inline text to translate. Exactly one of this and `audio_file_path`
    /// is populated at creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_content: Option<String>,
    /// Pointer to previously stored audio.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_file_path: Option<String>,
    /// Set by a successful handoff, cleared by cancellation and reclamation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_node_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Recognized-text hint for audio tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_text: Option<String>,
    /// Incremented on every pending requeue and every stuck-task recovery.
    pub retry_count: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy_score: Option<f64>,
}

impl Task {
    /// Create a new inline-text task in PENDING.
    pub fn text(source_language: String, target_languages: Vec<String>, content: String) -> Self {
        Self::new(source_language, target_languages, Some(content), None)
    }

    /// Create a new stored-audio task in PENDING.
    pub fn audio(
        source_language: String,
        target_languages: Vec<String>,
        audio_file_path: String,
    ) -> Self {
        Self::new(source_language, target_languages, None, Some(audio_file_path))
    }

    fn new(
        source_language: String,
        target_languages: Vec<String>,
        text_content: Option<String>,
        audio_file_path: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            status: TaskStatus::Pending,
            source_language,
            target_languages,
            text_content,
            audio_file_path,
            assigned_node_id: None,
            created_at: now,
            updated_at: now,
            result_file_path: None,
            error_message: None,
            original_text: None,
            retry_count: 0,
            accuracy_score: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_task_populates_exactly_one_content_field() {
        let task = Task::text("en".into(), vec!["zh".into()], "hello".into());
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 0);
        assert!(task.text_content.is_some());
        assert!(task.audio_file_path.is_none());
        assert!(task.assigned_node_id.is_none());
    }

    #[test]
    fn test_audio_task_populates_exactly_one_content_field() {
        let task = Task::audio("en".into(), vec!["fr".into(), "de".into()], "audio/a.wav".into());
        assert!(task.text_content.is_none());
        assert_eq!(task.audio_file_path.as_deref(), Some("audio/a.wav"));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Dispatching.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
    }
}
