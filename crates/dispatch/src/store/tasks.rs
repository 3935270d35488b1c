use chrono::{DateTime, Utc};
use uuid::Uuid;

use polyvox_common::ids::TaskId;
use polyvox_common::types::{Task, TaskStatus};

use super::{StoreError, TaskStore};

/// How `update_status` treats the assigned-node column.
#[derive(Clone, Copy, Debug, Default)]
pub enum NodeAssignment<'a> {
    /// Leave the column untouched.
    #[default]
    Keep,
    /// Record a successful handoff.
    Assign(&'a str),
    /// Null the column (cancellation, reclamation).
    Clear,
}

/// Optional fields written alongside a status transition. All affected
/// columns land in one UPDATE — partial transitions are not possible.
#[derive(Clone, Copy, Debug, Default)]
pub struct TaskUpdate<'a> {
    pub assigned_node: NodeAssignment<'a>,
    pub retry_count: Option<i32>,
    pub error_message: Option<&'a str>,
    pub result_file_path: Option<&'a str>,
    pub accuracy_score: Option<f64>,
}

/// Listing filters for the task lookup surface.
#[derive(Clone, Debug, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub source_language: Option<String>,
    /// Substring match against the comma-joined target column.
    pub target_language: Option<String>,
    pub text_contains: Option<String>,
}

impl TaskStore {
    /// Persist a new task. The caller constructs it in PENDING with
    /// `retry_count = 0`; the persisted row is returned.
    pub async fn insert_task(&self, task: &Task) -> Result<Task, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO translation_tasks (id, status, source_language, target_languages,
                                           text_content, audio_file_path, assigned_node_id,
                                           created_at, updated_at, result_file_path,
                                           error_message, original_text, retry_count,
                                           accuracy_score)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(task.id.0)
        .bind(task.status.as_db_str())
        .bind(&task.source_language)
        .bind(join_languages(&task.target_languages))
        .bind(&task.text_content)
        .bind(&task.audio_file_path)
        .bind(&task.assigned_node_id)
        .bind(task.created_at)
        .bind(task.updated_at)
        .bind(&task.result_file_path)
        .bind(&task.error_message)
        .bind(&task.original_text)
        .bind(task.retry_count)
        .bind(task.accuracy_score)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(task.clone())
    }

    /// Retrieve a task by ID.
    pub async fn get_task(&self, id: TaskId) -> Result<Task, StoreError> {
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT id, status, source_language, target_languages, text_content,
                   audio_file_path, assigned_node_id, created_at, updated_at,
                   result_file_path, error_message, original_text, retry_count,
                   accuracy_score
            FROM translation_tasks
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?
        .ok_or_else(|| StoreError::NotFound(format!("Task {}", id)))?;

        Ok(row.into())
    }

    /// Transition a task's status, writing all affected fields in one
    /// atomic statement and advancing `updated_at`.
    pub async fn update_status(
        &self,
        id: TaskId,
        status: TaskStatus,
        update: TaskUpdate<'_>,
    ) -> Result<(), StoreError> {
        let (touch_node, node_value) = match update.assigned_node {
            NodeAssignment::Keep => (false, None),
            NodeAssignment::Assign(node_id) => (true, Some(node_id)),
            NodeAssignment::Clear => (true, None),
        };

        sqlx::query(
            r#"
            UPDATE translation_tasks
            SET status = $2,
                assigned_node_id = CASE WHEN $3 THEN $4 ELSE assigned_node_id END,
                retry_count = COALESCE($5, retry_count),
                error_message = COALESCE($6, error_message),
                result_file_path = COALESCE($7, result_file_path),
                accuracy_score = COALESCE($8, accuracy_score),
                updated_at = $9
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .bind(status.as_db_str())
        .bind(touch_node)
        .bind(node_value)
        .bind(update.retry_count)
        .bind(update.error_message)
        .bind(update.result_file_path)
        .bind(update.accuracy_score)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(())
    }

    /// Number of PROCESSING tasks currently assigned to one node — the
    /// authoritative capacity count, preferred over the node's self-report.
    pub async fn count_processing(&self, node_id: &str) -> Result<i64, StoreError> {
        let row: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM translation_tasks
            WHERE assigned_node_id = $1
              AND status = 'processing'
            "#,
        )
        .bind(node_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(row.0)
    }

    /// All PROCESSING tasks whose `updated_at` is older than `threshold`,
    /// oldest first.
    pub async fn list_stuck(&self, threshold: DateTime<Utc>) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT id, status, source_language, target_languages, text_content,
                   audio_file_path, assigned_node_id, created_at, updated_at,
                   result_file_path, error_message, original_text, retry_count,
                   accuracy_score
            FROM translation_tasks
            WHERE status = 'processing'
              AND updated_at < $1
            ORDER BY updated_at
            "#,
        )
        .bind(threshold)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// List tasks matching the given filters, newest first.
    pub async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT id, status, source_language, target_languages, text_content,
                   audio_file_path, assigned_node_id, created_at, updated_at,
                   result_file_path, error_message, original_text, retry_count,
                   accuracy_score
            FROM translation_tasks
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR source_language = $2)
              AND ($3::text IS NULL OR target_languages LIKE '%' || $3 || '%')
              AND ($4::text IS NULL OR text_content LIKE '%' || $4 || '%')
            ORDER BY created_at DESC
            "#,
        )
        .bind(filter.status.map(|s| s.as_db_str()))
        .bind(&filter.source_language)
        .bind(&filter.target_language)
        .bind(&filter.text_contains)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

/// Internal row type for sqlx deserialization.
#[derive(sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    status: String,
    source_language: String,
    target_languages: String,
    text_content: Option<String>,
    audio_file_path: Option<String>,
    assigned_node_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    result_file_path: Option<String>,
    error_message: Option<String>,
    original_text: Option<String>,
    retry_count: i32,
    accuracy_score: Option<f64>,
}

impl From<TaskRow> for Task {
    fn from(row: TaskRow) -> Self {
        Self {
            id: TaskId::from_uuid(row.id),
            status: parse_task_status(&row.status),
            source_language: row.source_language,
            target_languages: split_languages(&row.target_languages),
            text_content: row.text_content,
            audio_file_path: row.audio_file_path,
            assigned_node_id: row.assigned_node_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
            result_file_path: row.result_file_path,
            error_message: row.error_message,
            original_text: row.original_text,
            retry_count: row.retry_count,
            accuracy_score: row.accuracy_score,
        }
    }
}

fn parse_task_status(s: &str) -> TaskStatus {
    TaskStatus::from_db_str(s).unwrap_or_else(|| {
        tracing::warn!(status = s, "Unknown task status, defaulting to Pending");
        TaskStatus::Pending
    })
}

fn join_languages(languages: &[String]) -> String {
    languages.join(",")
}

fn split_languages(joined: &str) -> Vec<String> {
    joined
        .split(',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_status_db_round_trip() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Dispatching,
            TaskStatus::Processing,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(parse_task_status(status.as_db_str()), status);
        }
    }

    #[test]
    fn test_unknown_status_defaults_to_pending() {
        assert_eq!(parse_task_status("archived"), TaskStatus::Pending);
    }

    #[test]
    fn test_language_join_split_round_trip() {
        let langs = vec!["zh".to_string(), "fr-CA".to_string(), "de".to_string()];
        assert_eq!(join_languages(&langs), "zh,fr-CA,de");
        assert_eq!(split_languages("zh,fr-CA,de"), langs);
    }

    #[test]
    fn test_split_languages_drops_empty_segments() {
        assert_eq!(split_languages(""), Vec::<String>::new());
        assert_eq!(split_languages("en,"), vec!["en".to_string()]);
    }

    #[test]
    fn test_language_case_is_preserved() {
        let langs = vec!["pt-BR".to_string(), "EN".to_string()];
        assert_eq!(split_languages(&join_languages(&langs)), langs);
    }
}
