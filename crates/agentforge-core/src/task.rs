use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of work a queue task carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    BuildAgent,
    DeployAgent,
    InvokeAgent,
}

/// Lifecycle status of a queue task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal tasks are never re-delivered.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// A unit of work on the build queue.
///
/// Leased by at most one worker at a time; only the leaseholder may mutate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub task_type: TaskType,
    pub project_id: Option<String>,
    /// Opaque payload passed through to the handler.
    #[serde(default)]
    pub payload: serde_json::Value,
    pub priority: u8,
    pub retry_count: u32,
    pub max_retries: u32,
    pub status: TaskStatus,
    pub worker_id: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    /// Monotonic version counter for optimistic concurrency.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    /// Create a pending task.
    pub fn new(task_type: TaskType, project_id: Option<String>, priority: u8) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            task_type,
            project_id,
            payload: serde_json::Value::Null,
            priority,
            retry_count: 0,
            max_retries: 3,
            status: TaskStatus::Pending,
            worker_id: None,
            result: None,
            error_message: None,
            version: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Create the single build task for a project.
    pub fn build_for(project_id: impl Into<String>, priority: u8) -> Self {
        Self::new(TaskType::BuildAgent, Some(project_id.into()), priority)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_build_task_defaults() {
        let task = TaskRecord::build_for("p-1", 3);
        assert_eq!(task.task_type, TaskType::BuildAgent);
        assert_eq!(task.project_id.as_deref(), Some("p-1"));
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.max_retries, 3);
        assert_eq!(task.retry_count, 0);
        assert!(task.worker_id.is_none());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Queued.is_terminal());
    }

    #[test]
    fn test_task_type_wire_names() {
        assert_eq!(
            serde_json::to_string(&TaskType::BuildAgent).unwrap(),
            "\"build_agent\""
        );
        assert_eq!(
            serde_json::to_string(&TaskType::InvokeAgent).unwrap(),
            "\"invoke_agent\""
        );
    }
}
