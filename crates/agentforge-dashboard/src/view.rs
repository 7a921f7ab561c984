use agentforge_artifacts::ArtifactLayout;
use agentforge_core::{
    ErrorInfo, ForgeResult, ProjectStatus, StageMetrics, StageStatus, TaskStatus, TaskType,
};
use agentforge_store::{ProjectStore, StateStore, TaskStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One stage row of the dashboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageView {
    pub stage_name: String,
    pub stage_number: u32,
    pub display_name: String,
    pub status: StageStatus,
    pub duration_seconds: Option<f64>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub tool_calls: Option<u32>,
    pub artifacts: Vec<String>,
    pub error_message: Option<String>,
}

/// The latest task's status, for the console header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskView {
    pub task_id: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub worker_id: Option<String>,
}

/// Merged, point-in-time view of one build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardSnapshot {
    pub project_id: String,
    pub project_name: String,
    pub requirement: String,
    pub status: ProjectStatus,
    pub progress: u8,
    pub current_stage: Option<String>,
    pub stages: Vec<StageView>,
    /// Summed tokens, tool calls, and durations across all stages.
    pub aggregated: StageMetrics,
    pub latest_task: Option<TaskView>,
    pub error_info: Option<ErrorInfo>,
    /// Seconds remaining, estimated from the mean completed-stage duration.
    pub eta_seconds: Option<f64>,
    /// Whether a `workflow_report*` artifact exists for the UI.
    pub has_workflow_report: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Provenance label for the console.
    pub source: String,
}

/// Read-side dashboard over the state store and artifact layout.
pub struct BuildDashboard {
    store: Arc<dyn StateStore>,
    layout: ArtifactLayout,
}

impl BuildDashboard {
    /// Build a dashboard.
    pub fn new(store: Arc<dyn StateStore>, layout: ArtifactLayout) -> Self {
        Self { store, layout }
    }

    /// Produce the merged snapshot for one project.
    pub async fn snapshot(&self, project_id: &str) -> ForgeResult<DashboardSnapshot> {
        let project = self.store.get_project(project_id).await?;
        let tasks = self.store.list_tasks_for_project(project_id).await?;
        let latest_task = tasks.first().map(|t| TaskView {
            task_id: t.task_id.clone(),
            task_type: t.task_type,
            status: t.status,
            retry_count: t.retry_count,
            worker_id: t.worker_id.clone(),
        });

        let stages: Vec<StageView> = project
            .stages
            .iter()
            .map(|s| StageView {
                stage_name: s.stage_name.clone(),
                stage_number: s.stage_number,
                display_name: s.display_name.clone(),
                status: s.status,
                duration_seconds: s.duration_seconds,
                input_tokens: s.input_tokens,
                output_tokens: s.output_tokens,
                tool_calls: s.tool_calls,
                artifacts: s.artifacts(),
                error_message: s.error_message.clone(),
            })
            .collect();

        let aggregated = project.aggregate_metrics();
        let eta_seconds = estimate_eta(&project.stages);
        let has_workflow_report = self.layout.has_workflow_report(&project.project_name);

        Ok(DashboardSnapshot {
            project_id: project.project_id.clone(),
            project_name: project.project_name.clone(),
            requirement: project.requirement.clone(),
            status: project.status,
            progress: project.progress,
            current_stage: project.current_stage.clone(),
            stages,
            aggregated,
            latest_task,
            error_info: project.error_info.clone(),
            eta_seconds,
            has_workflow_report,
            created_at: project.created_at,
            updated_at: project.updated_at,
            source: "state_store".to_string(),
        })
    }
}

/// Mean completed-stage duration times the number of stages still to run.
/// `None` until at least one stage has completed, or once nothing remains.
fn estimate_eta(stages: &[agentforge_core::StageSnapshot]) -> Option<f64> {
    let completed: Vec<f64> = stages
        .iter()
        .filter(|s| s.status == StageStatus::Completed)
        .filter_map(|s| s.duration_seconds)
        .collect();
    if completed.is_empty() {
        return None;
    }
    let remaining = stages
        .iter()
        .filter(|s| matches!(s.status, StageStatus::Pending | StageStatus::Running))
        .count();
    if remaining == 0 {
        return None;
    }
    let mean = completed.iter().sum::<f64>() / completed.len() as f64;
    Some(mean * remaining as f64)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use agentforge_core::{BuildRequest, ProjectRecord, StageSnapshot, TaskRecord};
    use agentforge_store::{MemoryStateStore, ProjectStore, TaskStore};

    fn stages() -> Vec<StageSnapshot> {
        let mut one = StageSnapshot::new("orchestrator", 1, "Orchestrator");
        one.status = StageStatus::Completed;
        one.duration_seconds = Some(2.0);
        one.input_tokens = Some(100);
        one.tool_calls = Some(1);
        one.output_data.insert(
            "artifacts".into(),
            serde_json::json!(["projects/demo/config.yaml"]),
        );
        let two = StageSnapshot::new("requirements_analyzer", 2, "Requirements Analyzer");
        let three = StageSnapshot::new("system_architect", 3, "System Architect");
        vec![one, two, three]
    }

    #[tokio::test]
    async fn test_snapshot_merges_project_and_task() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStateStore::new());
        let request = BuildRequest::new("demo requirement").with_project_name("demo");
        let mut project = ProjectRecord::new(&request, "demo", stages());
        project.recompute_progress();
        store.create_project(&project).await.unwrap();
        let task = TaskRecord::build_for(&project.project_id, 3);
        store.create_task(&task).await.unwrap();

        let dashboard =
            BuildDashboard::new(store.clone(), ArtifactLayout::new(tmp.path()));
        let snapshot = dashboard.snapshot(&project.project_id).await.unwrap();

        assert_eq!(snapshot.project_name, "demo");
        assert_eq!(snapshot.stages.len(), 3);
        assert_eq!(snapshot.stages[0].artifacts, vec!["projects/demo/config.yaml"]);
        assert_eq!(snapshot.aggregated.input_tokens, 100);
        assert_eq!(snapshot.aggregated.tool_calls, 1);
        assert_eq!(snapshot.latest_task.unwrap().task_id, task.task_id);
        assert!(!snapshot.has_workflow_report);
        // One completed stage at 2s, two remaining.
        assert!((snapshot.eta_seconds.unwrap() - 4.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_workflow_report_classification() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStateStore::new());
        let request = BuildRequest::new("demo requirement").with_project_name("demo");
        let project = ProjectRecord::new(&request, "demo", stages());
        store.create_project(&project).await.unwrap();

        let dir = tmp.path().join("projects/demo");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("workflow_report.md"), "# report").unwrap();

        let dashboard =
            BuildDashboard::new(store.clone(), ArtifactLayout::new(tmp.path()));
        let snapshot = dashboard.snapshot(&project.project_id).await.unwrap();
        assert!(snapshot.has_workflow_report);
    }

    #[test]
    fn test_eta_none_without_history_or_remaining() {
        let fresh: Vec<StageSnapshot> =
            vec![StageSnapshot::new("orchestrator", 1, "Orchestrator")];
        assert!(estimate_eta(&fresh).is_none());

        let mut done = stages();
        for stage in &mut done {
            stage.status = StageStatus::Completed;
            stage.duration_seconds = Some(1.0);
        }
        assert!(estimate_eta(&done).is_none());
    }
}
