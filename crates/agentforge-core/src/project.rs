use crate::control::ControlFlag;
use crate::request::BuildRequest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Cap on the per-stage log buffer embedded in the project record.
pub const MAX_STAGE_LOG_LINES: usize = 100;

/// Lifecycle status of a project (the unit of a build).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Pending,
    Queued,
    Building,
    Completed,
    Failed,
    Paused,
    Cancelled,
}

impl ProjectStatus {
    /// Terminal states accept no further pipeline work.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProjectStatus::Completed | ProjectStatus::Failed | ProjectStatus::Cancelled
        )
    }
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProjectStatus::Pending => "pending",
            ProjectStatus::Queued => "queued",
            ProjectStatus::Building => "building",
            ProjectStatus::Completed => "completed",
            ProjectStatus::Failed => "failed",
            ProjectStatus::Paused => "paused",
            ProjectStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Status of one stage within a project's embedded snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StageStatus {
    /// Completed or skipped stages count toward progress.
    pub fn is_done(&self) -> bool {
        matches!(self, StageStatus::Completed | StageStatus::Skipped)
    }
}

/// Telemetry captured for one stage execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StageMetrics {
    /// Tokens consumed by the sub-agent body, as reported by it.
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub tool_calls: u32,
    /// Wall-clock duration measured by the executor.
    #[serde(default)]
    pub duration_seconds: f64,
}

impl StageMetrics {
    /// Fold another stage's metrics into this aggregate.
    pub fn absorb(&mut self, other: &StageMetrics) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.tool_calls += other.tool_calls;
        self.duration_seconds += other.duration_seconds;
    }
}

/// One stage entry embedded in [`ProjectRecord::stages`].
///
/// Invariant: at most one entry is `running` at a time, except the three
/// developer-manager sub-stages during fan-out. Entries advance
/// monotonically except under restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSnapshot {
    pub stage_name: String,
    pub stage_number: u32,
    pub display_name: String,
    pub status: StageStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub tool_calls: Option<u32>,
    /// Free-form stage output document. Committed artifacts are recorded
    /// under the `artifacts` key as a list of workspace-relative paths.
    #[serde(default)]
    pub output_data: serde_json::Map<String, serde_json::Value>,
    pub error_message: Option<String>,
    #[serde(default)]
    pub logs: Vec<String>,
}

impl StageSnapshot {
    /// Create a pending snapshot entry.
    pub fn new(stage_name: impl Into<String>, stage_number: u32, display_name: impl Into<String>) -> Self {
        Self {
            stage_name: stage_name.into(),
            stage_number,
            display_name: display_name.into(),
            status: StageStatus::Pending,
            started_at: None,
            completed_at: None,
            duration_seconds: None,
            input_tokens: None,
            output_tokens: None,
            tool_calls: None,
            output_data: serde_json::Map::new(),
            error_message: None,
            logs: Vec::new(),
        }
    }

    /// Reset this entry back to pending, dropping outputs and telemetry.
    /// Used by restart handling.
    pub fn reset(&mut self) {
        self.status = StageStatus::Pending;
        self.started_at = None;
        self.completed_at = None;
        self.duration_seconds = None;
        self.input_tokens = None;
        self.output_tokens = None;
        self.tool_calls = None;
        self.output_data = serde_json::Map::new();
        self.error_message = None;
        self.logs.clear();
    }

    /// Append a log line, dropping the oldest lines past the cap.
    pub fn push_log(&mut self, line: impl Into<String>) {
        self.logs.push(line.into());
        if self.logs.len() > MAX_STAGE_LOG_LINES {
            let excess = self.logs.len() - MAX_STAGE_LOG_LINES;
            self.logs.drain(..excess);
        }
    }

    /// The artifact paths recorded in `output_data`, if any.
    pub fn artifacts(&self) -> Vec<String> {
        self.output_data
            .get("artifacts")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|p| p.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Apply completed-stage telemetry.
    pub fn record_metrics(&mut self, metrics: &StageMetrics) {
        self.duration_seconds = Some(metrics.duration_seconds);
        self.input_tokens = Some(metrics.input_tokens);
        self.output_tokens = Some(metrics.output_tokens);
        self.tool_calls = Some(metrics.tool_calls);
    }
}

/// First-failure information surfaced to callers when a project fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Name of the stage that failed first.
    pub stage_name: String,
    pub message: String,
    /// Failure classification label (see `ForgeError::classification`).
    pub classification: String,
}

/// The persistent record tying a requirement to its build, stages, and
/// resulting agent.
///
/// Exclusively owned by the workflow driver while `status == Building`;
/// readable by the dashboard at all times. Mutated only through the state
/// store's compare-and-swap update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub project_id: String,
    pub requirement: String,
    pub project_name: String,
    pub user_id: Option<String>,
    pub user_name: Option<String>,
    /// Build priority, 1 (lowest) to 5 (highest).
    pub priority: u8,
    #[serde(default)]
    pub tags: Vec<String>,
    pub status: ProjectStatus,
    /// 0–100, derived: round(100 × done stages / total stages).
    pub progress: u8,
    pub current_stage: Option<String>,
    #[serde(default)]
    pub control_flag: ControlFlag,
    #[serde(default)]
    pub stages: Vec<StageSnapshot>,
    pub error_info: Option<ErrorInfo>,
    /// Monotonic version counter for optimistic concurrency.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ProjectRecord {
    /// Create a pending project from a validated build request.
    ///
    /// `stages` is the fully-expanded snapshot (six pipeline stages plus the
    /// three developer-manager sub-stages); the total is fixed for the life
    /// of the project.
    pub fn new(request: &BuildRequest, project_name: impl Into<String>, stages: Vec<StageSnapshot>) -> Self {
        let now = Utc::now();
        Self {
            project_id: Uuid::new_v4().to_string(),
            requirement: request.requirement.clone(),
            project_name: project_name.into(),
            user_id: request.user_id.clone(),
            user_name: request.user_name.clone(),
            priority: request.priority,
            tags: request.tags.clone(),
            status: ProjectStatus::Pending,
            progress: 0,
            current_stage: None,
            control_flag: ControlFlag::None,
            stages,
            error_info: None,
            version: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Find a stage snapshot by name.
    pub fn stage(&self, name: &str) -> Option<&StageSnapshot> {
        self.stages.iter().find(|s| s.stage_name == name)
    }

    /// Find a stage snapshot by name, mutably.
    pub fn stage_mut(&mut self, name: &str) -> Option<&mut StageSnapshot> {
        self.stages.iter_mut().find(|s| s.stage_name == name)
    }

    /// Names of stages currently in `running`.
    pub fn running_stages(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|s| s.status == StageStatus::Running)
            .map(|s| s.stage_name.as_str())
            .collect()
    }

    /// Recompute `progress` from the stage snapshot.
    pub fn recompute_progress(&mut self) {
        let total = self.stages.len();
        if total == 0 {
            self.progress = 0;
            return;
        }
        let done = self.stages.iter().filter(|s| s.status.is_done()).count();
        self.progress = ((done as f64 / total as f64) * 100.0).round() as u8;
    }

    /// Whether every stage in the snapshot is completed or skipped.
    pub fn all_stages_done(&self) -> bool {
        self.stages.iter().all(|s| s.status.is_done())
    }

    /// Aggregate telemetry across all stages.
    pub fn aggregate_metrics(&self) -> StageMetrics {
        let mut total = StageMetrics::default();
        for stage in &self.stages {
            total.input_tokens += stage.input_tokens.unwrap_or(0);
            total.output_tokens += stage.output_tokens.unwrap_or(0);
            total.tool_calls += stage.tool_calls.unwrap_or(0);
            total.duration_seconds += stage.duration_seconds.unwrap_or(0.0);
        }
        total
    }

    /// Bump `updated_at` (callers bump `version` through the store).
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn request() -> BuildRequest {
        BuildRequest {
            requirement: "Weather assistant that fetches forecast by city".into(),
            project_name: Some("weather_agent".into()),
            user_id: None,
            user_name: None,
            priority: 3,
            tags: vec![],
        }
    }

    fn stages() -> Vec<StageSnapshot> {
        vec![
            StageSnapshot::new("orchestrator", 1, "Orchestrator"),
            StageSnapshot::new("requirements_analyzer", 2, "Requirements Analyzer"),
        ]
    }

    #[test]
    fn test_new_project_is_pending() {
        let project = ProjectRecord::new(&request(), "weather_agent", stages());
        assert_eq!(project.status, ProjectStatus::Pending);
        assert_eq!(project.progress, 0);
        assert_eq!(project.version, 0);
        assert!(project.current_stage.is_none());
        assert_eq!(project.control_flag, ControlFlag::None);
    }

    #[test]
    fn test_progress_rounds_from_done_stages() {
        let mut project = ProjectRecord::new(&request(), "weather_agent", stages());
        project.stages[0].status = StageStatus::Completed;
        project.recompute_progress();
        assert_eq!(project.progress, 50);

        project.stages[1].status = StageStatus::Skipped;
        project.recompute_progress();
        assert_eq!(project.progress, 100);
        assert!(project.all_stages_done());
    }

    #[test]
    fn test_stage_log_bounded() {
        let mut stage = StageSnapshot::new("orchestrator", 1, "Orchestrator");
        for i in 0..(MAX_STAGE_LOG_LINES + 20) {
            stage.push_log(format!("line {i}"));
        }
        assert_eq!(stage.logs.len(), MAX_STAGE_LOG_LINES);
        assert_eq!(stage.logs[0], "line 20");
    }

    #[test]
    fn test_stage_reset_clears_outputs() {
        let mut stage = StageSnapshot::new("agent_designer", 4, "Agent Designer");
        stage.status = StageStatus::Completed;
        stage.output_data.insert(
            "artifacts".into(),
            serde_json::json!(["projects/x/agents/x/agent_designer.json"]),
        );
        stage.push_log("done");
        stage.reset();
        assert_eq!(stage.status, StageStatus::Pending);
        assert!(stage.output_data.is_empty());
        assert!(stage.logs.is_empty());
        assert!(stage.artifacts().is_empty());
    }

    #[test]
    fn test_artifacts_accessor() {
        let mut stage = StageSnapshot::new("tool_developer", 5, "Tool Developer");
        stage.output_data.insert(
            "artifacts".into(),
            serde_json::json!(["tools/generated_tools/x/api/fetch.py"]),
        );
        assert_eq!(stage.artifacts(), vec!["tools/generated_tools/x/api/fetch.py"]);
    }

    #[test]
    fn test_aggregate_metrics_sums_stages() {
        let mut project = ProjectRecord::new(&request(), "weather_agent", stages());
        project.stages[0].input_tokens = Some(100);
        project.stages[0].output_tokens = Some(50);
        project.stages[0].tool_calls = Some(2);
        project.stages[0].duration_seconds = Some(1.5);
        project.stages[1].input_tokens = Some(200);
        project.stages[1].duration_seconds = Some(2.5);

        let agg = project.aggregate_metrics();
        assert_eq!(agg.input_tokens, 300);
        assert_eq!(agg.output_tokens, 50);
        assert_eq!(agg.tool_calls, 2);
        assert!((agg.duration_seconds - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_status_serialization_is_snake_case() {
        let json = serde_json::to_string(&ProjectStatus::Building).unwrap();
        assert_eq!(json, "\"building\"");
        let parsed: StageStatus = serde_json::from_str("\"skipped\"").unwrap();
        assert_eq!(parsed, StageStatus::Skipped);
    }
}
