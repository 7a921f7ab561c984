use agentforge_core::{
    AgentRecord, ForgeError, ForgeResult, ProjectRecord, ProjectStatus, TaskRecord, TaskStatus,
};
use async_trait::async_trait;

/// Bounded attempts for the optimistic-concurrency retry helpers.
pub const CAS_MAX_ATTEMPTS: u32 = 8;

/// Filter for project listings.
#[derive(Debug, Clone, Default)]
pub struct ProjectFilter {
    pub status: Option<ProjectStatus>,
    pub user_id: Option<String>,
}

/// Cursor-based pagination request. `last_key` is the id of the last item
/// of the previous page.
#[derive(Debug, Clone)]
pub struct Page {
    pub last_key: Option<String>,
    pub limit: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            last_key: None,
            limit: 50,
        }
    }
}

/// One page of results plus the cursor for the next page (absent on the
/// final page).
#[derive(Debug, Clone)]
pub struct PageResult<T> {
    pub items: Vec<T>,
    pub last_key: Option<String>,
}

/// Store operations for [`ProjectRecord`]s.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Insert a new project. Fails with [`ForgeError::Conflict`] when the id
    /// or the project name already exists.
    async fn create_project(&self, project: &ProjectRecord) -> ForgeResult<()>;

    /// Fetch a project by id.
    async fn get_project(&self, project_id: &str) -> ForgeResult<ProjectRecord>;

    /// Look up a project by its unique name.
    async fn find_project_by_name(&self, name: &str) -> ForgeResult<Option<ProjectRecord>>;

    /// Compare-and-swap replace. Succeeds only when the stored version equals
    /// `expected_version`; on success the stored record gets
    /// `expected_version + 1` and a fresh `updated_at`.
    async fn update_project(
        &self,
        project_id: &str,
        expected_version: u64,
        updated: ProjectRecord,
    ) -> ForgeResult<ProjectRecord>;

    /// List projects ordered by creation time, filtered and paginated.
    async fn list_projects(
        &self,
        filter: &ProjectFilter,
        page: &Page,
    ) -> ForgeResult<PageResult<ProjectRecord>>;

    /// Remove a project together with its tasks and agents. Idempotent.
    async fn delete_project_cascade(&self, project_id: &str) -> ForgeResult<()>;
}

/// Store operations for [`TaskRecord`]s.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new task. Fails with [`ForgeError::Conflict`] on a duplicate id.
    async fn create_task(&self, task: &TaskRecord) -> ForgeResult<()>;

    /// Fetch a task by id.
    async fn get_task(&self, task_id: &str) -> ForgeResult<TaskRecord>;

    /// Compare-and-swap replace, same contract as `update_project`.
    async fn update_task(
        &self,
        task_id: &str,
        expected_version: u64,
        updated: TaskRecord,
    ) -> ForgeResult<TaskRecord>;

    /// Tasks belonging to a project, newest first.
    async fn list_tasks_for_project(&self, project_id: &str) -> ForgeResult<Vec<TaskRecord>>;

    /// Tasks in a given status across all projects.
    async fn list_tasks_by_status(&self, status: TaskStatus) -> ForgeResult<Vec<TaskRecord>>;

    /// Transition a task to `running` under `worker_id`. Fails with
    /// [`ForgeError::Conflict`] when the task is terminal or already held by
    /// another worker.
    async fn claim_task(&self, task_id: &str, worker_id: &str) -> ForgeResult<TaskRecord>;

    /// Record liveness for a claimed task. Fails with
    /// [`ForgeError::Conflict`] unless `worker_id` is the current holder.
    async fn heartbeat_task(&self, task_id: &str, worker_id: &str) -> ForgeResult<()>;
}

/// Store operations for [`AgentRecord`]s.
#[async_trait]
pub trait AgentStore: Send + Sync {
    /// Insert a built agent. Fails with [`ForgeError::Conflict`] on a
    /// duplicate agent id.
    async fn create_agent(&self, agent: &AgentRecord) -> ForgeResult<()>;

    /// Fetch an agent by id.
    async fn get_agent(&self, agent_id: &str) -> ForgeResult<AgentRecord>;

    /// Agents produced by a project.
    async fn list_agents_for_project(&self, project_id: &str) -> ForgeResult<Vec<AgentRecord>>;
}

/// Convenience supertrait for components that need all three entity stores
/// behind one shared handle.
pub trait StateStore: ProjectStore + TaskStore + AgentStore {}

impl<T: ProjectStore + TaskStore + AgentStore> StateStore for T {}

/// Apply `mutate` to the current project record and CAS it back, retrying on
/// conflict up to [`CAS_MAX_ATTEMPTS`] times.
pub async fn update_project_with<S, F>(
    store: &S,
    project_id: &str,
    mutate: F,
) -> ForgeResult<ProjectRecord>
where
    S: ProjectStore + ?Sized,
    F: Fn(&mut ProjectRecord) -> ForgeResult<()> + Send + Sync,
{
    for _ in 0..CAS_MAX_ATTEMPTS {
        let current = store.get_project(project_id).await?;
        let expected = current.version;
        let mut draft = current;
        mutate(&mut draft)?;
        match store.update_project(project_id, expected, draft).await {
            Ok(stored) => return Ok(stored),
            Err(ForgeError::Conflict(_)) => continue,
            Err(e) => return Err(e),
        }
    }
    Err(ForgeError::Conflict(format!(
        "project {project_id}: CAS retries exhausted after {CAS_MAX_ATTEMPTS} attempts"
    )))
}

/// Apply `mutate` to the current task record and CAS it back, retrying on
/// conflict up to [`CAS_MAX_ATTEMPTS`] times.
pub async fn update_task_with<S, F>(store: &S, task_id: &str, mutate: F) -> ForgeResult<TaskRecord>
where
    S: TaskStore + ?Sized,
    F: Fn(&mut TaskRecord) -> ForgeResult<()> + Send + Sync,
{
    for _ in 0..CAS_MAX_ATTEMPTS {
        let current = store.get_task(task_id).await?;
        let expected = current.version;
        let mut draft = current;
        mutate(&mut draft)?;
        match store.update_task(task_id, expected, draft).await {
            Ok(stored) => return Ok(stored),
            Err(ForgeError::Conflict(_)) => continue,
            Err(e) => return Err(e),
        }
    }
    Err(ForgeError::Conflict(format!(
        "task {task_id}: CAS retries exhausted after {CAS_MAX_ATTEMPTS} attempts"
    )))
}
