use crate::store::{
    AgentStore, Page, PageResult, ProjectFilter, ProjectStore, TaskStore,
};
use agentforge_core::{
    AgentRecord, ForgeError, ForgeResult, ProjectRecord, TaskRecord, TaskStatus,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::warn;

#[derive(Default)]
struct Inner {
    projects: HashMap<String, ProjectRecord>,
    /// Unique project name → project id.
    name_index: HashMap<String, String>,
    tasks: HashMap<String, TaskRecord>,
    tasks_by_project: HashMap<String, Vec<String>>,
    agents: HashMap<String, AgentRecord>,
    agents_by_project: HashMap<String, Vec<String>>,
}

/// In-memory state store with optional best-effort JSON persistence.
///
/// All mutators are compare-and-swap on the record's `version` counter;
/// secondary indexes (by name, by project) are maintained inline. Persistence
/// mirrors records to `<dir>/{projects,tasks,agents}/<id>.json` after each
/// commit and never fails the operation.
pub struct MemoryStateStore {
    inner: RwLock<Inner>,
    persist_dir: Option<PathBuf>,
}

impl MemoryStateStore {
    /// Create an empty, non-persistent store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            persist_dir: None,
        }
    }

    /// Mirror committed records to JSON files under `dir`.
    pub fn with_persist_dir(mut self, dir: PathBuf) -> Self {
        self.persist_dir = Some(dir);
        self
    }

    /// Load previously mirrored records back from disk. Unparseable files
    /// are skipped with a warning.
    pub async fn load_persisted(&self) -> ForgeResult<usize> {
        let Some(dir) = self.persist_dir.clone() else {
            return Ok(0);
        };
        let mut loaded = 0;
        let mut inner = self.inner.write().await;
        for entry in read_json_dir::<ProjectRecord>(&dir.join("projects")).await? {
            inner
                .name_index
                .insert(entry.project_name.clone(), entry.project_id.clone());
            inner.projects.insert(entry.project_id.clone(), entry);
            loaded += 1;
        }
        for entry in read_json_dir::<TaskRecord>(&dir.join("tasks")).await? {
            if let Some(project_id) = &entry.project_id {
                inner
                    .tasks_by_project
                    .entry(project_id.clone())
                    .or_default()
                    .push(entry.task_id.clone());
            }
            inner.tasks.insert(entry.task_id.clone(), entry);
            loaded += 1;
        }
        for entry in read_json_dir::<AgentRecord>(&dir.join("agents")).await? {
            inner
                .agents_by_project
                .entry(entry.project_id.clone())
                .or_default()
                .push(entry.agent_id.clone());
            inner.agents.insert(entry.agent_id.clone(), entry);
            loaded += 1;
        }
        Ok(loaded)
    }

    async fn persist<T: serde::Serialize>(&self, kind: &str, id: &str, record: &T) {
        let Some(dir) = &self.persist_dir else {
            return;
        };
        let dir = dir.join(kind);
        let path = dir.join(format!("{id}.json"));
        let json = match serde_json::to_string_pretty(record) {
            Ok(json) => json,
            Err(e) => {
                warn!(kind, id, error = %e, "State mirror serialization failed");
                return;
            }
        };
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            warn!(kind, id, error = %e, "State mirror directory creation failed");
            return;
        }
        if let Err(e) = tokio::fs::write(&path, json).await {
            warn!(kind, id, error = %e, "State mirror write failed");
        }
    }

    async fn unpersist(&self, kind: &str, id: &str) {
        let Some(dir) = &self.persist_dir else {
            return;
        };
        let path = dir.join(kind).join(format!("{id}.json"));
        if let Err(e) = tokio::fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(kind, id, error = %e, "State mirror removal failed");
            }
        }
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

async fn read_json_dir<T: serde::de::DeserializeOwned>(
    dir: &std::path::Path,
) -> ForgeResult<Vec<T>> {
    let mut records = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
        Err(e) => return Err(ForgeError::Io(e)),
    };
    while let Some(entry) = entries.next_entry().await? {
        if entry.path().extension().map_or(true, |ext| ext != "json") {
            continue;
        }
        let data = tokio::fs::read_to_string(entry.path()).await?;
        match serde_json::from_str(&data) {
            Ok(record) => records.push(record),
            Err(e) => warn!(path = %entry.path().display(), error = %e, "Skipping unparseable record"),
        }
    }
    Ok(records)
}

#[async_trait]
impl ProjectStore for MemoryStateStore {
    async fn create_project(&self, project: &ProjectRecord) -> ForgeResult<()> {
        {
            let mut inner = self.inner.write().await;
            if inner.projects.contains_key(&project.project_id) {
                return Err(ForgeError::Conflict(format!(
                    "project {} already exists",
                    project.project_id
                )));
            }
            if inner.name_index.contains_key(&project.project_name) {
                return Err(ForgeError::Validation(format!(
                    "project name '{}' is already taken",
                    project.project_name
                )));
            }
            inner
                .name_index
                .insert(project.project_name.clone(), project.project_id.clone());
            inner
                .projects
                .insert(project.project_id.clone(), project.clone());
        }
        self.persist("projects", &project.project_id, project).await;
        Ok(())
    }

    async fn get_project(&self, project_id: &str) -> ForgeResult<ProjectRecord> {
        let inner = self.inner.read().await;
        inner
            .projects
            .get(project_id)
            .cloned()
            .ok_or_else(|| ForgeError::NotFound(format!("project {project_id}")))
    }

    async fn find_project_by_name(&self, name: &str) -> ForgeResult<Option<ProjectRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .name_index
            .get(name)
            .and_then(|id| inner.projects.get(id))
            .cloned())
    }

    async fn update_project(
        &self,
        project_id: &str,
        expected_version: u64,
        mut updated: ProjectRecord,
    ) -> ForgeResult<ProjectRecord> {
        let stored = {
            let mut inner = self.inner.write().await;
            let current = inner
                .projects
                .get(project_id)
                .ok_or_else(|| ForgeError::NotFound(format!("project {project_id}")))?;
            if current.version != expected_version {
                return Err(ForgeError::Conflict(format!(
                    "project {project_id}: version {} != expected {expected_version}",
                    current.version
                )));
            }
            updated.version = expected_version + 1;
            updated.updated_at = Utc::now();
            inner.projects.insert(project_id.to_string(), updated.clone());
            updated
        };
        self.persist("projects", project_id, &stored).await;
        Ok(stored)
    }

    async fn list_projects(
        &self,
        filter: &ProjectFilter,
        page: &Page,
    ) -> ForgeResult<PageResult<ProjectRecord>> {
        let inner = self.inner.read().await;
        let mut matching: Vec<&ProjectRecord> = inner
            .projects
            .values()
            .filter(|p| filter.status.map_or(true, |s| p.status == s))
            .filter(|p| {
                filter
                    .user_id
                    .as_ref()
                    .map_or(true, |u| p.user_id.as_ref() == Some(u))
            })
            .collect();
        matching.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.project_id.cmp(&b.project_id))
        });

        let start = match &page.last_key {
            Some(key) => matching
                .iter()
                .position(|p| &p.project_id == key)
                .map_or(0, |i| i + 1),
            None => 0,
        };
        let items: Vec<ProjectRecord> = matching
            .iter()
            .skip(start)
            .take(page.limit)
            .map(|p| (*p).clone())
            .collect();
        let last_key = if start + items.len() < matching.len() {
            items.last().map(|p| p.project_id.clone())
        } else {
            None
        };
        Ok(PageResult { items, last_key })
    }

    async fn delete_project_cascade(&self, project_id: &str) -> ForgeResult<()> {
        let (task_ids, agent_ids) = {
            let mut inner = self.inner.write().await;
            let Some(project) = inner.projects.remove(project_id) else {
                return Ok(());
            };
            inner.name_index.remove(&project.project_name);
            let task_ids = inner.tasks_by_project.remove(project_id).unwrap_or_default();
            for id in &task_ids {
                inner.tasks.remove(id);
            }
            let agent_ids = inner.agents_by_project.remove(project_id).unwrap_or_default();
            for id in &agent_ids {
                inner.agents.remove(id);
            }
            (task_ids, agent_ids)
        };
        self.unpersist("projects", project_id).await;
        for id in &task_ids {
            self.unpersist("tasks", id).await;
        }
        for id in &agent_ids {
            self.unpersist("agents", id).await;
        }
        Ok(())
    }
}

#[async_trait]
impl TaskStore for MemoryStateStore {
    async fn create_task(&self, task: &TaskRecord) -> ForgeResult<()> {
        {
            let mut inner = self.inner.write().await;
            if inner.tasks.contains_key(&task.task_id) {
                return Err(ForgeError::Conflict(format!(
                    "task {} already exists",
                    task.task_id
                )));
            }
            if let Some(project_id) = &task.project_id {
                inner
                    .tasks_by_project
                    .entry(project_id.clone())
                    .or_default()
                    .push(task.task_id.clone());
            }
            inner.tasks.insert(task.task_id.clone(), task.clone());
        }
        self.persist("tasks", &task.task_id, task).await;
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> ForgeResult<TaskRecord> {
        let inner = self.inner.read().await;
        inner
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| ForgeError::NotFound(format!("task {task_id}")))
    }

    async fn update_task(
        &self,
        task_id: &str,
        expected_version: u64,
        mut updated: TaskRecord,
    ) -> ForgeResult<TaskRecord> {
        let stored = {
            let mut inner = self.inner.write().await;
            let current = inner
                .tasks
                .get(task_id)
                .ok_or_else(|| ForgeError::NotFound(format!("task {task_id}")))?;
            if current.version != expected_version {
                return Err(ForgeError::Conflict(format!(
                    "task {task_id}: version {} != expected {expected_version}",
                    current.version
                )));
            }
            updated.version = expected_version + 1;
            inner.tasks.insert(task_id.to_string(), updated.clone());
            updated
        };
        self.persist("tasks", task_id, &stored).await;
        Ok(stored)
    }

    async fn list_tasks_for_project(&self, project_id: &str) -> ForgeResult<Vec<TaskRecord>> {
        let inner = self.inner.read().await;
        let mut tasks: Vec<TaskRecord> = inner
            .tasks_by_project
            .get(project_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.tasks.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tasks)
    }

    async fn list_tasks_by_status(&self, status: TaskStatus) -> ForgeResult<Vec<TaskRecord>> {
        let inner = self.inner.read().await;
        let mut tasks: Vec<TaskRecord> = inner
            .tasks
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }

    async fn claim_task(&self, task_id: &str, worker_id: &str) -> ForgeResult<TaskRecord> {
        let stored = {
            let mut inner = self.inner.write().await;
            let task = inner
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| ForgeError::NotFound(format!("task {task_id}")))?;
            match task.status {
                TaskStatus::Pending | TaskStatus::Queued => {}
                TaskStatus::Running => {
                    if task.worker_id.as_deref() == Some(worker_id) {
                        return Ok(task.clone());
                    }
                    return Err(ForgeError::Conflict(format!(
                        "task {task_id} already claimed by {}",
                        task.worker_id.as_deref().unwrap_or("unknown")
                    )));
                }
                _ => {
                    return Err(ForgeError::Conflict(format!(
                        "task {task_id} is terminal and cannot be claimed"
                    )));
                }
            }
            task.status = TaskStatus::Running;
            task.worker_id = Some(worker_id.to_string());
            task.started_at.get_or_insert_with(Utc::now);
            task.version += 1;
            task.clone()
        };
        self.persist("tasks", task_id, &stored).await;
        Ok(stored)
    }

    async fn heartbeat_task(&self, task_id: &str, worker_id: &str) -> ForgeResult<()> {
        let inner = self.inner.read().await;
        let task = inner
            .tasks
            .get(task_id)
            .ok_or_else(|| ForgeError::NotFound(format!("task {task_id}")))?;
        if task.status != TaskStatus::Running || task.worker_id.as_deref() != Some(worker_id) {
            return Err(ForgeError::Conflict(format!(
                "task {task_id} is not held by worker {worker_id}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl AgentStore for MemoryStateStore {
    async fn create_agent(&self, agent: &AgentRecord) -> ForgeResult<()> {
        {
            let mut inner = self.inner.write().await;
            if inner.agents.contains_key(&agent.agent_id) {
                return Err(ForgeError::Conflict(format!(
                    "agent {} already exists",
                    agent.agent_id
                )));
            }
            inner
                .agents_by_project
                .entry(agent.project_id.clone())
                .or_default()
                .push(agent.agent_id.clone());
            inner.agents.insert(agent.agent_id.clone(), agent.clone());
        }
        self.persist("agents", &agent.agent_id, agent).await;
        Ok(())
    }

    async fn get_agent(&self, agent_id: &str) -> ForgeResult<AgentRecord> {
        let inner = self.inner.read().await;
        inner
            .agents
            .get(agent_id)
            .cloned()
            .ok_or_else(|| ForgeError::NotFound(format!("agent {agent_id}")))
    }

    async fn list_agents_for_project(&self, project_id: &str) -> ForgeResult<Vec<AgentRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .agents_by_project
            .get(project_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.agents.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
