use crate::registry::StageRegistry;
use agentforge_artifacts::ArtifactLayout;
use agentforge_core::{
    request::derive_project_name, BuildRequest, ControlAction, ControlFlag, ControlRequest,
    ForgeError, ForgeResult, ProjectStatus, TaskRecord, TaskType,
};
use agentforge_queue::BuildQueue;
use agentforge_store::{update_project_with, ProjectStore, StateStore, TaskStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Response to a build submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub project_id: String,
    pub task_id: String,
    pub project_name: String,
    pub status: String,
}

/// Submission, control, and delete operations over the pipeline. The REST
/// transport maps onto these; the core only produces typed errors.
pub struct BuildService {
    store: Arc<dyn StateStore>,
    queue: Arc<BuildQueue>,
    registry: Arc<StageRegistry>,
    layout: ArtifactLayout,
}

impl BuildService {
    /// Build a service.
    pub fn new(
        store: Arc<dyn StateStore>,
        queue: Arc<BuildQueue>,
        registry: Arc<StageRegistry>,
        layout: ArtifactLayout,
    ) -> Self {
        Self {
            store,
            queue,
            registry,
            layout,
        }
    }

    /// Accept a build request: create the project in `pending`, enqueue one
    /// `build_agent` task, and transition the project to `queued`.
    pub async fn submit(&self, request: BuildRequest) -> ForgeResult<SubmitReceipt> {
        request.validate()?;
        let project_name = match &request.project_name {
            Some(name) => name.clone(),
            None => derive_project_name(&request.requirement),
        };
        if self
            .store
            .find_project_by_name(&project_name)
            .await?
            .is_some()
        {
            return Err(ForgeError::Validation(format!(
                "project name '{project_name}' is already taken"
            )));
        }

        let project = agentforge_core::ProjectRecord::new(
            &request,
            &project_name,
            self.registry.snapshot_entries(),
        );
        self.store.create_project(&project).await?;

        let task = TaskRecord::build_for(&project.project_id, request.priority);
        self.store.create_task(&task).await?;
        self.queue.enqueue(&task).await?;

        let updated = update_project_with(self.store.as_ref(), &project.project_id, |draft| {
            draft.status = ProjectStatus::Queued;
            Ok(())
        })
        .await?;

        info!(
            project_id = %updated.project_id,
            project_name = %project_name,
            task_id = %task.task_id,
            "Build submitted"
        );
        Ok(SubmitReceipt {
            project_id: updated.project_id,
            task_id: task.task_id,
            project_name,
            status: "queued".to_string(),
        })
    }

    /// Set a control flag on a project. Transitions happen asynchronously
    /// at the next stage boundary, except where no driver is active (a
    /// stopped paused project cancels immediately; resume and restart
    /// re-enqueue the build task so a worker picks the project back up).
    pub async fn control(&self, project_id: &str, request: ControlRequest) -> ForgeResult<()> {
        let project = self.store.get_project(project_id).await?;
        let action = request.action;
        let flag = request.into_flag(&project)?;

        // Stop on a paused or queued-but-terminal-less project with no
        // active driver: nothing will observe the flag, settle it here.
        if flag == ControlFlag::Stop && project.status == ProjectStatus::Paused {
            let updated = update_project_with(self.store.as_ref(), project_id, |draft| {
                draft.status = ProjectStatus::Cancelled;
                draft.control_flag = ControlFlag::None;
                draft.completed_at = Some(chrono::Utc::now());
                Ok(())
            })
            .await?;
            agentforge_artifacts::write_status_mirror(&self.layout, &updated).await;
            return Ok(());
        }

        let flag_for_update = flag.clone();
        update_project_with(self.store.as_ref(), project_id, move |draft| {
            draft.control_flag = flag_for_update.clone();
            Ok(())
        })
        .await?;
        info!(project_id, ?action, "Control flag set");

        // Resume and restart need a worker: make sure a build task is
        // claimable again.
        if matches!(
            action,
            ControlAction::Resume | ControlAction::Restart
        ) {
            self.reenqueue_build_task(project_id, project.priority).await?;
        }
        Ok(())
    }

    /// Remove a project and everything it owns: records (tasks, agents) and
    /// the generated files under its four layout prefixes. Idempotent.
    pub async fn delete(&self, project_id: &str) -> ForgeResult<()> {
        let project = match self.store.get_project(project_id).await {
            Ok(project) => project,
            Err(ForgeError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        for task in self.store.list_tasks_for_project(project_id).await? {
            // Waiting tasks leave the queue; running ones expire with their
            // lease after the cascade removes the record.
            let _ = self.queue.cancel(&task.task_id).await;
        }
        self.store.delete_project_cascade(project_id).await?;

        let name = &project.project_name;
        for prefix in [
            format!("projects/{name}"),
            format!("agents/generated_agents/{name}"),
            format!("prompts/generated_agents_prompts/{name}"),
            format!("tools/generated_tools/{name}"),
        ] {
            let path = self.layout.absolute(&prefix);
            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(ForgeError::Io(e)),
            }
        }
        info!(project_id, project_name = %name, "Project deleted");
        Ok(())
    }

    async fn reenqueue_build_task(&self, project_id: &str, priority: u8) -> ForgeResult<()> {
        let tasks = self.store.list_tasks_for_project(project_id).await?;
        let latest_build = tasks
            .into_iter()
            .find(|t| t.task_type == TaskType::BuildAgent);
        match latest_build {
            Some(task) if !task.status.is_terminal() => self.queue.requeue(&task.task_id).await,
            _ => {
                let task = TaskRecord::build_for(project_id, priority);
                self.store.create_task(&task).await?;
                self.queue.enqueue(&task).await
            }
        }
    }
}
