use crate::events::EventSink;
use crate::executor::{StageExecutor, StageOutcome};
use crate::gate::{ControlGate, GateDecision};
use crate::registry::{NextWork, StageRegistry};
use crate::subagent::CancelHandle;
use agentforge_artifacts::{write_status_mirror, ArtifactWriter};
use agentforge_core::{
    AgentRecord, ControlFlag, ErrorInfo, ForgeError, ForgeResult, ProjectStatus, StageStatus,
};
use agentforge_store::{update_project_with, AgentStore, ProjectStore, StateStore};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

/// Terminal (or suspended) result of one drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveOutcome {
    Completed,
    Failed,
    Paused,
    Cancelled,
}

/// Per-project state machine: picks the next stage, fans out the three
/// developer sub-stages, aggregates fan-in results, and applies the
/// failure/retry policy. One driver owns a project from claim until it
/// reaches a terminal state or suspends.
pub struct WorkflowDriver {
    store: Arc<dyn StateStore>,
    writer: Arc<ArtifactWriter>,
    registry: Arc<StageRegistry>,
    executor: Arc<StageExecutor>,
    gate: ControlGate,
}

impl WorkflowDriver {
    /// Build a driver.
    pub fn new(
        store: Arc<dyn StateStore>,
        writer: Arc<ArtifactWriter>,
        registry: Arc<StageRegistry>,
        executor: Arc<StageExecutor>,
    ) -> Self {
        let gate = ControlGate::new(store.clone());
        Self {
            store,
            writer,
            registry,
            executor,
            gate,
        }
    }

    /// Drive the project until it completes, fails, pauses, or is cancelled.
    pub async fn drive(&self, project_id: &str) -> ForgeResult<DriveOutcome> {
        self.recover(project_id).await?;

        loop {
            let project = self.store.get_project(project_id).await?;

            // A redelivered task for an already-terminal project is a no-op
            // unless a restart flag is waiting.
            if project.status.is_terminal()
                && !matches!(project.control_flag, ControlFlag::Restart { .. })
            {
                return Ok(match project.status {
                    ProjectStatus::Completed => DriveOutcome::Completed,
                    ProjectStatus::Cancelled => DriveOutcome::Cancelled,
                    _ => DriveOutcome::Failed,
                });
            }

            match GateDecision::from_flag(&project.control_flag) {
                GateDecision::Stop => return self.finish_cancelled(project_id).await,
                GateDecision::Pause => return self.finish_paused(project_id).await,
                GateDecision::Restart {
                    from_stage,
                    clear_subsequent,
                } => {
                    self.apply_restart(project_id, &from_stage, clear_subsequent)
                        .await?;
                    continue;
                }
                GateDecision::Proceed => {}
            }

            if project.status != ProjectStatus::Building {
                self.mark_building(project_id).await?;
            }

            let project = self.store.get_project(project_id).await?;
            match self.registry.next_work(&project.stages) {
                None => return self.finish_completed(project_id).await,
                Some(NextWork::Single(spec)) => {
                    let outcome = self
                        .executor
                        .execute(project_id, &spec, CancelHandle::new(), EventSink::disabled())
                        .await?;
                    match outcome {
                        StageOutcome::Completed => {
                            if spec.name == "agent_developer_manager" {
                                self.record_agent(project_id).await?;
                            }
                        }
                        StageOutcome::Failed {
                            message,
                            classification,
                        } => {
                            return self
                                .finish_failed(project_id, spec.name, &message, &classification)
                                .await;
                        }
                        StageOutcome::Aborted => {
                            // Stop or restart raced in; the gate at the top
                            // of the loop settles it.
                        }
                    }
                }
                Some(NextWork::FanOut(specs)) => {
                    let outcome = self.run_fanout(project_id, specs).await?;
                    if let Some(done) = outcome {
                        return Ok(done);
                    }
                }
            }
        }
    }

    /// Run the developer fan-out and the fan-in barrier. Returns a terminal
    /// outcome, or `None` to continue with the synchronization step.
    async fn run_fanout(
        &self,
        project_id: &str,
        specs: Vec<crate::registry::StageSpec>,
    ) -> ForgeResult<Option<DriveOutcome>> {
        info!(
            project_id,
            substages = specs.len(),
            "Developer fan-out started"
        );
        let cancel = CancelHandle::new();
        let mut handles = Vec::with_capacity(specs.len());
        for spec in specs {
            let executor = self.executor.clone();
            let pid = project_id.to_string();
            let handle_cancel = cancel.clone();
            let name = spec.name;
            let handle = tokio::spawn(async move {
                let result = executor
                    .execute(&pid, &spec, handle_cancel.clone(), EventSink::disabled())
                    .await;
                // A failed sub-stage cancels its siblings cooperatively; they
                // observe the flag at their next boundary.
                if matches!(result, Ok(StageOutcome::Failed { .. })) {
                    handle_cancel.cancel();
                }
                result
            });
            handles.push((name, handle));
        }

        let mut first_failure: Option<(&'static str, String, String)> = None;
        for (name, handle) in handles {
            match handle.await {
                Ok(Ok(StageOutcome::Completed)) => {}
                Ok(Ok(StageOutcome::Failed {
                    message,
                    classification,
                })) => {
                    if first_failure.is_none() {
                        first_failure = Some((name, message, classification));
                    }
                }
                Ok(Ok(StageOutcome::Aborted)) => {}
                Ok(Err(e)) => return Err(e),
                Err(join) => {
                    return Err(ForgeError::Fatal(format!(
                        "sub-stage {name} panicked: {join}"
                    )));
                }
            }
        }

        if let Some((stage, message, classification)) = first_failure {
            let outcome = self
                .finish_failed(project_id, stage, &message, &classification)
                .await?;
            return Ok(Some(outcome));
        }

        // Fan-in barrier: the three results are committed; consult the gate
        // before the synchronization step.
        match self.gate.check(project_id).await? {
            GateDecision::Pause => Ok(Some(self.finish_paused(project_id).await?)),
            GateDecision::Stop => Ok(Some(self.finish_cancelled(project_id).await?)),
            GateDecision::Restart { .. } | GateDecision::Proceed => Ok(None),
        }
    }

    /// Reset stages a crashed worker left in `running`. Their artifacts were
    /// never committed, so the snapshot entry goes back to pending and the
    /// stage re-runs from scratch on this delivery.
    async fn recover(&self, project_id: &str) -> ForgeResult<()> {
        let project = self.store.get_project(project_id).await?;
        if project.running_stages().is_empty() {
            return Ok(());
        }
        warn!(project_id, "Recovering stages left running by a prior delivery");
        update_project_with(self.store.as_ref(), project_id, |draft| {
            for entry in &mut draft.stages {
                if entry.status == StageStatus::Running {
                    entry.status = StageStatus::Pending;
                    entry.started_at = None;
                    entry.push_log("recovered after redelivery");
                }
            }
            Ok(())
        })
        .await?;
        Ok(())
    }

    async fn mark_building(&self, project_id: &str) -> ForgeResult<()> {
        let updated = update_project_with(self.store.as_ref(), project_id, |draft| {
            draft.status = ProjectStatus::Building;
            draft.started_at.get_or_insert_with(Utc::now);
            if draft.control_flag == ControlFlag::Resume {
                draft.control_flag = ControlFlag::None;
            }
            Ok(())
        })
        .await?;
        write_status_mirror(self.writer.layout(), &updated).await;
        Ok(())
    }

    async fn finish_completed(&self, project_id: &str) -> ForgeResult<DriveOutcome> {
        let updated = update_project_with(self.store.as_ref(), project_id, |draft| {
            draft.status = ProjectStatus::Completed;
            draft.current_stage = None;
            draft.completed_at = Some(Utc::now());
            draft.recompute_progress();
            Ok(())
        })
        .await?;
        write_status_mirror(self.writer.layout(), &updated).await;
        info!(project_id, progress = updated.progress, "Build completed");
        Ok(DriveOutcome::Completed)
    }

    async fn finish_failed(
        &self,
        project_id: &str,
        stage: &str,
        message: &str,
        classification: &str,
    ) -> ForgeResult<DriveOutcome> {
        let stage_owned = stage.to_string();
        let message_owned = message.to_string();
        let classification_owned = classification.to_string();
        let updated = update_project_with(self.store.as_ref(), project_id, move |draft| {
            draft.status = ProjectStatus::Failed;
            draft.current_stage = Some(stage_owned.clone());
            draft.completed_at = Some(Utc::now());
            draft.error_info = Some(ErrorInfo {
                stage_name: stage_owned.clone(),
                message: message_owned.clone(),
                classification: classification_owned.clone(),
            });
            Ok(())
        })
        .await?;
        write_status_mirror(self.writer.layout(), &updated).await;
        warn!(project_id, stage, message, "Build failed; partial outputs retained");
        Ok(DriveOutcome::Failed)
    }

    async fn finish_paused(&self, project_id: &str) -> ForgeResult<DriveOutcome> {
        let registry = self.registry.clone();
        let updated = update_project_with(self.store.as_ref(), project_id, move |draft| {
            draft.status = ProjectStatus::Paused;
            draft.control_flag = ControlFlag::None;
            // Record which stage resumes the build.
            draft.current_stage = match registry.next_work(&draft.stages) {
                Some(NextWork::Single(spec)) => Some(spec.name.to_string()),
                Some(NextWork::FanOut(specs)) => {
                    specs.first().map(|s| s.name.to_string())
                }
                None => None,
            };
            Ok(())
        })
        .await?;
        write_status_mirror(self.writer.layout(), &updated).await;
        info!(project_id, next_stage = ?updated.current_stage, "Build paused");
        Ok(DriveOutcome::Paused)
    }

    async fn finish_cancelled(&self, project_id: &str) -> ForgeResult<DriveOutcome> {
        let updated = update_project_with(self.store.as_ref(), project_id, |draft| {
            draft.status = ProjectStatus::Cancelled;
            draft.control_flag = ControlFlag::None;
            draft.completed_at = Some(Utc::now());
            Ok(())
        })
        .await?;
        write_status_mirror(self.writer.layout(), &updated).await;
        info!(project_id, "Build cancelled; state retained for audit");
        Ok(DriveOutcome::Cancelled)
    }

    /// Create the agent record from the developer-manager's output. Runs
    /// once per successful synchronization; a redelivered duplicate is
    /// tolerated.
    async fn record_agent(&self, project_id: &str) -> ForgeResult<()> {
        let project = self.store.get_project(project_id).await?;
        let Some(manager) = project.stage("agent_developer_manager") else {
            return Ok(());
        };
        let get = |key: &str| {
            manager
                .output_data
                .get(key)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };
        let agent_name = {
            let name = get("agent_name");
            if name.is_empty() {
                project.project_name.clone()
            } else {
                name
            }
        };
        let list = |key: &str| {
            manager
                .output_data
                .get(key)
                .and_then(|v| v.as_array())
                .map(|a| {
                    a.iter()
                        .filter_map(|t| t.as_str().map(str::to_string))
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default()
        };

        let agent = AgentRecord::new(
            &project.project_id,
            &agent_name,
            get("prompt_path"),
            get("code_path"),
        )
        .with_tools(list("tools"))
        .with_capabilities(list("capabilities"));

        match self.store.create_agent(&agent).await {
            Ok(()) => {
                info!(project_id, agent_id = %agent.agent_id, "Agent recorded");
                Ok(())
            }
            Err(ForgeError::Conflict(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Apply a restart flag: unlink the affected stages' artifacts, reset
    /// their snapshot entries, and clear the flag. Pre-condition: none of
    /// the affected stages is currently running.
    async fn apply_restart(
        &self,
        project_id: &str,
        from_stage: &str,
        clear_subsequent: bool,
    ) -> ForgeResult<()> {
        let project = self.store.get_project(project_id).await?;
        let affected = self.registry.restart_set(from_stage, clear_subsequent);
        if affected.is_empty() {
            return Err(ForgeError::Validation(format!(
                "unknown restart stage: {from_stage}"
            )));
        }
        for name in &affected {
            if project
                .stage(name)
                .is_some_and(|s| s.status == StageStatus::Running)
            {
                return Err(ForgeError::Conflict(format!(
                    "cannot restart while stage {name} is running"
                )));
            }
        }

        // Unlink prior files first, then the re-run writes new ones.
        let mut prior_paths = Vec::new();
        for name in &affected {
            if let Some(stage) = project.stage(name) {
                prior_paths.extend(stage.artifacts());
            }
        }
        self.writer.remove_committed(&prior_paths).await?;
        if affected.contains(&"tool_developer") {
            let prefix = self
                .writer
                .layout()
                .stage_prefix(&project.project_name, "tool_developer");
            self.executor.tools().retract_under(&prefix).await;
        }

        let affected_owned: Vec<String> = affected.iter().map(|s| s.to_string()).collect();
        let deploy_enabled = self.registry.deploy_enabled();
        let updated = update_project_with(self.store.as_ref(), project_id, move |draft| {
            for name in &affected_owned {
                if let Some(entry) = draft.stage_mut(name) {
                    entry.reset();
                    if name == "agent_deployer" && !deploy_enabled {
                        entry.status = StageStatus::Skipped;
                    }
                }
            }
            draft.control_flag = ControlFlag::None;
            draft.status = ProjectStatus::Building;
            draft.error_info = None;
            draft.completed_at = None;
            draft.recompute_progress();
            Ok(())
        })
        .await?;
        write_status_mirror(self.writer.layout(), &updated).await;
        info!(
            project_id,
            from_stage,
            clear_subsequent,
            progress = updated.progress,
            "Restart applied"
        );
        Ok(())
    }
}
