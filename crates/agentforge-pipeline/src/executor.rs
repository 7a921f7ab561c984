use crate::events::{EventSink, StageEvent};
use crate::policy::PipelinePolicy;
use crate::registry::StageSpec;
use crate::subagent::{CancelHandle, StageContext, SubAgentFactory, SubAgentOutput};
use crate::toolreg::{ToolDeclaration, ToolRegistry};
use crate::validator::validate_stage;
use agentforge_artifacts::{ArtifactWriter, StageTxn};
use agentforge_core::{ControlFlag, ForgeError, ForgeResult, StageStatus};
use agentforge_store::{update_project_with, ProjectStore, StateStore};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::timeout;
use tracing::{error, info, warn};

/// How one stage invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// Stage committed: artifacts on disk, snapshot updated.
    Completed,
    /// Stage failed after exhausting its retry budget; the snapshot carries
    /// the diagnostic and any partial telemetry.
    Failed {
        message: String,
        classification: String,
    },
    /// A stop flag or cooperative cancellation was observed; nothing was
    /// committed and the snapshot entry is back to pending.
    Aborted,
}

/// Runs one stage: invokes the sub-agent body, captures telemetry, writes
/// artifacts transactionally, applies the stage validator, and transitions
/// the snapshot entry. Artifact recording and the status transition land in
/// a single conditional update, so readers never see a split.
pub struct StageExecutor {
    store: Arc<dyn StateStore>,
    writer: Arc<ArtifactWriter>,
    tools: Arc<ToolRegistry>,
    factory: SubAgentFactory,
    policy: PipelinePolicy,
}

impl StageExecutor {
    /// Build an executor.
    pub fn new(
        store: Arc<dyn StateStore>,
        writer: Arc<ArtifactWriter>,
        tools: Arc<ToolRegistry>,
        factory: SubAgentFactory,
        policy: PipelinePolicy,
    ) -> Self {
        Self {
            store,
            writer,
            tools,
            factory,
            policy,
        }
    }

    /// The typed tool registry (shared with validators).
    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    /// Execute one stage for a project.
    pub async fn execute(
        &self,
        project_id: &str,
        spec: &StageSpec,
        cancel: CancelHandle,
        events: EventSink,
    ) -> ForgeResult<StageOutcome> {
        let agent = self.factory.as_ref()(spec.name).ok_or_else(|| {
            ForgeError::Validation(format!("no sub-agent registered for stage {}", spec.name))
        })?;

        let ctx = self.stage_context(project_id, spec, cancel.clone(), events.clone()).await?;
        self.mark_running(project_id, spec).await?;
        info!(project_id, stage = spec.name, "Stage started");

        let started = Instant::now();
        let mut transient_left = self.policy.transient_retries;
        let mut timeout_left = self.policy.timeout_retries;

        loop {
            if cancel.is_cancelled() {
                return self.abandon(project_id, spec, "cancelled before attempt").await;
            }

            let mut txn = self.writer.begin(spec.name).await?;
            let run = timeout(self.policy.stage_timeout, agent.run(&ctx)).await;

            let output = match run {
                Err(_) => {
                    self.writer.abort(&mut txn).await?;
                    if timeout_left > 0 {
                        timeout_left -= 1;
                        warn!(project_id, stage = spec.name, "Stage timed out, retrying");
                        tokio::time::sleep(self.policy.retry_backoff).await;
                        continue;
                    }
                    let message = format!(
                        "stage exceeded its {}s budget",
                        self.policy.stage_timeout.as_secs()
                    );
                    return self
                        .fail_stage(project_id, spec, started, &message, "timeout")
                        .await;
                }
                Ok(Err(e)) => {
                    self.writer.abort(&mut txn).await?;
                    if cancel.is_cancelled() {
                        return self.abandon(project_id, spec, "cancelled mid-run").await;
                    }
                    if e.is_transient() && transient_left > 0 {
                        transient_left -= 1;
                        warn!(project_id, stage = spec.name, error = %e, "Transient stage error, retrying");
                        tokio::time::sleep(self.policy.retry_backoff).await;
                        continue;
                    }
                    let classification = e.classification().to_string();
                    return self
                        .fail_stage(project_id, spec, started, &e.to_string(), &classification)
                        .await;
                }
                Ok(Ok(output)) => output,
            };

            for file in &output.files {
                self.writer.put(&mut txn, &file.path, &file.contents).await?;
            }

            if let Err(e) = validate_stage(
                spec,
                &ctx.project_name,
                txn.staged(),
                &output.output_data,
                &self.tools,
                self.writer.layout(),
            )
            .await
            {
                self.writer.abort(&mut txn).await?;
                error!(project_id, stage = spec.name, error = %e, "Validator rejected stage artifacts");
                let classification = e.classification().to_string();
                return self
                    .fail_stage(project_id, spec, started, &e.to_string(), &classification)
                    .await;
            }

            // A stop flag observed now discards the finished result: the
            // work ran to completion but is never committed.
            let fresh = self.store.get_project(project_id).await?;
            if fresh.control_flag == ControlFlag::Stop || cancel.is_cancelled() {
                self.writer.abort(&mut txn).await?;
                return self.abandon(project_id, spec, "result discarded by stop").await;
            }

            self.declare_generated_tools(&output).await;
            return self
                .commit_stage(project_id, spec, started, output, &mut txn, &events)
                .await;
        }
    }

    async fn stage_context(
        &self,
        project_id: &str,
        spec: &StageSpec,
        cancel: CancelHandle,
        events: EventSink,
    ) -> ForgeResult<StageContext> {
        let project = self.store.get_project(project_id).await?;
        let agent_name = project
            .stage("orchestrator")
            .and_then(|s| s.output_data.get("agent_name"))
            .and_then(|v| v.as_str())
            .unwrap_or(&project.project_name)
            .to_string();

        let mut prior_outputs = HashMap::new();
        for input in spec.required_inputs {
            if let Some(stage) = project.stage(input) {
                prior_outputs.insert((*input).to_string(), stage.output_data.clone());
            }
        }

        Ok(StageContext {
            project_id: project.project_id.clone(),
            project_name: project.project_name.clone(),
            agent_name,
            requirement: project.requirement.clone(),
            prior_outputs,
            layout: self.writer.layout().clone(),
            cancel,
            events,
        })
    }

    async fn mark_running(&self, project_id: &str, spec: &StageSpec) -> ForgeResult<()> {
        let name = spec.name.to_string();
        update_project_with(self.store.as_ref(), project_id, move |draft| {
            draft.current_stage = Some(name.clone());
            let entry = draft
                .stage_mut(&name)
                .ok_or_else(|| ForgeError::NotFound(format!("stage {name}")))?;
            entry.status = StageStatus::Running;
            entry.started_at = Some(Utc::now());
            entry.push_log("stage started");
            Ok(())
        })
        .await?;
        Ok(())
    }

    async fn commit_stage(
        &self,
        project_id: &str,
        spec: &StageSpec,
        started: Instant,
        output: SubAgentOutput,
        txn: &mut StageTxn,
        events: &EventSink,
    ) -> ForgeResult<StageOutcome> {
        let paths = self.writer.commit(txn).await?;
        let mut metrics = output.metrics;
        metrics.duration_seconds = started.elapsed().as_secs_f64();

        let name = spec.name.to_string();
        let output_data = output.output_data.clone();
        let logs = output.logs.clone();
        let artifact_paths = paths.clone();
        update_project_with(self.store.as_ref(), project_id, move |draft| {
            let entry = draft
                .stage_mut(&name)
                .ok_or_else(|| ForgeError::NotFound(format!("stage {name}")))?;
            entry.status = StageStatus::Completed;
            entry.completed_at = Some(Utc::now());
            entry.record_metrics(&metrics);
            entry.output_data = output_data.clone();
            entry
                .output_data
                .insert("artifacts".into(), serde_json::json!(artifact_paths));
            for line in &logs {
                entry.push_log(line.clone());
            }
            entry.push_log("stage completed");
            draft.recompute_progress();
            Ok(())
        })
        .await?;

        events.emit(StageEvent::Metrics {
            input_tokens: metrics.input_tokens,
            output_tokens: metrics.output_tokens,
            tool_calls: metrics.tool_calls,
        });
        info!(
            project_id,
            stage = spec.name,
            artifacts = paths.len(),
            duration_s = format!("{:.2}", metrics.duration_seconds),
            "Stage completed"
        );
        Ok(StageOutcome::Completed)
    }

    async fn fail_stage(
        &self,
        project_id: &str,
        spec: &StageSpec,
        started: Instant,
        message: &str,
        classification: &str,
    ) -> ForgeResult<StageOutcome> {
        let name = spec.name.to_string();
        let message_owned = message.to_string();
        let duration = started.elapsed().as_secs_f64();
        update_project_with(self.store.as_ref(), project_id, move |draft| {
            let entry = draft
                .stage_mut(&name)
                .ok_or_else(|| ForgeError::NotFound(format!("stage {name}")))?;
            entry.status = StageStatus::Failed;
            entry.completed_at = Some(Utc::now());
            entry.duration_seconds = Some(duration);
            entry.error_message = Some(message_owned.clone());
            entry.push_log(format!("stage failed: {message_owned}"));
            Ok(())
        })
        .await?;
        error!(project_id, stage = spec.name, message, "Stage failed");
        Ok(StageOutcome::Failed {
            message: message.to_string(),
            classification: classification.to_string(),
        })
    }

    async fn abandon(
        &self,
        project_id: &str,
        spec: &StageSpec,
        reason: &str,
    ) -> ForgeResult<StageOutcome> {
        let name = spec.name.to_string();
        let reason_owned = reason.to_string();
        update_project_with(self.store.as_ref(), project_id, move |draft| {
            if let Some(entry) = draft.stage_mut(&name) {
                if entry.status == StageStatus::Running {
                    entry.status = StageStatus::Pending;
                    entry.started_at = None;
                    entry.push_log(format!("stage abandoned: {reason_owned}"));
                }
            }
            Ok(())
        })
        .await?;
        info!(project_id, stage = spec.name, reason, "Stage abandoned without commit");
        Ok(StageOutcome::Aborted)
    }

    async fn declare_generated_tools(&self, output: &SubAgentOutput) {
        let Some(declared) = output.output_data.get("declared_tools") else {
            return;
        };
        let Ok(declarations) =
            serde_json::from_value::<Vec<ToolDeclaration>>(declared.clone())
        else {
            warn!("declared_tools payload did not parse; skipping registration");
            return;
        };
        self.tools.declare_all(declarations).await;
    }
}
