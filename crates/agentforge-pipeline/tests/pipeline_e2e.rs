//! End-to-end pipeline tests.
//!
//! Drive full builds through the workflow driver with mock sub-agent
//! factories layered over the built-in templates: happy path and artifact
//! layout, duplicate submission, pause/resume at a stage boundary, validator
//! failure inside the developer fan-out, restart from a failed sub-stage,
//! stop-discard semantics, and the stage retry/timeout policy.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use agentforge_artifacts::{ArtifactLayout, ArtifactWriter};
use agentforge_core::{
    BuildRequest, ControlAction, ControlFlag, ControlRequest, ForgeError, ForgeResult,
    ProjectStatus, StageStatus,
};
use agentforge_dashboard::BuildDashboard;
use agentforge_pipeline::{
    template_factory, BuildService, DriveOutcome, GeneratedFile, PipelinePolicy, StageContext,
    StageExecutor, StageRegistry, SubAgent, SubAgentFactory, SubAgentOutput, ToolRegistry,
    WorkflowDriver,
};
use agentforge_queue::{BuildQueue, QueuePolicy};
use agentforge_store::{
    update_project_with, AgentStore, MemoryStateStore, ProjectStore, StateStore,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    _tmp: tempfile::TempDir,
    store: Arc<dyn StateStore>,
    layout: ArtifactLayout,
    queue: Arc<BuildQueue>,
    service: BuildService,
    driver: Arc<WorkflowDriver>,
    dashboard: BuildDashboard,
}

fn harness(factory: SubAgentFactory) -> Harness {
    harness_with_policy(factory, PipelinePolicy::fast())
}

fn harness_with_policy(factory: SubAgentFactory, policy: PipelinePolicy) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let memory = Arc::new(MemoryStateStore::new());
    let store: Arc<dyn StateStore> = memory.clone();
    let layout = ArtifactLayout::new(tmp.path());
    let writer = Arc::new(ArtifactWriter::new(layout.clone()));
    let registry = Arc::new(StageRegistry::standard(false));
    let tools = Arc::new(ToolRegistry::new());
    let queue = Arc::new(BuildQueue::with_policy(
        memory,
        QueuePolicy {
            visibility_timeout: Duration::from_secs(5),
            ..QueuePolicy::default()
        },
    ));
    let executor = Arc::new(StageExecutor::new(
        store.clone(),
        writer.clone(),
        tools,
        factory,
        policy,
    ));
    let driver = Arc::new(WorkflowDriver::new(
        store.clone(),
        writer,
        registry.clone(),
        executor,
    ));
    let service = BuildService::new(store.clone(), queue.clone(), registry, layout.clone());
    let dashboard = BuildDashboard::new(store.clone(), layout.clone());
    Harness {
        _tmp: tmp,
        store,
        layout,
        queue,
        service,
        driver,
        dashboard,
    }
}

fn overriding_factory(
    overrides: Vec<(&'static str, Arc<dyn SubAgent>)>,
) -> SubAgentFactory {
    let overrides: HashMap<&'static str, Arc<dyn SubAgent>> = overrides.into_iter().collect();
    let base = template_factory();
    Arc::new(move |stage| overrides.get(stage).cloned().or_else(|| base(stage)))
}

/// Rebuild the harness's driver around a different sub-agent factory. Used
/// by mocks that need the store handle, which only exists post-harness.
fn replace_driver(harness: &mut Harness, factory: SubAgentFactory, policy: PipelinePolicy) {
    let writer = Arc::new(ArtifactWriter::new(harness.layout.clone()));
    let registry = Arc::new(StageRegistry::standard(false));
    let executor = Arc::new(StageExecutor::new(
        harness.store.clone(),
        writer.clone(),
        Arc::new(ToolRegistry::new()),
        factory,
        policy,
    ));
    harness.driver = Arc::new(WorkflowDriver::new(
        harness.store.clone(),
        writer,
        registry,
        executor,
    ));
}

async fn submit_and_claim(harness: &Harness, name: &str) -> (String, String) {
    let receipt = harness
        .service
        .submit(
            BuildRequest::new("Weather assistant that fetches forecast by city")
                .with_project_name(name),
        )
        .await
        .unwrap();
    let lease = harness.queue.claim("w1").await.unwrap().unwrap();
    assert_eq!(lease.task_id, receipt.task_id);
    (receipt.project_id, receipt.task_id)
}

/// Invariant: every committed stage's recorded artifacts exist on disk.
async fn assert_artifacts_on_disk(harness: &Harness, project_id: &str) {
    let project = harness.store.get_project(project_id).await.unwrap();
    for stage in &project.stages {
        if stage.status != StageStatus::Completed {
            continue;
        }
        for rel in stage.artifacts() {
            assert!(
                harness.layout.absolute(&rel).exists(),
                "stage {} lists missing artifact {rel}",
                stage.stage_name
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Mock sub-agents
// ---------------------------------------------------------------------------

/// Delegates to the template body but first sets a control flag on the
/// project, simulating an operator action arriving while the stage runs.
struct FlagSetter {
    stage: &'static str,
    store: Arc<dyn StateStore>,
    flag: ControlFlag,
    fired: AtomicU32,
}

#[async_trait]
impl SubAgent for FlagSetter {
    fn stage_name(&self) -> &str {
        self.stage
    }

    async fn run(&self, ctx: &StageContext) -> ForgeResult<SubAgentOutput> {
        if self.fired.fetch_add(1, Ordering::SeqCst) == 0 {
            let flag = self.flag.clone();
            update_project_with(self.store.as_ref(), &ctx.project_id, move |draft| {
                draft.control_flag = flag.clone();
                Ok(())
            })
            .await?;
        }
        template_factory()(self.stage)
            .expect("template stage")
            .run(ctx)
            .await
    }
}

/// Emits a malformed prompt YAML for the first `failures` runs, then
/// delegates to the template body. Before failing it waits for both sibling
/// sub-stages to commit, so the scenario is deterministic: the siblings'
/// artifacts exist when the fan-in observes the failure.
struct FlakyPromptEngineer {
    failures: u32,
    runs: AtomicU32,
    store: Arc<dyn StateStore>,
}

#[async_trait]
impl SubAgent for FlakyPromptEngineer {
    fn stage_name(&self) -> &str {
        "prompt_engineer"
    }

    async fn run(&self, ctx: &StageContext) -> ForgeResult<SubAgentOutput> {
        if self.runs.fetch_add(1, Ordering::SeqCst) < self.failures {
            for _ in 0..200 {
                let project = self.store.get_project(&ctx.project_id).await?;
                let done = ["tool_developer", "agent_code_developer"]
                    .iter()
                    .all(|s| project.stage(s).is_some_and(|e| e.status.is_done()));
                if done {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            let mut output = SubAgentOutput::default();
            output.files.push(GeneratedFile::text(
                ctx.layout.agent_prompt(&ctx.project_name, &ctx.agent_name),
                "agent: [unclosed sequence",
            ));
            return Ok(output);
        }
        template_factory()("prompt_engineer")
            .expect("template stage")
            .run(ctx)
            .await
    }
}

/// Fails with a transient error the first `failures` runs.
struct TransientArchitect {
    failures: u32,
    runs: AtomicU32,
}

#[async_trait]
impl SubAgent for TransientArchitect {
    fn stage_name(&self) -> &str {
        "system_architect"
    }

    async fn run(&self, ctx: &StageContext) -> ForgeResult<SubAgentOutput> {
        if self.runs.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(ForgeError::Transient("simulated 503 from runtime".into()));
        }
        template_factory()("system_architect")
            .expect("template stage")
            .run(ctx)
            .await
    }
}

/// Never returns within any reasonable stage budget.
struct StuckDesigner;

#[async_trait]
impl SubAgent for StuckDesigner {
    fn stage_name(&self) -> &str {
        "agent_designer"
    }

    async fn run(&self, _ctx: &StageContext) -> ForgeResult<SubAgentOutput> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(SubAgentOutput::default())
    }
}

/// Waits until all three developer sub-stages have entered `run`, proving
/// the fan-out actually executes them concurrently.
struct BarrierSubstage {
    stage: &'static str,
    barrier: Arc<tokio::sync::Barrier>,
}

#[async_trait]
impl SubAgent for BarrierSubstage {
    fn stage_name(&self) -> &str {
        self.stage
    }

    async fn run(&self, ctx: &StageContext) -> ForgeResult<SubAgentOutput> {
        self.barrier.wait().await;
        template_factory()(self.stage)
            .expect("template stage")
            .run(ctx)
            .await
    }
}

// ---------------------------------------------------------------------------
// S1: happy path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_happy_path_builds_weather_agent() {
    let harness = harness(template_factory());
    let (project_id, task_id) = submit_and_claim(&harness, "weather_agent").await;

    let outcome = harness.driver.drive(&project_id).await.unwrap();
    assert_eq!(outcome, DriveOutcome::Completed);

    let project = harness.store.get_project(&project_id).await.unwrap();
    assert_eq!(project.status, ProjectStatus::Completed);
    assert_eq!(project.progress, 100);
    assert!(project.all_stages_done());
    assert!(project.completed_at.is_some());

    // Stage order: everything before the fan-out completed strictly in
    // sequence; the deployer was skipped (deployment disabled).
    for name in [
        "orchestrator",
        "requirements_analyzer",
        "system_architect",
        "agent_designer",
        "tool_developer",
        "prompt_engineer",
        "agent_code_developer",
        "agent_developer_manager",
    ] {
        assert_eq!(
            project.stage(name).unwrap().status,
            StageStatus::Completed,
            "stage {name}"
        );
    }
    assert_eq!(
        project.stage("agent_deployer").unwrap().status,
        StageStatus::Skipped
    );

    // The documented on-disk layout.
    let root = harness.layout.root();
    assert!(root.join("projects/weather_agent/config.yaml").exists());
    assert!(root.join("projects/weather_agent/README.md").exists());
    assert!(root.join("projects/weather_agent/requirements.txt").exists());
    assert!(root
        .join("projects/weather_agent/agents/weather_agent/requirements_analyzer.json")
        .exists());
    assert!(root
        .join("projects/weather_agent/agents/weather_agent/tools_developer.json")
        .exists());
    assert!(root
        .join("agents/generated_agents/weather_agent/weather_agent.py")
        .exists());
    assert!(root
        .join("prompts/generated_agents_prompts/weather_agent/weather_agent.yaml")
        .exists());
    assert!(root
        .join("tools/generated_tools/weather_agent/core/process_request.py")
        .exists());
    assert!(root.join("projects/weather_agent/workflow_report.md").exists());
    assert!(root.join("projects/weather_agent/status.yaml").exists());
    assert_artifacts_on_disk(&harness, &project_id).await;

    // The agent record was created by the synchronization step.
    let agents = harness.store.list_agents_for_project(&project_id).await.unwrap();
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0].agent_name, "weather_agent");
    assert!(agents[0].code_path.ends_with("weather_agent.py"));
    assert_eq!(agents[0].tools, vec!["process_request"]);

    // Task bookkeeping: the lease holder finishes the task.
    harness
        .queue
        .complete(&task_id, "w1", serde_json::json!({"status": "completed"}))
        .await
        .unwrap();

    // Dashboard merges it all.
    let snapshot = harness.dashboard.snapshot(&project_id).await.unwrap();
    assert_eq!(snapshot.progress, 100);
    assert!(snapshot.has_workflow_report);
    assert!(snapshot.aggregated.duration_seconds > 0.0);
    assert!(snapshot.eta_seconds.is_none());
}

// ---------------------------------------------------------------------------
// S2: duplicate project name
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_duplicate_project_name_rejected() {
    let harness = harness(template_factory());
    let request = BuildRequest::new("Weather assistant").with_project_name("weather_agent");
    harness.service.submit(request.clone()).await.unwrap();

    let err = harness.service.submit(request).await;
    assert!(matches!(err, Err(ForgeError::Validation(_))));

    // Only the first project exists.
    let found = harness
        .store
        .find_project_by_name("weather_agent")
        .await
        .unwrap();
    assert!(found.is_some());
}

// ---------------------------------------------------------------------------
// S3: pause at a stage boundary, then resume
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_pause_commits_running_stage_then_resume() {
    let mut harness = harness(template_factory());
    let flagger: Arc<dyn SubAgent> = Arc::new(FlagSetter {
        stage: "system_architect",
        store: harness.store.clone(),
        flag: ControlFlag::Pause,
        fired: AtomicU32::new(0),
    });
    replace_driver(
        &mut harness,
        overriding_factory(vec![("system_architect", flagger)]),
        PipelinePolicy::fast(),
    );

    let (project_id, task_id) = submit_and_claim(&harness, "weather_agent").await;
    let outcome = harness.driver.drive(&project_id).await.unwrap();
    assert_eq!(outcome, DriveOutcome::Paused);

    let project = harness.store.get_project(&project_id).await.unwrap();
    assert_eq!(project.status, ProjectStatus::Paused);
    // The pause arrived mid-architect: the stage ran to completion and
    // committed before the transition took effect.
    assert_eq!(
        project.stage("system_architect").unwrap().status,
        StageStatus::Completed
    );
    assert_eq!(
        project.stage("agent_designer").unwrap().status,
        StageStatus::Pending
    );
    assert_eq!(project.current_stage.as_deref(), Some("agent_designer"));
    assert_eq!(project.control_flag, ControlFlag::None);

    // Park the task the way the worker pool does.
    harness.queue.release(&task_id, "w1").await.unwrap();

    // Resume: validation requires paused, flag set, task re-enqueued.
    harness
        .service
        .control(
            &project_id,
            ControlRequest {
                action: ControlAction::Resume,
                from_stage: None,
                clear_subsequent: None,
                reason: None,
            },
        )
        .await
        .unwrap();

    let lease = harness.queue.claim("w2").await.unwrap().unwrap();
    assert_eq!(lease.project_id.as_deref(), Some(project_id.as_str()));
    let outcome = harness.driver.drive(&project_id).await.unwrap();
    assert_eq!(outcome, DriveOutcome::Completed);
    assert_artifacts_on_disk(&harness, &project_id).await;
}

// ---------------------------------------------------------------------------
// S4 + S5: validator failure in the fan-out, then restart
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_prompt_validator_failure_then_restart() {
    let mut harness = harness_with_policy(
        template_factory(),
        PipelinePolicy {
            stage_timeout: Duration::from_secs(5),
            ..PipelinePolicy::fast()
        },
    );
    let flaky: Arc<dyn SubAgent> = Arc::new(FlakyPromptEngineer {
        failures: 1,
        runs: AtomicU32::new(0),
        store: harness.store.clone(),
    });
    replace_driver(
        &mut harness,
        overriding_factory(vec![("prompt_engineer", flaky)]),
        PipelinePolicy {
            stage_timeout: Duration::from_secs(5),
            ..PipelinePolicy::fast()
        },
    );
    let (project_id, task_id) = submit_and_claim(&harness, "weather_agent").await;

    let outcome = harness.driver.drive(&project_id).await.unwrap();
    assert_eq!(outcome, DriveOutcome::Failed);

    let project = harness.store.get_project(&project_id).await.unwrap();
    assert_eq!(project.status, ProjectStatus::Failed);
    let error = project.error_info.clone().unwrap();
    assert_eq!(error.stage_name, "prompt_engineer");
    assert_eq!(error.classification, "validator");
    assert_eq!(project.current_stage.as_deref(), Some("prompt_engineer"));

    // The failing sub-stage rolled back: no prompt file on disk.
    assert!(!harness
        .layout
        .absolute("prompts/generated_agents_prompts/weather_agent/weather_agent.yaml")
        .exists());
    // Sibling sub-stages' artifacts are preserved for inspection.
    assert_eq!(
        project.stage("tool_developer").unwrap().status,
        StageStatus::Completed
    );
    assert_eq!(
        project.stage("agent_code_developer").unwrap().status,
        StageStatus::Completed
    );
    assert!(harness
        .layout
        .absolute("tools/generated_tools/weather_agent/core/process_request.py")
        .exists());

    // Pause and resume are rejected on a failed project; stop and restart
    // are accepted.
    let pause = harness
        .service
        .control(
            &project_id,
            ControlRequest {
                action: ControlAction::Pause,
                from_stage: None,
                clear_subsequent: None,
                reason: None,
            },
        )
        .await;
    assert!(matches!(pause, Err(ForgeError::Validation(_))));

    harness.queue.release(&task_id, "w1").await.unwrap();

    // S5: restart from the failed sub-stage.
    harness
        .service
        .control(
            &project_id,
            ControlRequest {
                action: ControlAction::Restart,
                from_stage: Some("prompt_engineer".into()),
                clear_subsequent: Some(true),
                reason: Some("fix prompt".into()),
            },
        )
        .await
        .unwrap();

    let lease = harness.queue.claim("w2").await.unwrap().unwrap();
    let outcome = harness.driver.drive(&project_id).await.unwrap();
    assert_eq!(outcome, DriveOutcome::Completed);
    let _ = lease;

    let project = harness.store.get_project(&project_id).await.unwrap();
    assert_eq!(project.status, ProjectStatus::Completed);
    assert_eq!(project.progress, 100);
    assert!(harness
        .layout
        .absolute("prompts/generated_agents_prompts/weather_agent/weather_agent.yaml")
        .exists());
    assert_artifacts_on_disk(&harness, &project_id).await;
}

#[tokio::test]
async fn test_restart_resets_progress_and_clears_artifacts() {
    let harness = harness(template_factory());
    let (project_id, task_id) = submit_and_claim(&harness, "weather_agent").await;
    harness.driver.drive(&project_id).await.unwrap();
    harness
        .queue
        .complete(&task_id, "w1", serde_json::json!({"status": "completed"}))
        .await
        .unwrap();

    let before = harness.store.get_project(&project_id).await.unwrap();
    assert_eq!(before.progress, 100);
    let report = harness
        .layout
        .absolute("projects/weather_agent/workflow_report.md");
    assert!(report.exists());

    harness
        .service
        .control(
            &project_id,
            ControlRequest {
                action: ControlAction::Restart,
                from_stage: Some("agent_developer_manager".into()),
                clear_subsequent: Some(true),
                reason: None,
            },
        )
        .await
        .unwrap();

    let lease = harness.queue.claim("w1").await.unwrap().unwrap();
    let _ = lease;
    // Drive applies the restart flag, then re-runs the synchronization step.
    let outcome = harness.driver.drive(&project_id).await.unwrap();
    assert_eq!(outcome, DriveOutcome::Completed);

    let after = harness.store.get_project(&project_id).await.unwrap();
    assert_eq!(after.progress, 100);
    // Sub-stage outputs survived the manager-only restart.
    assert_eq!(
        after.stage("tool_developer").unwrap().status,
        StageStatus::Completed
    );
    assert!(report.exists());
}

// ---------------------------------------------------------------------------
// Stop: discard-on-completion and idempotence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_stop_discards_uncommitted_stage_result() {
    let mut harness = harness(template_factory());
    let flagger: Arc<dyn SubAgent> = Arc::new(FlagSetter {
        stage: "agent_designer",
        store: harness.store.clone(),
        flag: ControlFlag::Stop,
        fired: AtomicU32::new(0),
    });
    replace_driver(
        &mut harness,
        overriding_factory(vec![("agent_designer", flagger)]),
        PipelinePolicy::fast(),
    );

    let (project_id, _task) = submit_and_claim(&harness, "weather_agent").await;
    let outcome = harness.driver.drive(&project_id).await.unwrap();
    assert_eq!(outcome, DriveOutcome::Cancelled);

    let project = harness.store.get_project(&project_id).await.unwrap();
    assert_eq!(project.status, ProjectStatus::Cancelled);
    // The designer finished its run but the result was discarded before
    // commit: snapshot back to pending, no document on disk.
    assert_eq!(
        project.stage("agent_designer").unwrap().status,
        StageStatus::Pending
    );
    assert!(!harness
        .layout
        .absolute("projects/weather_agent/agents/weather_agent/agent_designer.json")
        .exists());
    // Earlier commits are retained for audit.
    assert_eq!(
        project.stage("system_architect").unwrap().status,
        StageStatus::Completed
    );

    // Stop is idempotent: a second stop leaves the record unchanged.
    harness
        .service
        .control(
            &project_id,
            ControlRequest {
                action: ControlAction::Stop,
                from_stage: None,
                clear_subsequent: None,
                reason: None,
            },
        )
        .await
        .unwrap();
    let again = harness.store.get_project(&project_id).await.unwrap();
    assert_eq!(again.status, ProjectStatus::Cancelled);
}

// ---------------------------------------------------------------------------
// Retry policy: transient errors and timeouts
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_transient_stage_errors_are_retried() {
    let flaky: Arc<dyn SubAgent> = Arc::new(TransientArchitect {
        failures: 2,
        runs: AtomicU32::new(0),
    });
    let harness = harness(overriding_factory(vec![("system_architect", flaky)]));
    let (project_id, _task) = submit_and_claim(&harness, "weather_agent").await;

    // Two transient failures fit inside the default budget of two retries.
    let outcome = harness.driver.drive(&project_id).await.unwrap();
    assert_eq!(outcome, DriveOutcome::Completed);
}

#[tokio::test]
async fn test_transient_exhaustion_fails_project() {
    let flaky: Arc<dyn SubAgent> = Arc::new(TransientArchitect {
        failures: 10,
        runs: AtomicU32::new(0),
    });
    let harness = harness(overriding_factory(vec![("system_architect", flaky)]));
    let (project_id, _task) = submit_and_claim(&harness, "weather_agent").await;

    let outcome = harness.driver.drive(&project_id).await.unwrap();
    assert_eq!(outcome, DriveOutcome::Failed);
    let project = harness.store.get_project(&project_id).await.unwrap();
    let error = project.error_info.unwrap();
    assert_eq!(error.stage_name, "system_architect");
    assert_eq!(error.classification, "transient");
}

#[tokio::test]
async fn test_stage_timeout_fails_with_timeout_classification() {
    let stuck: Arc<dyn SubAgent> = Arc::new(StuckDesigner);
    let harness = harness(overriding_factory(vec![("agent_designer", stuck)]));
    let (project_id, _task) = submit_and_claim(&harness, "weather_agent").await;

    let outcome = harness.driver.drive(&project_id).await.unwrap();
    assert_eq!(outcome, DriveOutcome::Failed);
    let project = harness.store.get_project(&project_id).await.unwrap();
    let error = project.error_info.unwrap();
    assert_eq!(error.stage_name, "agent_designer");
    assert_eq!(error.classification, "timeout");
}

// ---------------------------------------------------------------------------
// Fan-out runs the three sub-stages concurrently
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_developer_substages_run_in_parallel() {
    let barrier = Arc::new(tokio::sync::Barrier::new(3));
    let overrides: Vec<(&'static str, Arc<dyn SubAgent>)> =
        ["tool_developer", "prompt_engineer", "agent_code_developer"]
            .into_iter()
            .map(|stage| {
                let agent: Arc<dyn SubAgent> = Arc::new(BarrierSubstage {
                    stage,
                    barrier: barrier.clone(),
                });
                (stage, agent)
            })
            .collect();
    // If the sub-stages ran sequentially the barrier would deadlock and the
    // stage budget would fail the build; completion proves concurrency.
    let harness = harness_with_policy(
        overriding_factory(overrides),
        PipelinePolicy {
            stage_timeout: Duration::from_secs(5),
            ..PipelinePolicy::fast()
        },
    );
    let (project_id, _task) = submit_and_claim(&harness, "weather_agent").await;

    let outcome = harness.driver.drive(&project_id).await.unwrap();
    assert_eq!(outcome, DriveOutcome::Completed);
}
