//! AgentForge command line: submit a requirement, drive the build pipeline
//! with an embedded worker pool, and inspect or control builds.

use agentforge_artifacts::{ArtifactLayout, ArtifactWriter};
use agentforge_core::{BuildRequest, ControlAction, ControlRequest, ProjectStatus};
use agentforge_dashboard::BuildDashboard;
use agentforge_pipeline::{
    template_factory, BuildService, PipelinePolicy, StageExecutor, StageRegistry, ToolRegistry,
    WorkflowDriver,
};
use agentforge_queue::{BuildQueue, QueuePolicy};
use agentforge_store::{MemoryStateStore, Page, ProjectFilter, ProjectStore, StateStore};
use agentforge_workers::{WorkerConfig, WorkerPool};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "agentforge", about = "AgentForge — agent build pipeline")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "forge.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a build request without running workers
    Submit {
        /// The natural-language requirement
        requirement: String,
        /// Explicit project name ([a-z][a-z0-9_]*)
        #[arg(long)]
        name: Option<String>,
        /// Build priority 1-5
        #[arg(long, default_value_t = 3)]
        priority: u8,
    },
    /// Submit a build and drive it to a terminal state
    Run {
        /// The natural-language requirement
        requirement: String,
        /// Explicit project name ([a-z][a-z0-9_]*)
        #[arg(long)]
        name: Option<String>,
        /// Build priority 1-5
        #[arg(long, default_value_t = 3)]
        priority: u8,
    },
    /// Print the build dashboard for a project
    Status {
        project_id: String,
    },
    /// List projects
    List {
        /// Filter by status
        #[arg(long)]
        status: Option<StatusArg>,
        /// Page size
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Send a control action to a project
    Control {
        project_id: String,
        #[arg(long)]
        action: ActionArg,
        /// Stage name for restart
        #[arg(long)]
        from_stage: Option<String>,
        /// Re-run only the named stage, keeping later stage outputs
        #[arg(long)]
        keep_subsequent: bool,
    },
    /// Delete a project and everything it owns
    Delete {
        project_id: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum StatusArg {
    Pending,
    Queued,
    Building,
    Completed,
    Failed,
    Paused,
    Cancelled,
}

impl From<StatusArg> for ProjectStatus {
    fn from(value: StatusArg) -> Self {
        match value {
            StatusArg::Pending => ProjectStatus::Pending,
            StatusArg::Queued => ProjectStatus::Queued,
            StatusArg::Building => ProjectStatus::Building,
            StatusArg::Completed => ProjectStatus::Completed,
            StatusArg::Failed => ProjectStatus::Failed,
            StatusArg::Paused => ProjectStatus::Paused,
            StatusArg::Cancelled => ProjectStatus::Cancelled,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ActionArg {
    Pause,
    Resume,
    Stop,
    Restart,
}

impl From<ActionArg> for ControlAction {
    fn from(value: ActionArg) -> Self {
        match value {
            ActionArg::Pause => ControlAction::Pause,
            ActionArg::Resume => ControlAction::Resume,
            ActionArg::Stop => ControlAction::Stop,
            ActionArg::Restart => ControlAction::Restart,
        }
    }
}

#[derive(Deserialize, Default)]
struct ForgeConfig {
    #[serde(default = "default_workspace_dir")]
    workspace_dir: PathBuf,
    #[serde(default = "default_data_dir")]
    data_dir: PathBuf,
    #[serde(default)]
    deploy_enabled: bool,
    #[serde(default)]
    workers: WorkersConfig,
    #[serde(default)]
    queue: QueueConfig,
}

#[derive(Deserialize)]
struct WorkersConfig {
    #[serde(default = "default_worker_count")]
    max_workflow_workers: usize,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            max_workflow_workers: default_worker_count(),
        }
    }
}

#[derive(Deserialize)]
struct QueueConfig {
    #[serde(default = "default_queue_depth")]
    max_queue_depth: usize,
    #[serde(default = "default_visibility_secs")]
    visibility_timeout_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_depth: default_queue_depth(),
            visibility_timeout_secs: default_visibility_secs(),
        }
    }
}

fn default_workspace_dir() -> PathBuf {
    PathBuf::from("./workspace")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_worker_count() -> usize {
    4
}

fn default_queue_depth() -> usize {
    1_000
}

fn default_visibility_secs() -> u64 {
    60
}

/// Everything the commands operate on.
struct Forge {
    store: Arc<MemoryStateStore>,
    queue: Arc<BuildQueue>,
    service: BuildService,
    dashboard: BuildDashboard,
    pool: Arc<WorkerPool>,
}

async fn build_forge(config: &ForgeConfig) -> Result<Forge, Box<dyn std::error::Error>> {
    let store = Arc::new(
        MemoryStateStore::new().with_persist_dir(config.data_dir.clone()),
    );
    let loaded = store.load_persisted().await?;
    if loaded > 0 {
        info!(records = loaded, "Loaded persisted state");
    }
    let state: Arc<dyn StateStore> = store.clone();

    let layout = ArtifactLayout::new(config.workspace_dir.clone());
    let writer = Arc::new(ArtifactWriter::new(layout.clone()));
    let registry = Arc::new(StageRegistry::standard(config.deploy_enabled));
    let tools = Arc::new(ToolRegistry::new());
    let queue = Arc::new(BuildQueue::with_policy(
        store.clone(),
        QueuePolicy {
            max_queue_depth: config.queue.max_queue_depth,
            visibility_timeout: Duration::from_secs(config.queue.visibility_timeout_secs),
            ..QueuePolicy::default()
        },
    ));
    let executor = Arc::new(StageExecutor::new(
        state.clone(),
        writer.clone(),
        tools,
        template_factory(),
        PipelinePolicy::default(),
    ));
    let driver = Arc::new(WorkflowDriver::new(
        state.clone(),
        writer,
        registry.clone(),
        executor,
    ));
    let pool = Arc::new(WorkerPool::new(
        queue.clone(),
        driver,
        state.clone(),
        WorkerConfig {
            max_workflow_workers: config.workers.max_workflow_workers,
            ..WorkerConfig::default()
        },
    ));
    let service = BuildService::new(state.clone(), queue.clone(), registry, layout.clone());
    let dashboard = BuildDashboard::new(state, layout);

    Ok(Forge {
        store,
        queue,
        service,
        dashboard,
        pool,
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config: ForgeConfig = match std::fs::read_to_string(&cli.config) {
        Ok(raw) => toml::from_str(&raw)?,
        Err(_) => ForgeConfig::default(),
    };
    let forge = build_forge(&config).await?;

    match cli.command {
        Commands::Submit {
            requirement,
            name,
            priority,
        } => {
            let receipt = forge
                .service
                .submit(build_request(requirement, name, priority))
                .await?;
            println!("{}", serde_json::to_string_pretty(&receipt)?);
        }
        Commands::Run {
            requirement,
            name,
            priority,
        } => {
            let receipt = forge
                .service
                .submit(build_request(requirement, name, priority))
                .await?;
            info!(project_id = %receipt.project_id, "Driving build to completion");
            loop {
                let worked = forge.pool.tick("cli-worker").await?;
                let project = forge.store.get_project(&receipt.project_id).await?;
                if project.status.is_terminal() || project.status == ProjectStatus::Paused {
                    break;
                }
                if !worked {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    forge.queue.reap_expired().await?;
                }
            }
            let snapshot = forge.dashboard.snapshot(&receipt.project_id).await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Commands::Status { project_id } => {
            let snapshot = forge.dashboard.snapshot(&project_id).await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Commands::List { status, limit } => {
            let filter = ProjectFilter {
                status: status.map(Into::into),
                user_id: None,
            };
            let page = forge
                .store
                .list_projects(&filter, &Page {
                    last_key: None,
                    limit,
                })
                .await?;
            for project in &page.items {
                println!(
                    "{}  {:<24} {:<10} {:>3}%",
                    project.project_id, project.project_name, project.status, project.progress
                );
            }
        }
        Commands::Control {
            project_id,
            action,
            from_stage,
            keep_subsequent,
        } => {
            forge
                .service
                .control(
                    &project_id,
                    ControlRequest {
                        action: action.into(),
                        from_stage,
                        clear_subsequent: Some(!keep_subsequent),
                        reason: None,
                    },
                )
                .await?;
            println!("control flag set on {project_id}");
        }
        Commands::Delete { project_id } => {
            forge.service.delete(&project_id).await?;
            println!("deleted {project_id}");
        }
    }
    Ok(())
}

fn build_request(requirement: String, name: Option<String>, priority: u8) -> BuildRequest {
    let mut request = BuildRequest::new(requirement).with_priority(priority);
    request.project_name = name;
    request
}
