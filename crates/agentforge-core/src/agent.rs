use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Where a built agent runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentType {
    Local,
    Agentcore,
}

/// Runtime status of a built agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Running,
    Offline,
    Error,
    Deploying,
}

/// The artifact of a successful build. Created by the developer-manager
/// synchronization step; never mutated by the pipeline afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    /// Globally unique: `<project_id>:<agent_name>`.
    pub agent_id: String,
    pub project_id: String,
    pub agent_name: String,
    pub deployment_type: DeploymentType,
    pub status: AgentStatus,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Names resolved against the typed tool registry at validation time.
    #[serde(default)]
    pub tools: Vec<String>,
    pub prompt_path: String,
    pub code_path: String,
    #[serde(default)]
    pub total_invocations: u64,
    #[serde(default)]
    pub successful_invocations: u64,
    #[serde(default)]
    pub failed_invocations: u64,
    #[serde(default)]
    pub avg_duration_ms: f64,
    pub last_invoked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deployment_metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl AgentRecord {
    /// Create an offline agent record for a freshly built agent.
    pub fn new(
        project_id: impl Into<String>,
        agent_name: impl Into<String>,
        prompt_path: impl Into<String>,
        code_path: impl Into<String>,
    ) -> Self {
        let project_id = project_id.into();
        let agent_name = agent_name.into();
        Self {
            agent_id: format!("{project_id}:{agent_name}"),
            project_id,
            agent_name,
            deployment_type: DeploymentType::Local,
            status: AgentStatus::Offline,
            capabilities: Vec::new(),
            tools: Vec::new(),
            prompt_path: prompt_path.into(),
            code_path: code_path.into(),
            total_invocations: 0,
            successful_invocations: 0,
            failed_invocations: 0,
            avg_duration_ms: 0.0,
            last_invoked_at: None,
            deployment_metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Attach the tool names this agent references.
    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = tools;
        self
    }

    /// Attach capability labels.
    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }
}
