use agentforge_core::{StageSnapshot, StageStatus};

/// Which opaque check runs over a stage's staged artifacts before commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidatorKind {
    /// No artifact check.
    None,
    /// Every staged `.json` document must parse.
    StageDocument,
    /// Staged `.yaml` files must parse (generated prompts).
    PromptYaml,
    /// Staged `.py` files must be non-empty and define at least one function.
    PythonSource,
    /// Python check plus tool-name resolution against the typed registry.
    AgentCode,
}

/// One entry of the declarative stage catalog.
#[derive(Debug, Clone)]
pub struct StageSpec {
    /// Stable wire-contract identifier.
    pub name: &'static str,
    pub display_name: &'static str,
    /// Position in the pipeline; sub-stages share their group's order.
    pub order: u32,
    /// Set for the three developer sub-stages.
    pub parallel_group: Option<&'static str>,
    /// Prior stages whose `output_data` this stage consumes.
    pub required_inputs: &'static [&'static str],
    /// Artifact categories this stage produces.
    pub produces: &'static [&'static str],
    pub validator: ValidatorKind,
}

/// Name of the developer fan-out group.
pub const DEVELOPER_GROUP: &str = "developer";

/// What the driver should run next.
#[derive(Debug, Clone)]
pub enum NextWork {
    /// One ordinary stage.
    Single(StageSpec),
    /// The developer fan-out: the not-yet-finished sub-stages.
    FanOut(Vec<StageSpec>),
}

/// Static ordered catalog of pipeline stages.
///
/// Stage identifiers are part of the wire contract. The developer-manager
/// stage expands into three parallel sub-stages followed by a
/// synchronization step (the manager entry itself); the deployer is optional
/// and pre-marked skipped when deployment is disabled.
#[derive(Debug, Clone)]
pub struct StageRegistry {
    stages: Vec<StageSpec>,
    deploy_enabled: bool,
}

impl StageRegistry {
    /// The standard seven-stage catalog.
    pub fn standard(deploy_enabled: bool) -> Self {
        let stages = vec![
            StageSpec {
                name: "orchestrator",
                display_name: "Orchestrator",
                order: 1,
                parallel_group: None,
                required_inputs: &[],
                produces: &["project_config"],
                validator: ValidatorKind::None,
            },
            StageSpec {
                name: "requirements_analyzer",
                display_name: "Requirements Analyzer",
                order: 2,
                parallel_group: None,
                required_inputs: &["orchestrator"],
                produces: &["stage_document"],
                validator: ValidatorKind::StageDocument,
            },
            StageSpec {
                name: "system_architect",
                display_name: "System Architect",
                order: 3,
                parallel_group: None,
                required_inputs: &["requirements_analyzer"],
                produces: &["stage_document"],
                validator: ValidatorKind::StageDocument,
            },
            StageSpec {
                name: "agent_designer",
                display_name: "Agent Designer",
                order: 4,
                parallel_group: None,
                required_inputs: &["requirements_analyzer", "system_architect"],
                produces: &["stage_document"],
                validator: ValidatorKind::StageDocument,
            },
            StageSpec {
                name: "tool_developer",
                display_name: "Tool Developer",
                order: 5,
                parallel_group: Some(DEVELOPER_GROUP),
                required_inputs: &["agent_designer"],
                produces: &["tool_source", "stage_document"],
                validator: ValidatorKind::PythonSource,
            },
            StageSpec {
                name: "prompt_engineer",
                display_name: "Prompt Engineer",
                order: 5,
                parallel_group: Some(DEVELOPER_GROUP),
                required_inputs: &["agent_designer"],
                produces: &["prompt_yaml", "stage_document"],
                validator: ValidatorKind::PromptYaml,
            },
            StageSpec {
                name: "agent_code_developer",
                display_name: "Agent Code Developer",
                order: 5,
                parallel_group: Some(DEVELOPER_GROUP),
                required_inputs: &["agent_designer"],
                produces: &["agent_source", "stage_document"],
                validator: ValidatorKind::AgentCode,
            },
            StageSpec {
                name: "agent_developer_manager",
                display_name: "Agent Developer Manager",
                order: 6,
                parallel_group: None,
                required_inputs: &["tool_developer", "prompt_engineer", "agent_code_developer"],
                produces: &["stage_document", "workflow_report"],
                validator: ValidatorKind::StageDocument,
            },
            StageSpec {
                name: "agent_deployer",
                display_name: "Agent Deployer",
                order: 7,
                parallel_group: None,
                required_inputs: &["agent_developer_manager"],
                produces: &["stage_document"],
                validator: ValidatorKind::StageDocument,
            },
        ];
        Self {
            stages,
            deploy_enabled,
        }
    }

    /// Whether the deployer stage runs.
    pub fn deploy_enabled(&self) -> bool {
        self.deploy_enabled
    }

    /// Look up a stage by wire name.
    pub fn get(&self, name: &str) -> Option<&StageSpec> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// All catalog entries in order.
    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    /// The three developer sub-stages.
    pub fn substages(&self) -> Vec<&StageSpec> {
        self.stages
            .iter()
            .filter(|s| s.parallel_group == Some(DEVELOPER_GROUP))
            .collect()
    }

    /// Whether `name` is one of the developer sub-stages.
    pub fn is_substage(&self, name: &str) -> bool {
        self.get(name)
            .is_some_and(|s| s.parallel_group.is_some())
    }

    /// Expanded snapshot entries for a new project, in execution order. The
    /// deployer is pre-marked skipped when deployment is disabled; the total
    /// is fixed for the life of the project.
    pub fn snapshot_entries(&self) -> Vec<StageSnapshot> {
        self.stages
            .iter()
            .map(|spec| {
                let mut entry = StageSnapshot::new(spec.name, spec.order, spec.display_name);
                if spec.name == "agent_deployer" && !self.deploy_enabled {
                    entry.status = StageStatus::Skipped;
                }
                entry
            })
            .collect()
    }

    /// Pick the next work item given the project's snapshot, walking the
    /// catalog in order. Sub-stages surface together as a fan-out of the
    /// members that still need to run.
    pub fn next_work(&self, snapshot: &[StageSnapshot]) -> Option<NextWork> {
        for spec in &self.stages {
            let Some(entry) = snapshot.iter().find(|s| s.stage_name == spec.name) else {
                continue;
            };
            if entry.status.is_done() {
                continue;
            }
            if spec.parallel_group.is_some() {
                // Gather every unfinished member of the group.
                let pending: Vec<StageSpec> = self
                    .substages()
                    .into_iter()
                    .filter(|sub| {
                        snapshot
                            .iter()
                            .find(|s| s.stage_name == sub.name)
                            .is_some_and(|s| !s.status.is_done())
                    })
                    .cloned()
                    .collect();
                return Some(NextWork::FanOut(pending));
            }
            return Some(NextWork::Single(spec.clone()));
        }
        None
    }

    /// Stages reset by `restart(from_stage, clear_subsequent)`: the named
    /// stage plus, when clearing, every stage strictly after it. Sibling
    /// sub-stages of the same order are preserved, so restarting one
    /// developer sub-stage keeps the other two.
    pub fn restart_set(&self, from_stage: &str, clear_subsequent: bool) -> Vec<&'static str> {
        let Some(from) = self.get(from_stage) else {
            return Vec::new();
        };
        self.stages
            .iter()
            .filter(|s| {
                s.name == from.name || (clear_subsequent && s.order > from.order)
            })
            .map(|s| s.name)
            .collect()
    }
}
