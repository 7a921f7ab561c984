use std::path::{Path, PathBuf};

/// Deterministic path layout keyed by project and agent name.
///
/// All helpers return workspace-relative string paths; these are exactly the
/// strings recorded in a stage's `output_data.artifacts`.
#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    root: PathBuf,
}

impl ArtifactLayout {
    /// Layout rooted at the given workspace directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The workspace root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a workspace-relative path to an absolute one.
    pub fn absolute(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    /// `projects/<name>`
    pub fn project_dir(&self, project: &str) -> String {
        format!("projects/{project}")
    }

    /// `projects/<name>/config.yaml`
    pub fn project_config(&self, project: &str) -> String {
        format!("projects/{project}/config.yaml")
    }

    /// `projects/<name>/status.yaml`
    pub fn project_status(&self, project: &str) -> String {
        format!("projects/{project}/status.yaml")
    }

    /// `projects/<name>/README.md`
    pub fn project_readme(&self, project: &str) -> String {
        format!("projects/{project}/README.md")
    }

    /// `projects/<name>/requirements.txt`
    pub fn project_requirements(&self, project: &str) -> String {
        format!("projects/{project}/requirements.txt")
    }

    /// `projects/<project>/agents/<agent>/<stage>.json`
    pub fn stage_document(&self, project: &str, agent: &str, stage: &str) -> String {
        format!("projects/{project}/agents/{agent}/{stage}.json")
    }

    /// `agents/generated_agents/<project>/<agent>.py`
    pub fn agent_code(&self, project: &str, agent: &str) -> String {
        format!("agents/generated_agents/{project}/{agent}.py")
    }

    /// `prompts/generated_agents_prompts/<project>/<agent>.yaml`
    pub fn agent_prompt(&self, project: &str, agent: &str) -> String {
        format!("prompts/generated_agents_prompts/{project}/{agent}.yaml")
    }

    /// `tools/generated_tools/<project>/<module>/<tool>.py`
    pub fn tool_file(&self, project: &str, module: &str, tool: &str) -> String {
        format!("tools/generated_tools/{project}/{module}/{tool}.py")
    }

    /// `projects/<name>/workflow_report.md`
    pub fn workflow_report(&self, project: &str) -> String {
        format!("projects/{project}/workflow_report.md")
    }

    /// Whether any `workflow_report*` artifact exists for the project.
    /// Consumed by the dashboard to classify the build for the UI.
    pub fn has_workflow_report(&self, project: &str) -> bool {
        let dir = self.root.join("projects").join(project);
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return false;
        };
        entries.flatten().any(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with("workflow_report"))
        })
    }

    /// The disjoint path prefix owned by a stage (or sub-stage). Collisions
    /// across prefixes are impossible by construction; within one, a
    /// duplicate path across sub-stages is a validator failure.
    pub fn stage_prefix(&self, project: &str, stage: &str) -> String {
        match stage {
            "tool_developer" => format!("tools/generated_tools/{project}"),
            "prompt_engineer" => format!("prompts/generated_agents_prompts/{project}"),
            "agent_code_developer" => format!("agents/generated_agents/{project}"),
            _ => format!("projects/{project}"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let layout = ArtifactLayout::new("/ws");
        assert_eq!(
            layout.agent_code("weather_agent", "weather_agent"),
            "agents/generated_agents/weather_agent/weather_agent.py"
        );
        assert_eq!(
            layout.agent_prompt("weather_agent", "weather_agent"),
            "prompts/generated_agents_prompts/weather_agent/weather_agent.yaml"
        );
        assert_eq!(
            layout.tool_file("weather_agent", "weather_api", "fetch_forecast"),
            "tools/generated_tools/weather_agent/weather_api/fetch_forecast.py"
        );
        assert_eq!(
            layout.stage_document("weather_agent", "weather_agent", "system_architect"),
            "projects/weather_agent/agents/weather_agent/system_architect.json"
        );
        assert_eq!(
            layout.absolute("projects/x/config.yaml"),
            PathBuf::from("/ws/projects/x/config.yaml")
        );
    }

    #[test]
    fn test_stage_prefixes_are_disjoint() {
        let layout = ArtifactLayout::new("/ws");
        let prefixes = [
            layout.stage_prefix("p", "tool_developer"),
            layout.stage_prefix("p", "prompt_engineer"),
            layout.stage_prefix("p", "agent_code_developer"),
        ];
        for (i, a) in prefixes.iter().enumerate() {
            for (j, b) in prefixes.iter().enumerate() {
                if i != j {
                    assert!(!a.starts_with(b.as_str()));
                }
            }
        }
    }

    #[test]
    fn test_workflow_report_detection() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = ArtifactLayout::new(tmp.path());
        assert!(!layout.has_workflow_report("demo"));

        let dir = tmp.path().join("projects/demo");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("workflow_report.html"), "<html>").unwrap();
        assert!(layout.has_workflow_report("demo"));
    }
}
