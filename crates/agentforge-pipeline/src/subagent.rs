use crate::events::{EventSink, StageEvent};
use agentforge_core::{ForgeError, ForgeResult, StageMetrics};
use agentforge_artifacts::ArtifactLayout;
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation handle passed to every sub-agent body.
///
/// Bodies are expected to observe it at tool-call boundaries; hard
/// cancellation is not guaranteed. Work that finishes anyway has its result
/// discarded before commit.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    /// A fresh, uncancelled handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// One generated file, staged by the executor into the artifact transaction.
#[derive(Debug, Clone)]
pub struct GeneratedFile {
    /// Workspace-relative destination path.
    pub path: String,
    pub contents: Vec<u8>,
}

impl GeneratedFile {
    /// Create a file from text contents.
    pub fn text(path: impl Into<String>, contents: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            contents: contents.into().into_bytes(),
        }
    }
}

/// Everything a stage invocation needs, threaded explicitly. There is no
/// ambient "current project" state anywhere in the pipeline.
#[derive(Clone)]
pub struct StageContext {
    pub project_id: String,
    pub project_name: String,
    pub agent_name: String,
    pub requirement: String,
    /// `output_data` of the stages named in the spec's `required_inputs`.
    pub prior_outputs: HashMap<String, serde_json::Map<String, serde_json::Value>>,
    pub layout: ArtifactLayout,
    pub cancel: CancelHandle,
    pub events: EventSink,
}

impl StageContext {
    /// A prior stage's output value, if present.
    pub fn prior(&self, stage: &str, key: &str) -> Option<&serde_json::Value> {
        self.prior_outputs.get(stage).and_then(|m| m.get(key))
    }
}

/// What a sub-agent body returns. The executor stages the files, applies the
/// stage validator, and commits artifacts and telemetry together.
#[derive(Debug, Clone, Default)]
pub struct SubAgentOutput {
    pub output_data: serde_json::Map<String, serde_json::Value>,
    pub files: Vec<GeneratedFile>,
    /// Token/tool-call counts reported by the body; wall-clock duration is
    /// measured by the executor.
    pub metrics: StageMetrics,
    pub logs: Vec<String>,
}

/// Strategy trait implemented by each stage body. The executor is oblivious
/// to which implementation runs: an LLM-backed body and the deterministic
/// templates are interchangeable.
#[async_trait]
pub trait SubAgent: Send + Sync {
    /// The stage this body implements.
    fn stage_name(&self) -> &str;

    /// Execute the stage.
    async fn run(&self, ctx: &StageContext) -> ForgeResult<SubAgentOutput>;
}

/// Resolves a stage name to its sub-agent body. Tests and custom runtimes
/// inject their own; [`template_factory`] is the built-in set.
pub type SubAgentFactory = Arc<dyn Fn(&str) -> Option<Arc<dyn SubAgent>> + Send + Sync>;

/// The built-in deterministic sub-agent set: renders the documented artifact
/// layout from the requirement text without any LLM calls. Useful for local
/// dry runs and as the contract reference for LLM-backed bodies.
pub fn template_factory() -> SubAgentFactory {
    Arc::new(|stage| {
        let agent: Arc<dyn SubAgent> = match stage {
            "orchestrator" => Arc::new(TemplateOrchestrator),
            "requirements_analyzer" => Arc::new(TemplateAnalyzer),
            "system_architect" => Arc::new(TemplateArchitect),
            "agent_designer" => Arc::new(TemplateDesigner),
            "tool_developer" => Arc::new(TemplateToolDeveloper),
            "prompt_engineer" => Arc::new(TemplatePromptEngineer),
            "agent_code_developer" => Arc::new(TemplateCodeDeveloper),
            "agent_developer_manager" => Arc::new(TemplateDeveloperManager),
            "agent_deployer" => Arc::new(TemplateDeployer),
            _ => return None,
        };
        Some(agent)
    })
}

/// File name of a stage's JSON document under `projects/<p>/agents/<a>/`.
/// The tool developer's document is historically named `tools_developer`.
pub fn stage_document_name(stage: &str) -> &str {
    match stage {
        "tool_developer" => "tools_developer",
        other => other,
    }
}

fn check_cancelled(ctx: &StageContext) -> ForgeResult<()> {
    if ctx.cancel.is_cancelled() {
        return Err(ForgeError::Transient("cancelled at tool-call boundary".into()));
    }
    Ok(())
}

fn doc_file(ctx: &StageContext, stage: &str, doc: &serde_json::Value) -> ForgeResult<GeneratedFile> {
    let path = ctx
        .layout
        .stage_document(&ctx.project_name, &ctx.agent_name, stage_document_name(stage));
    Ok(GeneratedFile {
        path,
        contents: serde_json::to_vec_pretty(doc)?,
    })
}

// ---------------------------------------------------------------------------
// Template bodies
// ---------------------------------------------------------------------------

struct TemplateOrchestrator;

#[async_trait]
impl SubAgent for TemplateOrchestrator {
    fn stage_name(&self) -> &str {
        "orchestrator"
    }

    async fn run(&self, ctx: &StageContext) -> ForgeResult<SubAgentOutput> {
        check_cancelled(ctx)?;
        ctx.events.emit(StageEvent::Text {
            text: format!("Initializing project {}", ctx.project_name),
        });

        let config = json!({
            "project": {
                "name": ctx.project_name,
                "agent": ctx.agent_name,
                "requirement": ctx.requirement,
            }
        });
        let config_yaml = serde_yaml_ng::to_string(&config)
            .map_err(|e| ForgeError::Validator(format!("config serialization: {e}")))?;
        let readme = format!(
            "# {}\n\nGenerated agent project.\n\n## Requirement\n\n{}\n",
            ctx.project_name, ctx.requirement
        );

        let mut output = SubAgentOutput::default();
        output.files.push(GeneratedFile::text(
            ctx.layout.project_config(&ctx.project_name),
            config_yaml,
        ));
        output.files.push(GeneratedFile::text(
            ctx.layout.project_readme(&ctx.project_name),
            readme,
        ));
        output.files.push(GeneratedFile::text(
            ctx.layout.project_requirements(&ctx.project_name),
            "strands-agents>=0.1\npyyaml>=6\n",
        ));
        output
            .output_data
            .insert("project_name".into(), json!(ctx.project_name));
        output
            .output_data
            .insert("agent_name".into(), json!(ctx.agent_name));
        output.logs.push("project directory initialized".into());
        ctx.events.emit(StageEvent::Done);
        Ok(output)
    }
}

struct TemplateAnalyzer;

#[async_trait]
impl SubAgent for TemplateAnalyzer {
    fn stage_name(&self) -> &str {
        "requirements_analyzer"
    }

    async fn run(&self, ctx: &StageContext) -> ForgeResult<SubAgentOutput> {
        check_cancelled(ctx)?;
        let doc = json!({
            "agent_name": ctx.agent_name,
            "requirement": ctx.requirement,
            "functional_requirements": [
                format!("Respond to user requests about: {}", ctx.requirement),
                "Report errors in a structured form",
            ],
            "non_functional_requirements": ["single-user latency under 5s"],
        });
        let mut output = SubAgentOutput::default();
        output.files.push(doc_file(ctx, "requirements_analyzer", &doc)?);
        output
            .output_data
            .insert("functional_count".into(), json!(2));
        output.logs.push("requirements analyzed".into());
        ctx.events.emit(StageEvent::Done);
        Ok(output)
    }
}

struct TemplateArchitect;

#[async_trait]
impl SubAgent for TemplateArchitect {
    fn stage_name(&self) -> &str {
        "system_architect"
    }

    async fn run(&self, ctx: &StageContext) -> ForgeResult<SubAgentOutput> {
        check_cancelled(ctx)?;
        let doc = json!({
            "agent_name": ctx.agent_name,
            "architecture": "single_agent",
            "components": [
                {"name": "prompt", "kind": "prompt_yaml"},
                {"name": "tools", "kind": "python_module"},
                {"name": "agent", "kind": "python_entrypoint"},
            ],
        });
        let mut output = SubAgentOutput::default();
        output.files.push(doc_file(ctx, "system_architect", &doc)?);
        output
            .output_data
            .insert("architecture".into(), json!("single_agent"));
        output.logs.push("architecture selected: single_agent".into());
        ctx.events.emit(StageEvent::Done);
        Ok(output)
    }
}

struct TemplateDesigner;

#[async_trait]
impl SubAgent for TemplateDesigner {
    fn stage_name(&self) -> &str {
        "agent_designer"
    }

    async fn run(&self, ctx: &StageContext) -> ForgeResult<SubAgentOutput> {
        check_cancelled(ctx)?;
        let schema = json!({
            "type": "object",
            "properties": {"query": {"type": "string"}},
            "required": ["query"],
        });
        let tools = json!([{
            "module": "core",
            "name": "process_request",
            "description": format!("Handle one request for {}", ctx.agent_name),
            "schema": schema.clone(),
        }]);
        // Designed tools are declared here, before the fan-out, so the
        // agent-code validator can resolve names regardless of sub-stage
        // completion order.
        let declared = json!([{
            "name": "process_request",
            "path": ctx.layout.tool_file(&ctx.project_name, "core", "process_request"),
            "schema": schema,
        }]);
        let doc = json!({
            "agent_name": ctx.agent_name,
            "capabilities": ["conversation", "tool_use"],
            "tools": tools,
        });
        let mut output = SubAgentOutput::default();
        output.files.push(doc_file(ctx, "agent_designer", &doc)?);
        output.output_data.insert("agent_name".into(), json!(ctx.agent_name));
        output.output_data.insert("tools".into(), tools);
        output.output_data.insert("declared_tools".into(), declared);
        output
            .output_data
            .insert("capabilities".into(), json!(["conversation", "tool_use"]));
        output.logs.push("agent design produced".into());
        ctx.events.emit(StageEvent::Done);
        Ok(output)
    }
}

fn designed_tools(ctx: &StageContext) -> Vec<(String, String, serde_json::Value)> {
    ctx.prior("agent_designer", "tools")
        .and_then(|v| v.as_array())
        .map(|tools| {
            tools
                .iter()
                .filter_map(|t| {
                    let module = t.get("module")?.as_str()?.to_string();
                    let name = t.get("name")?.as_str()?.to_string();
                    let schema = t.get("schema").cloned().unwrap_or(json!({}));
                    Some((module, name, schema))
                })
                .collect()
        })
        .unwrap_or_default()
}

struct TemplateToolDeveloper;

#[async_trait]
impl SubAgent for TemplateToolDeveloper {
    fn stage_name(&self) -> &str {
        "tool_developer"
    }

    async fn run(&self, ctx: &StageContext) -> ForgeResult<SubAgentOutput> {
        check_cancelled(ctx)?;
        let mut output = SubAgentOutput::default();
        let mut declared = Vec::new();

        for (module, name, schema) in designed_tools(ctx) {
            check_cancelled(ctx)?;
            let path = ctx.layout.tool_file(&ctx.project_name, &module, &name);
            let source = format!(
                "\"\"\"Generated tool `{name}` for {project}.\"\"\"\n\n\n\
                 def {name}(query: str) -> dict:\n    \
                 \"\"\"Handle one `{name}` call.\"\"\"\n    \
                 return {{\"status\": \"ok\", \"query\": query}}\n",
                project = ctx.project_name,
            );
            ctx.events.emit(StageEvent::ToolUse {
                name: "file_write".into(),
                input: json!({"path": path}),
            });
            output.files.push(GeneratedFile::text(&path, source));
            output.metrics.tool_calls += 1;
            declared.push(json!({"name": name, "path": path, "schema": schema}));
        }

        let doc = json!({"agent_name": ctx.agent_name, "tools": declared});
        output.files.push(doc_file(ctx, "tool_developer", &doc)?);
        output.output_data.insert("declared_tools".into(), json!(declared));
        output.logs.push(format!("{} tool(s) generated", declared.len()));
        ctx.events.emit(StageEvent::Done);
        Ok(output)
    }
}

struct TemplatePromptEngineer;

#[async_trait]
impl SubAgent for TemplatePromptEngineer {
    fn stage_name(&self) -> &str {
        "prompt_engineer"
    }

    async fn run(&self, ctx: &StageContext) -> ForgeResult<SubAgentOutput> {
        check_cancelled(ctx)?;
        let prompt = json!({
            "agent": {
                "name": ctx.agent_name,
                "description": format!("Agent built for: {}", ctx.requirement),
                "system_prompt": format!(
                    "You are {}, an assistant for the following need:\n{}\n\
                     Use your tools when they apply and answer concisely.",
                    ctx.agent_name, ctx.requirement
                ),
            }
        });
        let yaml = serde_yaml_ng::to_string(&prompt)
            .map_err(|e| ForgeError::Validator(format!("prompt serialization: {e}")))?;
        let prompt_path = ctx.layout.agent_prompt(&ctx.project_name, &ctx.agent_name);

        let doc = json!({"agent_name": ctx.agent_name, "prompt_path": prompt_path});
        let mut output = SubAgentOutput::default();
        output.files.push(GeneratedFile::text(&prompt_path, yaml));
        output.files.push(doc_file(ctx, "prompt_engineer", &doc)?);
        output
            .output_data
            .insert("prompt_path".into(), json!(prompt_path));
        output.logs.push("prompt rendered".into());
        ctx.events.emit(StageEvent::Done);
        Ok(output)
    }
}

struct TemplateCodeDeveloper;

#[async_trait]
impl SubAgent for TemplateCodeDeveloper {
    fn stage_name(&self) -> &str {
        "agent_code_developer"
    }

    async fn run(&self, ctx: &StageContext) -> ForgeResult<SubAgentOutput> {
        check_cancelled(ctx)?;
        let tool_names: Vec<String> = designed_tools(ctx)
            .into_iter()
            .map(|(_, name, _)| name)
            .collect();
        let code_path = ctx.layout.agent_code(&ctx.project_name, &ctx.agent_name);
        let source = format!(
            "\"\"\"Generated entrypoint for {agent}.\"\"\"\n\n\
             TOOLS = {tool_names:?}\n\n\n\
             def run(message: str) -> str:\n    \
             \"\"\"Answer one user message.\"\"\"\n    \
             return f\"[{agent}] {{message}}\"\n",
            agent = ctx.agent_name,
        );

        let doc = json!({
            "agent_name": ctx.agent_name,
            "code_path": code_path,
            "tools_used": tool_names,
        });
        let mut output = SubAgentOutput::default();
        output.files.push(GeneratedFile::text(&code_path, source));
        output.files.push(doc_file(ctx, "agent_code_developer", &doc)?);
        output.output_data.insert("code_path".into(), json!(code_path));
        output
            .output_data
            .insert("tools_used".into(), json!(tool_names));
        output.logs.push("agent entrypoint generated".into());
        ctx.events.emit(StageEvent::Done);
        Ok(output)
    }
}

struct TemplateDeveloperManager;

#[async_trait]
impl SubAgent for TemplateDeveloperManager {
    fn stage_name(&self) -> &str {
        "agent_developer_manager"
    }

    async fn run(&self, ctx: &StageContext) -> ForgeResult<SubAgentOutput> {
        check_cancelled(ctx)?;
        let prompt_path = ctx
            .prior("prompt_engineer", "prompt_path")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let code_path = ctx
            .prior("agent_code_developer", "code_path")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let tools: Vec<String> = ctx
            .prior("agent_code_developer", "tools_used")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|t| t.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let doc = json!({
            "agent_name": ctx.agent_name,
            "prompt_path": prompt_path,
            "code_path": code_path,
            "tools": tools,
            "capabilities": ["conversation", "tool_use"],
        });
        let report = format!(
            "# Workflow report: {}\n\n\
             | Output | Path |\n|---|---|\n\
             | Prompt | {} |\n| Code | {} |\n\n\
             Tools: {}\n",
            ctx.project_name,
            prompt_path,
            code_path,
            if tools.is_empty() { "none".to_string() } else { tools.join(", ") },
        );

        let mut output = SubAgentOutput::default();
        output.files.push(doc_file(ctx, "agent_developer_manager", &doc)?);
        output.files.push(GeneratedFile::text(
            ctx.layout.workflow_report(&ctx.project_name),
            report,
        ));
        output.output_data.insert("agent_name".into(), json!(ctx.agent_name));
        output.output_data.insert("prompt_path".into(), json!(prompt_path));
        output.output_data.insert("code_path".into(), json!(code_path));
        output.output_data.insert("tools".into(), json!(tools));
        output
            .output_data
            .insert("capabilities".into(), json!(["conversation", "tool_use"]));
        output.logs.push("developer outputs synchronized".into());
        ctx.events.emit(StageEvent::Done);
        Ok(output)
    }
}

struct TemplateDeployer;

#[async_trait]
impl SubAgent for TemplateDeployer {
    fn stage_name(&self) -> &str {
        "agent_deployer"
    }

    async fn run(&self, ctx: &StageContext) -> ForgeResult<SubAgentOutput> {
        check_cancelled(ctx)?;
        let doc = json!({
            "agent_name": ctx.agent_name,
            "deployment_type": "local",
            "endpoint": format!("local://{}", ctx.agent_name),
        });
        let mut output = SubAgentOutput::default();
        output.files.push(doc_file(ctx, "agent_deployer", &doc)?);
        output
            .output_data
            .insert("deployment_type".into(), json!("local"));
        output.logs.push("local deployment recorded".into());
        ctx.events.emit(StageEvent::Done);
        Ok(output)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn ctx() -> StageContext {
        StageContext {
            project_id: "p-1".into(),
            project_name: "weather_agent".into(),
            agent_name: "weather_agent".into(),
            requirement: "Weather assistant that fetches forecast by city".into(),
            prior_outputs: HashMap::new(),
            layout: ArtifactLayout::new("/tmp/forge-test"),
            cancel: CancelHandle::new(),
            events: EventSink::disabled(),
        }
    }

    #[tokio::test]
    async fn test_factory_covers_all_stages() {
        let factory = template_factory();
        for stage in [
            "orchestrator",
            "requirements_analyzer",
            "system_architect",
            "agent_designer",
            "tool_developer",
            "prompt_engineer",
            "agent_code_developer",
            "agent_developer_manager",
            "agent_deployer",
        ] {
            let agent = factory(stage).unwrap();
            assert_eq!(agent.stage_name(), stage);
        }
        assert!(factory("no_such_stage").is_none());
    }

    #[tokio::test]
    async fn test_orchestrator_renders_project_files() {
        let factory = template_factory();
        let output = factory("orchestrator").unwrap().run(&ctx()).await.unwrap();
        let paths: Vec<&str> = output.files.iter().map(|f| f.path.as_str()).collect();
        assert!(paths.contains(&"projects/weather_agent/config.yaml"));
        assert!(paths.contains(&"projects/weather_agent/README.md"));
        assert!(paths.contains(&"projects/weather_agent/requirements.txt"));
        assert_eq!(
            output.output_data.get("agent_name").unwrap(),
            &json!("weather_agent")
        );
    }

    #[tokio::test]
    async fn test_tool_developer_uses_design() {
        let factory = template_factory();
        let mut ctx = ctx();
        let mut design = serde_json::Map::new();
        design.insert(
            "tools".into(),
            json!([{"module": "api", "name": "fetch_forecast", "schema": {}}]),
        );
        ctx.prior_outputs.insert("agent_designer".into(), design);

        let output = factory("tool_developer").unwrap().run(&ctx).await.unwrap();
        assert!(output
            .files
            .iter()
            .any(|f| f.path == "tools/generated_tools/weather_agent/api/fetch_forecast.py"));
        // The document keeps its historical name.
        assert!(output
            .files
            .iter()
            .any(|f| f.path.ends_with("tools_developer.json")));
        assert_eq!(output.metrics.tool_calls, 1);
    }

    #[tokio::test]
    async fn test_prompt_engineer_yaml_parses() {
        let factory = template_factory();
        let output = factory("prompt_engineer").unwrap().run(&ctx()).await.unwrap();
        let prompt = output
            .files
            .iter()
            .find(|f| f.path.ends_with(".yaml"))
            .unwrap();
        let parsed: serde_yaml_ng::Value =
            serde_yaml_ng::from_slice(&prompt.contents).unwrap();
        assert!(parsed.get("agent").is_some());
    }

    #[tokio::test]
    async fn test_cancelled_body_short_circuits() {
        let factory = template_factory();
        let ctx = ctx();
        ctx.cancel.cancel();
        let err = factory("system_architect").unwrap().run(&ctx).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_manager_collects_developer_outputs() {
        let factory = template_factory();
        let mut ctx = ctx();
        let mut prompt_out = serde_json::Map::new();
        prompt_out.insert("prompt_path".into(), json!("prompts/p/a.yaml"));
        let mut code_out = serde_json::Map::new();
        code_out.insert("code_path".into(), json!("agents/p/a.py"));
        code_out.insert("tools_used".into(), json!(["fetch_forecast"]));
        ctx.prior_outputs.insert("prompt_engineer".into(), prompt_out);
        ctx.prior_outputs.insert("agent_code_developer".into(), code_out);

        let output = factory("agent_developer_manager")
            .unwrap()
            .run(&ctx)
            .await
            .unwrap();
        assert_eq!(output.output_data.get("code_path").unwrap(), &json!("agents/p/a.py"));
        assert!(output
            .files
            .iter()
            .any(|f| f.path == "projects/weather_agent/workflow_report.md"));
    }
}
