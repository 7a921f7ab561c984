use crate::registry::{StageSpec, ValidatorKind};
use crate::toolreg::ToolRegistry;
use agentforge_artifacts::{ArtifactLayout, StagedFile};
use agentforge_core::{ForgeError, ForgeResult};

/// Apply a stage's validator to its staged artifacts before commit.
///
/// Validator failures are deterministic: the stage fails without retry and
/// the executor rolls the transaction back. Sub-stages are additionally
/// confined to their disjoint path prefixes, so a cross-prefix write (the
/// only way two sub-stages could collide) surfaces here.
pub async fn validate_stage(
    spec: &StageSpec,
    project_name: &str,
    staged: &[StagedFile],
    output_data: &serde_json::Map<String, serde_json::Value>,
    tools: &ToolRegistry,
    layout: &ArtifactLayout,
) -> ForgeResult<()> {
    if spec.parallel_group.is_some() {
        check_prefix_ownership(spec, project_name, staged, layout)?;
    }

    match spec.validator {
        ValidatorKind::None => Ok(()),
        ValidatorKind::StageDocument => check_json_documents(staged).await,
        ValidatorKind::PromptYaml => {
            check_json_documents(staged).await?;
            check_yaml_documents(staged).await
        }
        ValidatorKind::PythonSource => {
            check_json_documents(staged).await?;
            check_python_sources(staged).await
        }
        ValidatorKind::AgentCode => {
            check_json_documents(staged).await?;
            check_python_sources(staged).await?;
            check_tool_references(output_data, tools).await
        }
    }
}

fn check_prefix_ownership(
    spec: &StageSpec,
    project_name: &str,
    staged: &[StagedFile],
    layout: &ArtifactLayout,
) -> ForgeResult<()> {
    let own_prefix = layout.stage_prefix(project_name, spec.name);
    let doc_prefix = format!("projects/{project_name}/agents/");
    for file in staged {
        if !file.rel_path.starts_with(&own_prefix) && !file.rel_path.starts_with(&doc_prefix) {
            return Err(ForgeError::Validator(format!(
                "stage {} wrote outside its prefix: {}",
                spec.name, file.rel_path
            )));
        }
    }
    Ok(())
}

async fn check_json_documents(staged: &[StagedFile]) -> ForgeResult<()> {
    for file in staged.iter().filter(|f| f.rel_path.ends_with(".json")) {
        let bytes = tokio::fs::read(&file.scratch_path).await?;
        serde_json::from_slice::<serde_json::Value>(&bytes).map_err(|e| {
            ForgeError::Validator(format!("{}: invalid JSON document: {e}", file.rel_path))
        })?;
    }
    Ok(())
}

async fn check_yaml_documents(staged: &[StagedFile]) -> ForgeResult<()> {
    for file in staged
        .iter()
        .filter(|f| f.rel_path.ends_with(".yaml") || f.rel_path.ends_with(".yml"))
    {
        let bytes = tokio::fs::read(&file.scratch_path).await?;
        serde_yaml_ng::from_slice::<serde_yaml_ng::Value>(&bytes).map_err(|e| {
            ForgeError::Validator(format!("{}: invalid YAML: {e}", file.rel_path))
        })?;
    }
    Ok(())
}

async fn check_python_sources(staged: &[StagedFile]) -> ForgeResult<()> {
    for file in staged.iter().filter(|f| f.rel_path.ends_with(".py")) {
        let bytes = tokio::fs::read(&file.scratch_path).await?;
        let source = String::from_utf8(bytes).map_err(|_| {
            ForgeError::Validator(format!("{}: not valid UTF-8", file.rel_path))
        })?;
        if source.trim().is_empty() {
            return Err(ForgeError::Validator(format!(
                "{}: empty python module",
                file.rel_path
            )));
        }
        if !source.contains("def ") {
            return Err(ForgeError::Validator(format!(
                "{}: no function definitions",
                file.rel_path
            )));
        }
    }
    Ok(())
}

async fn check_tool_references(
    output_data: &serde_json::Map<String, serde_json::Value>,
    tools: &ToolRegistry,
) -> ForgeResult<()> {
    let names: Vec<String> = output_data
        .get("tools_used")
        .and_then(|v| v.as_array())
        .map(|a| {
            a.iter()
                .filter_map(|t| t.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    tools
        .resolve_all(&names)
        .await
        .map_err(|e| ForgeError::Validator(e.to_string()))?;
    Ok(())
}
