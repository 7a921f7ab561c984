use crate::layout::ArtifactLayout;
use agentforge_core::ProjectRecord;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

/// Shape of the `status.yaml` mirror file.
#[derive(Debug, Serialize)]
struct StatusMirror<'a> {
    project_id: &'a str,
    project_name: &'a str,
    status: String,
    progress: u8,
    current_stage: Option<&'a str>,
    updated_at: DateTime<Utc>,
}

/// Write the best-effort `projects/<name>/status.yaml` mirror.
///
/// Mirrors never fail the pipeline; errors are logged and swallowed. The
/// durable source of truth stays in the state store.
pub async fn write_status_mirror(layout: &ArtifactLayout, project: &ProjectRecord) {
    let mirror = StatusMirror {
        project_id: &project.project_id,
        project_name: &project.project_name,
        status: project.status.to_string(),
        progress: project.progress,
        current_stage: project.current_stage.as_deref(),
        updated_at: project.updated_at,
    };
    let yaml = match serde_yaml_ng::to_string(&mirror) {
        Ok(yaml) => yaml,
        Err(e) => {
            warn!(project_id = %project.project_id, error = %e, "Status mirror serialization failed");
            return;
        }
    };
    let path = layout.absolute(&layout.project_status(&project.project_name));
    if let Some(parent) = path.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            warn!(project_id = %project.project_id, error = %e, "Status mirror directory creation failed");
            return;
        }
    }
    if let Err(e) = tokio::fs::write(&path, yaml).await {
        warn!(project_id = %project.project_id, error = %e, "Status mirror write failed");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use agentforge_core::{BuildRequest, StageSnapshot};

    #[tokio::test]
    async fn test_status_mirror_written() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = ArtifactLayout::new(tmp.path());
        let request = BuildRequest::new("demo requirement").with_project_name("demo");
        let project = ProjectRecord::new(
            &request,
            "demo",
            vec![StageSnapshot::new("orchestrator", 1, "Orchestrator")],
        );

        write_status_mirror(&layout, &project).await;

        let path = tmp.path().join("projects/demo/status.yaml");
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("project_name: demo"));
        assert!(content.contains("status: pending"));
    }
}
