use crate::layout::ArtifactLayout;
use agentforge_core::{ForgeError, ForgeResult};
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{debug, warn};
use uuid::Uuid;

/// A file staged inside an open transaction, readable by validators before
/// commit.
#[derive(Debug, Clone)]
pub struct StagedFile {
    /// Workspace-relative destination path.
    pub rel_path: String,
    /// Absolute location in the scratch area.
    pub scratch_path: PathBuf,
}

#[derive(Debug)]
enum TxnState {
    Open,
    Committed(Vec<String>),
    Aborted,
}

/// One stage's write transaction. Files accumulate under a scratch
/// directory and only reach their final paths on commit.
#[derive(Debug)]
pub struct StageTxn {
    handle: String,
    stage_name: String,
    scratch: PathBuf,
    files: Vec<StagedFile>,
    state: TxnState,
}

impl StageTxn {
    /// Opaque transaction handle id.
    pub fn handle(&self) -> &str {
        &self.handle
    }

    /// The stage this transaction belongs to.
    pub fn stage_name(&self) -> &str {
        &self.stage_name
    }

    /// Files staged so far.
    pub fn staged(&self) -> &[StagedFile] {
        &self.files
    }
}

/// Transactional writer for stage artifacts.
///
/// Protocol per stage: `begin` → `put`* → `commit` or `abort`. Commit moves
/// the scratch set into place atomically (per file rename) and returns the
/// workspace-relative paths for the caller to record in the stage's
/// `output_data.artifacts` within the same conditional state update.
pub struct ArtifactWriter {
    layout: ArtifactLayout,
}

impl ArtifactWriter {
    /// Writer over the given layout.
    pub fn new(layout: ArtifactLayout) -> Self {
        Self { layout }
    }

    /// The layout this writer targets.
    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    /// Open a transaction for a stage attempt.
    pub async fn begin(&self, stage_name: &str) -> ForgeResult<StageTxn> {
        let handle = Uuid::new_v4().to_string();
        let scratch = self.layout.root().join(".staging").join(&handle);
        tokio::fs::create_dir_all(&scratch).await?;
        debug!(stage = stage_name, handle = %handle, "Artifact transaction opened");
        Ok(StageTxn {
            handle,
            stage_name: stage_name.to_string(),
            scratch,
            files: Vec::new(),
            state: TxnState::Open,
        })
    }

    /// Stage one file at a workspace-relative path.
    pub async fn put(&self, txn: &mut StageTxn, rel_path: &str, bytes: &[u8]) -> ForgeResult<()> {
        if !matches!(txn.state, TxnState::Open) {
            return Err(ForgeError::Conflict(format!(
                "transaction {} is no longer open",
                txn.handle
            )));
        }
        if rel_path.starts_with('/') || rel_path.split('/').any(|part| part == "..") {
            return Err(ForgeError::Validation(format!(
                "artifact path '{rel_path}' escapes the workspace"
            )));
        }
        let scratch_path = txn.scratch.join(rel_path);
        if let Some(parent) = scratch_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&scratch_path, bytes).await?;
        txn.files.push(StagedFile {
            rel_path: rel_path.to_string(),
            scratch_path,
        });
        Ok(())
    }

    /// Atomically move the scratch set into place and return the committed
    /// paths. Duplicate paths within the transaction fail the commit.
    /// Repeated commit of an already-committed transaction is a no-op
    /// returning the same path set.
    pub async fn commit(&self, txn: &mut StageTxn) -> ForgeResult<Vec<String>> {
        match &txn.state {
            TxnState::Committed(paths) => return Ok(paths.clone()),
            TxnState::Aborted => {
                return Err(ForgeError::Conflict(format!(
                    "transaction {} was aborted",
                    txn.handle
                )))
            }
            TxnState::Open => {}
        }

        let mut seen = HashSet::new();
        let mut duplicate = None;
        for file in &txn.files {
            if !seen.insert(file.rel_path.clone()) {
                duplicate = Some(file.rel_path.clone());
                break;
            }
        }
        if let Some(rel_path) = duplicate {
            self.abort(txn).await?;
            return Err(ForgeError::Validator(format!(
                "duplicate artifact path in commit: {rel_path}"
            )));
        }

        let mut committed = Vec::with_capacity(txn.files.len());
        for file in &txn.files {
            let dest = self.layout.absolute(&file.rel_path);
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::rename(&file.scratch_path, &dest).await?;
            committed.push(file.rel_path.clone());
        }
        self.remove_scratch(txn).await;
        debug!(
            stage = %txn.stage_name,
            handle = %txn.handle,
            files = committed.len(),
            "Artifact transaction committed"
        );
        txn.state = TxnState::Committed(committed.clone());
        Ok(committed)
    }

    /// Discard the scratch set. Used for rollback on validator failure and
    /// for uncommitted work after a stop flag.
    pub async fn abort(&self, txn: &mut StageTxn) -> ForgeResult<()> {
        if matches!(txn.state, TxnState::Committed(_)) {
            return Err(ForgeError::Conflict(format!(
                "transaction {} already committed",
                txn.handle
            )));
        }
        self.remove_scratch(txn).await;
        txn.state = TxnState::Aborted;
        debug!(stage = %txn.stage_name, handle = %txn.handle, "Artifact transaction aborted");
        Ok(())
    }

    /// Unlink previously committed files, as recorded in a stage snapshot.
    /// The restart policy: prior files go first, then the re-run writes new
    /// ones. Missing files are ignored.
    pub async fn remove_committed(&self, rel_paths: &[String]) -> ForgeResult<()> {
        for rel in rel_paths {
            let path = self.layout.absolute(rel);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(path = %path.display(), "Removed prior artifact"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(ForgeError::Io(e)),
            }
        }
        Ok(())
    }

    async fn remove_scratch(&self, txn: &StageTxn) {
        if let Err(e) = tokio::fs::remove_dir_all(&txn.scratch).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(handle = %txn.handle, error = %e, "Scratch cleanup failed");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn writer(tmp: &tempfile::TempDir) -> ArtifactWriter {
        ArtifactWriter::new(ArtifactLayout::new(tmp.path()))
    }

    #[tokio::test]
    async fn test_commit_moves_files_into_place() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = writer(&tmp);

        let mut txn = writer.begin("tool_developer").await.unwrap();
        writer
            .put(&mut txn, "tools/generated_tools/demo/api/fetch.py", b"def fetch(): ...")
            .await
            .unwrap();
        writer
            .put(&mut txn, "projects/demo/agents/demo/tools_developer.json", b"{}")
            .await
            .unwrap();

        // Nothing visible before commit.
        assert!(!tmp.path().join("tools/generated_tools/demo/api/fetch.py").exists());

        let paths = writer.commit(&mut txn).await.unwrap();
        assert_eq!(paths.len(), 2);
        assert!(tmp.path().join("tools/generated_tools/demo/api/fetch.py").exists());
        assert!(!tmp.path().join(".staging").join(txn.handle()).exists());
    }

    #[tokio::test]
    async fn test_commit_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = writer(&tmp);
        let mut txn = writer.begin("orchestrator").await.unwrap();
        writer
            .put(&mut txn, "projects/demo/config.yaml", b"name: demo")
            .await
            .unwrap();
        let first = writer.commit(&mut txn).await.unwrap();
        let second = writer.commit(&mut txn).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_abort_discards_scratch() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = writer(&tmp);
        let mut txn = writer.begin("prompt_engineer").await.unwrap();
        writer
            .put(&mut txn, "prompts/generated_agents_prompts/demo/demo.yaml", b"bad: [")
            .await
            .unwrap();
        writer.abort(&mut txn).await.unwrap();
        assert!(!tmp
            .path()
            .join("prompts/generated_agents_prompts/demo/demo.yaml")
            .exists());
        assert!(writer.commit(&mut txn).await.is_err());
    }

    #[tokio::test]
    async fn test_duplicate_path_fails_commit() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = writer(&tmp);
        let mut txn = writer.begin("agent_code_developer").await.unwrap();
        writer
            .put(&mut txn, "agents/generated_agents/demo/demo.py", b"v1")
            .await
            .unwrap();
        writer
            .put(&mut txn, "agents/generated_agents/demo/demo.py", b"v2")
            .await
            .unwrap();
        let err = writer.commit(&mut txn).await;
        assert!(matches!(err, Err(ForgeError::Validator(_))));
        assert!(!tmp.path().join("agents/generated_agents/demo/demo.py").exists());
    }

    #[tokio::test]
    async fn test_path_escape_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = writer(&tmp);
        let mut txn = writer.begin("orchestrator").await.unwrap();
        assert!(writer.put(&mut txn, "../outside.txt", b"x").await.is_err());
        assert!(writer.put(&mut txn, "/etc/passwd", b"x").await.is_err());
    }

    #[tokio::test]
    async fn test_remove_committed_for_restart() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = writer(&tmp);
        let mut txn = writer.begin("tool_developer").await.unwrap();
        writer
            .put(&mut txn, "tools/generated_tools/demo/api/fetch.py", b"v1")
            .await
            .unwrap();
        let paths = writer.commit(&mut txn).await.unwrap();

        writer.remove_committed(&paths).await.unwrap();
        assert!(!tmp.path().join("tools/generated_tools/demo/api/fetch.py").exists());
        // Idempotent on missing files.
        writer.remove_committed(&paths).await.unwrap();
    }
}
