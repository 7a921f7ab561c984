//! Artifact persistence for the AgentForge pipeline.
//!
//! Generated files land in a deterministic layout rooted at the workspace
//! directory (the contract consumed by downstream runtime and deployment
//! services):
//!
//! ```text
//! projects/<project_name>/...
//! agents/generated_agents/<project_name>/<agent_name>.py
//! prompts/generated_agents_prompts/<project_name>/<agent_name>.yaml
//! tools/generated_tools/<project_name>/<module>/<tool>.py
//! ```
//!
//! Writes are transactional per stage: files accumulate in a scratch area
//! and move into place atomically on commit, or vanish on abort. Committing
//! an already-committed transaction is a no-op returning the same path set.

/// Path layout helpers.
pub mod layout;
/// Best-effort YAML status mirror.
pub mod mirror;
/// Transactional stage writer.
pub mod writer;

pub use layout::ArtifactLayout;
pub use mirror::write_status_mirror;
pub use writer::{ArtifactWriter, StageTxn, StagedFile};
