//! Core records and error definitions for the AgentForge build pipeline.
//!
//! This crate provides the foundational types shared across all AgentForge
//! crates: the durable entity records (project, task, agent), the per-project
//! control flag, build/control request payloads, and the unified error enum.
//!
//! # Main types
//!
//! - [`ForgeError`] — Unified error enum for all pipeline subsystems.
//! - [`ForgeResult`] — Convenience alias for `Result<T, ForgeError>`.
//! - [`ProjectRecord`] — The unit of a build, with its embedded stage snapshot.
//! - [`TaskRecord`] — A unit of work on the build queue.
//! - [`AgentRecord`] — The artifact of a successful build.
//! - [`ControlFlag`] — User-requested transition observed at stage boundaries.

/// Built-agent records produced by the developer-manager stage.
pub mod agent;
/// Pause/resume/stop/restart control flags and requests.
pub mod control;
/// Project records and embedded stage snapshots.
pub mod project;
/// Build submission payloads and input validation.
pub mod request;
/// Queue task records.
pub mod task;

pub use agent::{AgentRecord, AgentStatus, DeploymentType};
pub use control::{ControlAction, ControlFlag, ControlRequest};
pub use project::{
    ErrorInfo, ProjectRecord, ProjectStatus, StageMetrics, StageSnapshot, StageStatus,
    MAX_STAGE_LOG_LINES,
};
pub use request::BuildRequest;
pub use task::{TaskRecord, TaskStatus, TaskType};

/// Top-level error type for the AgentForge pipeline.
///
/// Variants follow the failure taxonomy of the system: validation errors are
/// surfaced to the caller and never retried, conflicts are retried internally
/// with bounded attempts, transient errors are retried with backoff, and
/// validator failures are deterministic stage failures that roll back their
/// artifacts.
#[derive(Debug, thiserror::Error)]
pub enum ForgeError {
    /// Input violates a contract (bad stage name, unknown project, invalid
    /// control action for the current state).
    #[error("Validation error: {0}")]
    Validation(String),

    /// Optimistic-concurrency failure, duplicate create, or a restart blocked
    /// by a running later stage.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// No such project, task, stage, or agent.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Network, rate-limit, or 5xx failure from the sub-agent runtime.
    #[error("Transient error: {0}")]
    Transient(String),

    /// A validator rejected a generated artifact. Never retried.
    #[error("Validator failure: {0}")]
    Validator(String),

    /// A stage or sub-call exceeded its time budget.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// State store unreachable or disk write failed after retries.
    #[error("Fatal: {0}")]
    Fatal(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ForgeError {
    /// Whether this error is worth retrying with backoff.
    ///
    /// Timeouts carry their own single-retry budget and are handled
    /// separately by the stage executor.
    pub fn is_transient(&self) -> bool {
        matches!(self, ForgeError::Transient(_))
    }

    /// Short classification label used in `error_info` and dashboards.
    pub fn classification(&self) -> &'static str {
        match self {
            ForgeError::Validation(_) => "validation",
            ForgeError::Conflict(_) => "conflict",
            ForgeError::NotFound(_) => "not_found",
            ForgeError::Transient(_) => "transient",
            ForgeError::Validator(_) => "validator",
            ForgeError::Timeout(_) => "timeout",
            ForgeError::Fatal(_) => "fatal",
            ForgeError::Json(_) => "validation",
            ForgeError::Io(_) => "fatal",
        }
    }
}

/// A convenience `Result` alias using [`ForgeError`].
pub type ForgeResult<T> = Result<T, ForgeError>;
