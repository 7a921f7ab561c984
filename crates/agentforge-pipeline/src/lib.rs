//! Build pipeline for AgentForge: the fixed seven-stage workflow that turns
//! a natural-language requirement into a working agent package.
//!
//! The pipeline's own topology is fixed; any multi-agent orchestration a
//! build produces is data, not control flow. Stages execute strictly in
//! order except the developer-manager fan-out, whose three sub-stages run in
//! parallel and synchronize at a fan-in barrier.
//!
//! # Main types
//!
//! - [`StageRegistry`] — Declarative stage catalog with sub-stage expansion.
//! - [`ControlGate`] — Pause/resume/stop/restart signals at stage boundaries.
//! - [`StageExecutor`] — Runs one stage: sub-agent, telemetry, artifacts, validators.
//! - [`WorkflowDriver`] — Per-project state machine over the stage sequence.
//! - [`BuildService`] — Submission, control, and delete operations.
//! - [`SubAgent`] — Strategy trait implemented by stage bodies.

/// Stage event stream surfaced to transports.
pub mod events;
/// Stage executor.
pub mod executor;
/// Control-flag gate.
pub mod gate;
/// Pipeline policy knobs.
pub mod policy;
/// Stage catalog.
pub mod registry;
/// Submission and control operations.
pub mod service;
/// Sub-agent strategy trait and built-in template bodies.
pub mod subagent;
/// Typed registry for generated tools.
pub mod toolreg;
/// Artifact validators.
pub mod validator;
/// Workflow driver.
pub mod driver;

pub use driver::{DriveOutcome, WorkflowDriver};
pub use events::{EventSink, StageEvent};
pub use executor::{StageExecutor, StageOutcome};
pub use gate::{ControlGate, GateDecision};
pub use policy::PipelinePolicy;
pub use registry::{NextWork, StageRegistry, StageSpec, ValidatorKind};
pub use service::{BuildService, SubmitReceipt};
pub use subagent::{
    template_factory, CancelHandle, GeneratedFile, StageContext, SubAgent, SubAgentFactory,
    SubAgentOutput,
};
pub use toolreg::{ToolDeclaration, ToolRegistry};
