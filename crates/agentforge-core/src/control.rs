use crate::project::{ProjectRecord, ProjectStatus};
use crate::{ForgeError, ForgeResult};
use serde::{Deserialize, Serialize};

/// User-requested transition, read at stage boundaries and at the
/// developer-manager fan-in. Setting the flag never interrupts in-flight
/// sub-agent work; the driver observes it at the next gate check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlFlag {
    /// Proceed normally.
    #[default]
    None,
    /// Suspend after the current stage commits.
    Pause,
    /// Transition a paused project back to building.
    Resume,
    /// Cancel the build; the running stage's result is discarded on
    /// completion and state is retained for audit.
    Stop,
    /// Re-run from the named stage.
    Restart {
        /// Stage to reset and re-run.
        from_stage: String,
        /// When true (the default), later stages are also reset and their
        /// artifacts cleared; when false only `from_stage` is re-run.
        #[serde(default = "default_clear_subsequent")]
        clear_subsequent: bool,
    },
}

fn default_clear_subsequent() -> bool {
    true
}

/// The action field of a control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Pause,
    Resume,
    Stop,
    Restart,
}

/// A control request against a project, as submitted by an operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRequest {
    pub action: ControlAction,
    /// Required for `restart`.
    pub from_stage: Option<String>,
    /// Only meaningful for `restart`; defaults to true.
    pub clear_subsequent: Option<bool>,
    /// Free-form operator note, recorded in logs only.
    pub reason: Option<String>,
}

impl ControlRequest {
    /// Validate this request against the project's current status and the
    /// known stage names, and produce the flag to set.
    ///
    /// Rules: `pause` only from `building`; `resume` only from `paused`;
    /// `stop` from any state except `completed` (on `failed` and `cancelled`
    /// projects it settles as an idempotent no-op annotation and never
    /// resurrects the terminal state); `restart` requires a known
    /// `from_stage`.
    pub fn into_flag(self, project: &ProjectRecord) -> ForgeResult<ControlFlag> {
        match self.action {
            ControlAction::Pause => {
                if project.status != ProjectStatus::Building {
                    return Err(ForgeError::Validation(format!(
                        "cannot pause project in status {}",
                        project.status
                    )));
                }
                Ok(ControlFlag::Pause)
            }
            ControlAction::Resume => {
                if project.status != ProjectStatus::Paused {
                    return Err(ForgeError::Validation(format!(
                        "cannot resume project in status {}",
                        project.status
                    )));
                }
                Ok(ControlFlag::Resume)
            }
            ControlAction::Stop => {
                if project.status == ProjectStatus::Completed {
                    return Err(ForgeError::Validation(format!(
                        "cannot stop project in terminal status {}",
                        project.status
                    )));
                }
                Ok(ControlFlag::Stop)
            }
            ControlAction::Restart => {
                let from_stage = self.from_stage.ok_or_else(|| {
                    ForgeError::Validation("restart requires from_stage".to_string())
                })?;
                if project.stage(&from_stage).is_none() {
                    return Err(ForgeError::Validation(format!(
                        "unknown stage name: {from_stage}"
                    )));
                }
                Ok(ControlFlag::Restart {
                    from_stage,
                    clear_subsequent: self.clear_subsequent.unwrap_or(true),
                })
            }
        }
    }
}
