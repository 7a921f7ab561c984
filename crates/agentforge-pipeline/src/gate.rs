use agentforge_core::{ControlFlag, ForgeResult};
use agentforge_store::{ProjectStore, StateStore};
use std::sync::Arc;

/// What the driver should do at a stage boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// No flag (or a resume flag): run the next stage.
    Proceed,
    /// Suspend after committing the current stage.
    Pause,
    /// Cancel; uncommitted results are discarded.
    Stop,
    /// Reset the named stage (and later ones when clearing) and re-run.
    Restart {
        from_stage: String,
        clear_subsequent: bool,
    },
}

impl GateDecision {
    /// Map a control flag to a decision. `Resume` reads as proceed: the
    /// driver clears the flag when it picks the project back up.
    pub fn from_flag(flag: &ControlFlag) -> Self {
        match flag {
            ControlFlag::None | ControlFlag::Resume => GateDecision::Proceed,
            ControlFlag::Pause => GateDecision::Pause,
            ControlFlag::Stop => GateDecision::Stop,
            ControlFlag::Restart {
                from_stage,
                clear_subsequent,
            } => GateDecision::Restart {
                from_stage: from_stage.clone(),
                clear_subsequent: *clear_subsequent,
            },
        }
    }
}

/// Reads the per-project control flag at stage boundaries.
///
/// The flag is consulted only here: immediately before executing a stage,
/// immediately after completing one, and at the developer-manager fan-in.
/// In-flight sub-agent work is never interrupted by a flag change.
pub struct ControlGate {
    store: Arc<dyn StateStore>,
}

impl ControlGate {
    /// Gate over the given store.
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Fresh read of the project's flag.
    pub async fn check(&self, project_id: &str) -> ForgeResult<GateDecision> {
        let project = self.store.get_project(project_id).await?;
        Ok(GateDecision::from_flag(&project.control_flag))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_mapping() {
        assert_eq!(GateDecision::from_flag(&ControlFlag::None), GateDecision::Proceed);
        assert_eq!(
            GateDecision::from_flag(&ControlFlag::Resume),
            GateDecision::Proceed
        );
        assert_eq!(GateDecision::from_flag(&ControlFlag::Pause), GateDecision::Pause);
        assert_eq!(GateDecision::from_flag(&ControlFlag::Stop), GateDecision::Stop);
        assert_eq!(
            GateDecision::from_flag(&ControlFlag::Restart {
                from_stage: "agent_designer".into(),
                clear_subsequent: true
            }),
            GateDecision::Restart {
                from_stage: "agent_designer".into(),
                clear_subsequent: true
            }
        );
    }
}
