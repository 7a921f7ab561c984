//! Build dashboard for AgentForge: a pure read-side projection merging the
//! project record, its embedded stage snapshot, and the latest task into one
//! view with derived metrics and an ETA. Stale reads are tolerated; the
//! writer side never depends on this crate.

/// Dashboard projection.
pub mod view;

pub use view::{BuildDashboard, DashboardSnapshot, StageView, TaskView};
