//! Worker pool for the AgentForge build pipeline.
//!
//! Each worker runs a loop: claim one build task, drive the project's
//! workflow until it suspends or terminates, persist the result, and release
//! the lease. Workers never block on each other; the only shared state is
//! the state store and the queue. A worker that crashes mid-stage simply
//! stops heartbeating; the lease expires, the task is re-delivered, and the
//! workflow resumes from the last committed stage.

/// Worker pool implementation.
pub mod pool;

pub use pool::{WorkerConfig, WorkerPool};
