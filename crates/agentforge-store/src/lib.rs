//! State store for the AgentForge build pipeline.
//!
//! Provides ACID-for-a-single-key operations over project, task, and agent
//! records. Every mutator is compare-and-swap on a monotonic version counter;
//! callers retry on conflict with bounded attempts via the
//! [`update_project_with`] / [`update_task_with`] helpers.
//!
//! # Main types
//!
//! - [`ProjectStore`] / [`TaskStore`] / [`AgentStore`] — Entity store traits.
//! - [`MemoryStateStore`] — In-memory implementation with optional JSON
//!   persistence, good enough for a single-node deployment.
//! - [`ProjectFilter`], [`Page`], [`PageResult`] — Listing contracts.

/// In-memory store implementation.
pub mod memory;
/// Store traits and listing contracts.
pub mod store;

pub use memory::MemoryStateStore;
pub use store::{
    update_project_with, update_task_with, AgentStore, Page, PageResult, ProjectFilter,
    ProjectStore, StateStore, TaskStore, CAS_MAX_ATTEMPTS,
};
