//! Priority build queue for the AgentForge pipeline.
//!
//! Delivery is at-least-once: a claimed task is protected by a lease with a
//! visibility timeout, and returns to the ready set when the holder's
//! heartbeat lapses. Higher priority runs first, FIFO within equal priority.
//! Failures are retried with exponential backoff (base 2s, cap 60s) up to the
//! task's `max_retries`; terminal tasks are never re-delivered.
//!
//! The claim step doubles as the single-concurrent-build mutex: a build task
//! whose project already holds an active lease is skipped and stays ready
//! until the first build terminates or is paused.

/// Queue implementation.
pub mod queue;

pub use queue::{BuildQueue, FailOutcome, Lease, QueuePolicy};
