// src/dag/mod.rs

//! Task graph representation.
//!
//! - [`task`] defines tasks, the callable interface and the per-attempt
//!   [`RunContext`].
//! - [`graph`] holds the validated, immutable [`TaskGraph`].

/// Canonical task id type used throughout the engine.
pub type TaskName = String;

/// Canonical graph id type.
pub type GraphId = String;

pub mod graph;
pub mod task;

pub use graph::TaskGraph;
pub use task::{task_fn, RunContext, TaskCallable, TaskDefinition, TaskError, TaskFuture, TaskResult};
