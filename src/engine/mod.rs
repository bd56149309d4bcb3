// src/engine/mod.rs

//! Scheduler loop.
//!
//! The [`Engine`] owns the graph registry, the state store, the clock and
//! the executor. One call to [`Engine::tick`] materializes due DAG runs,
//! propagates upstream failures, dispatches every ready task instance and
//! recomputes run states, without ever waiting for a task to finish.
//!
//! The tick logic lives in [`core`]; the interval-driven async shell with its
//! start/stop lifecycle lives in [`runtime`].

use std::time::Duration;

use crate::store::{InstanceKey, RunKey};
use crate::types::RunState;

/// Tunables of the scheduler loop.
#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    /// Pause between ticks of the background loop.
    pub tick_interval: Duration,
    /// Upper bound on concurrently running task callables.
    pub max_active_tasks: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            max_active_tasks: 16,
        }
    }
}

/// What one or more ticks did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Runs created from schedules.
    pub created: Vec<RunKey>,
    /// Instances claimed and handed to the executor.
    pub dispatched: Vec<InstanceKey>,
    /// QUEUED or RUNNING instances with no live execution, put back to
    /// PENDING.
    pub released: Vec<InstanceKey>,
    /// Instances marked UPSTREAM_FAILED.
    pub blocked: Vec<InstanceKey>,
    /// Runs this tick found SUCCESS or FAILED when recomputing them.
    /// Runs finished by the executor between ticks are not listed.
    pub finished: Vec<(RunKey, RunState)>,
    /// Graphs, runs or instances that failed to advance and were skipped.
    pub errors: usize,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty()
            && self.dispatched.is_empty()
            && self.released.is_empty()
            && self.blocked.is_empty()
            && self.finished.is_empty()
            && self.errors == 0
    }

    pub fn merge(&mut self, other: TickReport) {
        self.created.extend(other.created);
        self.dispatched.extend(other.dispatched);
        self.released.extend(other.released);
        self.blocked.extend(other.blocked);
        self.finished.extend(other.finished);
        self.errors += other.errors;
    }
}

pub mod core;
pub mod runtime;

pub use core::Engine;
pub use runtime::EngineHandle;
