// src/types.rs

use std::fmt;

use serde::{Deserialize, Serialize};

/// Aggregate state of a DAG run.
///
/// - `Pending`: created, not yet evaluated by the scheduler.
/// - `Running`: at least one instance is still non-terminal and nothing failed.
/// - `Success`: every instance succeeded.
/// - `Failed`: some instance failed permanently or was blocked upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Pending,
    Running,
    Success,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Success | RunState::Failed)
    }
}

/// State of one task within one DAG run.
///
/// State transitions:
/// - Pending -> Queued -> Running -> Success
/// - Running -> Pending (retry scheduled, `retry_at` set)
/// - Running -> Failed (retries exhausted)
/// - Pending -> UpstreamFailed (an upstream instance failed terminally)
/// - Queued/Running -> Pending (crash recovery on reload)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    Pending,
    Queued,
    Running,
    Success,
    Failed,
    UpstreamFailed,
}

impl InstanceState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InstanceState::Success | InstanceState::Failed | InstanceState::UpstreamFailed
        )
    }

    /// Failed for good: no retry will ever turn this into a success.
    pub fn is_failed(self) -> bool {
        matches!(self, InstanceState::Failed | InstanceState::UpstreamFailed)
    }

    /// Claimed by an executor (in-flight).
    pub fn is_claimed(self) -> bool {
        matches!(self, InstanceState::Queued | InstanceState::Running)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceState::Pending => "pending",
            InstanceState::Queued => "queued",
            InstanceState::Running => "running",
            InstanceState::Success => "success",
            InstanceState::Failed => "failed",
            InstanceState::UpstreamFailed => "upstream_failed",
        };
        f.write_str(s)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Pending => "pending",
            RunState::Running => "running",
            RunState::Success => "success",
            RunState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// How a DAG run came into existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunTrigger {
    /// Materialized by the scheduler from the graph's schedule.
    #[default]
    Scheduled,
    /// Created through `Engine::trigger_run` (e.g. the `--trigger` flag).
    Manual,
}

impl fmt::Display for RunTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunTrigger::Scheduled => f.write_str("scheduled"),
            RunTrigger::Manual => f.write_str("manual"),
        }
    }
}
