// src/store/model.rs

//! Persistent records: DAG runs, task instances and their keys.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dag::{GraphId, TaskName};
use crate::types::{InstanceState, RunState, RunTrigger};

/// Identity of a DAG run: (graph id, logical timestamp).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunKey {
    pub graph_id: GraphId,
    pub logical_ts: DateTime<Utc>,
}

impl RunKey {
    pub fn new(graph_id: impl Into<GraphId>, logical_ts: DateTime<Utc>) -> Self {
        Self {
            graph_id: graph_id.into(),
            logical_ts,
        }
    }

    pub fn instance(&self, task_id: impl Into<TaskName>) -> InstanceKey {
        InstanceKey {
            run: self.clone(),
            task_id: task_id.into(),
        }
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.graph_id, self.logical_ts.to_rfc3339())
    }
}

/// Identity of a task instance: (graph id, logical timestamp, task id).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceKey {
    pub run: RunKey,
    pub task_id: TaskName,
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.run, self.task_id)
    }
}

/// One scheduled (or manually triggered) execution of a whole graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagRun {
    pub graph_id: GraphId,
    pub logical_ts: DateTime<Utc>,
    pub state: RunState,
    #[serde(default)]
    pub trigger: RunTrigger,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DagRun {
    pub fn key(&self) -> RunKey {
        RunKey::new(self.graph_id.clone(), self.logical_ts)
    }
}

/// One task within one DAG run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInstance {
    pub graph_id: GraphId,
    pub logical_ts: DateTime<Utc>,
    pub task_id: TaskName,
    pub state: InstanceState,
    /// Attempts started so far (an attempt starts at QUEUED -> RUNNING).
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Earliest time a PENDING instance awaiting retry may be dispatched.
    #[serde(default)]
    pub retry_at: Option<DateTime<Utc>>,
}

impl TaskInstance {
    pub(crate) fn new(run: &RunKey, task_id: impl Into<TaskName>) -> Self {
        Self {
            graph_id: run.graph_id.clone(),
            logical_ts: run.logical_ts,
            task_id: task_id.into(),
            state: InstanceState::Pending,
            attempts: 0,
            last_attempt_at: None,
            last_error: None,
            retry_at: None,
        }
    }

    pub fn run_key(&self) -> RunKey {
        RunKey::new(self.graph_id.clone(), self.logical_ts)
    }

    pub fn key(&self) -> InstanceKey {
        self.run_key().instance(self.task_id.clone())
    }

    /// True unless a retry deferral is still in the future.
    pub fn retry_elapsed(&self, now: DateTime<Utc>) -> bool {
        self.retry_at.is_none_or(|at| at <= now)
    }
}

/// Side effects attached to a state transition.
///
/// `retry_at` is always replaced by the value carried here, so it is only
/// ever set on an instance that was just deferred.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionMeta {
    /// Marks the start of an attempt: bumps `attempts` and stamps
    /// `last_attempt_at`.
    pub attempt_started: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub retry_at: Option<DateTime<Utc>>,
}

impl TransitionMeta {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn attempt_started(at: DateTime<Utc>) -> Self {
        Self {
            attempt_started: Some(at),
            ..Self::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn with_retry_at(mut self, at: DateTime<Utc>) -> Self {
        self.retry_at = Some(at);
        self
    }
}

/// Whole-store image written by persistence backends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub runs: Vec<DagRun>,
    pub instances: Vec<TaskInstance>,
}

/// Newest version of one record, as appended to a persistence log.
///
/// Replaying records in order and keeping the last version per key
/// rebuilds the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum StoreRecord {
    Run(DagRun),
    Instance(TaskInstance),
}
