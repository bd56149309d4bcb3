// src/errors.rs

//! Crate-wide error type and result alias.
//!
//! Task callables never produce a `TickdagError`: their failures are plain
//! values ([`crate::dag::TaskError`]) that the executor records on the task
//! instance. Everything here is an engine-level error.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::InstanceState;

#[derive(Error, Debug)]
pub enum TickdagError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Cycle detected in DAG: {0}")]
    DagCycle(String),

    #[error("DAG run already exists: dag '{graph}' at {logical_ts}")]
    DuplicateRun {
        graph: String,
        logical_ts: DateTime<Utc>,
    },

    #[error("Conflicting transition for {instance}: expected {expected:?}, found {actual:?}")]
    Conflict {
        instance: String,
        expected: InstanceState,
        actual: InstanceState,
    },

    #[error("Unknown DAG: {0}")]
    UnknownGraph(String),

    #[error("Unknown DAG run: {0}")]
    UnknownRun(String),

    #[error("Unknown task instance: {0}")]
    UnknownInstance(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TickdagError {
    /// `DuplicateRun` and `Conflict` are expected under normal operation;
    /// callers re-read state instead of giving up.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            TickdagError::DuplicateRun { .. } | TickdagError::Conflict { .. }
        )
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, TickdagError>;
