// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::dag::{TaskDefinition, TaskGraph};
use crate::engine::EngineOptions;
use crate::errors::Result;
use crate::exec::ShellCommand;
use crate::schedule::Schedule;

/// Configuration exactly as read from a TOML file:
///
/// ```toml
/// [engine]
/// tick_interval = "1s"
/// max_active_tasks = 16
/// state_dir = ".tickdag"
///
/// [default]
/// retries = 1
/// retry_delay = "5m"
///
/// [dag.weather]
/// start = "2024-01-01T00:00:00Z"
/// interval = "10m"
///
/// [dag.weather.task.fetch]
/// cmd = "curl -sf https://example.com/weather > weather.json"
///
/// [dag.weather.task.merge]
/// cmd = "python merge.py"
/// after = ["fetch"]
/// retries = 3
/// retry_delay = "30s"
/// ```
///
/// Durations are `<n><unit>` with unit `ms`, `s`, `m`, `h` or `d`. Nothing
/// here is validated; see [`ConfigFile`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfigFile {
    #[serde(default)]
    pub engine: EngineSection,

    /// Fallback retry policy for tasks that don't set their own.
    #[serde(default)]
    pub default: DefaultSection,

    /// All DAGs from `[dag.<id>]`.
    #[serde(default)]
    pub dag: BTreeMap<String, DagConfig>,
}

/// `[engine]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineSection {
    #[serde(default = "default_tick_interval")]
    pub tick_interval: String,

    #[serde(default = "default_max_active_tasks")]
    pub max_active_tasks: usize,

    /// Directory holding the persisted run state.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

fn default_tick_interval() -> String {
    "1s".to_string()
}

fn default_max_active_tasks() -> usize {
    16
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".tickdag")
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            tick_interval: default_tick_interval(),
            max_active_tasks: default_max_active_tasks(),
            state_dir: default_state_dir(),
        }
    }
}

/// `[default]` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DefaultSection {
    #[serde(default)]
    pub retries: u32,

    /// Unset means retry on the next tick.
    #[serde(default)]
    pub retry_delay: Option<String>,
}

/// `[dag.<id>]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DagConfig {
    /// RFC 3339 timestamp of the first logical run.
    pub start: DateTime<Utc>,

    pub interval: String,

    /// `false`: only the latest missed interval is scheduled.
    #[serde(default = "default_catchup")]
    pub catchup: bool,

    /// Tasks from `[dag.<id>.task.<name>]`, keyed by task id.
    #[serde(default)]
    pub task: BTreeMap<String, TaskConfig>,
}

fn default_catchup() -> bool {
    true
}

/// `[dag.<id>.task.<name>]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskConfig {
    /// Shell command to run.
    pub cmd: String,

    /// Upstream task ids within the same DAG.
    #[serde(default)]
    pub after: Vec<String>,

    /// Overrides `[default].retries`.
    #[serde(default)]
    pub retries: Option<u32>,

    /// Overrides `[default].retry_delay`.
    #[serde(default)]
    pub retry_delay: Option<String>,
}

/// Validated configuration with durations parsed and defaults applied.
///
/// Only obtainable through `TryFrom<RawConfigFile>` (see `validate.rs`).
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub engine: EngineConfig,
    pub dags: BTreeMap<String, DagSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub tick_interval: Duration,
    pub max_active_tasks: usize,
    pub state_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DagSpec {
    pub schedule: Schedule,
    pub tasks: BTreeMap<String, TaskSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    pub cmd: String,
    pub after: Vec<String>,
    pub retries: u32,
    pub retry_delay: Duration,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(engine: EngineConfig, dags: BTreeMap<String, DagSpec>) -> Self {
        Self { engine, dags }
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            tick_interval: self.engine.tick_interval,
            max_active_tasks: self.engine.max_active_tasks,
        }
    }

    /// Build one [`TaskGraph`] per configured DAG, every task running its
    /// `cmd` through a [`ShellCommand`].
    pub fn task_graphs(&self) -> Result<Vec<TaskGraph>> {
        self.dags
            .iter()
            .map(|(id, dag)| {
                let defs = dag.tasks.iter().map(|(name, task)| {
                    task.after.iter().fold(
                        TaskDefinition::new(name.as_str(), Arc::new(ShellCommand::new(&task.cmd)))
                            .with_retries(task.retries, task.retry_delay),
                        |def, dep| def.after(dep.as_str()),
                    )
                });
                TaskGraph::build(id.as_str(), dag.schedule, defs)
            })
            .collect()
    }
}
