// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Parser, ValueEnum};

/// Command-line arguments for `tickdag`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "tickdag",
    version,
    about = "Run DAGs of shell tasks on a fixed schedule, with retries and crash recovery.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    ///
    /// Default: `Tickdag.toml` in the current working directory.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Override `[engine].state_dir`.
    #[arg(long, value_name = "DIR")]
    pub state_dir: Option<PathBuf>,

    /// Tick until every due run has finished (or is waiting on nothing),
    /// then exit instead of running forever.
    #[arg(long)]
    pub once: bool,

    /// Parse + validate, print DAGs and due runs, but don't execute anything
    /// or touch the state directory.
    #[arg(long, conflicts_with_all = ["list_runs", "once"])]
    pub dry_run: bool,

    /// Print stored DAG runs and task instance states, then exit.
    #[arg(long, conflicts_with = "once")]
    pub list_runs: bool,

    /// Manually create a run, e.g. `--trigger weather@2024-03-01T00:00:00Z`.
    /// May be given several times.
    #[arg(long, value_name = "DAG@TIMESTAMP", value_parser = parse_trigger)]
    pub trigger: Vec<TriggerSpec>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `TICKDAG_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Parsed `--trigger` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerSpec {
    pub graph_id: String,
    pub logical_ts: DateTime<Utc>,
}

fn parse_trigger(s: &str) -> Result<TriggerSpec, String> {
    let (graph_id, ts) = s
        .rsplit_once('@')
        .ok_or_else(|| format!("expected <DAG>@<RFC3339 timestamp>, got '{s}'"))?;
    if graph_id.is_empty() {
        return Err(format!("missing DAG id in '{s}'"));
    }
    let logical_ts = DateTime::parse_from_rfc3339(ts)
        .map_err(|e| format!("invalid timestamp '{ts}': {e}"))?
        .with_timezone(&Utc);
    Ok(TriggerSpec {
        graph_id: graph_id.to_string(),
        logical_ts,
    })
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
