// src/lib.rs

pub mod cli;
pub mod config;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod fs;
pub mod logging;
pub mod schedule;
pub mod store;
pub mod types;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::cli::CliArgs;
use crate::config::{default_config_path, load_and_validate, ConfigFile};
use crate::dag::TaskGraph;
use crate::engine::Engine;
use crate::schedule::{due_runs, Clock, SystemClock};
use crate::store::{JsonFilePersistence, StateStore};

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading and graph construction
/// - the persistent state store (with crash recovery)
/// - the engine and its scheduler loop
/// - Ctrl-C handling
pub async fn run(args: CliArgs) -> Result<()> {
    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    let cfg = load_and_validate(&config_path)?;
    let graphs = cfg.task_graphs()?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    if args.dry_run {
        print_dry_run(&cfg, &graphs, clock.now());
        return Ok(());
    }

    let state_dir = resolve_state_dir(&config_path, args.state_dir.as_deref(), &cfg);
    info!(state_dir = %state_dir.display(), "opening state store");
    let store = Arc::new(StateStore::open(
        Arc::new(JsonFilePersistence::in_dir(&state_dir)),
        Arc::clone(&clock),
    )?);

    if args.list_runs {
        print_runs(&store);
        return Ok(());
    }

    let mut engine = Engine::new(store, clock, cfg.engine_options());
    for graph in graphs {
        engine.register(graph)?;
    }

    for spec in &args.trigger {
        match engine.trigger_run(&spec.graph_id, spec.logical_ts) {
            Ok(run) => info!(run = %run.key(), "manual run created"),
            Err(err) if err.is_benign() => warn!(error = %err, "manual run already exists"),
            Err(err) => return Err(err.into()),
        }
    }

    if args.once {
        let report = engine.run_until_idle().await?;
        if report.errors > 0 {
            warn!(errors = report.errors, "some runs could not be advanced; see errors above");
        }
        print_runs(engine.store());
        return Ok(());
    }

    let handle = engine.start();
    tokio::signal::ctrl_c()
        .await
        .context("listening for Ctrl-C")?;
    info!("Ctrl-C received; shutting down");
    handle.stop().await?;
    Ok(())
}

/// `[engine].state_dir` (or the `--state-dir` override); relative paths are
/// taken relative to the config file's directory.
fn resolve_state_dir(config_path: &Path, cli_dir: Option<&Path>, cfg: &ConfigFile) -> PathBuf {
    if let Some(dir) = cli_dir {
        return dir.to_path_buf();
    }
    let dir = &cfg.engine.state_dir;
    if dir.is_absolute() {
        return dir.clone();
    }
    config_root_dir(config_path).join(dir)
}

/// - If the config path has a non-empty parent (e.g. "configs/Tickdag.toml"),
///   we use that directory.
/// - If it's just a bare filename like "Tickdag.toml" (parent = ""),
///   we fall back to the current working directory "."
fn config_root_dir(config_path: &Path) -> PathBuf {
    match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    }
}

/// Print DAGs, tasks and what is due right now, without touching state.
fn print_dry_run(cfg: &ConfigFile, graphs: &[TaskGraph], now: DateTime<Utc>) {
    println!("tickdag dry-run");
    println!("  engine.tick_interval = {:?}", cfg.engine.tick_interval);
    println!("  engine.max_active_tasks = {}", cfg.engine.max_active_tasks);
    println!("  engine.state_dir = {}", cfg.engine.state_dir.display());
    println!();

    for graph in graphs {
        println!("dag {} ({})", graph.id(), graph.schedule());
        for task_id in graph.topological_order() {
            let Some(spec) = cfg.dags.get(graph.id()).and_then(|d| d.tasks.get(task_id)) else {
                continue;
            };
            println!("  - {task_id}");
            println!("      cmd: {}", spec.cmd);
            if !spec.after.is_empty() {
                println!("      after: {:?}", spec.after);
            }
            if spec.retries > 0 {
                println!("      retries: {} (delay {:?})", spec.retries, spec.retry_delay);
            }
        }

        let none = Default::default();
        let mut due = due_runs(graph.schedule(), now, &none);
        match due.next() {
            Some(first) => {
                let (count, last) = due.fold((1usize, first), |(n, _), ts| (n + 1, ts));
                println!(
                    "  due runs at {}: {} ({} .. {})",
                    now.to_rfc3339(),
                    count,
                    first.to_rfc3339(),
                    last.to_rfc3339()
                );
            }
            None => println!("  due runs at {}: none", now.to_rfc3339()),
        }
        println!();
    }

    debug!("dry-run complete (no execution)");
}

/// Print every stored run with its task instances.
fn print_runs(store: &StateStore) {
    let runs = store.runs();
    if runs.is_empty() {
        println!("no dag runs recorded");
        return;
    }

    for run in runs {
        println!(
            "{} {} [{}] ({})",
            run.graph_id,
            run.logical_ts.to_rfc3339(),
            run.state,
            run.trigger
        );
        for instance in store.instances_of(&run.key()) {
            print!(
                "  - {}: {} (attempts {})",
                instance.task_id, instance.state, instance.attempts
            );
            if let Some(at) = instance.retry_at {
                print!(" retry at {}", at.to_rfc3339());
            }
            if let Some(err) = &instance.last_error {
                print!(" last error: {err}");
            }
            println!();
        }
    }
}
