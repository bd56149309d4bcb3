// src/config/validate.rs

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::TimeDelta;

use crate::config::duration::parse_duration;
use crate::config::model::{
    ConfigFile, DagConfig, DagSpec, EngineConfig, RawConfigFile, TaskSpec,
};
use crate::dag::graph::topological_order;
use crate::errors::{Result, TickdagError};
use crate::schedule::Schedule;

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = TickdagError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        ensure_has_dags(&raw)?;
        let engine = validate_engine_section(&raw)?;

        let mut dags = BTreeMap::new();
        for (id, dag) in raw.dag.iter() {
            dags.insert(id.clone(), validate_dag(&raw, id, dag)?);
        }

        Ok(ConfigFile::new_unchecked(engine, dags))
    }
}

fn config_err(msg: impl Into<String>) -> TickdagError {
    TickdagError::ConfigError(msg.into())
}

fn duration_field(value: &str, field: &str) -> Result<Duration> {
    parse_duration(value).map_err(|e| config_err(format!("{field}: {e}")))
}

fn ensure_has_dags(cfg: &RawConfigFile) -> Result<()> {
    if cfg.dag.is_empty() {
        return Err(config_err(
            "config must contain at least one [dag.<id>] section",
        ));
    }
    Ok(())
}

fn validate_engine_section(cfg: &RawConfigFile) -> Result<EngineConfig> {
    let tick_interval = duration_field(&cfg.engine.tick_interval, "[engine].tick_interval")?;
    if tick_interval.is_zero() {
        return Err(config_err("[engine].tick_interval must be > 0"));
    }

    if cfg.engine.max_active_tasks == 0 {
        return Err(config_err("[engine].max_active_tasks must be >= 1 (got 0)"));
    }

    Ok(EngineConfig {
        tick_interval,
        max_active_tasks: cfg.engine.max_active_tasks,
        state_dir: cfg.engine.state_dir.clone(),
    })
}

fn validate_dag(cfg: &RawConfigFile, id: &str, dag: &DagConfig) -> Result<DagSpec> {
    if dag.task.is_empty() {
        return Err(config_err(format!(
            "dag '{id}' must contain at least one [dag.{id}.task.<name>] section"
        )));
    }

    let interval = duration_field(&dag.interval, &format!("[dag.{id}].interval"))?;
    let interval = TimeDelta::from_std(interval)
        .map_err(|_| config_err(format!("[dag.{id}].interval is out of range")))?;
    let schedule = Schedule::new(dag.start, interval)
        .map_err(|e| match e {
            TickdagError::ConfigError(msg) => config_err(format!("[dag.{id}]: {msg}")),
            other => other,
        })?
        .with_catchup(dag.catchup);

    validate_task_dependencies(id, dag)?;

    // A topological sort fails if there is a cycle.
    topological_order(
        id,
        dag.task
            .iter()
            .map(|(name, task)| (name.as_str(), task.after.iter().map(String::as_str))),
    )?;

    let default_delay = match &cfg.default.retry_delay {
        Some(s) => duration_field(s, "[default].retry_delay")?,
        None => Duration::ZERO,
    };

    let mut tasks = BTreeMap::new();
    for (name, task) in dag.task.iter() {
        if task.cmd.trim().is_empty() {
            return Err(config_err(format!(
                "task '{name}' in dag '{id}' has an empty `cmd`"
            )));
        }
        let retry_delay = match &task.retry_delay {
            Some(s) => duration_field(s, &format!("[dag.{id}.task.{name}].retry_delay"))?,
            None => default_delay,
        };
        tasks.insert(
            name.clone(),
            TaskSpec {
                cmd: task.cmd.clone(),
                after: task.after.clone(),
                retries: task.retries.unwrap_or(cfg.default.retries),
                retry_delay,
            },
        );
    }

    Ok(DagSpec { schedule, tasks })
}

fn validate_task_dependencies(id: &str, dag: &DagConfig) -> Result<()> {
    for (name, task) in dag.task.iter() {
        for dep in task.after.iter() {
            if dep == name {
                return Err(config_err(format!(
                    "task '{name}' in dag '{id}' cannot depend on itself in `after`"
                )));
            }
            if !dag.task.contains_key(dep) {
                return Err(config_err(format!(
                    "task '{name}' in dag '{id}' has unknown dependency '{dep}' in `after`"
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> Result<ConfigFile> {
        let raw: RawConfigFile = toml::from_str(toml_src)?;
        ConfigFile::try_from(raw)
    }

    fn expect_config_error(toml_src: &str, needle: &str) {
        match parse(toml_src) {
            Err(TickdagError::ConfigError(msg)) => {
                assert!(msg.contains(needle), "message {msg:?} lacks {needle:?}")
            }
            other => panic!("expected ConfigError containing {needle:?}, got {other:?}"),
        }
    }

    const DAG_HEADER: &str = r#"
[dag.etl]
start = "2024-01-01T00:00:00Z"
interval = "1h"
"#;

    #[test]
    fn defaults_are_applied_and_overridden() {
        let cfg = parse(&format!(
            r#"
[default]
retries = 2
retry_delay = "5m"
{DAG_HEADER}
[dag.etl.task.extract]
cmd = "echo extract"

[dag.etl.task.load]
cmd = "echo load"
after = ["extract"]
retries = 0
retry_delay = "10s"
"#
        ))
        .unwrap();

        assert_eq!(cfg.engine.tick_interval, Duration::from_secs(1));
        assert_eq!(cfg.engine.max_active_tasks, 16);

        let dag = &cfg.dags["etl"];
        assert_eq!(dag.schedule.interval(), TimeDelta::hours(1));
        assert!(dag.schedule.catchup());
        assert_eq!(dag.tasks["extract"].retries, 2);
        assert_eq!(dag.tasks["extract"].retry_delay, Duration::from_secs(300));
        assert_eq!(dag.tasks["load"].retries, 0);
        assert_eq!(dag.tasks["load"].retry_delay, Duration::from_secs(10));

        let graphs = cfg.task_graphs().unwrap();
        assert_eq!(graphs.len(), 1);
        assert_eq!(graphs[0].upstreams_of("load").len(), 1);
    }

    #[test]
    fn empty_config_is_rejected() {
        expect_config_error("", "at least one [dag.<id>]");
    }

    #[test]
    fn dag_without_tasks_is_rejected() {
        expect_config_error(DAG_HEADER, "at least one [dag.etl.task.<name>]");
    }

    #[test]
    fn zero_interval_is_rejected() {
        expect_config_error(
            r#"
[dag.etl]
start = "2024-01-01T00:00:00Z"
interval = "0s"
[dag.etl.task.a]
cmd = "true"
"#,
            "interval must be positive",
        );
    }

    #[test]
    fn bad_engine_section_is_rejected() {
        expect_config_error(
            &format!("[engine]\nmax_active_tasks = 0\n{DAG_HEADER}[dag.etl.task.a]\ncmd = \"true\"\n"),
            "max_active_tasks",
        );
        expect_config_error(
            &format!("[engine]\ntick_interval = \"soon\"\n{DAG_HEADER}[dag.etl.task.a]\ncmd = \"true\"\n"),
            "[engine].tick_interval",
        );
    }

    #[test]
    fn unknown_and_self_dependencies_are_rejected() {
        expect_config_error(
            &format!("{DAG_HEADER}[dag.etl.task.a]\ncmd = \"true\"\nafter = [\"ghost\"]\n"),
            "unknown dependency 'ghost'",
        );
        expect_config_error(
            &format!("{DAG_HEADER}[dag.etl.task.a]\ncmd = \"true\"\nafter = [\"a\"]\n"),
            "cannot depend on itself",
        );
    }

    #[test]
    fn cycles_are_rejected() {
        let err = parse(&format!(
            "{DAG_HEADER}[dag.etl.task.a]\ncmd = \"true\"\nafter = [\"b\"]\n[dag.etl.task.b]\ncmd = \"true\"\nafter = [\"a\"]\n"
        ))
        .unwrap_err();
        assert!(matches!(err, TickdagError::DagCycle(_)));
    }

    #[test]
    fn unknown_keys_are_toml_errors() {
        let err = parse(&format!("{DAG_HEADER}[dag.etl.task.a]\ncmd = \"true\"\nwatch = [\"src\"]\n"))
            .unwrap_err();
        assert!(matches!(err, TickdagError::TomlError(_)));
    }
}
