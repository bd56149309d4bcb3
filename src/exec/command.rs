// src/exec/command.rs

//! Task callable that runs a shell command.

use std::process::Stdio;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use crate::dag::{RunContext, TaskCallable, TaskError, TaskFuture, TaskResult};

pub const ENV_DAG_ID: &str = "TICKDAG_DAG_ID";
pub const ENV_TASK_ID: &str = "TICKDAG_TASK_ID";
pub const ENV_LOGICAL_TS: &str = "TICKDAG_LOGICAL_TS";
pub const ENV_LOGICAL_DATE: &str = "TICKDAG_LOGICAL_DATE";
pub const ENV_ATTEMPT: &str = "TICKDAG_ATTEMPT";

/// Runs `cmd` through the platform shell with the run context exported as
/// `TICKDAG_*` environment variables. A non-zero exit is a task failure.
#[derive(Debug, Clone)]
pub struct ShellCommand {
    cmd: String,
}

impl ShellCommand {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self { cmd: cmd.into() }
    }

    pub fn cmd(&self) -> &str {
        &self.cmd
    }
}

impl TaskCallable for ShellCommand {
    fn call(&self, ctx: RunContext) -> TaskFuture {
        let cmd = self.cmd.clone();
        Box::pin(async move { run_shell(cmd, ctx).await })
    }
}

async fn run_shell(cmd_line: String, ctx: RunContext) -> TaskResult {
    debug!(task = %ctx.task_id, attempt = ctx.attempt, cmd = %cmd_line, "spawning task process");

    let mut cmd = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(&cmd_line);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(&cmd_line);
        c
    };

    cmd.env(ENV_DAG_ID, &ctx.graph_id)
        .env(ENV_TASK_ID, &ctx.task_id)
        .env(ENV_LOGICAL_TS, ctx.logical_ts.to_rfc3339())
        .env(ENV_LOGICAL_DATE, ctx.logical_date().format("%Y-%m-%d").to_string())
        .env(ENV_ATTEMPT, ctx.attempt.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawning process for task '{}'", ctx.task_id))?;

    // Drain both pipes so the child never blocks on a full buffer.
    let stdout = child.stdout.take().map(|out| {
        let task = ctx.task_id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(out).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!(task = %task, "stdout: {}", line);
            }
        })
    });
    let stderr = child.stderr.take().map(|err| {
        let task = ctx.task_id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(err).lines();
            let mut last = None;
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(task = %task, "stderr: {}", line);
                last = Some(line);
            }
            last
        })
    });

    let status = child
        .wait()
        .await
        .with_context(|| format!("waiting for process of task '{}'", ctx.task_id))?;

    if let Some(handle) = stdout {
        let _ = handle.await;
    }
    let last_stderr = match stderr {
        Some(handle) => handle.await.ok().flatten(),
        None => None,
    };

    if status.success() {
        return Ok(());
    }

    let code = status
        .code()
        .map_or_else(|| "signal".to_string(), |c| c.to_string());
    Err(TaskError::new(match last_stderr {
        Some(line) => format!("command exited with code {code}: {line}"),
        None => format!("command exited with code {code}"),
    }))
}
