// src/dag/task.rs

//! Task definitions and the callable interface the engine invokes.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

use crate::dag::{GraphId, TaskName};

/// Per-invocation context handed to every task callable.
///
/// Reconstructed from the DAG run and the task instance on every attempt;
/// it is never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    pub graph_id: GraphId,
    pub task_id: TaskName,
    /// The scheduled interval this run covers, not the time it executes.
    pub logical_ts: DateTime<Utc>,
    /// 1-based attempt number.
    pub attempt: u32,
}

impl RunContext {
    /// Calendar date of the logical timestamp (`YYYY-MM-DD` when displayed).
    pub fn logical_date(&self) -> NaiveDate {
        self.logical_ts.date_naive()
    }
}

/// Failure reported by a task callable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct TaskError {
    message: String,
}

impl TaskError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for TaskError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for TaskError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{err:#}"))
    }
}

pub type TaskResult = Result<(), TaskError>;

/// Future returned by [`TaskCallable::call`].
pub type TaskFuture = Pin<Box<dyn Future<Output = TaskResult> + Send + 'static>>;

/// The unit of work wrapped by a task definition.
///
/// The engine treats it as opaque: it is called with a [`RunContext`] and
/// either succeeds or fails. Panics inside the returned future are caught by
/// the executor and recorded as failures.
pub trait TaskCallable: Send + Sync {
    fn call(&self, ctx: RunContext) -> TaskFuture;
}

/// Adapter turning an async closure into a [`TaskCallable`]. See [`task_fn`].
pub struct FnTask<F> {
    f: F,
}

impl<F, Fut> TaskCallable for FnTask<F>
where
    F: Fn(RunContext) -> Fut + Send + Sync,
    Fut: Future<Output = TaskResult> + Send + 'static,
{
    fn call(&self, ctx: RunContext) -> TaskFuture {
        Box::pin((self.f)(ctx))
    }
}

/// Wrap an async closure as a shareable task callable.
///
/// ```ignore
/// let fetch = task_fn(|ctx| async move {
///     println!("fetching data for {}", ctx.logical_date());
///     Ok(())
/// });
/// ```
pub fn task_fn<F, Fut>(f: F) -> Arc<dyn TaskCallable>
where
    F: Fn(RunContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TaskResult> + Send + 'static,
{
    Arc::new(FnTask { f })
}

/// One node of a task graph: identity, callable, upstream edges and retry
/// policy.
#[derive(Clone)]
pub struct TaskDefinition {
    id: TaskName,
    callable: Arc<dyn TaskCallable>,
    upstream: BTreeSet<TaskName>,
    retries: u32,
    retry_delay: Duration,
}

impl TaskDefinition {
    /// A task with no upstream dependencies and no retries.
    pub fn new(id: impl Into<TaskName>, callable: Arc<dyn TaskCallable>) -> Self {
        Self {
            id: id.into(),
            callable,
            upstream: BTreeSet::new(),
            retries: 0,
            retry_delay: Duration::ZERO,
        }
    }

    /// Add an upstream dependency: this task waits for `dep`.
    pub fn after(mut self, dep: impl Into<TaskName>) -> Self {
        self.upstream.insert(dep.into());
        self
    }

    /// Allow up to `retries` re-runs after a failure, each deferred by
    /// `delay`.
    pub fn with_retries(mut self, retries: u32, delay: Duration) -> Self {
        self.retries = retries;
        self.retry_delay = delay;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn callable(&self) -> &Arc<dyn TaskCallable> {
        &self.callable
    }

    pub fn upstream(&self) -> &BTreeSet<TaskName> {
        &self.upstream
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }
}

impl fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("id", &self.id)
            .field("upstream", &self.upstream)
            .field("retries", &self.retries)
            .field("retry_delay", &self.retry_delay)
            .finish_non_exhaustive()
    }
}
