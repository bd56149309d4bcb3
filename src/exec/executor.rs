// src/exec/executor.rs

//! Runs one task instance attempt end to end.

use std::any::Any;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, error, info, warn};

use crate::dag::{RunContext, TaskCallable, TaskError, TaskGraph, TaskResult};
use crate::errors::{Result, TickdagError};
use crate::schedule::Clock;
use crate::store::{InstanceKey, StateStore, TransitionMeta};
use crate::types::InstanceState;

/// What happened to one `execute` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutcome {
    /// The instance was not PENDING and ready, or someone else claimed it
    /// first; nothing was done.
    Skipped,
    Succeeded,
    /// The attempt failed and the instance went back to PENDING until
    /// `retry_at`.
    RetryScheduled {
        retry_at: DateTime<Utc>,
        error: String,
    },
    /// The attempt failed with no retries left.
    Failed { error: String },
}

/// Executes task instances against the state store.
///
/// Cheap to clone; clones share the concurrency limit, the in-flight
/// counter and the set of live claims.
#[derive(Clone)]
pub struct Executor {
    store: Arc<StateStore>,
    clock: Arc<dyn Clock>,
    permits: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    idle: Arc<Notify>,
    claims: Arc<Mutex<HashSet<InstanceKey>>>,
}

/// Marks one instance as owned by a live execution until dropped.
struct ClaimGuard {
    claims: Arc<Mutex<HashSet<InstanceKey>>>,
    key: InstanceKey,
}

impl ClaimGuard {
    fn acquire(claims: &Arc<Mutex<HashSet<InstanceKey>>>, key: &InstanceKey) -> Option<Self> {
        let fresh = claims
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.clone());
        fresh.then(|| Self {
            claims: Arc::clone(claims),
            key: key.clone(),
        })
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        self.claims
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("available_permits", &self.permits.available_permits())
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

impl Executor {
    /// `max_active_tasks` bounds how many callables run at once; claimed
    /// instances beyond that wait in QUEUED.
    pub fn new(store: Arc<StateStore>, clock: Arc<dyn Clock>, max_active_tasks: usize) -> Self {
        Self {
            store,
            clock,
            permits: Arc::new(Semaphore::new(max_active_tasks.max(1))),
            in_flight: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
            claims: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Whether an execution started by this executor currently owns `key`.
    ///
    /// A QUEUED or RUNNING instance nobody holds was stranded, e.g. by a
    /// store write that failed mid-attempt.
    pub fn holds(&self, key: &InstanceKey) -> bool {
        self.claims
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(key)
    }

    /// Number of dispatched executions that have not finished yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Claim and run one attempt of `key` to completion.
    ///
    /// An instance that is not ready, or a claim lost to a concurrent
    /// executor, is [`ExecOutcome::Skipped`], not an error.
    pub async fn execute(&self, key: &InstanceKey, graph: &TaskGraph) -> Result<ExecOutcome> {
        let Some(_guard) = self.claim(key, graph)? else {
            return Ok(ExecOutcome::Skipped);
        };
        self.run_claimed(key, graph).await
    }

    /// Claim `key` now and run it in the background.
    ///
    /// Returns `false` if the claim was lost. Completion is only observable
    /// through the store (and [`Executor::drain`]).
    pub fn dispatch(&self, key: InstanceKey, graph: Arc<TaskGraph>) -> Result<bool> {
        let Some(guard) = self.claim(&key, &graph)? else {
            return Ok(false);
        };

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(err) = this.run_claimed(&key, &graph).await {
                error!(instance = %key, error = %err, "task execution error");
            }
            drop(guard);
            if this.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                this.idle.notify_waiters();
            }
        });
        Ok(true)
    }

    /// Wait until every dispatched execution has finished.
    pub async fn drain(&self) {
        loop {
            let idle = self.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            debug!(in_flight = self.in_flight(), "waiting for in-flight tasks");
            idle.await;
        }
    }

    /// PENDING -> QUEUED if ready now. `None` when the instance is not
    /// ready or no longer PENDING.
    ///
    /// The guard is taken before the store swap so a claim is never in the
    /// store without a live owner.
    fn claim(&self, key: &InstanceKey, graph: &TaskGraph) -> Result<Option<ClaimGuard>> {
        if graph.task(&key.task_id).is_none() {
            return Err(TickdagError::UnknownInstance(key.to_string()));
        }
        let Some(guard) = ClaimGuard::acquire(&self.claims, key) else {
            debug!(instance = %key, "already executing; skipping");
            return Ok(None);
        };
        match self.store.claim_if_ready(key, graph, self.clock.now()) {
            Ok(true) => Ok(Some(guard)),
            Ok(false) => {
                debug!(instance = %key, "not ready; skipping");
                Ok(None)
            }
            Err(err @ TickdagError::Conflict { .. }) => {
                debug!(instance = %key, reason = %err, "claim lost; skipping");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn run_claimed(&self, key: &InstanceKey, graph: &TaskGraph) -> Result<ExecOutcome> {
        let def = graph
            .task(&key.task_id)
            .ok_or_else(|| TickdagError::UnknownInstance(key.to_string()))?;

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| TickdagError::Other(anyhow!("executor semaphore closed: {e}")))?;

        let instance = self.store.transition_instance(
            key,
            InstanceState::Queued,
            InstanceState::Running,
            TransitionMeta::attempt_started(self.clock.now()),
        )?;

        let ctx = RunContext {
            graph_id: key.run.graph_id.clone(),
            task_id: key.task_id.clone(),
            logical_ts: key.run.logical_ts,
            attempt: instance.attempts,
        };
        info!(
            graph = %ctx.graph_id,
            ts = %ctx.logical_ts.to_rfc3339(),
            task = %ctx.task_id,
            attempt = ctx.attempt,
            "task attempt started"
        );

        let outcome = match invoke(Arc::clone(def.callable()), ctx).await {
            Ok(()) => {
                self.store.transition_instance(
                    key,
                    InstanceState::Running,
                    InstanceState::Success,
                    TransitionMeta::none(),
                )?;
                info!(instance = %key, attempt = instance.attempts, "task succeeded");
                ExecOutcome::Succeeded
            }
            Err(err) if instance.attempts <= def.retries() => {
                let delay = TimeDelta::from_std(def.retry_delay()).unwrap_or(TimeDelta::MAX);
                let retry_at = self
                    .clock
                    .now()
                    .checked_add_signed(delay)
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                self.store.transition_instance(
                    key,
                    InstanceState::Running,
                    InstanceState::Pending,
                    TransitionMeta::failed(err.message()).with_retry_at(retry_at),
                )?;
                warn!(
                    instance = %key,
                    attempt = instance.attempts,
                    retries = def.retries(),
                    retry_at = %retry_at.to_rfc3339(),
                    error = %err,
                    "task failed; retry scheduled"
                );
                ExecOutcome::RetryScheduled {
                    retry_at,
                    error: err.message().to_string(),
                }
            }
            Err(err) => {
                self.store.transition_instance(
                    key,
                    InstanceState::Running,
                    InstanceState::Failed,
                    TransitionMeta::failed(err.message()),
                )?;
                error!(
                    instance = %key,
                    attempts = instance.attempts,
                    error = %err,
                    "task failed; no retries left"
                );
                self.store.propagate_upstream_failures(&key.run, graph)?;
                ExecOutcome::Failed {
                    error: err.message().to_string(),
                }
            }
        };

        self.store.recompute_run_state(&key.run)?;
        Ok(outcome)
    }
}

/// Run the callable on its own tokio task so a panic surfaces as a
/// `JoinError` instead of unwinding through the executor.
async fn invoke(callable: Arc<dyn TaskCallable>, ctx: RunContext) -> TaskResult {
    let handle = tokio::spawn(async move { callable.call(ctx).await });
    match handle.await {
        Ok(result) => result,
        Err(join_err) if join_err.is_panic() => Err(TaskError::new(format!(
            "task panicked: {}",
            panic_message(join_err.into_panic().as_ref())
        ))),
        Err(join_err) => Err(TaskError::new(format!("task aborted: {join_err}"))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
