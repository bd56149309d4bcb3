// src/engine/core.rs

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

use crate::dag::{GraphId, TaskGraph};
use crate::errors::{Result, TickdagError};
use crate::exec::Executor;
use crate::schedule::{due_runs, Clock};
use crate::store::{DagRun, RunKey, StateStore};
use crate::types::{InstanceState, RunState, RunTrigger};

use super::{EngineOptions, TickReport};

/// Explicit scheduler instance: no global state, several engines can live
/// side by side (each with its own store).
pub struct Engine {
    pub(super) store: Arc<StateStore>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) executor: Executor,
    pub(super) graphs: BTreeMap<GraphId, Arc<TaskGraph>>,
    pub(super) options: EngineOptions,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("graphs", &self.graphs.keys().collect::<Vec<_>>())
            .field("options", &self.options)
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(store: Arc<StateStore>, clock: Arc<dyn Clock>, options: EngineOptions) -> Self {
        let executor = Executor::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            options.max_active_tasks,
        );
        Self {
            store,
            clock,
            executor,
            graphs: BTreeMap::new(),
            options,
        }
    }

    /// Add `graph` to the registry.
    ///
    /// Stored FAILED runs of the graph get one upstream-failure pass here, so
    /// a crash between recording a failure and blocking its dependents is
    /// repaired on the next start.
    pub fn register(&mut self, graph: TaskGraph) -> Result<()> {
        let id = graph.id().to_string();
        if self.graphs.contains_key(&id) {
            return Err(TickdagError::ConfigError(format!(
                "dag '{id}' is registered more than once"
            )));
        }

        for run in self.store.runs_of(&id) {
            if run.state == RunState::Failed {
                self.store.propagate_upstream_failures(&run.key(), &graph)?;
            }
        }

        info!(graph = %id, tasks = graph.len(), schedule = %graph.schedule(), "dag registered");
        self.graphs.insert(id, Arc::new(graph));
        Ok(())
    }

    pub fn graph(&self, id: &str) -> Option<&Arc<TaskGraph>> {
        self.graphs.get(id)
    }

    pub fn graphs(&self) -> impl Iterator<Item = &Arc<TaskGraph>> {
        self.graphs.values()
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn options(&self) -> EngineOptions {
        self.options
    }

    /// Manually create a run of `graph_id` at `logical_ts`.
    ///
    /// Any timestamp is accepted, on or off the schedule grid. The run is
    /// picked up by the next tick.
    pub fn trigger_run(&self, graph_id: &str, logical_ts: DateTime<Utc>) -> Result<DagRun> {
        let graph = self
            .graphs
            .get(graph_id)
            .ok_or_else(|| TickdagError::UnknownGraph(graph_id.to_string()))?;
        self.store.create_run(graph, logical_ts, RunTrigger::Manual)
    }

    /// One scheduler pass. Never waits for task completion.
    ///
    /// A graph or run that fails to advance is logged and counted in
    /// [`TickReport::errors`]; the rest of the pass still happens.
    pub fn tick(&self) -> TickReport {
        let now = self.clock.now();
        let mut report = TickReport::default();

        for graph in self.graphs.values() {
            self.schedule_due_runs(graph, now, &mut report);
        }

        for run in self.store.active_runs() {
            let key = run.key();
            let Some(graph) = self.graphs.get(&key.graph_id) else {
                debug!(run = %key, "skipping run of unregistered dag");
                continue;
            };
            if let Err(err) = self.advance_run(&key, graph, now, &mut report) {
                error!(run = %key, error = %err, "failed to advance dag run");
                report.errors += 1;
            }
        }

        if !report.is_empty() {
            debug!(
                created = report.created.len(),
                dispatched = report.dispatched.len(),
                released = report.released.len(),
                blocked = report.blocked.len(),
                finished = report.finished.len(),
                errors = report.errors,
                "tick complete"
            );
        }
        report
    }

    /// Create the runs of `graph` that are due at `now`, oldest first. Stops
    /// at the first failure so runs are never created out of order.
    fn schedule_due_runs(&self, graph: &TaskGraph, now: DateTime<Utc>, report: &mut TickReport) {
        let existing = self.store.materialized(graph.id());

        for logical_ts in due_runs(graph.schedule(), now, &existing) {
            match self.store.create_run(graph, logical_ts, RunTrigger::Scheduled) {
                Ok(run) => report.created.push(run.key()),
                Err(err @ TickdagError::DuplicateRun { .. }) => {
                    debug!(graph = %graph.id(), reason = %err, "run already scheduled");
                }
                Err(err) => {
                    error!(
                        graph = %graph.id(),
                        ts = %logical_ts.to_rfc3339(),
                        error = %err,
                        "failed to create scheduled run"
                    );
                    report.errors += 1;
                    return;
                }
            }
        }
    }

    fn advance_run(
        &self,
        run: &RunKey,
        graph: &Arc<TaskGraph>,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<()> {
        report
            .released
            .extend(self.store.release_claims(run, |key| self.executor.holds(key))?);
        report
            .blocked
            .extend(self.store.propagate_upstream_failures(run, graph)?);

        if !self.store.recompute_run_state(run)?.is_terminal() {
            for instance in self.store.ready_instances(run, graph, now) {
                let key = instance.key();
                match self.executor.dispatch(key.clone(), Arc::clone(graph)) {
                    Ok(true) => report.dispatched.push(key),
                    Ok(false) => {}
                    Err(err) => {
                        error!(instance = %key, error = %err, "failed to dispatch task instance");
                        report.errors += 1;
                    }
                }
            }
        }

        let state = self.store.recompute_run_state(run)?;
        if state.is_terminal() {
            report.finished.push((run.clone(), state));
        }
        Ok(())
    }

    /// Earliest retry time after `now` of a PENDING instance in an active
    /// run.
    pub(super) fn next_deferred_retry(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.store
            .active_runs()
            .iter()
            .flat_map(|run| self.store.instances_of(&run.key()))
            .filter(|instance| instance.state == InstanceState::Pending)
            .filter_map(|instance| instance.retry_at)
            .filter(|retry_at| *retry_at > now)
            .min()
    }

    /// Tick until no run needs attention: nothing was dispatched, nothing is
    /// in flight and no retry is waiting for its delay.
    ///
    /// Between ticks it waits for in-flight executions. While a retry delay
    /// is pending it moves a clock that supports [`Clock::skip_to`] straight
    /// to the retry time; otherwise it sleeps, at most one tick interval at a
    /// time. Skipping time can make further schedule intervals due, which
    /// are then run as well.
    ///
    /// Tick errors are counted in the returned report, not returned.
    pub async fn run_until_idle(&self) -> Result<TickReport> {
        let mut total = TickReport::default();
        loop {
            let report = self.tick();
            let dispatched = !report.dispatched.is_empty();
            total.merge(report);

            if dispatched || self.executor.in_flight() > 0 {
                self.executor.drain().await;
                continue;
            }
            let now = self.clock.now();
            if let Some(retry_at) = self.next_deferred_retry(now) {
                if self.clock.skip_to(retry_at) {
                    debug!(to = %retry_at.to_rfc3339(), "clock skipped to next retry");
                } else {
                    let wait = (retry_at - now)
                        .to_std()
                        .unwrap_or_default()
                        .min(self.options.tick_interval);
                    tokio::time::sleep(wait).await;
                }
                continue;
            }
            break;
        }
        info!(
            created = total.created.len(),
            dispatched = total.dispatched.len(),
            finished = total.finished.len(),
            errors = total.errors,
            "engine idle"
        );
        Ok(total)
    }
}
