// src/store/mod.rs

//! Run State Store: the single source of truth for DAG runs and task
//! instances.
//!
//! All records live behind one lock. Every instance mutation goes through a
//! compare-and-swap ([`StateStore::transition_instance`]), which is what
//! guarantees that two racing dispatchers can never both claim the same
//! instance. Every successful mutation appends the records it changed to
//! the configured [`Persistence`] backend before the call returns; if that
//! write fails the change is undone record by record and the error is
//! returned.

pub mod model;
pub mod persistence;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::dag::TaskGraph;
use crate::errors::{Result, TickdagError};
use crate::schedule::Clock;
use crate::types::{InstanceState, RunState, RunTrigger};

pub use model::{
    DagRun, InstanceKey, RunKey, StoreRecord, StoreSnapshot, TaskInstance, TransitionMeta,
};
pub use persistence::{JsonFilePersistence, MemoryPersistence, Persistence};

/// The log is compacted once it holds this many times the live records...
const COMPACT_RATIO: usize = 4;
/// ...and at least this many appended records.
const COMPACT_MIN_LOG: usize = 1024;

#[derive(Debug, Default)]
struct Records {
    runs: BTreeMap<RunKey, DagRun>,
    instances: BTreeMap<InstanceKey, TaskInstance>,
    /// Runs that are not SUCCESS or FAILED yet.
    active: BTreeSet<RunKey>,
    /// Records appended to persistence since the last compaction.
    log_len: usize,
}

impl Records {
    fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let mut records = Records::default();
        for run in snapshot.runs {
            records.set_run(run);
        }
        for instance in snapshot.instances {
            records.instances.insert(instance.key(), instance);
        }
        records
    }

    fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            runs: self.runs.values().cloned().collect(),
            instances: self.instances.values().cloned().collect(),
        }
    }

    fn live(&self) -> usize {
        self.runs.len() + self.instances.len()
    }

    fn set_run(&mut self, run: DagRun) -> Option<DagRun> {
        let key = run.key();
        if run.state.is_terminal() {
            self.active.remove(&key);
        } else {
            self.active.insert(key.clone());
        }
        self.runs.insert(key, run)
    }

    fn restore(&mut self, undo: Vec<Undo>) {
        for entry in undo.into_iter().rev() {
            match entry {
                Undo::Run(_, Some(run)) => {
                    self.set_run(run);
                }
                Undo::Run(key, None) => {
                    self.runs.remove(&key);
                    self.active.remove(&key);
                }
                Undo::Instance(key, Some(instance)) => {
                    self.instances.insert(key, instance);
                }
                Undo::Instance(key, None) => {
                    self.instances.remove(&key);
                }
            }
        }
    }

    fn instances_of(&self, run: &RunKey) -> impl Iterator<Item = &TaskInstance> {
        let lo = run.instance(String::new());
        let run = run.clone();
        self.instances
            .range(lo..)
            .take_while(move |(key, _)| key.run == run)
            .map(|(_, instance)| instance)
    }

    fn runs_of(&self, graph_id: &str) -> impl Iterator<Item = &DagRun> {
        let graph = graph_id.to_string();
        self.runs
            .range(RunKey::new(graph_id, DateTime::<Utc>::MIN_UTC)..)
            .take_while(move |(key, _)| key.graph_id == graph)
            .map(|(_, run)| run)
    }

    fn state_of(&self, run: &RunKey, task_id: &str) -> Option<InstanceState> {
        self.instances
            .get(&run.instance(task_id))
            .map(|instance| instance.state)
    }

    /// PENDING, retry deferral elapsed, every upstream SUCCESS.
    fn is_ready(
        &self,
        run: &RunKey,
        instance: &TaskInstance,
        graph: &TaskGraph,
        now: DateTime<Utc>,
    ) -> bool {
        instance.state == InstanceState::Pending
            && instance.retry_elapsed(now)
            && graph
                .upstreams_of(&instance.task_id)
                .iter()
                .all(|dep| self.state_of(run, dep) == Some(InstanceState::Success))
    }
}

/// Previous version of a record replaced inside a [`Txn`].
#[derive(Debug)]
enum Undo {
    Run(RunKey, Option<DagRun>),
    Instance(InstanceKey, Option<TaskInstance>),
}

/// One store operation in progress: what it replaced, for rollback, and
/// the new versions it wrote, for persistence.
struct Txn<'a> {
    records: &'a mut Records,
    undo: Vec<Undo>,
    written: Vec<StoreRecord>,
}

impl Txn<'_> {
    fn put_run(&mut self, run: DagRun) {
        let key = run.key();
        if self.records.runs.get(&key) == Some(&run) {
            return;
        }
        let previous = self.records.set_run(run.clone());
        self.undo.push(Undo::Run(key, previous));
        self.written.push(StoreRecord::Run(run));
    }

    fn put_instance(&mut self, instance: TaskInstance) {
        let key = instance.key();
        if self.records.instances.get(&key) == Some(&instance) {
            return;
        }
        let previous = self.records.instances.insert(key.clone(), instance.clone());
        self.undo.push(Undo::Instance(key, previous));
        self.written.push(StoreRecord::Instance(instance));
    }

    fn transition(
        &mut self,
        key: &InstanceKey,
        from: InstanceState,
        to: InstanceState,
        meta: TransitionMeta,
    ) -> Result<TaskInstance> {
        let mut instance = self
            .records
            .instances
            .get(key)
            .cloned()
            .ok_or_else(|| TickdagError::UnknownInstance(key.to_string()))?;

        if instance.state != from {
            return Err(TickdagError::Conflict {
                instance: key.to_string(),
                expected: from,
                actual: instance.state,
            });
        }

        instance.state = to;
        if let Some(at) = meta.attempt_started {
            instance.attempts += 1;
            instance.last_attempt_at = Some(at);
        }
        match meta.error {
            Some(error) => instance.last_error = Some(error),
            None if to == InstanceState::Success => instance.last_error = None,
            None => {}
        }
        instance.retry_at = meta.retry_at;

        self.put_instance(instance.clone());
        Ok(instance)
    }
}

/// Aggregate run state from its instance states.
///
/// SUCCESS iff every instance succeeded, FAILED iff any instance failed or
/// was blocked upstream, RUNNING otherwise.
pub fn aggregate_run_state(states: impl IntoIterator<Item = InstanceState>) -> RunState {
    let mut all_success = true;
    for state in states {
        if state.is_failed() {
            return RunState::Failed;
        }
        all_success &= state == InstanceState::Success;
    }
    if all_success {
        RunState::Success
    } else {
        RunState::Running
    }
}

pub struct StateStore {
    records: Mutex<Records>,
    persistence: Arc<dyn Persistence>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for StateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let records = self.lock();
        f.debug_struct("StateStore")
            .field("runs", &records.runs.len())
            .field("active_runs", &records.active.len())
            .field("instances", &records.instances.len())
            .field("persistence", &self.persistence)
            .finish()
    }
}

impl StateStore {
    /// Open a store on `persistence`, reloading whatever it holds.
    ///
    /// No claim survives a restart: every QUEUED or RUNNING instance found
    /// in the loaded records is reset to PENDING (attempt count kept) so the
    /// scheduler dispatches it again. Existing instances are never
    /// re-created. Loaded state is compacted before the store is returned.
    pub fn open(persistence: Arc<dyn Persistence>, clock: Arc<dyn Clock>) -> Result<Self> {
        let loaded = persistence.load()?;
        let found = loaded.is_some();
        let mut records = loaded.map(Records::from_snapshot).unwrap_or_default();

        let mut recovered = 0usize;
        for (key, instance) in records.instances.iter_mut() {
            if instance.state.is_claimed() {
                warn!(
                    instance = %key,
                    state = %instance.state,
                    attempts = instance.attempts,
                    "resetting interrupted task instance to pending"
                );
                instance.state = InstanceState::Pending;
                instance.retry_at = None;
                recovered += 1;
            }
        }

        if found {
            persistence.compact(&records.snapshot())?;
            records.log_len = records.live();
        }

        info!(
            runs = records.runs.len(),
            active_runs = records.active.len(),
            instances = records.instances.len(),
            recovered,
            "state store opened"
        );

        Ok(Self {
            records: Mutex::new(records),
            persistence,
            clock,
        })
    }

    /// A fresh store without durability.
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Mutex::new(Records::default()),
            persistence: Arc::new(MemoryPersistence::new()),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Records> {
        // `mutate` undoes its changes on error, so a poisoned guard still
        // holds consistent records.
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply `f` under the lock and append the records it changed to
    /// persistence. On any error every change is undone.
    fn mutate<T>(&self, f: impl FnOnce(&mut Txn<'_>) -> Result<T>) -> Result<T> {
        let mut records = self.lock();
        let mut txn = Txn {
            records: &mut *records,
            undo: Vec::new(),
            written: Vec::new(),
        };
        let out = f(&mut txn);
        let Txn { undo, written, .. } = txn;

        let out = match out {
            Ok(out) => out,
            Err(err) => {
                records.restore(undo);
                return Err(err);
            }
        };
        if written.is_empty() {
            return Ok(out);
        }

        if let Err(err) = self.persistence.append(&written) {
            records.restore(undo);
            return Err(err);
        }
        records.log_len += written.len();
        self.maybe_compact(&mut records);
        Ok(out)
    }

    fn maybe_compact(&self, records: &mut Records) {
        let live = records.live();
        if records.log_len < COMPACT_MIN_LOG.max(live * COMPACT_RATIO) {
            return;
        }
        match self.persistence.compact(&records.snapshot()) {
            Ok(()) => {
                debug!(log_len = records.log_len, live, "state log compacted");
                records.log_len = live;
            }
            // The uncompacted log is still complete.
            Err(err) => warn!(error = %err, "state log compaction failed"),
        }
    }

    /// Create the run for (`graph`, `logical_ts`) in PENDING, together with
    /// one PENDING instance per task, atomically.
    pub fn create_run(
        &self,
        graph: &TaskGraph,
        logical_ts: DateTime<Utc>,
        trigger: RunTrigger,
    ) -> Result<DagRun> {
        let key = RunKey::new(graph.id(), logical_ts);
        let now = self.clock.now();

        let run = self.mutate(|txn| {
            if txn.records.runs.contains_key(&key) {
                return Err(TickdagError::DuplicateRun {
                    graph: key.graph_id.clone(),
                    logical_ts,
                });
            }

            let run = DagRun {
                graph_id: key.graph_id.clone(),
                logical_ts,
                state: RunState::Pending,
                trigger,
                created_at: now,
                updated_at: now,
            };
            txn.put_run(run.clone());
            for task_id in graph.task_ids() {
                txn.put_instance(TaskInstance::new(&key, task_id));
            }
            Ok(run)
        })?;

        info!(run = %key, %trigger, tasks = graph.len(), "dag run created");
        Ok(run)
    }

    /// PENDING instances of `run` whose upstreams all succeeded and whose
    /// retry deferral (if any) has elapsed at `now`.
    pub fn ready_instances(
        &self,
        run: &RunKey,
        graph: &TaskGraph,
        now: DateTime<Utc>,
    ) -> Vec<TaskInstance> {
        let records = self.lock();
        records
            .instances_of(run)
            .filter(|instance| records.is_ready(run, instance, graph, now))
            .cloned()
            .collect()
    }

    /// Compare-and-swap the state of one instance from `from` to `to`.
    ///
    /// Fails with [`TickdagError::Conflict`] when the current state is not
    /// `from`; nothing is changed in that case.
    pub fn transition_instance(
        &self,
        key: &InstanceKey,
        from: InstanceState,
        to: InstanceState,
        meta: TransitionMeta,
    ) -> Result<TaskInstance> {
        let instance = self.mutate(|txn| txn.transition(key, from, to, meta))?;
        debug!(
            instance = %key,
            %from,
            %to,
            attempts = instance.attempts,
            "task instance transitioned"
        );
        Ok(instance)
    }

    /// PENDING -> QUEUED, but only if `key` is ready at `now` (see
    /// [`StateStore::ready_instances`]). Readiness is checked under the same
    /// lock as the swap.
    ///
    /// `Ok(false)` when the instance is PENDING but not ready;
    /// [`TickdagError::Conflict`] when it is not PENDING.
    pub fn claim_if_ready(
        &self,
        key: &InstanceKey,
        graph: &TaskGraph,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let claimed = self.mutate(|txn| {
            let ready = match txn.records.instances.get(key) {
                None => return Err(TickdagError::UnknownInstance(key.to_string())),
                Some(instance) if instance.state != InstanceState::Pending => {
                    return Err(TickdagError::Conflict {
                        instance: key.to_string(),
                        expected: InstanceState::Pending,
                        actual: instance.state,
                    });
                }
                Some(instance) => txn.records.is_ready(&key.run, instance, graph, now),
            };
            if ready {
                txn.transition(key, InstanceState::Pending, InstanceState::Queued, TransitionMeta::none())?;
            }
            Ok(ready)
        })?;

        if claimed {
            debug!(instance = %key, "task instance claimed");
        }
        Ok(claimed)
    }

    /// Put QUEUED or RUNNING instances of `run` that no live execution
    /// holds back to PENDING, keeping their attempt count.
    ///
    /// `held` answers whether a live execution owns an instance. This is how
    /// a claim stranded by a failed store write gets dispatched again.
    pub fn release_claims(
        &self,
        run: &RunKey,
        held: impl Fn(&InstanceKey) -> bool,
    ) -> Result<Vec<InstanceKey>> {
        let released = self.mutate(|txn| {
            let stranded: Vec<(InstanceKey, InstanceState)> = txn
                .records
                .instances_of(run)
                .filter(|instance| instance.state.is_claimed())
                .map(|instance| (instance.key(), instance.state))
                .filter(|(key, _)| !held(key))
                .collect();

            let mut released = Vec::with_capacity(stranded.len());
            for (key, state) in stranded {
                txn.transition(&key, state, InstanceState::Pending, TransitionMeta::none())?;
                released.push(key);
            }
            Ok(released)
        })?;

        for key in &released {
            warn!(instance = %key, "claim has no live execution; instance is pending again");
        }
        Ok(released)
    }

    /// Re-derive and store the aggregate state of `run`.
    pub fn recompute_run_state(&self, run: &RunKey) -> Result<RunState> {
        let now = self.clock.now();
        let (previous, state) = self.mutate(|txn| {
            let state = aggregate_run_state(txn.records.instances_of(run).map(|i| i.state));
            let mut entry = txn
                .records
                .runs
                .get(run)
                .cloned()
                .ok_or_else(|| TickdagError::UnknownRun(run.to_string()))?;
            let previous = entry.state;
            if previous != state {
                entry.state = state;
                entry.updated_at = now;
                txn.put_run(entry);
            }
            Ok((previous, state))
        })?;

        if previous != state {
            if state.is_terminal() {
                info!(run = %run, %state, "dag run finished");
            } else {
                debug!(run = %run, from = %previous, to = %state, "dag run state changed");
            }
        }
        Ok(state)
    }

    /// Mark every PENDING instance of `run` that has a FAILED or
    /// UPSTREAM_FAILED upstream as UPSTREAM_FAILED, transitively.
    ///
    /// Returns the instances that were marked.
    pub fn propagate_upstream_failures(
        &self,
        run: &RunKey,
        graph: &TaskGraph,
    ) -> Result<Vec<InstanceKey>> {
        let marked = self.mutate(|txn| {
            let mut marked = Vec::new();
            // Topological order: upstream marks are visible to later tasks.
            for task_id in graph.topological_order() {
                if txn.records.state_of(run, task_id) != Some(InstanceState::Pending) {
                    continue;
                }
                let blocked = graph.upstreams_of(task_id).iter().any(|dep| {
                    txn.records
                        .state_of(run, dep)
                        .is_some_and(InstanceState::is_failed)
                });
                if blocked {
                    let key = run.instance(task_id.clone());
                    txn.transition(
                        &key,
                        InstanceState::Pending,
                        InstanceState::UpstreamFailed,
                        TransitionMeta::none(),
                    )?;
                    marked.push(key);
                }
            }
            Ok(marked)
        })?;

        for key in &marked {
            info!(instance = %key, "task instance blocked by failed upstream");
        }
        Ok(marked)
    }

    pub fn run(&self, key: &RunKey) -> Option<DagRun> {
        self.lock().runs.get(key).cloned()
    }

    /// Every stored run, ordered by graph id then logical timestamp.
    pub fn runs(&self) -> Vec<DagRun> {
        self.lock().runs.values().cloned().collect()
    }

    pub fn runs_of(&self, graph_id: &str) -> Vec<DagRun> {
        self.lock().runs_of(graph_id).cloned().collect()
    }

    /// Runs that are not SUCCESS or FAILED yet, oldest key first.
    pub fn active_runs(&self) -> Vec<DagRun> {
        let records = self.lock();
        records
            .active
            .iter()
            .filter_map(|key| records.runs.get(key))
            .cloned()
            .collect()
    }

    pub fn instances_of(&self, run: &RunKey) -> Vec<TaskInstance> {
        self.lock().instances_of(run).cloned().collect()
    }

    pub fn instance(&self, key: &InstanceKey) -> Option<TaskInstance> {
        self.lock().instances.get(key).cloned()
    }

    /// Logical timestamps of `graph_id` that already have a run.
    pub fn materialized(&self, graph_id: &str) -> BTreeSet<DateTime<Utc>> {
        self.lock()
            .runs_of(graph_id)
            .map(|run| run.logical_ts)
            .collect()
    }
}
