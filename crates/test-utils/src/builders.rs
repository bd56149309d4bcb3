#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use tickdag::dag::{task_fn, TaskCallable, TaskDefinition, TaskGraph};
use tickdag::engine::{Engine, EngineOptions};
use tickdag::schedule::{Clock, ManualClock, Schedule};
use tickdag::store::{Persistence, StateStore};

/// 2024-01-01T00:00:00Z, the start of every test schedule.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// A callable that always succeeds.
pub fn noop() -> Arc<dyn TaskCallable> {
    task_fn(|_| async { Ok(()) })
}

/// Builder for `TaskGraph` to simplify test setup.
pub struct GraphBuilder {
    id: String,
    start: DateTime<Utc>,
    interval: TimeDelta,
    catchup: bool,
    tasks: Vec<TaskDefinition>,
}

impl GraphBuilder {
    /// Hourly schedule starting at [`t0`].
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            start: t0(),
            interval: TimeDelta::hours(1),
            catchup: true,
            tasks: Vec::new(),
        }
    }

    pub fn every(mut self, interval: TimeDelta) -> Self {
        self.interval = interval;
        self
    }

    pub fn starting(mut self, start: DateTime<Utc>) -> Self {
        self.start = start;
        self
    }

    pub fn catchup(mut self, catchup: bool) -> Self {
        self.catchup = catchup;
        self
    }

    /// Task `name` running `callable` after `deps`.
    pub fn task(self, name: &str, deps: &[&str], callable: Arc<dyn TaskCallable>) -> Self {
        self.task_with_retries(name, deps, callable, 0, Duration::ZERO)
    }

    pub fn task_with_retries(
        mut self,
        name: &str,
        deps: &[&str],
        callable: Arc<dyn TaskCallable>,
        retries: u32,
        retry_delay: Duration,
    ) -> Self {
        let def = deps
            .iter()
            .fold(TaskDefinition::new(name, callable), |def, dep| def.after(*dep))
            .with_retries(retries, retry_delay);
        self.tasks.push(def);
        self
    }

    pub fn try_build(self) -> tickdag::errors::Result<TaskGraph> {
        let schedule = Schedule::new(self.start, self.interval)?.with_catchup(self.catchup);
        TaskGraph::build(self.id, schedule, self.tasks)
    }

    pub fn build(self) -> TaskGraph {
        self.try_build().expect("Failed to build valid graph from builder")
    }
}

/// An engine over an in-memory store, driven by a manual clock set to
/// `now`.
pub struct TestEngine {
    pub engine: Engine,
    pub clock: ManualClock,
}

impl TestEngine {
    pub fn new(now: DateTime<Utc>, graphs: Vec<TaskGraph>) -> Self {
        let clock = ManualClock::new(now);
        let store = Arc::new(StateStore::in_memory(Arc::new(clock.clone())));
        Self::with_store(clock, store, graphs)
    }

    /// Engine on `persistence`, reopening whatever it holds.
    pub fn open(now: DateTime<Utc>, persistence: Arc<dyn Persistence>, graphs: Vec<TaskGraph>) -> Self {
        let clock = ManualClock::new(now);
        let store = Arc::new(
            StateStore::open(persistence, Arc::new(clock.clone()) as Arc<dyn Clock>)
                .expect("Failed to open state store"),
        );
        Self::with_store(clock, store, graphs)
    }

    fn with_store(clock: ManualClock, store: Arc<StateStore>, graphs: Vec<TaskGraph>) -> Self {
        let options = EngineOptions {
            tick_interval: Duration::from_millis(10),
            max_active_tasks: 8,
        };
        let mut engine = Engine::new(store, Arc::new(clock.clone()), options);
        for graph in graphs {
            engine.register(graph).expect("Failed to register graph");
        }
        Self { engine, clock }
    }
}
