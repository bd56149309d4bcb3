// tests/restart_recovery.rs

use std::sync::Arc;

use chrono::TimeDelta;
use tempfile::TempDir;

use tickdag::schedule::ManualClock;
use tickdag::store::{
    DagRun, JsonFilePersistence, MemoryPersistence, Persistence, RunKey, StateStore,
    StoreSnapshot, TaskInstance, TransitionMeta,
};
use tickdag::types::{InstanceState, RunState, RunTrigger};
use tickdag_test_utils::builders::{t0, GraphBuilder, TestEngine};
use tickdag_test_utils::fake_task::{CallLog, FakeTask};
use tickdag_test_utils::{init_tracing, with_timeout};

fn instance(run: &RunKey, task_id: &str, state: InstanceState, attempts: u32) -> TaskInstance {
    TaskInstance {
        graph_id: run.graph_id.clone(),
        logical_ts: run.logical_ts,
        task_id: task_id.to_string(),
        state,
        attempts,
        last_attempt_at: (attempts > 0).then(t0),
        last_error: None,
        retry_at: None,
    }
}

/// A run whose first task was RUNNING when the process died.
fn crashed_snapshot() -> StoreSnapshot {
    let run = RunKey::new("etl", t0());
    StoreSnapshot {
        runs: vec![DagRun {
            graph_id: run.graph_id.clone(),
            logical_ts: run.logical_ts,
            state: RunState::Running,
            trigger: RunTrigger::Scheduled,
            created_at: t0(),
            updated_at: t0(),
        }],
        instances: vec![
            instance(&run, "extract", InstanceState::Running, 1),
            instance(&run, "load", InstanceState::Pending, 0),
        ],
    }
}

fn etl(log: &CallLog) -> tickdag::dag::TaskGraph {
    GraphBuilder::new("etl")
        .task("extract", &[], FakeTask::succeed(log).arc())
        .task("load", &["extract"], FakeTask::succeed(log).arc())
        .build()
}

#[tokio::test]
async fn interrupted_instance_is_dispatched_again() {
    init_tracing();
    let persistence = MemoryPersistence::new();
    persistence.seed(crashed_snapshot());
    let log = CallLog::new();

    let t = TestEngine::open(t0(), Arc::new(persistence.clone()), vec![etl(&log)]);

    let run = RunKey::new("etl", t0());
    let extract = t.engine.store().instance(&run.instance("extract")).unwrap();
    assert_eq!(extract.state, InstanceState::Pending);
    assert_eq!(extract.attempts, 1);

    // Recovery is saved right away, before any tick.
    let saved = persistence.load().unwrap().unwrap();
    assert!(saved.instances.iter().all(|i| !i.state.is_claimed()));

    let report = with_timeout(t.engine.run_until_idle()).await.unwrap();

    assert!(report.created.is_empty(), "existing run must not be re-created");
    assert_eq!(log.task_ids(), ["extract", "load"]);
    assert_eq!(log.calls()[0].attempt, 2);
    assert_eq!(t.engine.store().run(&run).unwrap().state, RunState::Success);
}

#[tokio::test]
async fn state_file_survives_a_restart() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let log = CallLog::new();

    // First process: create the run, claim `extract`, then "crash".
    {
        let clock = ManualClock::new(t0());
        let store = StateStore::open(
            Arc::new(JsonFilePersistence::in_dir(dir.path())),
            Arc::new(clock.clone()),
        )
        .unwrap();
        let run = store
            .create_run(&etl(&log), t0(), RunTrigger::Scheduled)
            .unwrap()
            .key();
        let key = run.instance("extract");
        store
            .transition_instance(&key, InstanceState::Pending, InstanceState::Queued, TransitionMeta::none())
            .unwrap();
        store
            .transition_instance(
                &key,
                InstanceState::Queued,
                InstanceState::Running,
                TransitionMeta::attempt_started(t0()),
            )
            .unwrap();
    }
    assert!(dir.path().join("state.jsonl").exists());
    assert!(log.calls().is_empty());

    // Second process, an hour and a half later.
    let t = TestEngine::open(
        t0() + TimeDelta::minutes(90),
        Arc::new(JsonFilePersistence::in_dir(dir.path())),
        vec![etl(&log)],
    );
    let report = with_timeout(t.engine.run_until_idle()).await.unwrap();

    // The crashed run is finished and the next hourly run is scheduled.
    assert_eq!(report.created, vec![RunKey::new("etl", t0() + TimeDelta::hours(1))]);
    let first = RunKey::new("etl", t0());
    assert_eq!(t.engine.store().run(&first).unwrap().state, RunState::Success);
    assert_eq!(
        t.engine.store().instance(&first.instance("extract")).unwrap().attempts,
        2
    );
    assert_eq!(log.count("extract"), 2);
    assert_eq!(log.count("load"), 2);

    // A third open sees everything the second one wrote.
    let reopened = StateStore::open(
        Arc::new(JsonFilePersistence::in_dir(dir.path())),
        Arc::new(ManualClock::new(t0())),
    )
    .unwrap();
    assert_eq!(reopened.runs().len(), 2);
    assert!(reopened.active_runs().is_empty());
}

#[tokio::test]
async fn failed_run_left_half_propagated_is_repaired_on_register() {
    init_tracing();
    let run = RunKey::new("etl", t0());
    let mut snapshot = crashed_snapshot();
    snapshot.runs[0].state = RunState::Failed;
    snapshot.instances[0].state = InstanceState::Failed;

    let persistence = MemoryPersistence::new();
    persistence.seed(snapshot);
    let log = CallLog::new();
    let t = TestEngine::open(t0(), Arc::new(persistence), vec![etl(&log)]);

    assert_eq!(
        t.engine.store().instance(&run.instance("load")).unwrap().state,
        InstanceState::UpstreamFailed
    );
    with_timeout(t.engine.run_until_idle()).await.unwrap();
    assert!(log.calls().is_empty());
}

#[tokio::test]
async fn background_loop_runs_until_stopped() {
    init_tracing();
    let persistence = MemoryPersistence::new();
    let log = CallLog::new();
    let t = TestEngine::open(t0(), Arc::new(persistence.clone()), vec![etl(&log)]);

    let handle = t.engine.start();
    let run = RunKey::new("etl", t0());
    with_timeout(async {
        loop {
            let done = handle
                .engine()
                .store()
                .run(&run)
                .is_some_and(|r| r.state == RunState::Success);
            if done {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await;
    with_timeout(handle.stop()).await.unwrap();

    assert_eq!(log.task_ids(), ["extract", "load"]);
    let saved = persistence.load().unwrap().unwrap();
    assert!(saved.runs.iter().all(|r| r.state == RunState::Success));
}
