// tests/storage_faults.rs

use std::sync::Arc;

use tickdag::dag::task_fn;
use tickdag::fs::mock::MockFileSystem;
use tickdag::schedule::ManualClock;
use tickdag::store::{JsonFilePersistence, RunKey, StateStore};
use tickdag::types::{InstanceState, RunState};
use tickdag_test_utils::builders::{t0, GraphBuilder, TestEngine};
use tickdag_test_utils::fake_task::{CallLog, FakeTask};
use tickdag_test_utils::{init_tracing, with_timeout};

const STATE: &str = "/state/state.jsonl";

fn persistence(fs: &MockFileSystem) -> Arc<JsonFilePersistence> {
    Arc::new(JsonFilePersistence::with_fs(Arc::new(fs.clone()), STATE))
}

#[tokio::test]
async fn claim_stranded_by_a_failed_write_is_released_and_retried() {
    init_tracing();
    let fs = MockFileSystem::new();
    // The disk fills up while the first attempt is running, so recording
    // its success fails.
    let disk = fs.clone();
    let graph = GraphBuilder::new("etl")
        .task(
            "A",
            &[],
            task_fn(move |ctx| {
                let disk = disk.clone();
                async move {
                    if ctx.attempt == 1 {
                        disk.set_fail_writes(true);
                    }
                    Ok(())
                }
            }),
        )
        .build();
    let t = TestEngine::open(t0(), persistence(&fs), vec![graph]);
    let run = RunKey::new("etl", t0());
    let a = run.instance("A");

    assert_eq!(t.engine.tick().dispatched, vec![a.clone()]);
    with_timeout(t.engine.executor().drain()).await;

    let stranded = t.engine.store().instance(&a).unwrap();
    assert_eq!(stranded.state, InstanceState::Running);
    assert_eq!(stranded.attempts, 1);
    assert!(!t.engine.executor().holds(&a));

    // Space is freed again.
    fs.set_fail_writes(false);
    let report = with_timeout(t.engine.run_until_idle()).await.unwrap();

    assert_eq!(report.released, vec![a.clone()]);
    assert_eq!(report.dispatched, vec![a.clone()]);
    let done = t.engine.store().instance(&a).unwrap();
    assert_eq!(done.state, InstanceState::Success);
    assert_eq!(done.attempts, 2);
    assert_eq!(t.engine.store().run(&run).unwrap().state, RunState::Success);

    let reopened = StateStore::open(persistence(&fs), Arc::new(ManualClock::new(t0()))).unwrap();
    assert_eq!(reopened.instance(&a).unwrap().state, InstanceState::Success);
    assert_eq!(reopened.run(&run).unwrap().state, RunState::Success);
}

#[tokio::test]
async fn tick_keeps_going_while_the_disk_is_full() {
    init_tracing();
    let fs = MockFileSystem::new();
    let log = CallLog::new();
    let graph = GraphBuilder::new("etl")
        .task("A", &[], FakeTask::succeed(&log).arc())
        .build();
    let t = TestEngine::open(t0(), persistence(&fs), vec![graph]);

    fs.set_fail_writes(true);
    let report = t.engine.tick();
    assert_eq!(report.errors, 1);
    assert!(report.created.is_empty());
    assert!(t.engine.store().runs().is_empty());

    fs.set_fail_writes(false);
    let report = with_timeout(t.engine.run_until_idle()).await.unwrap();
    assert_eq!(report.created, vec![RunKey::new("etl", t0())]);
    assert_eq!(report.errors, 0);
    assert_eq!(log.task_ids(), ["A"]);
}
