// tests/claim_race.rs

use std::sync::Arc;
use std::thread;

use tickdag::errors::TickdagError;
use tickdag::exec::{ExecOutcome, Executor};
use tickdag::schedule::ManualClock;
use tickdag::store::{StateStore, TransitionMeta};
use tickdag::types::{InstanceState, RunTrigger};
use tickdag_test_utils::builders::{t0, GraphBuilder};
use tickdag_test_utils::fake_task::{CallLog, FakeTask};
use tickdag_test_utils::{init_tracing, with_timeout};

#[test]
fn only_one_thread_wins_the_pending_to_queued_swap() {
    let clock = ManualClock::new(t0());
    let store = Arc::new(StateStore::in_memory(Arc::new(clock)));
    let graph = GraphBuilder::new("race")
        .task("A", &[], FakeTask::succeed(&CallLog::new()).arc())
        .build();
    let run = store.create_run(&graph, t0(), RunTrigger::Scheduled).unwrap().key();
    let key = run.instance("A");

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = Arc::clone(&store);
            let key = key.clone();
            thread::spawn(move || {
                store.transition_instance(
                    &key,
                    InstanceState::Pending,
                    InstanceState::Queued,
                    TransitionMeta::none(),
                )
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let wins = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(wins, 1);
    for result in results.iter().filter(|r| r.is_err()) {
        assert!(matches!(
            result,
            Err(TickdagError::Conflict {
                expected: InstanceState::Pending,
                actual: InstanceState::Queued,
                ..
            })
        ));
    }
    assert_eq!(store.instance(&key).unwrap().state, InstanceState::Queued);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_executors_run_an_instance_once() {
    init_tracing();
    let log = CallLog::new();
    let clock = ManualClock::new(t0());
    let store = Arc::new(StateStore::in_memory(Arc::new(clock.clone())));
    let graph = Arc::new(
        GraphBuilder::new("race")
            .task("A", &[], FakeTask::succeed(&log).arc())
            .build(),
    );
    let run = store.create_run(&graph, t0(), RunTrigger::Scheduled).unwrap().key();
    let key = run.instance("A");

    // Two independent executors sharing one store, like two schedulers.
    let executors = [
        Executor::new(Arc::clone(&store), Arc::new(clock.clone()), 4),
        Executor::new(Arc::clone(&store), Arc::new(clock.clone()), 4),
    ];

    let mut handles = Vec::new();
    for i in 0..6 {
        let executor = executors[i % 2].clone();
        let graph = Arc::clone(&graph);
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            executor.execute(&key, &graph).await
        }));
    }

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(with_timeout(handle).await.unwrap().unwrap());
    }

    let succeeded = outcomes
        .iter()
        .filter(|o| **o == ExecOutcome::Succeeded)
        .count();
    let skipped = outcomes.iter().filter(|o| **o == ExecOutcome::Skipped).count();
    assert_eq!(succeeded, 1);
    assert_eq!(skipped, 5);
    assert_eq!(log.count("A"), 1);

    let instance = store.instance(&key).unwrap();
    assert_eq!(instance.state, InstanceState::Success);
    assert_eq!(instance.attempts, 1);
}

#[tokio::test]
async fn dispatch_of_a_claimed_instance_is_refused() {
    let log = CallLog::new();
    let clock = ManualClock::new(t0());
    let store = Arc::new(StateStore::in_memory(Arc::new(clock.clone())));
    let graph = Arc::new(
        GraphBuilder::new("race")
            .task("A", &[], FakeTask::succeed(&log).arc())
            .build(),
    );
    let run = store.create_run(&graph, t0(), RunTrigger::Scheduled).unwrap().key();
    let executor = Executor::new(Arc::clone(&store), Arc::new(clock), 2);

    assert!(executor.dispatch(run.instance("A"), Arc::clone(&graph)).unwrap());
    assert!(!executor.dispatch(run.instance("A"), Arc::clone(&graph)).unwrap());
    with_timeout(executor.drain()).await;

    assert_eq!(log.count("A"), 1);
    assert_eq!(executor.in_flight(), 0);
}
