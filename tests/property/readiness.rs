use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use tickdag::dag::{task_fn, TaskError, TaskGraph};
use tickdag::engine::{Engine, EngineOptions};
use tickdag::errors::TickdagError;
use tickdag::schedule::ManualClock;
use tickdag::store::{aggregate_run_state, RunKey, StateStore, TransitionMeta};
use tickdag::types::{InstanceState, RunTrigger};
use tickdag_test_utils::builders::{noop, t0, GraphBuilder};
use tickdag_test_utils::with_timeout;

/// Acyclic task set: task `i` may only depend on tasks `0..i`.
/// Returns the dependency lists per task index.
fn dag_strategy(max_tasks: usize) -> impl Strategy<Value = Vec<BTreeSet<usize>>> {
    (1..=max_tasks).prop_flat_map(|n| {
        proptest::collection::vec(proptest::collection::vec(any::<usize>(), 0..n), n).prop_map(
            |raw| {
                raw.into_iter()
                    .enumerate()
                    .map(|(i, picks)| {
                        if i == 0 {
                            BTreeSet::new()
                        } else {
                            picks.into_iter().map(|p| p % i).collect()
                        }
                    })
                    .collect()
            },
        )
    })
}

fn name(i: usize) -> String {
    format!("task_{i}")
}

fn build(deps: &[BTreeSet<usize>]) -> TaskGraph {
    let mut builder = GraphBuilder::new("prop");
    for (i, upstream) in deps.iter().enumerate() {
        let names: Vec<String> = upstream.iter().map(|&d| name(d)).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        builder = builder.task(&name(i), &refs, noop());
    }
    builder.build()
}

/// Terminal state of every task, in index order, when the tasks in
/// `failing` fail permanently.
fn expected_states(deps: &[BTreeSet<usize>], failing: &BTreeSet<usize>) -> Vec<InstanceState> {
    let mut expected: Vec<InstanceState> = Vec::with_capacity(deps.len());
    for (i, upstream) in deps.iter().enumerate() {
        let state = if upstream.iter().any(|&d| expected[d].is_failed()) {
            InstanceState::UpstreamFailed
        } else if failing.contains(&i) {
            InstanceState::Failed
        } else {
            InstanceState::Success
        };
        expected.push(state);
    }
    expected
}

proptest! {
    #[test]
    fn roots_are_exactly_the_tasks_without_upstreams(deps in dag_strategy(12)) {
        let graph = build(&deps);

        let expected: BTreeSet<String> = deps
            .iter()
            .enumerate()
            .filter(|(_, d)| d.is_empty())
            .map(|(i, _)| name(i))
            .collect();
        prop_assert_eq!(graph.root_tasks(), expected);

        let position: BTreeMap<&str, usize> = graph
            .topological_order()
            .iter()
            .enumerate()
            .map(|(pos, id)| (id.as_str(), pos))
            .collect();
        prop_assert_eq!(position.len(), deps.len());
        for (i, upstream) in deps.iter().enumerate() {
            for &d in upstream {
                prop_assert!(position[name(d).as_str()] < position[name(i).as_str()]);
                prop_assert!(graph.downstreams_of(&name(d)).contains(&name(i)));
            }
        }
    }

    #[test]
    fn closing_a_chain_into_a_loop_is_rejected(len in 1usize..8) {
        let mut builder = GraphBuilder::new("loop");
        for i in 0..len {
            let upstream = name((i + len - 1) % len);
            builder = builder.task(&name(i), &[upstream.as_str()], noop());
        }
        prop_assert!(matches!(builder.try_build(), Err(TickdagError::DagCycle(_))));
    }

    /// Drive one run by hand through the store, picking among ready
    /// instances in a random order, and check that nothing ever starts
    /// before its upstreams succeeded.
    #[test]
    fn no_instance_starts_before_its_upstreams_succeed(
        deps in dag_strategy(10),
        failing in proptest::collection::btree_set(0usize..10, 0..3),
        picks in proptest::collection::vec(any::<usize>(), 1..32),
    ) {
        let graph = build(&deps);
        let store = StateStore::in_memory(Arc::new(ManualClock::new(t0())));
        let run = store.create_run(&graph, t0(), RunTrigger::Scheduled).unwrap().key();

        let mut step = 0;
        loop {
            store.propagate_upstream_failures(&run, &graph).unwrap();
            let ready = store.ready_instances(&run, &graph, t0());
            if ready.is_empty() {
                break;
            }
            let key = ready[picks[step % picks.len()] % ready.len()].key();
            step += 1;

            for dep in graph.upstreams_of(&key.task_id) {
                let upstream = store.instance(&run.instance(dep)).unwrap();
                prop_assert_eq!(upstream.state, InstanceState::Success);
            }

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

            let index: usize = key.task_id["task_".len()..].parse().unwrap();
            let (to, meta) = if failing.contains(&index) {
                (InstanceState::Failed, TransitionMeta::failed("boom"))
            } else {
                (InstanceState::Success, TransitionMeta::none())
            };
            store.transition_instance(&key, InstanceState::Running, to, meta).unwrap();
            store.recompute_run_state(&run).unwrap();
        }
        store.recompute_run_state(&run).unwrap();

        let expected = expected_states(&deps, &failing);

        for (i, state) in expected.iter().enumerate() {
            let instance = store.instance(&run.instance(name(i))).unwrap();
            prop_assert_eq!(instance.state, *state, "task {}", name(i));
            let ran = matches!(state, InstanceState::Success | InstanceState::Failed);
            prop_assert_eq!(instance.attempts, u32::from(ran));
        }
        prop_assert_eq!(
            store.run(&run).unwrap().state,
            aggregate_run_state(expected.iter().copied())
        );
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Same property with the real engine on a multi-threaded runtime: each
    /// task checks its upstreams from inside its own callable, after a
    /// random delay, while other tasks run concurrently.
    #[test]
    fn engine_never_starts_a_task_before_its_upstreams_succeed(
        deps in dag_strategy(8),
        failing in proptest::collection::btree_set(0usize..8, 0..2),
        delays_ms in proptest::collection::vec(0u64..4, 8),
    ) {
        let clock = ManualClock::new(t0());
        let store = Arc::new(StateStore::in_memory(Arc::new(clock.clone())));
        let run = RunKey::new("prop", t0());
        let early_starts = Arc::new(AtomicUsize::new(0));

        let mut builder = GraphBuilder::new("prop");
        for (i, upstream) in deps.iter().enumerate() {
            let names: Vec<String> = upstream.iter().map(|&d| name(d)).collect();
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            let (store, run, early_starts) = (Arc::clone(&store), run.clone(), Arc::clone(&early_starts));
            let upstream_keys: Vec<_> = names.iter().map(|dep| run.instance(dep.as_str())).collect();
            let delay = Duration::from_millis(delays_ms[i]);
            let fails = failing.contains(&i);
            let callable = task_fn(move |_| {
                let store = Arc::clone(&store);
                let upstream_keys = upstream_keys.clone();
                let early_starts = Arc::clone(&early_starts);
                async move {
                    let all_done = upstream_keys.iter().all(|key| {
                        store.instance(key).is_some_and(|u| u.state == InstanceState::Success)
                    });
                    if !all_done {
                        early_starts.fetch_add(1, Ordering::SeqCst);
                    }
                    tokio::time::sleep(delay).await;
                    if fails {
                        Err(TaskError::new("boom"))
                    } else {
                        Ok(())
                    }
                }
            });
            builder = builder.task(&name(i), &refs, callable);
        }

        let options = EngineOptions {
            tick_interval: Duration::from_millis(5),
            max_active_tasks: 4,
        };
        let mut engine = Engine::new(Arc::clone(&store), Arc::new(clock), options);
        engine.register(builder.build()).unwrap();

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(with_timeout(engine.run_until_idle())).unwrap();

        prop_assert_eq!(early_starts.load(Ordering::SeqCst), 0);
        let expected = expected_states(&deps, &failing);
        for (i, state) in expected.iter().enumerate() {
            let instance = store.instance(&run.instance(name(i))).unwrap();
            prop_assert_eq!(instance.state, *state, "task {}", name(i));
        }
        prop_assert_eq!(
            store.run(&run).unwrap().state,
            aggregate_run_state(expected.iter().copied())
        );
    }
}
