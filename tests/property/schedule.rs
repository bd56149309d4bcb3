use std::collections::BTreeSet;

use chrono::TimeDelta;
use proptest::prelude::*;
use tickdag::schedule::{due_runs, Schedule};
use tickdag_test_utils::builders::t0;

proptest! {
    #[test]
    fn due_runs_cover_every_interval_up_to_now(
        interval_min in 1i64..240,
        now_offset_min in -600i64..6000,
        taken in proptest::collection::btree_set(0i64..50, 0..10),
    ) {
        let interval = TimeDelta::minutes(interval_min);
        let schedule = Schedule::new(t0(), interval).unwrap();
        let now = t0() + TimeDelta::minutes(now_offset_min);
        let existing: BTreeSet<_> = taken.iter().map(|k| t0() + interval * (*k as i32)).collect();

        let due: Vec<_> = due_runs(&schedule, now, &existing).collect();

        let expected_all: Vec<_> = if now_offset_min < 0 {
            Vec::new()
        } else {
            (0..=now_offset_min / interval_min)
                .map(|k| t0() + TimeDelta::minutes(k * interval_min))
                .collect()
        };
        let expected: Vec<_> = expected_all
            .into_iter()
            .filter(|ts| !existing.contains(ts))
            .collect();
        prop_assert_eq!(&due, &expected);

        for ts in &due {
            prop_assert!(*ts <= now);
            prop_assert_eq!((*ts - t0()).num_minutes() % interval_min, 0);
        }
    }

    #[test]
    fn without_catchup_at_most_the_latest_interval_is_due(
        interval_min in 1i64..240,
        now_offset_min in -600i64..6000,
    ) {
        let schedule = Schedule::new(t0(), TimeDelta::minutes(interval_min))
            .unwrap()
            .with_catchup(false);
        let now = t0() + TimeDelta::minutes(now_offset_min);
        let none = BTreeSet::new();

        let due: Vec<_> = due_runs(&schedule, now, &none).collect();

        if now_offset_min < 0 {
            prop_assert!(due.is_empty());
        } else {
            let latest = t0() + TimeDelta::minutes(now_offset_min / interval_min * interval_min);
            prop_assert_eq!(due, vec![latest]);
            prop_assert_eq!(schedule.latest_due(now), Some(latest));
        }
    }
}
