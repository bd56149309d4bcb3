// src/schedule.rs

//! Clock abstraction and the schedule generator.
//!
//! A graph's [`Schedule`] is a start time plus a fixed interval. Every
//! `start + k * interval` (k >= 0) that is not in the future is a *logical
//! timestamp* the graph should have a DAG run for. [`due_runs`] yields the
//! ones that are not materialized yet, oldest first, so a backlog is caught
//! up in creation order.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeDelta, Utc};

use crate::errors::{Result, TickdagError};

/// Source of wall-clock time for the engine.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Jump forward to `to` without waiting, if this clock is virtual.
    /// Returns `false` for clocks that can only be waited on.
    fn skip_to(&self, _to: DateTime<Utc>) -> bool {
        false
    }
}

/// Real wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.lock() = to;
    }

    pub fn advance(&self, by: TimeDelta) {
        let mut now = self.lock();
        *now += by;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DateTime<Utc>> {
        // A poisoned clock still holds a valid timestamp.
        self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.lock()
    }

    /// Never moves backwards.
    fn skip_to(&self, to: DateTime<Utc>) -> bool {
        let mut now = self.lock();
        if to > *now {
            *now = to;
        }
        true
    }
}

/// Recurring schedule of a task graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    start: DateTime<Utc>,
    interval: TimeDelta,
    catchup: bool,
}

impl Schedule {
    /// Create a schedule with catch-up enabled.
    ///
    /// Fails with [`TickdagError::ConfigError`] if `interval` is zero,
    /// negative, or not a whole number of milliseconds.
    pub fn new(start: DateTime<Utc>, interval: TimeDelta) -> Result<Self> {
        if interval <= TimeDelta::zero() {
            return Err(TickdagError::ConfigError(format!(
                "schedule interval must be positive (got {interval})"
            )));
        }
        if interval.subsec_nanos() % 1_000_000 != 0 {
            return Err(TickdagError::ConfigError(format!(
                "schedule interval must be a whole number of milliseconds (got {interval})"
            )));
        }
        Ok(Self {
            start,
            interval,
            catchup: true,
        })
    }

    /// With `catchup = false` only the most recent due interval is ever
    /// scheduled; older missed intervals are skipped.
    pub fn with_catchup(mut self, catchup: bool) -> Self {
        self.catchup = catchup;
        self
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn interval(&self) -> TimeDelta {
        self.interval
    }

    pub fn catchup(&self) -> bool {
        self.catchup
    }

    /// Latest `start + k * interval` that is `<= now`, if any.
    pub fn latest_due(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if now < self.start {
            return None;
        }
        let elapsed_ms = (now - self.start).num_milliseconds();
        let interval_ms = self.interval.num_milliseconds();
        let k = elapsed_ms / interval_ms;
        k.checked_mul(interval_ms)
            .and_then(TimeDelta::try_milliseconds)
            .and_then(|offset| self.start.checked_add_signed(offset))
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "every {} from {}{}",
            self.interval,
            self.start.to_rfc3339(),
            if self.catchup { "" } else { " (no catchup)" }
        )
    }
}

/// Lazy, finite sequence of due logical timestamps. See [`due_runs`].
#[derive(Debug)]
pub struct DueRuns<'a> {
    next: Option<DateTime<Utc>>,
    interval: TimeDelta,
    now: DateTime<Utc>,
    existing: &'a BTreeSet<DateTime<Utc>>,
}

impl Iterator for DueRuns<'_> {
    type Item = DateTime<Utc>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let candidate = self.next?;
            if candidate > self.now {
                self.next = None;
                return None;
            }
            self.next = candidate.checked_add_signed(self.interval);
            if !self.existing.contains(&candidate) {
                return Some(candidate);
            }
        }
    }
}

/// Every logical timestamp of `schedule` that is due at `now` and not in
/// `existing`, ascending.
///
/// The sequence is bounded by `now`, so each call only ever covers the
/// current backlog; callers simply ask again on the next tick.
pub fn due_runs<'a>(
    schedule: &Schedule,
    now: DateTime<Utc>,
    existing: &'a BTreeSet<DateTime<Utc>>,
) -> DueRuns<'a> {
    let first = if schedule.catchup {
        Some(schedule.start)
    } else {
        schedule.latest_due(now)
    };

    DueRuns {
        next: first,
        interval: schedule.interval,
        now,
        existing,
    }
}
