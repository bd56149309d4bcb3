use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tickdag::dag::{RunContext, TaskCallable, TaskError, TaskFuture};

/// Shared log of every callable invocation, in call order.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<RunContext>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, ctx: RunContext) {
        self.calls.lock().unwrap().push(ctx);
    }

    pub fn calls(&self) -> Vec<RunContext> {
        self.calls.lock().unwrap().clone()
    }

    /// Task ids in call order.
    pub fn task_ids(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.task_id).collect()
    }

    pub fn count(&self, task_id: &str) -> usize {
        self.calls().iter().filter(|c| c.task_id == task_id).count()
    }
}

/// How a [`FakeTask`] behaves on a given attempt.
#[derive(Debug, Clone, Copy)]
enum Script {
    Succeed,
    /// Fail the first `n` attempts, then succeed.
    FailTimes(u32),
    AlwaysFail,
    Panic,
}

/// A fake callable that:
/// - records each invocation in a [`CallLog`]
/// - optionally sleeps, to keep executions in flight
/// - succeeds, fails or panics according to its script.
#[derive(Debug, Clone)]
pub struct FakeTask {
    log: CallLog,
    script: Script,
    delay: Duration,
    running: Arc<AtomicUsize>,
    max_running: Arc<AtomicUsize>,
}

impl FakeTask {
    fn new(log: &CallLog, script: Script) -> Self {
        Self {
            log: log.clone(),
            script,
            delay: Duration::ZERO,
            running: Arc::new(AtomicUsize::new(0)),
            max_running: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn succeed(log: &CallLog) -> Self {
        Self::new(log, Script::Succeed)
    }

    pub fn fail_times(log: &CallLog, n: u32) -> Self {
        Self::new(log, Script::FailTimes(n))
    }

    pub fn always_fail(log: &CallLog) -> Self {
        Self::new(log, Script::AlwaysFail)
    }

    pub fn panic(log: &CallLog) -> Self {
        Self::new(log, Script::Panic)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Highest number of concurrent invocations of this task (and its
    /// clones) observed so far.
    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    pub fn arc(self) -> Arc<dyn TaskCallable> {
        Arc::new(self)
    }
}

impl TaskCallable for FakeTask {
    fn call(&self, ctx: RunContext) -> TaskFuture {
        let this = self.clone();
        Box::pin(async move {
            let attempt = ctx.attempt;
            tracing::debug!(task = %ctx.task_id, attempt, script = ?this.script, "fake task called");
            this.log.record(ctx);

            let now_running = this.running.fetch_add(1, Ordering::SeqCst) + 1;
            this.max_running.fetch_max(now_running, Ordering::SeqCst);
            if !this.delay.is_zero() {
                tokio::time::sleep(this.delay).await;
            }
            this.running.fetch_sub(1, Ordering::SeqCst);

            match this.script {
                Script::Succeed => Ok(()),
                Script::FailTimes(n) if attempt <= n => {
                    Err(TaskError::new(format!("scripted failure on attempt {attempt}")))
                }
                Script::FailTimes(_) => Ok(()),
                Script::AlwaysFail => Err(TaskError::new("scripted permanent failure")),
                Script::Panic => panic!("scripted panic"),
            }
        })
    }
}
