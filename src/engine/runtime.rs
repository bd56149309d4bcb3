// src/engine/runtime.rs

use std::sync::Arc;

use anyhow::anyhow;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, trace, warn};

use crate::errors::{Result, TickdagError};

use super::core::Engine;

/// Handle to a running scheduler loop. See [`Engine::start`].
#[derive(Debug)]
pub struct EngineHandle {
    engine: Arc<Engine>,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl EngineHandle {
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Stop ticking, wait for the loop to exit, then wait for every
    /// in-flight task execution to finish. Running callables are not
    /// cancelled.
    pub async fn stop(self) -> Result<()> {
        info!("engine stop requested");
        // Receiver may already be gone if the loop exited on its own.
        let _ = self.shutdown_tx.send(true);

        self.join
            .await
            .map_err(|e| TickdagError::Other(anyhow!("scheduler loop panicked: {e}")))?;

        self.engine.executor().drain().await;
        info!("engine stopped");
        Ok(())
    }
}

impl Engine {
    /// Spawn the interval-driven scheduler loop on the current tokio runtime.
    ///
    /// Each tick runs to completion before the next one starts; task
    /// executions dispatched by a tick keep running across ticks. Failures
    /// inside a tick are logged there and the loop carries on.
    pub fn start(self) -> EngineHandle {
        let engine = Arc::new(self);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let join = tokio::spawn(run_loop(Arc::clone(&engine), shutdown_rx));

        EngineHandle {
            engine,
            shutdown_tx,
            join,
        }
    }
}

async fn run_loop(engine: Arc<Engine>, mut shutdown_rx: watch::Receiver<bool>) {
    let tick_interval = engine.options().tick_interval;
    info!(?tick_interval, "scheduler loop started");

    let mut ticker = tokio::time::interval(tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    // Sender dropped: nobody can stop us any more, so stop now.
                    break;
                }
                continue;
            }
            _ = ticker.tick() => {}
        }

        let report = engine.tick();
        if report.errors > 0 {
            warn!(errors = report.errors, "scheduler tick finished with errors");
        }
        trace!(?report, "tick");
    }

    info!("scheduler loop exiting");
}
