//! Periodic service plumbing shared by the housekeeping passes.
//!
//! Each service runs in its own task: one pass, then sleep for its
//! `loop_interval` or until the shared stop signal fires. A failed pass is
//! logged and the service carries on.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowgrid_lifecycle::Lifecycle;
use flowgrid_state::{Expected, Run, RunFilter, State};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::HousekeepingResult;

/// What one pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassStats {
    pub examined: usize,
    pub transitioned: usize,
    /// Lost a race with another writer.
    pub skipped: usize,
    pub failed: usize,
}

impl PassStats {
    pub fn is_idle(&self) -> bool {
        self.examined == 0
    }

    pub(crate) fn absorb(&mut self, other: PassStats) {
        self.examined += other.examined;
        self.transitioned += other.transitioned;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

#[async_trait]
pub trait LoopService: Send + Sync {
    fn name(&self) -> &'static str;

    fn loop_interval(&self) -> Duration;

    /// One pass as of `now`.
    async fn run_once(&self, now: DateTime<Utc>) -> HousekeepingResult<PassStats>;
}

/// Drive `service` until `shutdown` flips to `true` or its sender is dropped.
pub async fn run_service(service: Arc<dyn LoopService>, mut shutdown: watch::Receiver<bool>) {
    let name = service.name();
    let interval = service.loop_interval();
    info!(service = name, ?interval, "service started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        match service.run_once(Utc::now()).await {
            Ok(stats) if stats.is_idle() => debug!(service = name, "nothing to do"),
            Ok(stats) => info!(
                service = name,
                transitioned = stats.transitioned,
                skipped = stats.skipped,
                failed = stats.failed,
                "pass finished"
            ),
            Err(e) => error!(service = name, error = %e, "pass failed"),
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    info!(service = name, "service stopped");
}

/// Owns the tasks of every spawned service and their stop signal.
pub struct ServiceManager {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Default for ServiceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceManager {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            tasks: Vec::new(),
        }
    }

    /// A receiver for the stop signal, for loops not spawned here.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn spawn(&mut self, service: Arc<dyn LoopService>) {
        let name = service.name();
        let shutdown = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(run_service(service, shutdown));
        self.tasks.push((name, handle));
    }

    pub fn running(&self) -> Vec<&'static str> {
        self.tasks
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(name, _)| *name)
            .collect()
    }

    /// Signal every service to stop and wait for them.
    pub async fn stop_all(self) {
        let _ = self.shutdown_tx.send(true);
        for (name, handle) in self.tasks {
            if let Err(e) = handle.await {
                error!(service = name, error = %e, "service task panicked");
            }
        }
        info!("all services stopped");
    }
}

/// Move every run matching `filter` to the state built by `next`.
///
/// `next` also returns what the run must still look like when the commit
/// happens. Transitioned runs and runs that changed underneath have left the
/// filter, so only failed ones advance the offset.
pub(crate) async fn sweep<F>(
    lifecycle: &Lifecycle,
    filter: RunFilter,
    mut next: F,
) -> HousekeepingResult<PassStats>
where
    F: FnMut(&Run) -> (Expected, State) + Send,
{
    let limit = filter.limit.max(1);
    let mut stats = PassStats::default();
    let mut offset = 0;

    loop {
        let page = lifecycle
            .store()
            .query_runs(&filter.clone().page(limit, offset))
            .await?;
        let fetched = page.len();
        stats.examined += fetched;

        for run in page {
            let (expected, state) = next(&run);
            let to = state.kind;
            match lifecycle.transition_from(run.id, expected, state).await {
                Ok(_) => stats.transitioned += 1,
                Err(e) if e.is_illegal() => {
                    debug!(run_id = %run.id, %to, "run changed underneath, skipped");
                    stats.skipped += 1;
                }
                Err(e) => {
                    warn!(run_id = %run.id, %to, error = %e, "transition failed");
                    stats.failed += 1;
                    offset += 1;
                }
            }
        }

        if fetched < limit {
            break;
        }
    }

    Ok(stats)
}
