//! Scheduler loop: pages through schedulable deployments and materializes
//! their runs.
//!
//! One pass walks the catalog in pages of `deployment_batch_size`. Each page
//! is materialized with at most `max_concurrency` deployments in flight. A
//! full page is followed immediately by the next one; a short page ends the
//! pass and the loop sleeps for `loop_interval`.
//!
//! ```text
//! Idle ──▶ Paging ──▶ Draining ──┬──▶ Paging   (page was full)
//!                                └──▶ Sleeping ──▶ Paging
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use flowgrid_state::{Deployment, DeploymentCatalog, Event, EventSink, RunStore};

use crate::error::SchedulerResult;
use crate::materializer::{MaterializeReport, Materializer, MaterializerConfig};

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub loop_interval: Duration,
    pub deployment_batch_size: usize,
    /// Deployments materialized concurrently within one page.
    pub max_concurrency: usize,
    /// Consecutive failed passes before `SchedulingFailed` is emitted.
    pub failure_threshold: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            loop_interval: Duration::from_secs(60),
            deployment_batch_size: 100,
            max_concurrency: 10,
            failure_threshold: 2,
        }
    }
}

/// Where the loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    Idle,
    Paging,
    Draining,
    Sleeping,
}

/// Totals for one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub pages: usize,
    pub deployments: usize,
    pub inserted: usize,
    /// Deployments whose materialization failed this pass.
    pub failed: Vec<String>,
    /// The pass ended early on a stop request.
    pub interrupted: bool,
}

pub struct Scheduler {
    catalog: Arc<dyn DeploymentCatalog>,
    materializer: Materializer,
    events: Arc<dyn EventSink>,
    config: SchedulerConfig,
    phase: watch::Sender<LoopPhase>,
    /// deployment_id → consecutive failed passes.
    failures: Mutex<HashMap<String, u32>>,
}

impl Scheduler {
    pub fn new(
        catalog: Arc<dyn DeploymentCatalog>,
        store: Arc<dyn RunStore>,
        events: Arc<dyn EventSink>,
        config: SchedulerConfig,
        materializer: MaterializerConfig,
    ) -> Self {
        let (phase, _) = watch::channel(LoopPhase::Idle);
        Self {
            catalog,
            materializer: Materializer::new(store, events.clone(), materializer),
            events,
            config,
            phase,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Observe phase changes.
    pub fn phase(&self) -> watch::Receiver<LoopPhase> {
        self.phase.subscribe()
    }

    fn set_phase(&self, phase: LoopPhase) {
        self.phase.send_replace(phase);
    }

    /// Consecutive failed passes recorded for a deployment.
    pub async fn failure_count(&self, deployment_id: &str) -> u32 {
        self.failures
            .lock()
            .await
            .get(deployment_id)
            .copied()
            .unwrap_or(0)
    }

    /// Run until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval = ?self.config.loop_interval,
            batch = self.config.deployment_batch_size,
            "scheduler started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.run_pass(Utc::now(), Some(&shutdown)).await {
                Ok(report) => {
                    debug!(
                        pages = report.pages,
                        deployments = report.deployments,
                        inserted = report.inserted,
                        failed = report.failed.len(),
                        "scheduler pass finished"
                    );
                }
                Err(e) => error!(error = %e, "scheduler pass failed"),
            }

            self.set_phase(LoopPhase::Sleeping);
            tokio::select! {
                _ = tokio::time::sleep(self.config.loop_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.set_phase(LoopPhase::Idle);
        info!("scheduler stopped");
    }

    /// One pass over the whole catalog as of `now`.
    ///
    /// A stop request is honoured between pages. Errors listing the catalog
    /// end the pass; per-deployment errors are recorded and skipped.
    pub async fn run_pass(
        &self,
        now: DateTime<Utc>,
        shutdown: Option<&watch::Receiver<bool>>,
    ) -> SchedulerResult<PassReport> {
        let mut report = PassReport::default();
        let mut token: Option<String> = None;
        let page_size = self.config.deployment_batch_size.max(1);

        loop {
            if shutdown.is_some_and(|rx| *rx.borrow()) {
                report.interrupted = true;
                break;
            }

            self.set_phase(LoopPhase::Paging);
            let page = self
                .materializer
                .config()
                .retry
                .retry("list_schedulable", || {
                    self.catalog.list_schedulable(token.as_deref(), page_size)
                })
                .await?;
            report.pages += 1;
            report.deployments += page.deployments.len();

            self.set_phase(LoopPhase::Draining);
            let pending: Vec<_> = page
                .deployments
                .iter()
                .map(|deployment| async move {
                    let outcome = self.materializer.materialize(deployment, now).await;
                    (deployment, outcome)
                })
                .collect();
            let outcomes: Vec<_> = stream::iter(pending)
                .buffer_unordered(self.config.max_concurrency.max(1))
                .collect()
                .await;

            for (deployment, outcome) in outcomes {
                self.record(deployment, outcome, &mut report).await;
            }

            let full = page.deployments.len() == page_size;
            match page.next_page_token {
                Some(next) if full => token = Some(next),
                _ => break,
            }
        }

        Ok(report)
    }

    async fn record(
        &self,
        deployment: &Deployment,
        outcome: SchedulerResult<MaterializeReport>,
        report: &mut PassReport,
    ) {
        let mut failures = self.failures.lock().await;
        match outcome {
            Ok(done) => {
                report.inserted += done.inserted;
                failures.remove(&deployment.id);
            }
            Err(e) => {
                let count = failures.entry(deployment.id.clone()).or_insert(0);
                *count += 1;
                warn!(
                    deployment_id = %deployment.id,
                    consecutive_failures = *count,
                    error = %e,
                    "failed to schedule runs"
                );
                if *count >= self.config.failure_threshold {
                    self.events.emit(Event::SchedulingFailed {
                        deployment_id: deployment.id.clone(),
                        consecutive_failures: *count,
                        error: e.to_string(),
                    });
                }
                report.failed.push(deployment.id.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use flowgrid_recurrence::ScheduleSpec;
    use flowgrid_state::fault::FaultInjectingStore;
    use flowgrid_state::{BroadcastSink, NullSink, RetryPolicy, RunFilter, StateStore};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 8, 1, 0, 0, 0).unwrap()
    }

    fn hourly(id: &str) -> Deployment {
        Deployment::new(id, id, t0()).with_schedule(
            ScheduleSpec::interval(3600)
                .anchored_at(t0())
                .build()
                .unwrap(),
        )
    }

    fn materializer_config() -> MaterializerConfig {
        MaterializerConfig {
            retry: RetryPolicy::new(1, Duration::ZERO),
            ..Default::default()
        }
    }

    fn scheduler(
        store: &StateStore,
        runs: Arc<dyn RunStore>,
        events: Arc<dyn EventSink>,
        batch: usize,
    ) -> Scheduler {
        Scheduler::new(
            Arc::new(store.clone()),
            runs,
            events,
            SchedulerConfig {
                deployment_batch_size: batch,
                max_concurrency: 2,
                loop_interval: Duration::from_millis(10),
                ..Default::default()
            },
            materializer_config(),
        )
    }

    #[tokio::test]
    async fn pass_drains_every_page() {
        let store = StateStore::open_in_memory().unwrap();
        for i in 0..5 {
            store.put_deployment(&hourly(&format!("dep-{i}"))).unwrap();
        }
        let scheduler = scheduler(&store, Arc::new(store.clone()), Arc::new(NullSink), 2);

        let report = scheduler.run_pass(t0(), None).await.unwrap();
        assert_eq!(report.pages, 3);
        assert_eq!(report.deployments, 5);
        assert_eq!(report.inserted, 15);
        assert!(report.failed.is_empty());

        let again = scheduler.run_pass(t0(), None).await.unwrap();
        assert_eq!(again.inserted, 0);
    }

    #[tokio::test]
    async fn exact_multiple_of_page_size_ends_on_empty_page() {
        let store = StateStore::open_in_memory().unwrap();
        for i in 0..4 {
            store.put_deployment(&hourly(&format!("dep-{i}"))).unwrap();
        }
        let scheduler = scheduler(&store, Arc::new(store.clone()), Arc::new(NullSink), 2);
        let report = scheduler.run_pass(t0(), None).await.unwrap();
        assert_eq!(report.pages, 3);
        assert_eq!(report.deployments, 4);
    }

    #[tokio::test]
    async fn failing_deployment_does_not_abort_pass() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_deployment(&hourly("bad")).unwrap();
        store.put_deployment(&hourly("good")).unwrap();
        let flaky = Arc::new(FaultInjectingStore::new(store.clone()));
        flaky.fail_inserts_always("bad");
        let sink = Arc::new(BroadcastSink::new(64));
        let mut events = sink.subscribe();
        let scheduler = scheduler(&store, flaky.clone(), sink.clone(), 10);

        let first = scheduler.run_pass(t0(), None).await.unwrap();
        assert_eq!(first.failed, vec!["bad".to_string()]);
        assert_eq!(first.inserted, 3);
        assert_eq!(scheduler.failure_count("bad").await, 1);

        let second = scheduler.run_pass(t0(), None).await.unwrap();
        assert_eq!(second.failed, vec!["bad".to_string()]);
        assert_eq!(scheduler.failure_count("bad").await, 2);

        let mut flagged = None;
        while let Ok(event) = events.try_recv() {
            if let Event::SchedulingFailed {
                deployment_id,
                consecutive_failures,
                ..
            } = event
            {
                flagged = Some((deployment_id, consecutive_failures));
            }
        }
        assert_eq!(flagged, Some(("bad".to_string(), 2)));

        flaky.heal_inserts("bad");
        let third = scheduler.run_pass(t0(), None).await.unwrap();
        assert!(third.failed.is_empty());
        assert_eq!(third.inserted, 3);
        assert_eq!(scheduler.failure_count("bad").await, 0);
    }

    #[tokio::test]
    async fn stop_request_is_honoured_between_pages() {
        let store = StateStore::open_in_memory().unwrap();
        for i in 0..3 {
            store.put_deployment(&hourly(&format!("dep-{i}"))).unwrap();
        }
        let scheduler = scheduler(&store, Arc::new(store.clone()), Arc::new(NullSink), 1);
        let (_tx, rx) = watch::channel(true);

        let report = scheduler.run_pass(t0(), Some(&rx)).await.unwrap();
        assert!(report.interrupted);
        assert_eq!(report.pages, 0);
    }

    #[tokio::test]
    async fn run_loop_materializes_and_stops() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_deployment(&hourly("etl")).unwrap();
        let scheduler = Arc::new(scheduler(
            &store,
            Arc::new(store.clone()),
            Arc::new(NullSink),
            10,
        ));
        let mut phase = scheduler.phase();
        let (tx, rx) = watch::channel(false);
        let started = Utc::now();

        let handle = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.run(rx).await }
        });

        phase
            .wait_for(|p| *p == LoopPhase::Sleeping)
            .await
            .unwrap();
        let runs = store
            .query_runs(&RunFilter::default().for_deployment("etl"))
            .await
            .unwrap();
        assert!(runs.len() >= 3);
        assert!(runs.iter().all(|r| r.scheduled_time > started));

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*scheduler.phase().borrow(), LoopPhase::Idle);
    }
}
