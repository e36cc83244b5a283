//! Turns one deployment's schedule into Scheduled runs.
//!
//! Candidates come from the recurrence evaluator. Those whose idempotency
//! key is already stored are dropped, the rest are inserted in chunks of at
//! most `insert_batch_size`, oldest first, one store transaction per chunk.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use flowgrid_recurrence::{SchedulingBounds, evaluate};
use flowgrid_state::{Deployment, Event, EventSink, NewRun, RetryPolicy, RunStore};
use tracing::{debug, info, warn};

use crate::error::{SchedulerError, SchedulerResult};

#[derive(Debug, Clone, PartialEq)]
pub struct MaterializerConfig {
    /// Upper bound on runs per insert transaction.
    pub insert_batch_size: usize,
    /// Defaults that deployment overrides are applied to.
    pub bounds: SchedulingBounds,
    pub retry: RetryPolicy,
}

impl Default for MaterializerConfig {
    fn default() -> Self {
        Self {
            insert_batch_size: 500,
            bounds: SchedulingBounds::default(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Outcome of materializing one deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaterializeReport {
    pub candidates: usize,
    pub already_present: usize,
    pub inserted: usize,
    pub chunks: usize,
}

pub struct Materializer {
    store: Arc<dyn RunStore>,
    events: Arc<dyn EventSink>,
    config: MaterializerConfig,
}

impl Materializer {
    pub fn new(
        store: Arc<dyn RunStore>,
        events: Arc<dyn EventSink>,
        config: MaterializerConfig,
    ) -> Self {
        Self {
            store,
            events,
            config,
        }
    }

    pub fn config(&self) -> &MaterializerConfig {
        &self.config
    }

    /// Insert the missing runs of `deployment` as of `now`.
    ///
    /// Safe to repeat: a second call with the same inputs inserts nothing.
    pub async fn materialize(
        &self,
        deployment: &Deployment,
        now: DateTime<Utc>,
    ) -> SchedulerResult<MaterializeReport> {
        let Some(schedule) = &deployment.schedule else {
            return Ok(MaterializeReport::default());
        };
        let bounds = deployment.bounds.apply(&self.config.bounds);
        let candidates = evaluate(schedule, now, &bounds);
        let mut report = MaterializeReport {
            candidates: candidates.len(),
            ..MaterializeReport::default()
        };
        if candidates.is_empty() {
            debug!(deployment_id = %deployment.id, schedule = %schedule.describe(), "no candidates");
            return Ok(report);
        }

        let runs: Vec<NewRun> = candidates
            .iter()
            .map(|at| NewRun::scheduled(deployment, *at, now))
            .collect();
        let keys: Vec<String> = runs.iter().map(|r| r.idempotency_key.clone()).collect();
        let existing = self
            .config
            .retry
            .retry("find_existing", || self.store.find_existing(&deployment.id, &keys))
            .await?;
        let fresh: Vec<NewRun> = runs
            .into_iter()
            .filter(|r| !existing.contains(&r.idempotency_key))
            .collect();
        report.already_present = report.candidates - fresh.len();

        for chunk in fresh.chunks(self.config.insert_batch_size.max(1)) {
            let inserted = self
                .config
                .retry
                .retry("insert_runs", || {
                    self.store.insert_runs(&deployment.id, chunk.to_vec())
                })
                .await
                .map_err(|source| {
                    warn!(
                        deployment_id = %deployment.id,
                        inserted = report.inserted,
                        error = %source,
                        "chunk insert failed, stopping deployment"
                    );
                    SchedulerError::PartialBatchFailure {
                        deployment_id: deployment.id.clone(),
                        inserted: report.inserted,
                        source,
                    }
                })?;

            report.chunks += 1;
            report.inserted += inserted;
            if inserted > 0 {
                if let (Some(first), Some(last)) = (chunk.first(), chunk.last()) {
                    self.events.emit(Event::RunsScheduled {
                        deployment_id: deployment.id.clone(),
                        count: inserted,
                        first: first.scheduled_time,
                        last: last.scheduled_time,
                    });
                }
            }
        }

        if report.inserted > 0 {
            info!(
                deployment_id = %deployment.id,
                inserted = report.inserted,
                chunks = report.chunks,
                "runs scheduled"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};
    use flowgrid_recurrence::{BoundsOverride, ScheduleSpec};
    use flowgrid_state::fault::FaultInjectingStore;
    use flowgrid_state::{BroadcastSink, RunFilter, StateStore};
    use std::time::Duration;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 1, 9, 0, 0).unwrap()
    }

    fn hourly(id: &str, min_runs: usize) -> Deployment {
        let mut deployment = Deployment::new(id, id, t0()).with_schedule(
            ScheduleSpec::interval(3600)
                .anchored_at(t0())
                .build()
                .unwrap(),
        );
        deployment.bounds = BoundsOverride {
            min_runs: Some(min_runs),
            ..Default::default()
        };
        deployment.tags = vec!["nightly".into()];
        deployment
    }

    fn config(insert_batch_size: usize) -> MaterializerConfig {
        MaterializerConfig {
            insert_batch_size,
            retry: RetryPolicy::new(2, Duration::from_millis(1)),
            ..Default::default()
        }
    }

    fn setup(
        insert_batch_size: usize,
    ) -> (Arc<FaultInjectingStore<StateStore>>, Arc<BroadcastSink>, Materializer) {
        let store = Arc::new(FaultInjectingStore::new(StateStore::open_in_memory().unwrap()));
        let sink = Arc::new(BroadcastSink::new(64));
        let materializer = Materializer::new(store.clone(), sink.clone(), config(insert_batch_size));
        (store, sink, materializer)
    }

    #[tokio::test]
    async fn inserts_in_chunks_of_batch_size() {
        let (store, sink, materializer) = setup(2);
        let mut events = sink.subscribe();

        let report = materializer.materialize(&hourly("etl", 5), t0()).await.unwrap();
        assert_eq!(report.candidates, 5);
        assert_eq!(report.inserted, 5);
        assert_eq!(store.insert_batches("etl"), vec![2, 2, 1]);

        let mut counts = Vec::new();
        while let Ok(Event::RunsScheduled { count, first, last, .. }) = events.try_recv() {
            assert!(first <= last);
            counts.push(count);
        }
        assert_eq!(counts, vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn runs_are_scheduled_in_order_with_deployment_tags() {
        let (store, _, materializer) = setup(500);
        materializer.materialize(&hourly("etl", 3), t0()).await.unwrap();

        let runs = store
            .query_runs(&RunFilter::default().for_deployment("etl"))
            .await
            .unwrap();
        let times: Vec<_> = runs.iter().map(|r| r.scheduled_time).collect();
        assert_eq!(
            times,
            vec![
                t0() + TimeDelta::hours(1),
                t0() + TimeDelta::hours(2),
                t0() + TimeDelta::hours(3),
            ]
        );
        assert!(runs.iter().all(|r| r.tags == vec!["nightly".to_string()]));
    }

    #[tokio::test]
    async fn second_call_inserts_nothing() {
        let (store, _, materializer) = setup(2);
        let deployment = hourly("etl", 5);
        materializer.materialize(&deployment, t0()).await.unwrap();

        let again = materializer.materialize(&deployment, t0()).await.unwrap();
        assert_eq!(again.inserted, 0);
        assert_eq!(again.already_present, 5);
        assert_eq!(again.chunks, 0);
        assert_eq!(store.insert_batches("etl"), vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn later_call_only_adds_new_horizon() {
        let (_, _, materializer) = setup(500);
        let deployment = hourly("etl", 3);
        materializer.materialize(&deployment, t0()).await.unwrap();

        let later = materializer
            .materialize(&deployment, t0() + TimeDelta::hours(1))
            .await
            .unwrap();
        assert_eq!(later.candidates, 3);
        assert_eq!(later.already_present, 2);
        assert_eq!(later.inserted, 1);
    }

    #[tokio::test]
    async fn transient_insert_failure_is_retried() {
        let (store, _, materializer) = setup(500);
        store.fail_inserts("etl", 1);

        let report = materializer.materialize(&hourly("etl", 3), t0()).await.unwrap();
        assert_eq!(report.inserted, 3);
    }

    #[tokio::test]
    async fn exhausted_retries_keep_earlier_chunks() {
        let (store, _, materializer) = setup(2);
        let deployment = hourly("etl", 5);
        store.fail_inserts_after("etl", 1, u32::MAX);

        let err = materializer.materialize(&deployment, t0()).await.unwrap_err();
        match err {
            SchedulerError::PartialBatchFailure { inserted, .. } => assert_eq!(inserted, 2),
            other => panic!("unexpected error {other}"),
        }
        let stored = store
            .query_runs(&RunFilter::default().for_deployment("etl"))
            .await
            .unwrap();
        assert_eq!(stored.len(), 2);

        store.heal_inserts("etl");
        let report = materializer.materialize(&deployment, t0()).await.unwrap();
        assert_eq!(report.already_present, 2);
        assert_eq!(report.inserted, 3);
    }

    #[tokio::test]
    async fn deployment_without_schedule_is_a_no_op() {
        let (store, _, materializer) = setup(2);
        let deployment = Deployment::new("manual", "manual", t0());
        let report = materializer.materialize(&deployment, t0()).await.unwrap();
        assert_eq!(report, MaterializeReport::default());
        assert!(store.insert_batches("manual").is_empty());
    }
}
