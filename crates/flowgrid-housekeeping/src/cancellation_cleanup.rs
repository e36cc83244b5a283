//! Cancels the unfinished descendants of cancelled runs.
//!
//! Children are found through `parent_run_id`. The walk goes through every
//! child, finished or not, so a still-running grandchild under a completed
//! child is cancelled too.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use flowgrid_lifecycle::Lifecycle;
use flowgrid_state::{Expected, RunFilter, RunId, State, StateType};
use tracing::{debug, warn};

use crate::error::HousekeepingResult;
use crate::service::{LoopService, PassStats};

pub const PARENT_CANCELLED_MESSAGE: &str = "The parent run was cancelled.";

#[derive(Debug, Clone, PartialEq)]
pub struct CancellationCleanupConfig {
    pub loop_interval: Duration,
    pub batch_size: usize,
    /// Only runs cancelled within this window are revisited.
    pub lookback: TimeDelta,
}

impl Default for CancellationCleanupConfig {
    fn default() -> Self {
        Self {
            loop_interval: Duration::from_secs(20),
            batch_size: 200,
            lookback: TimeDelta::days(1),
        }
    }
}

pub struct CancellationCleanup {
    lifecycle: Lifecycle,
    config: CancellationCleanupConfig,
}

impl CancellationCleanup {
    pub fn new(lifecycle: Lifecycle, config: CancellationCleanupConfig) -> Self {
        Self { lifecycle, config }
    }

    fn limit(&self) -> usize {
        self.config.batch_size.max(1)
    }

    async fn cancel_descendants(
        &self,
        root: RunId,
        now: DateTime<Utc>,
        visited: &mut HashSet<RunId>,
    ) -> HousekeepingResult<PassStats> {
        let mut stats = PassStats::default();
        let mut stack = vec![root];

        while let Some(parent) = stack.pop() {
            if !visited.insert(parent) {
                continue;
            }
            let mut offset = 0;
            loop {
                let children = self
                    .lifecycle
                    .store()
                    .query_runs(&RunFilter::default().children_of(parent).page(self.limit(), offset))
                    .await?;
                let fetched = children.len();
                offset += fetched;

                for child in children {
                    stack.push(child.id);
                    if child.state.is_terminal() {
                        continue;
                    }
                    stats.examined += 1;
                    let state = State::new(StateType::Cancelled, now)
                        .with_message(PARENT_CANCELLED_MESSAGE);
                    let expected = Expected::state(child.state.kind);
                    match self.lifecycle.transition_from(child.id, expected, state).await {
                        Ok(_) => {
                            debug!(run_id = %child.id, %parent, "child run cancelled");
                            stats.transitioned += 1;
                        }
                        Err(e) if e.is_illegal() => stats.skipped += 1,
                        Err(e) => {
                            warn!(run_id = %child.id, %parent, error = %e, "failed to cancel child run");
                            stats.failed += 1;
                        }
                    }
                }

                if fetched < self.limit() {
                    break;
                }
            }
        }

        Ok(stats)
    }
}

#[async_trait]
impl LoopService for CancellationCleanup {
    fn name(&self) -> &'static str {
        "cancellation_cleanup"
    }

    fn loop_interval(&self) -> Duration {
        self.config.loop_interval
    }

    async fn run_once(&self, now: DateTime<Utc>) -> HousekeepingResult<PassStats> {
        let mut stats = PassStats::default();
        let mut visited = HashSet::new();
        let mut offset = 0;
        let filter = RunFilter::in_states([StateType::Cancelled])
            .updated_since(now - self.config.lookback);

        loop {
            let cancelled = self
                .lifecycle
                .store()
                .query_runs(&filter.clone().page(self.limit(), offset))
                .await?;
            let fetched = cancelled.len();
            offset += fetched;

            for run in cancelled {
                let found = self.cancel_descendants(run.id, now, &mut visited).await?;
                stats.absorb(found);
            }

            if fetched < self.limit() {
                break;
            }
        }

        Ok(stats)
    }
}
