//! Marks Scheduled runs that missed their start as Late.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use flowgrid_lifecycle::Lifecycle;
use flowgrid_state::{Expected, RunFilter, State, StateType};

use crate::error::HousekeepingResult;
use crate::service::{LoopService, PassStats, sweep};

pub const LATE_MESSAGE: &str = "Run is late.";

#[derive(Debug, Clone, PartialEq)]
pub struct LateRunsConfig {
    pub loop_interval: Duration,
    /// Grace period after the scheduled time.
    pub after: TimeDelta,
    pub batch_size: usize,
}

impl Default for LateRunsConfig {
    fn default() -> Self {
        Self {
            loop_interval: Duration::from_secs(5),
            after: TimeDelta::seconds(15),
            batch_size: 400,
        }
    }
}

pub struct LateRuns {
    lifecycle: Lifecycle,
    config: LateRunsConfig,
}

impl LateRuns {
    pub fn new(lifecycle: Lifecycle, config: LateRunsConfig) -> Self {
        Self { lifecycle, config }
    }
}

#[async_trait]
impl LoopService for LateRuns {
    fn name(&self) -> &'static str {
        "late_runs"
    }

    fn loop_interval(&self) -> Duration {
        self.config.loop_interval
    }

    async fn run_once(&self, now: DateTime<Utc>) -> HousekeepingResult<PassStats> {
        let cutoff = now - self.config.after;
        // Late runs are no longer Scheduled, so they are never matched twice.
        let filter = RunFilter::in_states([StateType::Scheduled])
            .scheduled_before(cutoff)
            .page(self.config.batch_size, 0);
        sweep(&self.lifecycle, filter, |_| {
            (
                Expected::state(StateType::Scheduled),
                State::new(StateType::Late, now).with_message(LATE_MESSAGE),
            )
        })
        .await
    }
}
