//! Fails Paused runs whose pause deadline has passed.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowgrid_lifecycle::Lifecycle;
use flowgrid_state::{Expected, RunFilter, State, StateType};

use crate::error::HousekeepingResult;
use crate::service::{LoopService, PassStats, sweep};

pub const EXPIRED_MESSAGE: &str = "The run was paused and never resumed.";

#[derive(Debug, Clone, PartialEq)]
pub struct PauseExpirationsConfig {
    pub loop_interval: Duration,
    pub batch_size: usize,
}

impl Default for PauseExpirationsConfig {
    fn default() -> Self {
        Self {
            loop_interval: Duration::from_secs(5),
            batch_size: 200,
        }
    }
}

pub struct PauseExpirations {
    lifecycle: Lifecycle,
    config: PauseExpirationsConfig,
}

impl PauseExpirations {
    pub fn new(lifecycle: Lifecycle, config: PauseExpirationsConfig) -> Self {
        Self { lifecycle, config }
    }
}

#[async_trait]
impl LoopService for PauseExpirations {
    fn name(&self) -> &'static str {
        "pause_expirations"
    }

    fn loop_interval(&self) -> Duration {
        self.config.loop_interval
    }

    async fn run_once(&self, now: DateTime<Utc>) -> HousekeepingResult<PassStats> {
        let filter = RunFilter::in_states([StateType::Paused])
            .pause_deadline_before(now)
            .page(self.config.batch_size, 0);
        // A run resumed or re-paused after the query no longer matches.
        sweep(&self.lifecycle, filter, |_| {
            (
                Expected::state(StateType::Paused).pause_expired_by(now),
                State::new(StateType::Failed, now).with_message(EXPIRED_MESSAGE),
            )
        })
        .await
    }
}
