//! Scheduler error types.

use flowgrid_state::StateError;
use thiserror::Error;

/// Errors that can occur while materializing runs.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A chunk insert kept failing. Chunks before it stay inserted.
    #[error(
        "partial batch failure for deployment {deployment_id}: {inserted} run(s) inserted before: {source}"
    )]
    PartialBatchFailure {
        deployment_id: String,
        inserted: usize,
        #[source]
        source: StateError,
    },

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
