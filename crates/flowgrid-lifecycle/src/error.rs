//! Error types for run lifecycle transitions.

use flowgrid_state::{RunId, StateError, StateType};
use thiserror::Error;

pub type TransitionResult<T> = Result<T, TransitionError>;

#[derive(Debug, Error)]
pub enum TransitionError {
    #[error(
        "illegal transition for run {run_id}: {} -> {to}",
        .from.map_or("(new)", StateType::as_str)
    )]
    IllegalTransition {
        run_id: RunId,
        from: Option<StateType>,
        to: StateType,
    },

    #[error("run not found: {0}")]
    RunNotFound(RunId),

    /// The deployment already has `limit` runs in Running.
    #[error("deployment {deployment_id} is at its concurrency limit of {limit}")]
    ConcurrencyLimit { deployment_id: String, limit: u32 },

    #[error("store unavailable after {attempts} attempt(s): {source}")]
    StoreUnavailable {
        attempts: u32,
        #[source]
        source: StateError,
    },

    #[error("store error: {0}")]
    Store(#[source] StateError),
}

impl TransitionError {
    /// Classify a store error returned after `attempts` tries.
    pub fn from_store(err: StateError, attempts: u32) -> Self {
        match err {
            StateError::IllegalTransition { run_id, from, to } => {
                TransitionError::IllegalTransition { run_id, from, to }
            }
            StateError::ConcurrencyLimit {
                deployment_id,
                limit,
            } => TransitionError::ConcurrencyLimit {
                deployment_id,
                limit,
            },
            StateError::RunNotFound(id) => TransitionError::RunNotFound(id),
            e if e.is_transient() => TransitionError::StoreUnavailable {
                attempts,
                source: e,
            },
            e => TransitionError::Store(e),
        }
    }

    /// Lost a race with another writer, or asked for something the table forbids.
    pub fn is_illegal(&self) -> bool {
        matches!(self, TransitionError::IllegalTransition { .. })
    }
}
