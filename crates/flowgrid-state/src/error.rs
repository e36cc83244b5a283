//! Error types for the run store.

use thiserror::Error;

use crate::types::{RunId, StateType};

/// Result type alias for run store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during run store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("run not found: {0}")]
    RunNotFound(RunId),

    #[error(
        "illegal transition for run {run_id}: {} -> {to}",
        .from.map_or("(new)", StateType::as_str)
    )]
    IllegalTransition {
        run_id: RunId,
        /// `None` when the run is being created.
        from: Option<StateType>,
        to: StateType,
    },

    #[error("deployment {deployment_id} already has {limit} running run(s)")]
    ConcurrencyLimit { deployment_id: String, limit: u32 },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StateError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StateError::Unavailable(_)
                | StateError::Transaction(_)
                | StateError::Read(_)
                | StateError::Write(_)
        )
    }
}
