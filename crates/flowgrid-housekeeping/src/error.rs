//! Housekeeping error types.

use flowgrid_state::StateError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HousekeepingError {
    #[error("state store error: {0}")]
    State(#[from] StateError),
}

pub type HousekeepingResult<T> = Result<T, HousekeepingError>;
