//! Error types for schedule construction.

use thiserror::Error;

/// Result type alias for schedule construction.
pub type ScheduleResult<T> = Result<T, ScheduleError>;

/// Errors raised while building a [`crate::Schedule`].
///
/// Evaluation never fails; a malformed definition is rejected here, when the
/// schedule is constructed or deserialized.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),
}

impl ScheduleError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        ScheduleError::InvalidSchedule(reason.into())
    }
}
