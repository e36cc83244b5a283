//! flowgrid-recurrence: schedule definitions and candidate run time evaluation.
//!
//! Three recurrence kinds are supported:
//!
//! - fixed intervals aligned to an anchor,
//! - cron expressions (5 or 6 fields, via the `cron` crate),
//! - a UTC subset of RFC 5545 RRULE.
//!
//! Validation happens once, in [`Schedule::new`]. Evaluation ([`evaluate`])
//! is pure: the same schedule, `now` and bounds always give the same list.

pub mod error;
pub mod evaluator;
pub mod rrule;
pub mod schedule;

pub use error::{ScheduleError, ScheduleResult};
pub use evaluator::{BoundsOverride, SchedulingBounds, evaluate};
pub use schedule::{Recurrence, Schedule, ScheduleSpec};
