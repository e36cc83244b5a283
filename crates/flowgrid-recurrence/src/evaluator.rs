//! Turns a schedule and a set of bounds into candidate run times.
//!
//! Generation continues until both floors are met (`min_runs` candidates and
//! a candidate at or beyond `now + min_scheduled_time`) and never passes a
//! ceiling (`max_runs` candidates, `now + max_scheduled_time`, schedule end).
//! When floors and ceilings conflict the ceilings win.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::schedule::Schedule;

/// Count and horizon limits for one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulingBounds {
    pub min_runs: usize,
    pub max_runs: usize,
    pub min_scheduled_time: TimeDelta,
    pub max_scheduled_time: TimeDelta,
}

impl Default for SchedulingBounds {
    fn default() -> Self {
        Self {
            min_runs: 3,
            max_runs: 100,
            min_scheduled_time: TimeDelta::hours(1),
            max_scheduled_time: TimeDelta::days(100),
        }
    }
}

/// Per-deployment replacements for individual bound fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundsOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_runs: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_runs: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_scheduled_time_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_scheduled_time_seconds: Option<u64>,
}

impl BoundsOverride {
    /// Apply the overrides on top of `base`.
    pub fn apply(&self, base: &SchedulingBounds) -> SchedulingBounds {
        SchedulingBounds {
            min_runs: self.min_runs.unwrap_or(base.min_runs),
            max_runs: self.max_runs.unwrap_or(base.max_runs),
            min_scheduled_time: seconds_or(self.min_scheduled_time_seconds, base.min_scheduled_time),
            max_scheduled_time: seconds_or(self.max_scheduled_time_seconds, base.max_scheduled_time),
        }
    }
}

fn seconds_or(seconds: Option<u64>, fallback: TimeDelta) -> TimeDelta {
    seconds
        .and_then(|s| i64::try_from(s).ok())
        .and_then(TimeDelta::try_seconds)
        .unwrap_or(fallback)
}

/// Candidate run times for `schedule` after `now`, strictly increasing.
///
/// Returns an empty vector when the schedule has no occurrence inside the
/// bounds.
pub fn evaluate(
    schedule: &Schedule,
    now: DateTime<Utc>,
    bounds: &SchedulingBounds,
) -> Vec<DateTime<Utc>> {
    let horizon = now
        .checked_add_signed(bounds.max_scheduled_time)
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    let time_floor = now
        .checked_add_signed(bounds.min_scheduled_time)
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    let ceiling = schedule.end().map_or(horizon, |end| end.min(horizon));

    let mut out: Vec<DateTime<Utc>> = Vec::new();
    let floors_met = |out: &[DateTime<Utc>]| {
        out.len() >= bounds.min_runs && out.last().copied().unwrap_or(now) >= time_floor
    };

    if bounds.max_runs == 0 || floors_met(&out) {
        return out;
    }

    for at in schedule.occurrences_after(now) {
        if at > ceiling {
            break;
        }
        if out.last().is_some_and(|last| at <= *last) {
            continue;
        }
        out.push(at);
        if out.len() >= bounds.max_runs || floors_met(&out) {
            break;
        }
    }

    out
}
