//! Schedule definitions.
//!
//! A [`ScheduleSpec`] is the serializable, unchecked form stored on a
//! deployment. A [`Schedule`] is the validated form; it can only be obtained
//! through [`Schedule::new`] (or by deserializing, which goes through the same
//! checks), so a malformed rule never reaches evaluation.
//!
//! Cron expressions may use the standard 5-field Unix form (minute, hour,
//! day-of-month, month, day-of-week); they are converted to the 6-field form
//! (with seconds) the `cron` crate expects.

use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ScheduleError, ScheduleResult};
use crate::rrule::RRule;

/// Longest accepted interval (100 years).
const MAX_INTERVAL_SECONDS: u64 = 100 * 366 * 86_400;

/// The recurrence part of a schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Recurrence {
    /// Fixed interval, aligned to `anchor` (Unix epoch when absent).
    Interval {
        every_seconds: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        anchor: Option<DateTime<Utc>>,
    },
    /// Cron expression, 5 or 6 fields.
    Cron { expression: String },
    /// RFC 5545 recurrence rule.
    Rrule { rule: String },
}

/// Unvalidated schedule definition as stored and transmitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSpec {
    pub recurrence: Recurrence,
    /// No occurrence earlier than this is produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,
    /// No occurrence later than this is produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
}

impl ScheduleSpec {
    pub fn interval(every_seconds: u64) -> Self {
        Self::from_recurrence(Recurrence::Interval {
            every_seconds,
            anchor: None,
        })
    }

    pub fn cron(expression: impl Into<String>) -> Self {
        Self::from_recurrence(Recurrence::Cron {
            expression: expression.into(),
        })
    }

    pub fn rrule(rule: impl Into<String>) -> Self {
        Self::from_recurrence(Recurrence::Rrule { rule: rule.into() })
    }

    fn from_recurrence(recurrence: Recurrence) -> Self {
        Self {
            recurrence,
            start: None,
            end: None,
        }
    }

    /// Set the interval anchor. Ignored for cron and RRULE schedules.
    pub fn anchored_at(mut self, at: DateTime<Utc>) -> Self {
        if let Recurrence::Interval { anchor, .. } = &mut self.recurrence {
            *anchor = Some(at);
        }
        self
    }

    pub fn starting(mut self, at: DateTime<Utc>) -> Self {
        self.start = Some(at);
        self
    }

    pub fn ending(mut self, at: DateTime<Utc>) -> Self {
        self.end = Some(at);
        self
    }

    /// Validate into a [`Schedule`].
    pub fn build(self) -> ScheduleResult<Schedule> {
        Schedule::new(self)
    }
}

#[derive(Debug, Clone)]
enum Rule {
    Interval { every: TimeDelta, anchor: DateTime<Utc> },
    Cron(Box<cron::Schedule>),
    Rrule { rule: RRule, dtstart: DateTime<Utc> },
}

/// A validated, immutable schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "ScheduleSpec", into = "ScheduleSpec")]
pub struct Schedule {
    spec: ScheduleSpec,
    rule: Rule,
}

impl Schedule {
    /// Validate a definition. This is the only place `InvalidSchedule` is raised.
    pub fn new(spec: ScheduleSpec) -> ScheduleResult<Self> {
        if let (Some(start), Some(end)) = (spec.start, spec.end) {
            if end < start {
                return Err(ScheduleError::invalid(format!(
                    "end {end} is before start {start}"
                )));
            }
        }

        let rule = match &spec.recurrence {
            Recurrence::Interval {
                every_seconds,
                anchor,
            } => {
                if *every_seconds == 0 || *every_seconds > MAX_INTERVAL_SECONDS {
                    return Err(ScheduleError::invalid(format!(
                        "interval must be between 1 and {MAX_INTERVAL_SECONDS} seconds, got {every_seconds}"
                    )));
                }
                let every = TimeDelta::try_seconds(*every_seconds as i64)
                    .ok_or_else(|| ScheduleError::invalid("interval out of range"))?;
                Rule::Interval {
                    every,
                    anchor: anchor.unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
                }
            }
            Recurrence::Cron { expression } => {
                let normalized = normalize_cron_expr(expression);
                let parsed = cron::Schedule::from_str(&normalized).map_err(|e| {
                    ScheduleError::invalid(format!("invalid cron expression '{expression}': {e}"))
                })?;
                Rule::Cron(Box::new(parsed))
            }
            Recurrence::Rrule { rule } => {
                let parsed = RRule::parse(rule)?;
                let dtstart = match parsed.dtstart.or(spec.start) {
                    Some(at) => at,
                    None if parsed.count.is_some() => {
                        return Err(ScheduleError::invalid(
                            "RRULE with COUNT requires DTSTART or a schedule start",
                        ));
                    }
                    None => DateTime::<Utc>::UNIX_EPOCH,
                };
                Rule::Rrule {
                    rule: parsed,
                    dtstart,
                }
            }
        };

        Ok(Self { spec, rule })
    }

    pub fn spec(&self) -> &ScheduleSpec {
        &self.spec
    }

    pub fn start(&self) -> Option<DateTime<Utc>> {
        self.spec.start
    }

    pub fn end(&self) -> Option<DateTime<Utc>> {
        self.spec.end
    }

    /// Short description for logs.
    pub fn describe(&self) -> String {
        match &self.spec.recurrence {
            Recurrence::Interval { every_seconds, .. } => format!("every {every_seconds}s"),
            Recurrence::Cron { expression } => format!("cron '{expression}'"),
            Recurrence::Rrule { rule } => format!("rrule '{}'", rule.replace('\n', " ")),
        }
    }

    /// Occurrences strictly after `after`, not before the schedule start and
    /// not after its end, in increasing order.
    pub fn occurrences_after(
        &self,
        after: DateTime<Utc>,
    ) -> Box<dyn Iterator<Item = DateTime<Utc>> + '_> {
        let start = self.spec.start;
        let end = self.spec.end;

        let raw: Box<dyn Iterator<Item = DateTime<Utc>> + '_> = match &self.rule {
            Rule::Interval { every, anchor } => {
                Box::new(interval_occurrences(*anchor, *every, after, start))
            }
            Rule::Cron(schedule) => {
                // `after` is exclusive; back off one second so an occurrence
                // exactly at `start` is still produced.
                let from = match start {
                    Some(s) if s > after => s - TimeDelta::seconds(1),
                    _ => after,
                };
                Box::new(schedule.after(&from))
            }
            Rule::Rrule { rule, dtstart } => Box::new(rule.occurrences_after(*dtstart, after)),
        };

        Box::new(
            raw.filter(move |at| *at > after && start.is_none_or(|s| *at >= s))
                .take_while(move |at| end.is_none_or(|e| *at <= e)),
        )
    }
}

impl PartialEq for Schedule {
    fn eq(&self, other: &Self) -> bool {
        self.spec == other.spec
    }
}

impl TryFrom<ScheduleSpec> for Schedule {
    type Error = ScheduleError;

    fn try_from(spec: ScheduleSpec) -> ScheduleResult<Self> {
        Schedule::new(spec)
    }
}

impl From<Schedule> for ScheduleSpec {
    fn from(schedule: Schedule) -> Self {
        schedule.spec
    }
}

/// Convert a 5-field Unix cron expression to the 6-field form.
fn normalize_cron_expr(cron_expr: &str) -> String {
    let fields: Vec<&str> = cron_expr.split_whitespace().collect();
    if fields.len() == 5 {
        format!("0 {}", fields.join(" "))
    } else {
        cron_expr.trim().to_string()
    }
}

/// `anchor + k * every` for every `k` whose value is after `after` and not
/// before `start`.
fn interval_occurrences(
    anchor: DateTime<Utc>,
    every: TimeDelta,
    after: DateTime<Utc>,
    start: Option<DateTime<Utc>>,
) -> impl Iterator<Item = DateTime<Utc>> {
    let every_ms = every.num_milliseconds();
    let mut first = if after < anchor {
        0
    } else {
        (after - anchor).num_milliseconds() / every_ms + 1
    };
    if let Some(start) = start.filter(|s| *s > anchor) {
        let offset = (start - anchor).num_milliseconds();
        first = first.max(offset.div_euclid(every_ms) + i64::from(offset.rem_euclid(every_ms) != 0));
    }
    (first..).map_while(move |k| {
        let ms = k.checked_mul(every_ms)?;
        anchor.checked_add_signed(TimeDelta::try_milliseconds(ms)?)
    })
}
