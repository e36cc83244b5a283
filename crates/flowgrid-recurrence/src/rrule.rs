//! RRULE parsing and expansion.
//!
//! Supports the subset of RFC 5545 recurrence rules that deployments use in
//! practice: `FREQ` (MINUTELY through MONTHLY), `INTERVAL`, `COUNT`, `UNTIL`,
//! `BYDAY`, `BYMONTHDAY`, `BYHOUR` and `BYMINUTE`. An optional `DTSTART` line
//! may precede the rule. Only UTC times are accepted.

use std::collections::VecDeque;

use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveDateTime, TimeDelta, Timelike, Utc, Weekday};

use crate::error::{ScheduleError, ScheduleResult};

/// Consecutive periods without a candidate before expansion gives up.
const MAX_EMPTY_PERIODS: u32 = 100_000;

/// Upper bound on `INTERVAL`.
const MAX_INTERVAL: u32 = 100_000;

/// Recurrence frequency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frequency {
    Minutely,
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

impl Frequency {
    fn parse(value: &str) -> ScheduleResult<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "MINUTELY" => Ok(Frequency::Minutely),
            "HOURLY" => Ok(Frequency::Hourly),
            "DAILY" => Ok(Frequency::Daily),
            "WEEKLY" => Ok(Frequency::Weekly),
            "MONTHLY" => Ok(Frequency::Monthly),
            other => Err(ScheduleError::invalid(format!(
                "unsupported RRULE frequency '{other}'"
            ))),
        }
    }

    /// Nominal period length, used only to skip ahead cheaply.
    fn unit_seconds(self) -> i64 {
        match self {
            Frequency::Minutely => 60,
            Frequency::Hourly => 3_600,
            Frequency::Daily => 86_400,
            Frequency::Weekly => 604_800,
            Frequency::Monthly => 28 * 86_400,
        }
    }
}

/// A parsed recurrence rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RRule {
    pub freq: Frequency,
    pub interval: u32,
    pub count: Option<u32>,
    pub until: Option<DateTime<Utc>>,
    pub by_day: Vec<Weekday>,
    pub by_month_day: Vec<u32>,
    pub by_hour: Vec<u32>,
    pub by_minute: Vec<u32>,
    /// `DTSTART` carried inside the rule text, if any.
    pub dtstart: Option<DateTime<Utc>>,
}

impl RRule {
    /// Parse rule text such as `FREQ=WEEKLY;BYDAY=MO,WE;BYHOUR=9` or
    /// `DTSTART:20240101T090000Z\nRRULE:FREQ=DAILY;COUNT=5`.
    pub fn parse(text: &str) -> ScheduleResult<Self> {
        let mut dtstart = None;
        let mut body: Option<&str> = None;

        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if let Some(rest) = line.strip_prefix("DTSTART") {
                let (params, value) = rest
                    .rsplit_once(':')
                    .ok_or_else(|| ScheduleError::invalid("DTSTART line has no value"))?;
                if let Some(tz) = params.split(';').find_map(|p| p.strip_prefix("TZID=")) {
                    if !tz.eq_ignore_ascii_case("UTC") {
                        return Err(ScheduleError::invalid(format!(
                            "DTSTART timezone '{tz}' is not supported; use UTC"
                        )));
                    }
                }
                dtstart = Some(parse_datetime(value)?);
                continue;
            }
            let rule = line.strip_prefix("RRULE:").unwrap_or(line);
            if body.replace(rule).is_some() {
                return Err(ScheduleError::invalid("only a single RRULE is supported"));
            }
        }

        let body = body.ok_or_else(|| ScheduleError::invalid("missing RRULE body"))?;

        let mut freq = None;
        let mut interval = 1;
        let mut count = None;
        let mut until = None;
        let mut by_day = Vec::new();
        let mut by_month_day = Vec::new();
        let mut by_hour = Vec::new();
        let mut by_minute = Vec::new();

        for part in body.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part.split_once('=').ok_or_else(|| {
                ScheduleError::invalid(format!("malformed RRULE part '{part}'"))
            })?;
            match key.trim().to_ascii_uppercase().as_str() {
                "FREQ" => freq = Some(Frequency::parse(value)?),
                "INTERVAL" => interval = parse_number("INTERVAL", value, 1, MAX_INTERVAL)?,
                "COUNT" => count = Some(parse_number("COUNT", value, 1, u32::MAX)?),
                "UNTIL" => until = Some(parse_datetime(value)?),
                "BYDAY" => by_day = parse_list(value, parse_weekday)?,
                "BYMONTHDAY" => {
                    by_month_day = parse_list(value, |v| parse_number("BYMONTHDAY", v, 1, 31))?
                }
                "BYHOUR" => by_hour = parse_list(value, |v| parse_number("BYHOUR", v, 0, 23))?,
                "BYMINUTE" => {
                    by_minute = parse_list(value, |v| parse_number("BYMINUTE", v, 0, 59))?
                }
                "WKST" if value.trim().eq_ignore_ascii_case("MO") => {}
                other => {
                    return Err(ScheduleError::invalid(format!(
                        "unsupported RRULE part '{other}={value}'"
                    )));
                }
            }
        }

        let freq = freq.ok_or_else(|| ScheduleError::invalid("RRULE is missing FREQ"))?;
        if count.is_some() && until.is_some() {
            return Err(ScheduleError::invalid(
                "RRULE may not specify both COUNT and UNTIL",
            ));
        }

        by_day.sort_by_key(|d: &Weekday| d.num_days_from_monday());
        by_day.dedup();
        for list in [&mut by_month_day, &mut by_hour, &mut by_minute] {
            list.sort_unstable();
            list.dedup();
        }

        Ok(RRule {
            freq,
            interval,
            count,
            until,
            by_day,
            by_month_day,
            by_hour,
            by_minute,
            dtstart,
        })
    }

    /// Occurrences strictly after `after`, expanded from `dtstart`.
    pub fn occurrences_after(&self, dtstart: DateTime<Utc>, after: DateTime<Utc>) -> RRuleIter<'_> {
        // COUNT is measured from DTSTART, so those rules cannot skip ahead.
        let period = if self.count.is_some() {
            0
        } else {
            self.skip_periods(dtstart, after)
        };
        RRuleIter {
            rule: self,
            dtstart,
            after,
            period,
            pending: VecDeque::new(),
            counted: 0,
            empty_streak: 0,
            done: false,
        }
    }

    /// Whole periods that end before `after` and can be skipped.
    fn skip_periods(&self, dtstart: DateTime<Utc>, after: DateTime<Utc>) -> u64 {
        if after <= dtstart {
            return 0;
        }
        let elapsed = match self.freq {
            Frequency::Monthly => {
                let months = i64::from(after.year() - dtstart.year()) * 12
                    + i64::from(after.month())
                    - i64::from(dtstart.month());
                months.max(0) as u64
            }
            freq => ((after - dtstart).num_seconds() / freq.unit_seconds()).max(0) as u64,
        };
        (elapsed / u64::from(self.interval)).saturating_sub(1)
    }

    /// Candidates of period `k`, sorted. `None` once the calendar overflows.
    fn period_candidates(&self, dtstart: DateTime<Utc>, k: u64) -> Option<Vec<DateTime<Utc>>> {
        let step = k.checked_mul(u64::from(self.interval))?;
        let mut out = Vec::new();

        match self.freq {
            Frequency::Minutely => {
                let minutes = TimeDelta::try_minutes(i64::try_from(step).ok()?)?;
                out.push(dtstart.checked_add_signed(minutes)?);
            }
            Frequency::Hourly => {
                let hours = TimeDelta::try_hours(i64::try_from(step).ok()?)?;
                let at = dtstart.checked_add_signed(hours)?;
                if self.by_minute.is_empty() {
                    out.push(at);
                } else {
                    out.extend(self.by_minute.iter().filter_map(|&m| at.with_minute(m)));
                }
            }
            Frequency::Daily => {
                let day = dtstart.date_naive().checked_add_days(Days::new(step))?;
                self.expand_times(day, dtstart, &mut out);
            }
            Frequency::Weekly => {
                let start = dtstart.date_naive();
                let week_start = start.checked_sub_days(Days::new(u64::from(
                    start.weekday().num_days_from_monday(),
                )))?;
                let week = week_start.checked_add_days(Days::new(step.checked_mul(7)?))?;
                let weekdays = if self.by_day.is_empty() {
                    vec![start.weekday()]
                } else {
                    self.by_day.clone()
                };
                for weekday in weekdays {
                    let day = week.checked_add_days(Days::new(u64::from(
                        weekday.num_days_from_monday(),
                    )))?;
                    self.expand_times(day, dtstart, &mut out);
                }
            }
            Frequency::Monthly => {
                let total = i64::from(dtstart.year()) * 12
                    + i64::from(dtstart.month0())
                    + i64::try_from(step).ok()?;
                let year = i32::try_from(total.div_euclid(12)).ok()?;
                let month = u32::try_from(total.rem_euclid(12)).ok()? + 1;
                NaiveDate::from_ymd_opt(year, month, 1)?;
                let days: Vec<u32> = if !self.by_month_day.is_empty() {
                    self.by_month_day.clone()
                } else if !self.by_day.is_empty() {
                    (1..=31).collect()
                } else {
                    vec![dtstart.day()]
                };
                for day in days {
                    if let Some(date) = NaiveDate::from_ymd_opt(year, month, day) {
                        self.expand_times(date, dtstart, &mut out);
                    }
                }
            }
        }

        out.retain(|at| self.matches_filters(at));
        out.sort_unstable();
        out.dedup();
        Some(out)
    }

    fn expand_times(&self, day: NaiveDate, dtstart: DateTime<Utc>, out: &mut Vec<DateTime<Utc>>) {
        let hours = or_default(&self.by_hour, dtstart.hour());
        let minutes = or_default(&self.by_minute, dtstart.minute());
        for &hour in &hours {
            for &minute in &minutes {
                if let Some(at) = day.and_hms_opt(hour, minute, dtstart.second()) {
                    out.push(at.and_utc());
                }
            }
        }
    }

    fn matches_filters(&self, at: &DateTime<Utc>) -> bool {
        (self.by_day.is_empty() || self.by_day.contains(&at.weekday()))
            && (self.by_month_day.is_empty() || self.by_month_day.contains(&at.day()))
            && (self.by_hour.is_empty() || self.by_hour.contains(&at.hour()))
            && (self.by_minute.is_empty() || self.by_minute.contains(&at.minute()))
    }
}

/// Lazy occurrence iterator returned by [`RRule::occurrences_after`].
pub struct RRuleIter<'a> {
    rule: &'a RRule,
    dtstart: DateTime<Utc>,
    after: DateTime<Utc>,
    period: u64,
    pending: VecDeque<DateTime<Utc>>,
    counted: u32,
    empty_streak: u32,
    done: bool,
}

impl Iterator for RRuleIter<'_> {
    type Item = DateTime<Utc>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(at) = self.pending.pop_front() {
                if at < self.dtstart {
                    continue;
                }
                if self.rule.until.is_some_and(|until| at > until) {
                    self.finish();
                    return None;
                }
                if let Some(limit) = self.rule.count {
                    if self.counted >= limit {
                        self.finish();
                        return None;
                    }
                    self.counted += 1;
                }
                if at <= self.after {
                    continue;
                }
                return Some(at);
            }

            if self.done {
                return None;
            }

            match self.rule.period_candidates(self.dtstart, self.period) {
                Some(candidates) if candidates.is_empty() => {
                    self.empty_streak += 1;
                    if self.empty_streak > MAX_EMPTY_PERIODS {
                        self.done = true;
                    }
                }
                Some(candidates) => {
                    self.empty_streak = 0;
                    self.pending.extend(candidates);
                }
                None => self.done = true,
            }
            self.period += 1;
        }
    }
}

impl RRuleIter<'_> {
    fn finish(&mut self) {
        self.done = true;
        self.pending.clear();
    }
}

fn or_default(list: &[u32], default: u32) -> Vec<u32> {
    if list.is_empty() {
        vec![default]
    } else {
        list.to_vec()
    }
}

fn parse_number(key: &str, value: &str, min: u32, max: u32) -> ScheduleResult<u32> {
    let n: u32 = value
        .trim()
        .parse()
        .map_err(|_| ScheduleError::invalid(format!("{key} value '{value}' is not a number")))?;
    if n < min || n > max {
        return Err(ScheduleError::invalid(format!(
            "{key} value {n} is outside {min}..={max}"
        )));
    }
    Ok(n)
}

fn parse_list<T>(value: &str, parse: impl Fn(&str) -> ScheduleResult<T>) -> ScheduleResult<Vec<T>> {
    value.split(',').map(str::trim).map(parse).collect()
}

fn parse_weekday(value: &str) -> ScheduleResult<Weekday> {
    match value.to_ascii_uppercase().as_str() {
        "MO" => Ok(Weekday::Mon),
        "TU" => Ok(Weekday::Tue),
        "WE" => Ok(Weekday::Wed),
        "TH" => Ok(Weekday::Thu),
        "FR" => Ok(Weekday::Fri),
        "SA" => Ok(Weekday::Sat),
        "SU" => Ok(Weekday::Sun),
        other => Err(ScheduleError::invalid(format!(
            "unsupported BYDAY value '{other}'"
        ))),
    }
}

/// Parse `20240101T090000Z`, `20240101T090000` or `20240101`.
fn parse_datetime(value: &str) -> ScheduleResult<DateTime<Utc>> {
    let trimmed = value.trim();
    let naive = trimmed.strip_suffix('Z').unwrap_or(trimmed);
    if let Ok(at) = NaiveDateTime::parse_from_str(naive, "%Y%m%dT%H%M%S") {
        return Ok(at.and_utc());
    }
    NaiveDate::parse_from_str(naive, "%Y%m%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|at| at.and_utc())
        .ok_or_else(|| ScheduleError::invalid(format!("invalid RRULE date '{value}'")))
}
