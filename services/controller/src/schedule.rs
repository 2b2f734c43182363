//! Cron expression evaluation.
//!
//! Accepts 5, 6 or 7 field expressions:
//!
//! - 5 fields: `minute hour day-of-month month day-of-week`
//! - 6 fields: `minute hour day-of-month month day-of-week year`
//! - 7 fields: `second minute hour day-of-month month day-of-week year`
//!
//! plus the named shorthands (`@hourly`, `@daily`, ...) and `@every <duration>`.
//! Second through day-of-week are delegated to `croner`; the year field is
//! filtered here. Everything is evaluated in UTC.

use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, TimeZone, Utc};
use croner::Cron;

const MIN_YEAR: i32 = 1970;
const MAX_YEAR: i32 = 2099;

/// Upper bound on year jumps when searching for the next occurrence.
const MAX_YEAR_JUMPS: usize = 200;

/// Errors from schedule parsing and evaluation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    #[error("invalid schedule {expr:?}: {reason}")]
    Invalid { expr: String, reason: String },

    #[error("schedule {expr:?} has no occurrence after {after}")]
    NoOccurrence { expr: String, after: String },
}

/// A parsed schedule.
pub struct CronSchedule {
    expr: String,
    kind: Kind,
}

enum Kind {
    Every(chrono::Duration),
    Cron { cron: Cron, years: YearSet },
}

impl std::fmt::Debug for CronSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CronSchedule")
            .field("expr", &self.expr)
            .finish_non_exhaustive()
    }
}

impl CronSchedule {
    /// Parse a schedule expression.
    pub fn parse(expr: &str) -> Result<Self, ScheduleError> {
        let invalid = |reason: String| ScheduleError::Invalid {
            expr: expr.to_string(),
            reason,
        };

        let trimmed = expr.trim();
        if let Some(spec) = trimmed.strip_prefix("@every") {
            let every = parse_duration(spec.trim()).map_err(invalid)?;
            return Ok(Self {
                expr: expr.to_string(),
                kind: Kind::Every(every),
            });
        }

        let expanded = match trimmed {
            "@yearly" | "@annually" => "0 0 0 1 1 * *",
            "@monthly" => "0 0 0 1 * * *",
            "@weekly" => "0 0 0 * * 0 *",
            "@daily" | "@midnight" => "0 0 0 * * * *",
            "@hourly" => "0 0 * * * * *",
            "@reboot" => return Err(invalid("@reboot has no next occurrence".to_string())),
            s if s.starts_with('@') => return Err(invalid(format!("unknown shorthand {}", s))),
            s => s,
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        let (second, rest, year) = match fields.len() {
            5 => ("0", &fields[..], "*"),
            6 => ("0", &fields[..5], fields[5]),
            7 => (fields[0], &fields[1..6], fields[6]),
            n => return Err(invalid(format!("expected 5 to 7 fields, found {}", n))),
        };

        let pattern = format!("{} {}", second, rest.join(" "));
        let cron = Cron::new(&pattern)
            .with_seconds_optional()
            .parse()
            .map_err(|e| invalid(e.to_string()))?;
        let years = YearSet::parse(year).map_err(invalid)?;

        Ok(Self {
            expr: expr.to_string(),
            kind: Kind::Cron { cron, years },
        })
    }

    /// First occurrence strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        let exhausted = || ScheduleError::NoOccurrence {
            expr: self.expr.clone(),
            after: cronscale_resources::time::format(&after),
        };

        let (cron, years) = match &self.kind {
            Kind::Every(every) => return after.checked_add_signed(*every).ok_or_else(exhausted),
            Kind::Cron { cron, years } => (cron, years),
        };

        let mut from = after;
        let mut inclusive = false;
        for _ in 0..MAX_YEAR_JUMPS {
            let candidate = cron
                .find_next_occurrence(&from, inclusive)
                .map_err(|_| exhausted())?;

            match years.next_allowed(candidate.year()) {
                Some(year) if year == candidate.year() => return Ok(candidate),
                Some(year) => {
                    from = Utc
                        .with_ymd_and_hms(year, 1, 1, 0, 0, 0)
                        .single()
                        .ok_or_else(exhausted)?;
                    inclusive = true;
                }
                None => return Err(exhausted()),
            }
        }

        Err(exhausted())
    }
}

/// Next trigger instant of `expr` strictly after `after`.
pub fn next(expr: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
    CronSchedule::parse(expr)?.next_after(after)
}

/// Allowed years; `None` means any.
#[derive(Debug, Clone, PartialEq, Eq)]
struct YearSet(Option<BTreeSet<i32>>);

impl YearSet {
    fn parse(field: &str) -> Result<Self, String> {
        if field == "*" || field == "?" {
            return Ok(Self(None));
        }

        let mut years = BTreeSet::new();
        for part in field.split(',') {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => {
                    let step: i32 = step
                        .parse()
                        .map_err(|_| format!("invalid year step {:?}", step))?;
                    if step <= 0 {
                        return Err(format!("invalid year step {:?}", step));
                    }
                    (range, Some(step))
                }
                None => (part, None),
            };

            let (start, end) = match range {
                "*" => (MIN_YEAR, MAX_YEAR),
                r => match r.split_once('-') {
                    Some((a, b)) => (parse_year(a)?, parse_year(b)?),
                    None => {
                        let year = parse_year(r)?;
                        (year, if step.is_some() { MAX_YEAR } else { year })
                    }
                },
            };
            if start > end {
                return Err(format!("invalid year range {:?}", range));
            }

            let step = usize::try_from(step.unwrap_or(1)).unwrap_or(1);
            years.extend((start..=end).step_by(step));
        }

        Ok(Self(Some(years)))
    }

    /// Smallest allowed year not before `year`.
    fn next_allowed(&self, year: i32) -> Option<i32> {
        match &self.0 {
            None => Some(year),
            Some(years) => years.range(year..).next().copied(),
        }
    }
}

fn parse_year(s: &str) -> Result<i32, String> {
    let year: i32 = s.parse().map_err(|_| format!("invalid year {:?}", s))?;
    if !(MIN_YEAR..=MAX_YEAR).contains(&year) {
        return Err(format!("year {} outside {}-{}", year, MIN_YEAR, MAX_YEAR));
    }
    Ok(year)
}

/// Duration units, longest prefix first where they overlap.
const UNITS: &[(&str, u64)] = &[
    ("ns", 1),
    ("us", 1_000),
    ("µs", 1_000),
    ("μs", 1_000),
    ("ms", 1_000_000),
    ("s", 1_000_000_000),
    ("m", 60 * 1_000_000_000),
    ("h", 3600 * 1_000_000_000),
];

/// Parse a duration such as `90s` or `1h30m`.
fn parse_duration(s: &str) -> Result<chrono::Duration, String> {
    if s.is_empty() {
        return Err("@every requires a duration".to_string());
    }

    let mut rest = s;
    let mut total: u64 = 0;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        if digits == 0 {
            return Err(format!("invalid duration {:?}", s));
        }
        let value: u64 = rest[..digits]
            .parse()
            .map_err(|_| format!("invalid duration {:?}", s))?;
        rest = &rest[digits..];

        let (unit, nanos) = UNITS
            .iter()
            .find(|(unit, _)| rest.starts_with(unit))
            .ok_or_else(|| format!("missing or unknown unit in duration {:?}", s))?;
        rest = &rest[unit.len()..];

        total = value
            .checked_mul(*nanos)
            .and_then(|n| total.checked_add(n))
            .ok_or_else(|| format!("duration {:?} overflows", s))?;
    }

    if total == 0 {
        return Err("@every duration must be positive".to_string());
    }
    let nanos = i64::try_from(total).map_err(|_| format!("duration {:?} overflows", s))?;
    Ok(chrono::Duration::nanoseconds(nanos))
}
