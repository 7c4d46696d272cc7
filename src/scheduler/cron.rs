//! Five-field cron expressions: `minute hour day-of-month month day-of-week`.
//!
//! Each field accepts `*`, a value, a range `a-b`, a step `*/n`, `a-b/n` or
//! `a/n`, and comma-separated lists of those. Day-of-week 0 and 7 are both
//! Sunday. When day-of-month and day-of-week are both restricted a day
//! matches if either does.

use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, TimeZone, Timelike};
use std::fmt;

use crate::config::ConfigError;

/// How far ahead `next_after` searches before giving up.
const SEARCH_LIMIT_DAYS: i64 = 366 * 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expr: String,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
}

const FIELDS: [FieldSpec; 5] = [
    FieldSpec { name: "minute", min: 0, max: 59 },
    FieldSpec { name: "hour", min: 0, max: 23 },
    FieldSpec { name: "day-of-month", min: 1, max: 31 },
    FieldSpec { name: "month", min: 1, max: 12 },
    FieldSpec { name: "day-of-week", min: 0, max: 7 },
];

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidCron {
            expr: expr.to_string(),
            reason,
        };

        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != FIELDS.len() {
            return Err(invalid(format!("expected 5 fields, found {}", fields.len())));
        }

        let mut sets = [0u64; 5];
        for (i, (field, spec)) in fields.iter().zip(FIELDS.iter()).enumerate() {
            sets[i] = parse_field(field, spec).map_err(invalid)?;
        }

        // Sunday may be written as 7.
        let mut days_of_week = sets[4];
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week | 1) & !(1 << 7);
        }

        Ok(Self {
            expr: expr.to_string(),
            minutes: sets[0],
            hours: sets[1],
            days_of_month: sets[2],
            months: sets[3],
            days_of_week,
            dom_restricted: !fields[2].starts_with('*'),
            dow_restricted: !fields[4].starts_with('*'),
        })
    }

    fn matches_date(&self, d: &NaiveDate) -> bool {
        if !bit(self.months, d.month()) {
            return false;
        }
        let dom = bit(self.days_of_month, d.day());
        let dow = bit(self.days_of_week, d.weekday().num_days_from_sunday());
        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// The first matching minute strictly after `after`, in `after`'s time
    /// zone. Local times skipped by a DST change never fire; repeated local
    /// times fire once, at their first occurrence.
    pub fn next_after<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        let tz = after.timezone();
        let start = after.naive_local().with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
        let limit = start + Duration::days(SEARCH_LIMIT_DAYS);

        let mut t = start;
        while t < limit {
            if !self.matches_date(&t.date()) {
                t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !bit(self.hours, t.hour()) {
                t = t.with_minute(0)? + Duration::hours(1);
                continue;
            }
            if !bit(self.minutes, t.minute()) {
                t += Duration::minutes(1);
                continue;
            }

            let candidate = match tz.from_local_datetime(&t) {
                LocalResult::Single(dt) => Some(dt),
                LocalResult::Ambiguous(earliest, latest) => {
                    if earliest > *after {
                        Some(earliest)
                    } else {
                        Some(latest)
                    }
                }
                LocalResult::None => None,
            };
            match candidate {
                Some(dt) if dt > *after => return Some(dt),
                _ => t += Duration::minutes(1),
            }
        }
        None
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expr)
    }
}

fn bit(set: u64, value: u32) -> bool {
    set & (1u64 << value) != 0
}

fn parse_field(field: &str, spec: &FieldSpec) -> Result<u64, String> {
    let mut set = 0u64;
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step {:?} in {} field", step, spec.name))?;
                if step == 0 {
                    return Err(format!("zero step in {} field", spec.name));
                }
                (range, Some(step))
            }
            None => (item, None),
        };

        let (lo, hi) = if range == "*" {
            (spec.min, spec.max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_value(a, spec)?, parse_value(b, spec)?)
        } else {
            let v = parse_value(range, spec)?;
            // `a/n` runs from a to the end of the field.
            (v, if step.is_some() { spec.max } else { v })
        };
        if lo > hi {
            return Err(format!("descending range {:?} in {} field", range, spec.name));
        }

        for v in (lo..=hi).step_by(step.unwrap_or(1) as usize) {
            set |= 1u64 << v;
        }
    }
    Ok(set)
}

fn parse_value(s: &str, spec: &FieldSpec) -> Result<u32, String> {
    let v: u32 = s
        .parse()
        .map_err(|_| format!("invalid value {:?} in {} field", s, spec.name))?;
    if v < spec.min || v > spec.max {
        return Err(format!(
            "{} out of range {}-{} in {} field",
            v, spec.min, spec.max, spec.name
        ));
    }
    Ok(v)
}
