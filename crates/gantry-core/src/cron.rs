// Copyright (C) 2025 Gantry Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Restricted cron evaluation for schedules.
//!
//! Schedules carry a five-field cron expression (minute, hour,
//! day-of-month, month, day-of-week) where each field is either a literal
//! number or `*`. Ranges, steps, and lists are rejected at parse time.
//!
//! Day-of-month and day-of-week are intersected: a schedule with both
//! restricted fires only when both match. This differs from classic cron,
//! which treats them as a union, and is kept deliberately.

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use thiserror::Error;

/// How far `next_run_after` scans before giving up, in minutes. A full
/// leap year covers every reachable literal combination.
const MAX_SCAN_MINUTES: i64 = 366 * 24 * 60;

/// Cron parsing errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CronError {
    /// The expression does not have exactly five whitespace-separated fields
    #[error("expected 5 cron fields, found {0}")]
    WrongFieldCount(usize),

    /// A field is neither `*` nor a literal within its legal range
    #[error("invalid {field} field: {value:?}")]
    InvalidField {
        /// Which cron position was rejected
        field: &'static str,
        /// The raw field text
        value: String,
    },
}

/// One cron field: a wildcard or a single literal value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Any,
    Exact(u32),
}

impl Field {
    fn matches(self, value: u32) -> bool {
        match self {
            Field::Any => true,
            Field::Exact(v) => v == value,
        }
    }
}

/// A parsed five-field cron expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CronExpression {
    minute: Field,
    hour: Field,
    day_of_month: Field,
    month: Field,
    day_of_week: Field,
}

fn parse_field(raw: &str, name: &'static str, min: u32, max: u32) -> Result<Field, CronError> {
    if raw == "*" {
        return Ok(Field::Any);
    }
    match raw.parse::<u32>() {
        Ok(v) if (min..=max).contains(&v) => Ok(Field::Exact(v)),
        _ => Err(CronError::InvalidField {
            field: name,
            value: raw.to_string(),
        }),
    }
}

impl CronExpression {
    /// Parse a five-field expression such as `30 4 * * 1`.
    pub fn parse(expression: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::WrongFieldCount(fields.len()));
        }
        Ok(Self {
            minute: parse_field(fields[0], "minute", 0, 59)?,
            hour: parse_field(fields[1], "hour", 0, 23)?,
            day_of_month: parse_field(fields[2], "day-of-month", 1, 31)?,
            month: parse_field(fields[3], "month", 1, 12)?,
            day_of_week: parse_field(fields[4], "day-of-week", 0, 6)?,
        })
    }

    /// Whether the expression matches the given instant, at minute
    /// granularity. Seconds are ignored.
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        self.minute.matches(at.minute())
            && self.hour.matches(at.hour())
            && self.day_of_month.matches(at.day())
            && self.month.matches(at.month())
            && self.day_of_week.matches(at.weekday().num_days_from_sunday())
    }

    /// The first matching minute strictly after `from`, stepping
    /// minute-by-minute up to one leap year out. Returns `None` for
    /// unsatisfiable expressions such as `0 0 31 2 *`.
    pub fn next_run_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut cursor = truncate_to_minute(from) + Duration::minutes(1);
        for _ in 0..MAX_SCAN_MINUTES {
            if self.matches(cursor) {
                return Some(cursor);
            }
            cursor = cursor + Duration::minutes(1);
        }
        None
    }
}

fn truncate_to_minute(at: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(at.year(), at.month(), at.day(), at.hour(), at.minute(), 0)
        .single()
        .unwrap_or(at)
}

/// Whether the expression is due at `now`.
pub fn is_due(expression: &str, now: DateTime<Utc>) -> Result<bool, CronError> {
    Ok(CronExpression::parse(expression)?.matches(now))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn parses_wildcards_and_literals() {
        let expr = CronExpression::parse("30 4 * * 1").unwrap();
        assert_eq!(
            expr,
            CronExpression {
                minute: Field::Exact(30),
                hour: Field::Exact(4),
                day_of_month: Field::Any,
                month: Field::Any,
                day_of_week: Field::Exact(1),
            }
        );
    }

    #[test]
    fn rejects_wrong_field_count() {
        assert_eq!(
            CronExpression::parse("* * * *"),
            Err(CronError::WrongFieldCount(4))
        );
        assert_eq!(
            CronExpression::parse("* * * * * *"),
            Err(CronError::WrongFieldCount(6))
        );
    }

    #[test]
    fn rejects_ranges_steps_and_lists() {
        for expr in ["1-5 * * * *", "*/15 * * * *", "1,2 * * * *"] {
            assert!(matches!(
                CronExpression::parse(expr),
                Err(CronError::InvalidField { field: "minute", .. })
            ));
        }
    }

    #[test]
    fn rejects_out_of_range_literals() {
        assert!(CronExpression::parse("60 * * * *").is_err());
        assert!(CronExpression::parse("* 24 * * *").is_err());
        assert!(CronExpression::parse("* * 0 * *").is_err());
        assert!(CronExpression::parse("* * 32 * *").is_err());
        assert!(CronExpression::parse("* * * 13 *").is_err());
        assert!(CronExpression::parse("* * * * 7").is_err());
    }

    #[test]
    fn every_minute_always_matches() {
        let expr = CronExpression::parse("* * * * *").unwrap();
        assert!(expr.matches(at(2025, 6, 15, 13, 37)));
    }

    #[test]
    fn seconds_are_ignored() {
        let expr = CronExpression::parse("30 4 * * *").unwrap();
        let t = Utc.with_ymd_and_hms(2025, 6, 15, 4, 30, 59).unwrap();
        assert!(expr.matches(t));
    }

    #[test]
    fn weekday_zero_is_sunday() {
        let expr = CronExpression::parse("0 0 * * 0").unwrap();
        // 2025-06-15 is a Sunday.
        assert!(expr.matches(at(2025, 6, 15, 0, 0)));
        assert!(!expr.matches(at(2025, 6, 16, 0, 0)));
    }

    #[test]
    fn restricted_dom_and_dow_must_both_match() {
        // Fire at midnight on the 15th only when it is also a Monday.
        let expr = CronExpression::parse("0 0 15 * 1").unwrap();
        // 2025-09-15 is a Monday.
        assert!(expr.matches(at(2025, 9, 15, 0, 0)));
        // 2025-06-15 is the right day-of-month but a Sunday.
        assert!(!expr.matches(at(2025, 6, 15, 0, 0)));
        // 2025-06-16 is a Monday but the wrong day-of-month.
        assert!(!expr.matches(at(2025, 6, 16, 0, 0)));
    }

    #[test]
    fn next_run_is_strictly_after_from() {
        let expr = CronExpression::parse("* * * * *").unwrap();
        let from = at(2025, 6, 15, 13, 37);
        assert_eq!(expr.next_run_after(from), Some(at(2025, 6, 15, 13, 38)));
    }

    #[test]
    fn next_run_truncates_seconds_before_stepping() {
        let expr = CronExpression::parse("* * * * *").unwrap();
        let from = Utc.with_ymd_and_hms(2025, 6, 15, 13, 37, 45).unwrap();
        assert_eq!(expr.next_run_after(from), Some(at(2025, 6, 15, 13, 38)));
    }

    #[test]
    fn next_run_crosses_day_boundary() {
        let expr = CronExpression::parse("30 4 * * *").unwrap();
        let from = at(2025, 6, 15, 5, 0);
        assert_eq!(expr.next_run_after(from), Some(at(2025, 6, 16, 4, 30)));
    }

    #[test]
    fn next_run_crosses_month_boundary() {
        let expr = CronExpression::parse("0 0 1 * *").unwrap();
        let from = at(2025, 6, 15, 0, 0);
        assert_eq!(expr.next_run_after(from), Some(at(2025, 7, 1, 0, 0)));
    }

    #[test]
    fn next_run_handles_annual_expression() {
        let expr = CronExpression::parse("0 0 1 1 *").unwrap();
        let from = at(2025, 1, 1, 0, 0);
        assert_eq!(expr.next_run_after(from), Some(at(2026, 1, 1, 0, 0)));
    }

    #[test]
    fn day_31_skips_short_months() {
        let expr = CronExpression::parse("0 0 31 * *").unwrap();
        // After Jan 31, February has no 31st; the next match is Mar 31.
        let from = at(2025, 1, 31, 0, 0);
        assert_eq!(expr.next_run_after(from), Some(at(2025, 3, 31, 0, 0)));
    }

    #[test]
    fn unsatisfiable_expression_returns_none() {
        // February 31st never exists.
        let expr = CronExpression::parse("0 0 31 2 *").unwrap();
        assert_eq!(expr.next_run_after(at(2025, 1, 1, 0, 0)), None);
    }

    #[test]
    fn is_due_parses_and_matches() {
        assert!(is_due("37 13 * * *", at(2025, 6, 15, 13, 37)).unwrap());
        assert!(!is_due("37 13 * * *", at(2025, 6, 15, 13, 38)).unwrap());
        assert!(is_due("bogus", at(2025, 6, 15, 13, 38)).is_err());
    }
}
