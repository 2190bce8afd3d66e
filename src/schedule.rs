//! Trigger evaluation.
//!
//! A [`ScheduleSpec`] holds one set of allowed values per cron field. An empty
//! set is a wildcard. A timestamp is due when every field matches its
//! minute-truncated component; day-of-month and day-of-week are AND'd, unlike
//! Vixie cron which ORs them when both are restricted.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CronError, Result};

const MINUTE: (u32, u32) = (0, 59);
const HOUR: (u32, u32) = (0, 23);
const DAY_OF_MONTH: (u32, u32) = (1, 31);
const MONTH: (u32, u32) = (1, 12);
const DAY_OF_WEEK: (u32, u32) = (0, 6);

/// How far [`ScheduleSpec::next_after`] looks ahead before giving up.
const LOOKAHEAD_MINUTES: i64 = 366 * 24 * 60;

/// Allowed values for each cron field. Sunday is day-of-week 0.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSpec {
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub minutes: BTreeSet<u32>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub hours: BTreeSet<u32>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub days_of_month: BTreeSet<u32>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub days_of_week: BTreeSet<u32>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub months: BTreeSet<u32>,
}

impl ScheduleSpec {
    /// A schedule that matches every minute.
    pub fn every_minute() -> Self {
        Self::default()
    }

    /// Parse a 5-field cron expression: `minute hour day-of-month month day-of-week`.
    ///
    /// Each field accepts `*`, `n`, `a-b`, `a,b,c`, `*/s`, `a-b/s` and `n/s`.
    /// Day-of-week accepts `7` as an alias for Sunday.
    pub fn parse(expr: &str) -> Result<Self> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(invalid(
                expr,
                format!("expected 5 fields, found {}", parts.len()),
            ));
        }

        let field = |name: &str, raw: &str, bounds: (u32, u32)| {
            parse_field(raw, bounds).map_err(|reason| invalid(expr, format!("{name}: {reason}")))
        };

        let days_of_week = field("day-of-week", parts[4], (0, 7))?
            .into_iter()
            .map(|d| d % 7)
            .collect();

        Ok(Self {
            minutes: field("minute", parts[0], MINUTE)?,
            hours: field("hour", parts[1], HOUR)?,
            days_of_month: field("day-of-month", parts[2], DAY_OF_MONTH)?,
            months: field("month", parts[3], MONTH)?,
            days_of_week,
        })
    }

    /// Reject values outside each field's range.
    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("minute", &self.minutes, MINUTE),
            ("hour", &self.hours, HOUR),
            ("day-of-month", &self.days_of_month, DAY_OF_MONTH),
            ("month", &self.months, MONTH),
            ("day-of-week", &self.days_of_week, DAY_OF_WEEK),
        ];
        for (name, set, (min, max)) in fields {
            if let Some(bad) = set.iter().find(|v| **v < min || **v > max) {
                return Err(invalid(
                    &self.to_string(),
                    format!("{name} value {bad} outside {min}-{max}"),
                ));
            }
        }
        Ok(())
    }

    /// True when `at`, truncated to the minute, satisfies every field.
    pub fn is_due<Tz: TimeZone>(&self, at: &DateTime<Tz>) -> bool {
        let at = truncate_to_minute(at);
        matches(&self.minutes, at.minute())
            && matches(&self.hours, at.hour())
            && matches(&self.days_of_month, at.day())
            && matches(&self.months, at.month())
            && matches(&self.days_of_week, at.weekday().num_days_from_sunday())
    }

    /// The first due minute strictly after `after`, looking at most a year ahead.
    pub fn next_after(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut current = truncate_to_minute(after) + Duration::minutes(1);
        for _ in 0..LOOKAHEAD_MINUTES {
            if self.is_due(&current) {
                return Some(current);
            }
            current += Duration::minutes(1);
        }
        None
    }
}

impl fmt::Display for ScheduleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let render = |set: &BTreeSet<u32>| {
            if set.is_empty() {
                "*".to_string()
            } else {
                set.iter().map(u32::to_string).collect::<Vec<_>>().join(",")
            }
        };
        write!(
            f,
            "{} {} {} {} {}",
            render(&self.minutes),
            render(&self.hours),
            render(&self.days_of_month),
            render(&self.months),
            render(&self.days_of_week)
        )
    }
}

/// Drop seconds and sub-second precision.
pub fn truncate_to_minute<Tz: TimeZone>(at: &DateTime<Tz>) -> DateTime<Tz> {
    at.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or_else(|| at.clone())
}

fn matches(set: &BTreeSet<u32>, value: u32) -> bool {
    set.is_empty() || set.contains(&value)
}

fn invalid(expr: &str, reason: String) -> CronError {
    CronError::InvalidSchedule {
        expr: expr.to_string(),
        reason,
    }
}

fn parse_field(raw: &str, (min, max): (u32, u32)) -> std::result::Result<BTreeSet<u32>, String> {
    if raw == "*" {
        return Ok(BTreeSet::new());
    }

    let mut values = BTreeSet::new();
    for item in raw.split(',') {
        if item.is_empty() {
            return Err(format!("empty list item in '{raw}'"));
        }

        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step '{step}'"))?;
                if step == 0 {
                    return Err("step must be at least 1".to_string());
                }
                (range, Some(step))
            }
            None => (item, None),
        };

        let (start, end) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_value(a, min, max)?, parse_value(b, min, max)?)
        } else {
            let v = parse_value(range, min, max)?;
            // `n/s` runs from n to the end of the field.
            (v, if step.is_some() { max } else { v })
        };

        if start > end {
            return Err(format!("range start {start} is after end {end}"));
        }

        values.extend((start..=end).step_by(step.unwrap_or(1) as usize));
    }
    Ok(values)
}

fn parse_value(raw: &str, min: u32, max: u32) -> std::result::Result<u32, String> {
    let value: u32 = raw.parse().map_err(|_| format!("invalid value '{raw}'"))?;
    if value < min || value > max {
        return Err(format!("value {value} outside {min}-{max}"));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn set(values: &[u32]) -> BTreeSet<u32> {
        values.iter().copied().collect()
    }

    #[test]
    fn wildcard_spec_is_due_every_minute() {
        let spec = ScheduleSpec::every_minute();
        let mut t = at(2024, 2, 28, 22, 0, 0);
        for _ in 0..(3 * 24 * 60) {
            assert!(spec.is_due(&t), "expected due at {t}");
            t += Duration::minutes(1);
        }
    }

    #[test]
    fn nine_oclock_spec_matches_whole_minute_only() {
        let spec = ScheduleSpec {
            minutes: set(&[0]),
            hours: set(&[9]),
            ..Default::default()
        };

        assert!(spec.is_due(&at(2024, 1, 1, 9, 0, 0)));
        assert!(spec.is_due(&at(2024, 7, 19, 9, 0, 59)));
        assert!(spec.is_due(&(at(2024, 12, 31, 9, 0, 59) + Duration::milliseconds(999))));
        assert!(!spec.is_due(&at(2024, 1, 1, 9, 1, 0)));
        assert!(!spec.is_due(&at(2024, 1, 1, 8, 0, 0)));
    }

    #[test]
    fn day_of_month_and_day_of_week_are_both_required() {
        // 1st of the month AND a Monday.
        let spec = ScheduleSpec::parse("0 0 1 * 1").unwrap();

        // 2024-01-01 is a Monday.
        assert!(spec.is_due(&at(2024, 1, 1, 0, 0, 0)));
        // 2024-02-01 is a Thursday.
        assert!(!spec.is_due(&at(2024, 2, 1, 0, 0, 0)));
        // 2024-01-08 is a Monday but not the 1st.
        assert!(!spec.is_due(&at(2024, 1, 8, 0, 0, 0)));
    }

    #[test]
    fn month_field_restricts() {
        let spec = ScheduleSpec::parse("30 12 * 6 *").unwrap();
        assert!(spec.is_due(&at(2024, 6, 15, 12, 30, 10)));
        assert!(!spec.is_due(&at(2024, 7, 15, 12, 30, 10)));
    }

    #[test]
    fn parse_supports_lists_ranges_and_steps() {
        let spec = ScheduleSpec::parse("*/15 9-17 1,15 * 1-5").unwrap();
        assert_eq!(spec.minutes, set(&[0, 15, 30, 45]));
        assert_eq!(spec.hours, (9..=17).collect());
        assert_eq!(spec.days_of_month, set(&[1, 15]));
        assert!(spec.months.is_empty());
        assert_eq!(spec.days_of_week, set(&[1, 2, 3, 4, 5]));
    }

    #[test]
    fn parse_stepped_range_and_offset_step() {
        let spec = ScheduleSpec::parse("5/20 0-12/6 * * *").unwrap();
        assert_eq!(spec.minutes, set(&[5, 25, 45]));
        assert_eq!(spec.hours, set(&[0, 6, 12]));
    }

    #[test]
    fn parse_maps_seven_to_sunday() {
        let spec = ScheduleSpec::parse("0 0 * * 7").unwrap();
        assert_eq!(spec.days_of_week, set(&[0]));
        // 2024-01-07 is a Sunday.
        assert!(spec.is_due(&at(2024, 1, 7, 0, 0, 0)));
    }

    #[test]
    fn parse_rejects_bad_expressions() {
        for expr in [
            "",
            "* * * *",
            "* * * * * *",
            "60 * * * *",
            "* 24 * * *",
            "* * 0 * *",
            "* * * 13 *",
            "* * * * 8",
            "*/0 * * * *",
            "5-1 * * * *",
            "1,,2 * * * *",
            "a * * * *",
        ] {
            let err = ScheduleSpec::parse(expr).unwrap_err();
            assert!(
                matches!(err, CronError::InvalidSchedule { .. }),
                "expected InvalidSchedule for {expr:?}, got {err:?}"
            );
        }
    }

    #[test]
    fn validate_rejects_out_of_range_sets() {
        let spec = ScheduleSpec {
            hours: set(&[25]),
            ..Default::default()
        };
        assert!(spec.validate().is_err());
        assert!(ScheduleSpec::parse("0 9 * * 1-5").unwrap().validate().is_ok());
    }

    #[test]
    fn next_after_finds_following_match() {
        let spec = ScheduleSpec::parse("0 9 * * *").unwrap();
        assert_eq!(
            spec.next_after(&at(2024, 1, 1, 9, 0, 30)),
            Some(at(2024, 1, 2, 9, 0, 0))
        );
        assert_eq!(
            spec.next_after(&at(2024, 1, 1, 8, 59, 59)),
            Some(at(2024, 1, 1, 9, 0, 0))
        );
    }

    #[test]
    fn next_after_gives_up_on_impossible_dates() {
        let spec = ScheduleSpec::parse("0 0 31 2 *").unwrap();
        assert_eq!(spec.next_after(&at(2024, 1, 1, 0, 0, 0)), None);
    }

    #[test]
    fn display_renders_wildcards_and_lists() {
        let spec = ScheduleSpec::parse("0,30 9 * * 1-2").unwrap();
        assert_eq!(spec.to_string(), "0,30 9 * * 1,2");
    }

    #[test]
    fn truncate_drops_seconds() {
        let t = at(2024, 3, 3, 3, 3, 33) + Duration::milliseconds(250);
        assert_eq!(truncate_to_minute(&t), at(2024, 3, 3, 3, 3, 0));
    }
}
