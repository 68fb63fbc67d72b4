//! Five-field cron schedule for daemon mode.
//!
//! Supports the numeric subset: `*`, `*/n`, single values, ranges `a-b` and
//! comma lists, over minute / hour / day-of-month / month / day-of-week
//! (0 = Sunday).

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Datelike, Duration, Local, Timelike};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Field {
    Any,
    Step(u32),
    Values(Vec<u32>),
}

impl Field {
    fn parse(text: &str, min: u32, max: u32) -> Result<Field> {
        if text == "*" {
            return Ok(Field::Any);
        }
        if let Some(step) = text.strip_prefix("*/") {
            let step: u32 = step.parse().context("invalid step value")?;
            if step == 0 {
                bail!("step must be positive");
            }
            return Ok(Field::Step(step));
        }

        let mut values = Vec::new();
        for part in text.split(',') {
            if let Some((start, end)) = part.split_once('-') {
                let start: u32 = start.parse().context("invalid range start")?;
                let end: u32 = end.parse().context("invalid range end")?;
                if start > end {
                    bail!("range start after end in '{part}'");
                }
                values.extend(start..=end);
            } else {
                values.push(part.parse().context("invalid field value")?);
            }
        }
        for value in &values {
            if *value < min || *value > max {
                bail!("value {value} out of range {min}..={max}");
            }
        }
        Ok(Field::Values(values))
    }

    fn matches(&self, value: u32) -> bool {
        match self {
            Field::Any => true,
            Field::Step(step) => value % step == 0,
            Field::Values(values) => values.contains(&value),
        }
    }
}

/// A parsed `minute hour day-of-month month day-of-week` expression.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    minute: Field,
    hour: Field,
    day_of_month: Field,
    month: Field,
    day_of_week: Field,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<CronSchedule> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            bail!(
                "cron expression must have 5 fields, got {} in '{expression}'",
                fields.len()
            );
        }
        Ok(CronSchedule {
            minute: Field::parse(fields[0], 0, 59).context("minute field")?,
            hour: Field::parse(fields[1], 0, 23).context("hour field")?,
            day_of_month: Field::parse(fields[2], 1, 31).context("day-of-month field")?,
            month: Field::parse(fields[3], 1, 12).context("month field")?,
            day_of_week: Field::parse(fields[4], 0, 6).context("day-of-week field")?,
        })
    }

    fn matches(&self, at: &DateTime<Local>) -> bool {
        self.minute.matches(at.minute())
            && self.hour.matches(at.hour())
            && self.day_of_month.matches(at.day())
            && self.month.matches(at.month())
            && self.day_of_week.matches(at.weekday().num_days_from_sunday())
    }

    /// First matching minute strictly after `from`.
    pub fn next_after(&self, from: DateTime<Local>) -> Option<DateTime<Local>> {
        let mut candidate = (from + Duration::minutes(1))
            .with_second(0)?
            .with_nanosecond(0)?;
        // A year of minutes covers every reachable schedule.
        for _ in 0..(366 * 24 * 60) {
            if self.matches(&candidate) {
                return Some(candidate);
            }
            candidate += Duration::minutes(1);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_parse_rejects_bad_expressions() {
        assert!(CronSchedule::parse("0 4 * *").is_err());
        assert!(CronSchedule::parse("61 4 * * *").is_err());
        assert!(CronSchedule::parse("*/0 * * * *").is_err());
        assert!(CronSchedule::parse("a b c d e").is_err());
    }

    #[test]
    fn test_daily_at_four() {
        let schedule = CronSchedule::parse("0 4 * * *").unwrap();
        let next = schedule.next_after(at(2024, 5, 1, 12, 0)).unwrap();
        assert_eq!(next, at(2024, 5, 2, 4, 0));
    }

    #[test]
    fn test_every_fifteen_minutes() {
        let schedule = CronSchedule::parse("*/15 * * * *").unwrap();
        let next = schedule.next_after(at(2024, 5, 1, 12, 7)).unwrap();
        assert_eq!(next, at(2024, 5, 1, 12, 15));
    }

    #[test]
    fn test_weekday_restriction() {
        // Mondays only (2024-05-06 is a Monday).
        let schedule = CronSchedule::parse("30 6 * * 1").unwrap();
        let next = schedule.next_after(at(2024, 5, 3, 12, 0)).unwrap();
        assert_eq!(next, at(2024, 5, 6, 6, 30));
    }

    #[test]
    fn test_range_and_list() {
        let schedule = CronSchedule::parse("0 8-10,14 * * *").unwrap();
        assert_eq!(
            schedule.next_after(at(2024, 5, 1, 8, 30)).unwrap(),
            at(2024, 5, 1, 9, 0)
        );
        assert_eq!(
            schedule.next_after(at(2024, 5, 1, 11, 0)).unwrap(),
            at(2024, 5, 1, 14, 0)
        );
    }
}
