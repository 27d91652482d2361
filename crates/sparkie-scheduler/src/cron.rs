//! Cron expression evaluator.
//! Supports: "MIN HOUR DOM MON DOW" (5-field, no seconds)
//! Each field accepts `*`, `N`, `a-b`, `*/N`, `a-b/N`, `a/N` and comma lists of those.
//! Day-of-week is 0-6 with Sunday = 0 (7 is accepted as Sunday too).
//! All five fields must match (day-of-month and day-of-week are ANDed).

use chrono::{DateTime, Datelike, Duration, FixedOffset, Offset, TimeZone, Timelike, Utc};
use sparkie_core::error::{Result, SparkieError};

/// How far ahead the minute scan looks before giving up.
pub const SEARCH_HORIZON_DAYS: i64 = 365;

/// Returned offset when an expression is malformed or never fires.
pub const FALLBACK_DELAY_HOURS: i64 = 24;

/// A parsed cron expression; each field is a bitmask of allowed values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
}

impl CronSchedule {
    /// Parse a 5-field expression. Fields past the fifth are ignored.
    pub fn parse(expression: &str) -> Result<Self> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() < 5 {
            return Err(SparkieError::InvalidInput(format!(
                "cron expression '{expression}' needs 5 fields: MIN HOUR DOM MON DOW"
            )));
        }

        let mut days_of_week = parse_field(parts[4], 0, 7)?;
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week | 1) & !(1 << 7);
        }

        Ok(Self {
            minutes: parse_field(parts[0], 0, 59)?,
            hours: parse_field(parts[1], 0, 23)?,
            days_of_month: parse_field(parts[2], 1, 31)?,
            months: parse_field(parts[3], 1, 12)?,
            days_of_week,
        })
    }

    /// Whether `t` (in its own timezone) satisfies every field.
    pub fn matches<Tz: TimeZone>(&self, t: &DateTime<Tz>) -> bool {
        bit(self.months, t.month())
            && bit(self.days_of_month, t.day())
            && bit(self.days_of_week, t.weekday().num_days_from_sunday())
            && bit(self.hours, t.hour())
            && bit(self.minutes, t.minute())
    }

    /// Earliest whole minute strictly after `after` that matches, scanning
    /// minute by minute up to the search horizon.
    pub fn next_after<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        let start = after.clone() + Duration::minutes(1);
        let mut candidate = start
            .with_second(0)
            .and_then(|c| c.with_nanosecond(0))
            .unwrap_or(start);
        let limit = after.clone() + Duration::days(SEARCH_HORIZON_DAYS);

        while candidate < limit {
            if self.matches(&candidate) {
                return Some(candidate);
            }
            candidate = candidate + Duration::minutes(1);
        }
        None
    }
}

/// Next fire time for `expression` after `after`.
///
/// Never fails: a malformed expression, or one with no match inside the
/// horizon, yields `after + 24h`.
pub fn next_fire_time<Tz: TimeZone>(expression: &str, after: DateTime<Tz>) -> DateTime<Tz> {
    let fallback = after.clone() + Duration::hours(FALLBACK_DELAY_HOURS);
    match CronSchedule::parse(expression) {
        Ok(schedule) => schedule.next_after(&after).unwrap_or_else(|| {
            tracing::warn!(
                "cron expression '{}' has no match within {} days, falling back to +{}h",
                expression,
                SEARCH_HORIZON_DAYS,
                FALLBACK_DELAY_HOURS
            );
            fallback
        }),
        Err(e) => {
            tracing::warn!("{e}, falling back to +{}h", FALLBACK_DELAY_HOURS);
            fallback
        }
    }
}

/// Evaluate `expression` on a wall clock shifted by `offset_minutes` from UTC,
/// returning the instant in UTC.
pub fn next_fire_time_with_offset(
    expression: &str,
    after: DateTime<Utc>,
    offset_minutes: i32,
) -> DateTime<Utc> {
    let offset = FixedOffset::east_opt(offset_minutes.saturating_mul(60)).unwrap_or_else(|| Utc.fix());
    next_fire_time(expression, after.with_timezone(&offset)).with_timezone(&Utc)
}

fn bit(mask: u64, value: u32) -> bool {
    value < 64 && mask & (1u64 << value) != 0
}

/// Parse one field into a bitmask of allowed values.
fn parse_field(field: &str, min: u32, max: u32) -> Result<u64> {
    let invalid = |why: &str| SparkieError::InvalidInput(format!("cron field '{field}': {why}"));
    let mut mask = 0u64;

    for segment in field.split(',') {
        if segment.is_empty() {
            return Err(invalid("empty list item"));
        }

        let (range, step) = match segment.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| invalid("step is not a number"))?;
                if step == 0 {
                    return Err(invalid("step must be > 0"));
                }
                (range, Some(step))
            }
            None => (segment, None),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            let a: u32 = a.parse().map_err(|_| invalid("range start is not a number"))?;
            let b: u32 = b.parse().map_err(|_| invalid("range end is not a number"))?;
            (a, b)
        } else {
            let n: u32 = range.parse().map_err(|_| invalid("value is not a number"))?;
            // "a/N" runs from a to the end of the field
            if step.is_some() { (n, max) } else { (n, n) }
        };

        if lo < min || hi > max || lo > hi {
            return Err(invalid(&format!("range {lo}-{hi} outside {min}-{max}")));
        }

        let mut v = lo;
        while v <= hi {
            mask |= 1u64 << v;
            v += step.unwrap_or(1);
        }
    }

    Ok(mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_every_hour() {
        let next = next_fire_time("0 * * * *", at(2026, 2, 22, 10, 30));
        assert_eq!(next, at(2026, 2, 22, 11, 0));
    }

    #[test]
    fn test_specific_time_same_day() {
        let next = next_fire_time("0 8 * * *", at(2026, 2, 22, 7, 0));
        assert_eq!(next, at(2026, 2, 22, 8, 0));
    }

    #[test]
    fn test_strictly_after_exact_match() {
        let next = next_fire_time("0 9 * * *", at(2026, 3, 1, 9, 0));
        assert_eq!(next, at(2026, 3, 2, 9, 0));
    }

    #[test]
    fn test_truncates_seconds() {
        let after = Utc.with_ymd_and_hms(2026, 2, 22, 10, 2, 45).unwrap();
        let next = next_fire_time("*/15 * * * *", after);
        assert_eq!(next, at(2026, 2, 22, 10, 15));
        assert_eq!(next.second(), 0);
    }

    #[test]
    fn test_range_with_step_and_list() {
        // minutes 10,20,30 during hours 9-17 on weekdays
        let schedule = CronSchedule::parse("10-30/10 9-17 * * 1-5").unwrap();
        // 2026-02-21 is a Saturday
        let next = schedule.next_after(&at(2026, 2, 21, 12, 0)).unwrap();
        assert_eq!(next, at(2026, 2, 23, 9, 10));
        let list = CronSchedule::parse("5,35 * * * *").unwrap();
        assert_eq!(list.next_after(&at(2026, 1, 1, 0, 6)).unwrap(), at(2026, 1, 1, 0, 35));
    }

    #[test]
    fn test_start_with_step_runs_to_field_end() {
        let schedule = CronSchedule::parse("50/5 * * * *").unwrap();
        assert_eq!(schedule.next_after(&at(2026, 1, 1, 0, 56)).unwrap(), at(2026, 1, 1, 1, 50));
    }

    #[test]
    fn test_month_and_day_of_month() {
        let next = next_fire_time("30 6 15 7 *", at(2026, 8, 1, 0, 0));
        assert_eq!(next, at(2027, 7, 15, 6, 30));
    }

    #[test]
    fn test_sunday_as_seven() {
        let a = CronSchedule::parse("0 0 * * 7").unwrap();
        let b = CronSchedule::parse("0 0 * * 0").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_day_fields_are_anded() {
        // the 13th that is also a Friday
        let next = next_fire_time("0 12 13 * 5", at(2026, 1, 1, 0, 0));
        assert_eq!(next, at(2026, 2, 13, 12, 0));
    }

    #[test]
    fn test_malformed_falls_back_to_24h() {
        let after = at(2026, 2, 22, 10, 0);
        assert_eq!(next_fire_time("bad", after), after + Duration::hours(24));
        assert_eq!(next_fire_time("0 9 * *", after), after + Duration::hours(24));
        assert_eq!(next_fire_time("61 * * * *", after), after + Duration::hours(24));
        assert_eq!(next_fire_time("*/0 * * * *", after), after + Duration::hours(24));
    }

    #[test]
    fn test_unreachable_date_falls_back_to_24h() {
        let after = at(2026, 2, 22, 10, 0);
        assert_eq!(next_fire_time("0 0 31 2 *", after), after + Duration::hours(24));
    }

    #[test]
    fn test_parse_errors() {
        assert!(CronSchedule::parse("").is_err());
        assert!(CronSchedule::parse("1,,2 * * * *").is_err());
        assert!(CronSchedule::parse("5-1 * * * *").is_err());
        assert!(CronSchedule::parse("* 24 * * *").is_err());
        assert!(CronSchedule::parse("* * 0 * *").is_err());
    }

    #[test]
    fn test_result_is_earliest_match() {
        let exprs = ["*/7 * * * *", "0 9 * * 1", "15,45 */3 * * *", "0 0 1 * *", "20-25 4 * 2 0"];
        let starts = [at(2026, 1, 31, 23, 59), at(2026, 2, 28, 4, 22), at(2026, 6, 15, 12, 0)];
        for expr in exprs {
            let schedule = CronSchedule::parse(expr).unwrap();
            for start in starts {
                let next = next_fire_time(expr, start);
                assert!(next > start, "{expr} from {start}");
                assert!(schedule.matches(&next));
                let mut probe = start.with_second(0).unwrap() + Duration::minutes(1);
                while probe < next {
                    assert!(!schedule.matches(&probe), "{expr}: earlier match at {probe}");
                    probe = probe + Duration::minutes(1);
                }
            }
        }
    }

    #[test]
    fn test_offset_evaluation() {
        // 09:00 at UTC+2 is 07:00 UTC
        let next = next_fire_time_with_offset("0 9 * * *", at(2026, 5, 1, 8, 0), 120);
        assert_eq!(next, at(2026, 5, 2, 7, 0));
    }
}
