//! Five-field cron expressions
//!
//! `minute hour day-of-month month day-of-week`, evaluated in UTC. Each field
//! accepts `*`, single values, ranges `a-b`, lists `a,b` and steps `*/n`,
//! `a-b/n` or `a/n`. Day-of-week runs 0-7 with both 0 and 7 meaning Sunday.
//! As in classic cron, when both day fields are restricted a day matches if
//! either does.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};

use crate::error::{Error, Result};

/// How far ahead `next_after` searches before concluding a schedule never fires
const SEARCH_YEARS: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Field {
    bits: u64,
    restricted: bool,
}

impl Field {
    fn contains(&self, value: u32) -> bool {
        self.bits & (1u64 << value) != 0
    }

    fn parse(spec: &str, min: u32, max: u32, name: &str) -> std::result::Result<Self, String> {
        let mut bits = 0u64;
        let restricted = spec != "*";

        for part in spec.split(',') {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => {
                    let step: u32 = step
                        .parse()
                        .map_err(|_| format!("{name}: invalid step '{step}'"))?;
                    if step == 0 || step > max {
                        return Err(format!("{name}: step must be within 1-{max}"));
                    }
                    (range, step)
                }
                None => (part, 1),
            };

            let (start, end) = if range == "*" {
                (min, max)
            } else if let Some((a, b)) = range.split_once('-') {
                (parse_value(a, name)?, parse_value(b, name)?)
            } else {
                let value = parse_value(range, name)?;
                // `a/n` means from a to the end of the field
                if part.contains('/') { (value, max) } else { (value, value) }
            };

            if start < min || end > max || start > end {
                return Err(format!("{name}: '{range}' is outside {min}-{max}"));
            }

            for value in (start..=end).step_by(step as usize) {
                bits |= 1u64 << value;
            }
        }

        Ok(Self { bits, restricted })
    }
}

fn parse_value(s: &str, name: &str) -> std::result::Result<u32, String> {
    s.parse().map_err(|_| format!("{name}: invalid value '{s}'"))
}

/// A parsed cron schedule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expression: String,
    minutes: Field,
    hours: Field,
    days_of_month: Field,
    months: Field,
    days_of_week: Field,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let invalid = |reason: String| {
            Error::Configuration(format!("invalid cron expression '{expression}': {reason}"))
        };

        let fields: Vec<&str> = expression.split_whitespace().collect();
        let [minute, hour, dom, month, dow] = fields.as_slice() else {
            return Err(invalid(format!("expected 5 fields, found {}", fields.len())));
        };

        let mut days_of_week = Field::parse(dow, 0, 7, "day-of-week").map_err(invalid)?;
        if days_of_week.contains(7) {
            days_of_week.bits |= 1;
        }

        Ok(Self {
            expression: fields.join(" "),
            minutes: Field::parse(minute, 0, 59, "minute").map_err(invalid)?,
            hours: Field::parse(hour, 0, 23, "hour").map_err(invalid)?,
            days_of_month: Field::parse(dom, 1, 31, "day-of-month").map_err(invalid)?,
            months: Field::parse(month, 1, 12, "month").map_err(invalid)?,
            days_of_week,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Whether the schedule fires at the minute containing `t`
    pub fn matches(&self, t: DateTime<Utc>) -> bool {
        self.months.contains(t.month())
            && self.day_matches(t)
            && self.hours.contains(t.hour())
            && self.minutes.contains(t.minute())
    }

    /// First firing time strictly after `after`, or `None` if there is none
    /// within the search horizon
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = after.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
        let horizon = t + Duration::days(366 * SEARCH_YEARS);

        while t < horizon {
            if !self.months.contains(t.month()) {
                let (year, month) = if t.month() == 12 {
                    (t.year() + 1, 1)
                } else {
                    (t.year(), t.month() + 1)
                };
                t = Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()?;
                continue;
            }
            if !self.day_matches(t) {
                t = (t + Duration::days(1)).with_hour(0)?.with_minute(0)?;
                continue;
            }
            if !self.hours.contains(t.hour()) {
                t = (t + Duration::hours(1)).with_minute(0)?;
                continue;
            }
            if !self.minutes.contains(t.minute()) {
                t += Duration::minutes(1);
                continue;
            }
            return Some(t);
        }
        None
    }

    fn day_matches(&self, t: DateTime<Utc>) -> bool {
        let dom = self.days_of_month.contains(t.day());
        let dow = self.days_of_week.contains(t.weekday().num_days_from_sunday());

        match (self.days_of_month.restricted, self.days_of_week.restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }
}

impl FromStr for CronSchedule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_parse_rejects_bad_expressions() {
        for bad in [
            "", "* * * *", "60 * * * *", "* 24 * * *", "*/0 * * * *", "5-1 * * * *", "a * * * *", "* * 0 * *",
            "5/4294967295 * * * *", "* */25 * * *",
        ] {
            assert!(
                matches!(CronSchedule::parse(bad), Err(Error::Configuration(_))),
                "{bad:?} should be rejected"
            );
        }
        assert!(CronSchedule::parse("0,15,30,45 9-17/2 1 */3 1-5").is_ok());
    }

    #[test]
    fn test_next_after_every_fifteen_minutes() {
        let cron = CronSchedule::parse("*/15 * * * *").unwrap();
        assert_eq!(cron.next_after(at(2024, 1, 1, 10, 7)), Some(at(2024, 1, 1, 10, 15)));
        // strictly after
        assert_eq!(cron.next_after(at(2024, 1, 1, 10, 15)), Some(at(2024, 1, 1, 10, 30)));
        assert_eq!(cron.next_after(at(2024, 1, 1, 23, 50)), Some(at(2024, 1, 2, 0, 0)));
    }

    #[test]
    fn test_next_after_daily_and_weekly() {
        let daily = CronSchedule::parse("30 3 * * *").unwrap();
        assert_eq!(daily.next_after(at(2024, 1, 1, 4, 0)), Some(at(2024, 1, 2, 3, 30)));

        // 2024-01-01 is a Monday; Sunday may be written 0 or 7
        let sunday = CronSchedule::parse("0 4 * * 7").unwrap();
        assert_eq!(sunday.next_after(at(2024, 1, 1, 0, 0)), Some(at(2024, 1, 7, 4, 0)));
        assert!(sunday.matches(at(2024, 1, 14, 4, 0)));
    }

    #[test]
    fn test_next_after_crosses_month_and_year() {
        let cron = CronSchedule::parse("0 0 1 * *").unwrap();
        assert_eq!(cron.next_after(at(2024, 12, 15, 0, 0)), Some(at(2025, 1, 1, 0, 0)));

        let leap = CronSchedule::parse("0 12 29 2 *").unwrap();
        assert_eq!(leap.next_after(at(2024, 3, 1, 0, 0)), Some(at(2028, 2, 29, 12, 0)));
    }

    #[test]
    fn test_restricted_day_fields_match_either() {
        // the 13th or any Friday
        let cron = CronSchedule::parse("0 0 13 * 5").unwrap();
        assert_eq!(cron.next_after(at(2024, 1, 1, 0, 0)), Some(at(2024, 1, 5, 0, 0)));
        assert!(cron.matches(at(2024, 1, 13, 0, 0)));
    }

    #[test]
    fn test_impossible_schedule_never_fires() {
        let cron = CronSchedule::parse("0 0 30 2 *").unwrap();
        assert_eq!(cron.next_after(at(2024, 1, 1, 0, 0)), None);
    }
}
