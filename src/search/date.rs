//! Date values of `created:`, `modified:` and `year:` terms
//!
//! ## Supported values
//! - `2020`, `2020-06`, `2020-06-15` (calendar ranges)
//! - `june`, `jun` (that month in any year)
//! - `15th`, `1st` (that day of any month)
//! - `30d`, `2w`, `6m`, `1y` (age relative to now)
//! - `today`, `yesterday`
//!
//! Every value may be prefixed with `<`, `<=`, `>`, `>=` or `=`. Calendar
//! boundaries are UTC days.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use regex::Regex;
use std::sync::LazyLock;

use super::terms::Comparison;

static AGE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{1,5})([dwmy])$").expect("this regex should always be valid"));
static ORDINAL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{1,2})(st|nd|rd|th)$").expect("this regex should always be valid"));
static CALENDAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{4})(?:[-/.](\d{1,2})(?:[-/.](\d{1,2}))?)?$").expect("this regex should always be valid")
});

const MONTHS: [&str; 12] = [
    "january", "february", "march", "april", "may", "june", "july", "august", "september", "october", "november",
    "december",
];

/// Which timestamp a date term looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateTarget {
    /// Capture time, falling back to the file-system creation time
    Created,
    Modified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateSpec {
    Year(i32),
    YearMonth(i32, u32),
    Day(NaiveDate),
    /// A month of any year
    Month(u32),
    /// A day of any month
    DayOfMonth(u32),
    /// Age; `<30d` means "newer than 30 days"
    Age(AgeUnit, u32),
    /// Whole day `n` days before today
    DaysAgo(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgeUnit {
    Days,
    Weeks,
    Months,
    Years,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateTerm {
    pub target: DateTarget,
    pub comparison: Comparison,
    pub spec: DateSpec,
}

impl DateTerm {
    /// Parse a date value; `None` when it is not a recognizable date
    pub fn parse(target: DateTarget, raw: &str) -> Option<Self> {
        let (comparison, value) = Comparison::split_prefix(raw.trim());
        let spec = parse_spec(&value.to_lowercase())?;
        Some(Self {
            target,
            comparison,
            spec,
        })
    }

    pub fn matches(&self, time: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let (start, end) = match self.spec {
            DateSpec::Month(month) => return time.month() == month,
            DateSpec::DayOfMonth(day) => return time.day() == day,
            DateSpec::Age(unit, count) => {
                let cutoff = age_cutoff(now, unit, count);
                // Older items have smaller timestamps
                return match self.comparison {
                    Comparison::Contains | Comparison::Equals | Comparison::LessThan => time > cutoff,
                    Comparison::LessOrEqual => time >= cutoff,
                    Comparison::GreaterThan => time < cutoff,
                    Comparison::GreaterOrEqual => time <= cutoff,
                };
            }
            spec => match calendar_range(spec, now) {
                Some(range) => range,
                None => return false,
            },
        };

        match self.comparison {
            Comparison::Contains | Comparison::Equals => time >= start && time < end,
            Comparison::LessThan => time < start,
            Comparison::LessOrEqual => time < end,
            Comparison::GreaterThan => time >= end,
            Comparison::GreaterOrEqual => time >= start,
        }
    }
}

fn parse_spec(value: &str) -> Option<DateSpec> {
    match value {
        "today" => return Some(DateSpec::DaysAgo(0)),
        "yesterday" => return Some(DateSpec::DaysAgo(1)),
        _ => {}
    }

    if let Some(caps) = CALENDAR_PATTERN.captures(value) {
        let year: i32 = caps[1].parse().ok()?;
        let month: Option<u32> = caps.get(2).and_then(|m| m.as_str().parse().ok());
        let day: Option<u32> = caps.get(3).and_then(|d| d.as_str().parse().ok());
        return match (month, day) {
            (Some(m), Some(d)) => NaiveDate::from_ymd_opt(year, m, d).map(DateSpec::Day),
            (Some(m), None) if (1..=12).contains(&m) => Some(DateSpec::YearMonth(year, m)),
            (Some(_), None) => None,
            _ => Some(DateSpec::Year(year)),
        };
    }

    if let Some(caps) = AGE_PATTERN.captures(value) {
        let count: u32 = caps[1].parse().ok()?;
        let unit = match &caps[2] {
            "d" => AgeUnit::Days,
            "w" => AgeUnit::Weeks,
            "m" => AgeUnit::Months,
            _ => AgeUnit::Years,
        };
        return Some(DateSpec::Age(unit, count));
    }

    if let Some(caps) = ORDINAL_PATTERN.captures(value) {
        let day: u32 = caps[1].parse().ok()?;
        return (1..=31).contains(&day).then_some(DateSpec::DayOfMonth(day));
    }

    month_number(value).map(DateSpec::Month)
}

/// Month number from a full name or an unambiguous prefix of at least 3 letters
pub fn month_number(value: &str) -> Option<u32> {
    if value.len() < 3 {
        return None;
    }
    MONTHS
        .iter()
        .position(|m| m.starts_with(value))
        .map(|i| i as u32 + 1)
}

fn age_cutoff(now: DateTime<Utc>, unit: AgeUnit, count: u32) -> DateTime<Utc> {
    let days = match unit {
        AgeUnit::Days => count as i64,
        AgeUnit::Weeks => count as i64 * 7,
        AgeUnit::Months => count as i64 * 30,
        AgeUnit::Years => count as i64 * 365,
    };
    now - Duration::days(days)
}

fn day_start(date: NaiveDate) -> Option<DateTime<Utc>> {
    date.and_hms_opt(0, 0, 0).map(|t| t.and_utc())
}

/// Half-open `[start, end)` range of a calendar spec
fn calendar_range(spec: DateSpec, now: DateTime<Utc>) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let (start, end) = match spec {
        DateSpec::Year(y) => (NaiveDate::from_ymd_opt(y, 1, 1)?, NaiveDate::from_ymd_opt(y + 1, 1, 1)?),
        DateSpec::YearMonth(y, m) => {
            let start = NaiveDate::from_ymd_opt(y, m, 1)?;
            let end = if m == 12 {
                NaiveDate::from_ymd_opt(y + 1, 1, 1)?
            } else {
                NaiveDate::from_ymd_opt(y, m + 1, 1)?
            };
            (start, end)
        }
        DateSpec::Day(d) => (d, d.succ_opt()?),
        DateSpec::DaysAgo(n) => {
            let day = now.date_naive() - Duration::days(n as i64);
            (day, day.succ_opt()?)
        }
        DateSpec::Month(_) | DateSpec::DayOfMonth(_) | DateSpec::Age(..) => return None,
    };
    Some((day_start(start)?, day_start(end)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    fn term(raw: &str) -> DateTerm {
        DateTerm::parse(DateTarget::Created, raw).unwrap()
    }

    #[test]
    fn test_parse_forms() {
        assert_eq!(term("2020").spec, DateSpec::Year(2020));
        assert_eq!(term("2020-06").spec, DateSpec::YearMonth(2020, 6));
        assert_eq!(term("2020-06-15").spec, DateSpec::Day(NaiveDate::from_ymd_opt(2020, 6, 15).unwrap()));
        assert_eq!(term("June").spec, DateSpec::Month(6));
        assert_eq!(term("sep").spec, DateSpec::Month(9));
        assert_eq!(term("15th").spec, DateSpec::DayOfMonth(15));
        assert_eq!(term("<30d").spec, DateSpec::Age(AgeUnit::Days, 30));
        assert_eq!(term("<30d").comparison, Comparison::LessThan);
        assert!(DateTerm::parse(DateTarget::Created, "2020-13").is_none());
        assert!(DateTerm::parse(DateTarget::Created, "ju").is_none());
        assert!(DateTerm::parse(DateTarget::Created, "cat").is_none());
    }

    #[test]
    fn test_calendar_matching() {
        let now = at(2024, 1, 1);
        assert!(term("2020").matches(at(2020, 12, 31), now));
        assert!(!term("2020").matches(at(2021, 1, 1), now));
        assert!(term(">2019").matches(at(2020, 1, 1), now));
        assert!(!term(">2019").matches(at(2019, 6, 1), now));
        assert!(term("<=2020-06").matches(at(2020, 6, 30), now));
        assert!(!term("<2020-06").matches(at(2020, 6, 1), now));
        assert!(term("2020-01-01").matches(at(2020, 1, 1), now));
    }

    #[test]
    fn test_relative_matching() {
        let now = at(2024, 3, 10);
        assert!(term("<30d").matches(at(2024, 3, 1), now));
        assert!(!term("<30d").matches(at(2024, 1, 1), now));
        assert!(term(">1y").matches(at(2022, 1, 1), now));
        assert!(term("today").matches(at(2024, 3, 10), now));
        assert!(term("yesterday").matches(at(2024, 3, 9), now));
        assert!(term("march").matches(at(1999, 3, 2), now));
        assert!(term("2nd").matches(at(1999, 3, 2), now));
    }
}
