use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::{util::days_in_year_month, Date, Duration, Month};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid date '{0}', expected YYYY-MM-DD")]
pub struct InvalidDate(pub String);

/// Inclusive date range. Every period-based query and the balance closing
/// operation use these bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    #[serde(with = "iso_date")]
    pub start: Date,
    #[serde(with = "iso_date")]
    pub end: Date,
}

impl DateRange {
    pub fn new(start: Date, end: Date) -> Self {
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    pub fn contains(&self, date: Date) -> bool {
        self.start <= date && date <= self.end
    }
}

impl Display for DateRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..={}", format_date(self.start), format_date(self.end))
    }
}

/// Calendar month containing `date`.
///
/// This is the only place month boundaries are computed. A balance closes a
/// period on `period_of(d).end`, and new operations are matched against
/// existing balances through the same function.
pub fn period_of(date: Date) -> DateRange {
    let start = date - Duration::days(i64::from(date.day()) - 1);
    let days = days_in_year_month(date.year(), date.month());
    let end = start + Duration::days(i64::from(days) - 1);
    DateRange { start, end }
}

pub fn format_date(d: Date) -> String {
    format!("{:04}-{:02}-{:02}", d.year(), d.month() as u8, d.day())
}

pub fn parse_date(s: &str) -> Result<Date, InvalidDate> {
    let invalid = || InvalidDate(s.to_string());
    let mut parts = s.trim().splitn(3, '-');
    let year = parts.next().and_then(|p| p.parse::<i32>().ok()).ok_or_else(invalid)?;
    let month = parts.next().and_then(|p| p.parse::<u8>().ok()).ok_or_else(invalid)?;
    let day = parts.next().and_then(|p| p.parse::<u8>().ok()).ok_or_else(invalid)?;
    let month = Month::try_from(month).map_err(|_| invalid())?;
    Date::from_calendar_date(year, month, day).map_err(|_| invalid())
}

impl FromStr for DateRange {
    type Err = InvalidDate;

    /// Parses `START..END` or `START..=END`, both ends inclusive.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .split_once("..=")
            .or_else(|| s.split_once(".."))
            .ok_or_else(|| InvalidDate(s.to_string()))?;
        Ok(DateRange::new(parse_date(start)?, parse_date(end)?))
    }
}

/// Serde adapter storing `time::Date` as `YYYY-MM-DD` text.
pub mod iso_date {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use time::Date;

    pub fn serialize<S: Serializer>(date: &Date, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_date(*date))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Date, D::Error> {
        let s = String::deserialize(deserializer)?;
        super::parse_date(&s).map_err(D::Error::custom)
    }

    pub mod option {
        use serde::{de::Error, Deserialize, Deserializer, Serializer};
        use time::Date;

        pub fn serialize<S: Serializer>(date: &Option<Date>, serializer: S) -> Result<S::Ok, S::Error> {
            match date {
                Some(d) => serializer.serialize_some(&crate::period::format_date(*d)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Date>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|s| crate::period::parse_date(&s).map_err(D::Error::custom))
                .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    #[test]
    fn test_period_of_mid_month() {
        let p = period_of(date!(2024 - 11 - 20));
        assert_eq!(p.start, date!(2024 - 11 - 01));
        assert_eq!(p.end, date!(2024 - 11 - 30));
    }

    #[test]
    fn test_period_of_leap_february() {
        assert_eq!(period_of(date!(2024 - 02 - 10)).end, date!(2024 - 02 - 29));
        assert_eq!(period_of(date!(2023 - 02 - 10)).end, date!(2023 - 02 - 28));
    }

    #[test]
    fn test_period_of_boundaries() {
        let first = period_of(date!(2024 - 12 - 01));
        let last = period_of(date!(2024 - 12 - 31));
        assert_eq!(first, last);
        assert!(first.contains(date!(2024 - 12 - 15)));
        assert!(!first.contains(date!(2025 - 01 - 01)));
    }

    #[test]
    fn test_parse_and_format_date() {
        let d = parse_date("2024-03-07").unwrap();
        assert_eq!(d, date!(2024 - 03 - 07));
        assert_eq!(format_date(d), "2024-03-07");
        assert!(parse_date("2024-13-01").is_err());
        assert!(parse_date("2024-02-30").is_err());
        assert!(parse_date("yesterday").is_err());
    }

    #[test]
    fn test_range_from_str() {
        let r: DateRange = "2024-11-01..2024-11-30".parse().unwrap();
        assert_eq!(r, period_of(date!(2024 - 11 - 05)));
        let r: DateRange = "2024-11-01..=2024-11-30".parse().unwrap();
        assert_eq!(r.end, date!(2024 - 11 - 30));
        assert!("2024-11-01".parse::<DateRange>().is_err());
    }

    #[test]
    fn test_range_is_empty() {
        assert!(DateRange::new(date!(2024 - 02 - 01), date!(2024 - 01 - 01)).is_empty());
        assert!(!DateRange::new(date!(2024 - 01 - 01), date!(2024 - 01 - 01)).is_empty());
    }
}
