//! Reconciliation periods.
//!
//! A `Period` is the atomic unit of reconciliation. Its length and boundary
//! alignment come from its `Granularity`: calendar months (the default) or
//! clock hours, both in UTC. Periods of the same granularity are totally
//! ordered by their start instant.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeDelta, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Length and boundary alignment of a period.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    /// Calendar month, starting on the first day at 00:00 UTC.
    #[default]
    Month,
    /// Clock hour, starting at minute zero.
    Hour,
}

impl Granularity {
    /// Get the granularity name as a string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Month => "month",
            Self::Hour => "hour",
        }
    }
}

impl FromStr for Granularity {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "month" | "monthly" => Ok(Self::Month),
            "hour" | "hourly" => Ok(Self::Hour),
            other => Err(CoreError::InvalidGranularity(other.to_string())),
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reconciliation period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Period {
    granularity: Granularity,
    start: DateTime<Utc>,
}

impl Period {
    /// The calendar month `year-month`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidPeriod` if the month is out of range.
    pub fn month(year: i32, month: u32) -> Result<Self> {
        let start = utc(year, month, 1, 0)
            .ok_or_else(|| CoreError::InvalidPeriod(format!("{year:04}-{month:02}")))?;
        Ok(Self {
            granularity: Granularity::Month,
            start,
        })
    }

    /// The clock hour starting at `year-month-day hour:00`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidPeriod` if any component is out of range.
    pub fn hour(year: i32, month: u32, day: u32, hour: u32) -> Result<Self> {
        let start = utc(year, month, day, hour).ok_or_else(|| {
            CoreError::InvalidPeriod(format!("{year:04}-{month:02}-{day:02}T{hour:02}"))
        })?;
        Ok(Self {
            granularity: Granularity::Hour,
            start,
        })
    }

    /// The period of the given granularity that contains `instant`.
    ///
    /// # Panics
    ///
    /// Never panics for instants chrono can represent.
    #[must_use]
    pub fn containing(granularity: Granularity, instant: DateTime<Utc>) -> Self {
        let day = match granularity {
            Granularity::Month => 1,
            Granularity::Hour => instant.day(),
        };
        let hour = match granularity {
            Granularity::Month => 0,
            Granularity::Hour => instant.hour(),
        };
        let start = utc(instant.year(), instant.month(), day, hour)
            .expect("components of a valid instant form a valid period start");
        Self { granularity, start }
    }

    /// Parse a period key (`YYYY-MM` for months, `YYYY-MM-DDTHH` for hours).
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidPeriod` if the key does not match the
    /// granularity's format.
    pub fn parse(granularity: Granularity, key: &str) -> Result<Self> {
        let invalid = || CoreError::InvalidPeriod(key.to_string());
        match granularity {
            Granularity::Month => {
                let (year, month) = key.trim().split_once('-').ok_or_else(invalid)?;
                let year = year.parse::<i32>().map_err(|_| invalid())?;
                let month = month.parse::<u32>().map_err(|_| invalid())?;
                Self::month(year, month)
            }
            Granularity::Hour => {
                let padded = format!("{}:00", key.trim());
                let naive = NaiveDateTime::parse_from_str(&padded, "%Y-%m-%dT%H:%M")
                    .map_err(|_| invalid())?;
                Self::hour(naive.year(), naive.month(), naive.day(), naive.hour())
            }
        }
    }

    /// The latest period whose data is complete according to a watermark.
    ///
    /// The period containing `watermark` counts as complete once the
    /// watermark has reached that period's final minute; otherwise the
    /// period before it is the latest complete one.
    #[must_use]
    pub fn latest_complete(granularity: Granularity, watermark: DateTime<Utc>) -> Self {
        let current = Self::containing(granularity, watermark);
        let final_minute = current.next().start - TimeDelta::minutes(1);
        if watermark >= final_minute {
            current
        } else {
            current.prev()
        }
    }

    /// The granularity of this period.
    #[must_use]
    pub const fn granularity(&self) -> Granularity {
        self.granularity
    }

    /// The first instant of the period.
    #[must_use]
    pub const fn start(&self) -> DateTime<Utc> {
        self.start
    }

    /// The last whole second of the period (inclusive end).
    #[must_use]
    pub fn end(&self) -> DateTime<Utc> {
        self.next().start - TimeDelta::seconds(1)
    }

    /// The following period.
    ///
    /// # Panics
    ///
    /// Panics if the successor is past chrono's maximum date.
    #[must_use]
    pub fn next(&self) -> Self {
        let start = match self.granularity {
            Granularity::Month => {
                let (year, month) = if self.start.month() == 12 {
                    (self.start.year() + 1, 1)
                } else {
                    (self.start.year(), self.start.month() + 1)
                };
                utc(year, month, 1, 0).expect("successor month is representable")
            }
            Granularity::Hour => self.start + TimeDelta::hours(1),
        };
        Self {
            granularity: self.granularity,
            start,
        }
    }

    /// The preceding period.
    ///
    /// # Panics
    ///
    /// Panics if the predecessor is before chrono's minimum date.
    #[must_use]
    pub fn prev(&self) -> Self {
        let start = match self.granularity {
            Granularity::Month => {
                let (year, month) = if self.start.month() == 1 {
                    (self.start.year() - 1, 12)
                } else {
                    (self.start.year(), self.start.month() - 1)
                };
                utc(year, month, 1, 0).expect("predecessor month is representable")
            }
            Granularity::Hour => self.start - TimeDelta::hours(1),
        };
        Self {
            granularity: self.granularity,
            start,
        }
    }

    /// The key used in ledger documents.
    #[must_use]
    pub fn key(&self) -> String {
        match self.granularity {
            Granularity::Month => self.start.format("%Y-%m").to_string(),
            Granularity::Hour => self.start.format("%Y-%m-%dT%H").to_string(),
        }
    }

    /// Path suffix of the storage partition holding this period's usage files.
    #[must_use]
    pub fn partition_prefix(&self) -> String {
        match self.granularity {
            Granularity::Month => self.start.format("%Y/%m/").to_string(),
            Granularity::Hour => self.start.format("%Y/%m/%d/%H/").to_string(),
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

fn utc(year: i32, month: u32, day: u32, hour: u32) -> Option<DateTime<Utc>> {
    NaiveDate::from_ymd_opt(year, month, day)?
        .and_hms_opt(hour, 0, 0)
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, s).unwrap()
    }

    #[test]
    fn month_key() {
        assert_eq!(Period::month(2025, 1).unwrap().key(), "2025-01");
        assert_eq!(Period::month(2025, 12).unwrap().key(), "2025-12");
    }

    #[test]
    fn month_rejects_out_of_range() {
        assert!(Period::month(2025, 0).is_err());
        assert!(Period::month(2025, 13).is_err());
    }

    #[test]
    fn month_successor_wraps_year() {
        let dec = Period::month(2024, 12).unwrap();
        assert_eq!(dec.next(), Period::month(2025, 1).unwrap());
        assert_eq!(dec.next().prev(), dec);
    }

    #[test]
    fn month_end_is_last_second() {
        let feb = Period::month(2024, 2).unwrap();
        assert_eq!(feb.start(), at(2024, 2, 1, 0, 0, 0));
        assert_eq!(feb.end(), at(2024, 2, 29, 23, 59, 59));
    }

    #[test]
    fn hour_successor_crosses_day() {
        let last = Period::hour(2025, 1, 31, 23).unwrap();
        assert_eq!(last.next(), Period::hour(2025, 2, 1, 0).unwrap());
        assert_eq!(last.key(), "2025-01-31T23");
        assert_eq!(last.end(), at(2025, 1, 31, 23, 59, 59));
    }

    #[test]
    fn parse_round_trips_keys() {
        let month = Period::parse(Granularity::Month, "2025-07").unwrap();
        assert_eq!(month, Period::month(2025, 7).unwrap());

        let hour = Period::parse(Granularity::Hour, "2025-07-04T13").unwrap();
        assert_eq!(hour, Period::hour(2025, 7, 4, 13).unwrap());

        assert!(Period::parse(Granularity::Month, "2025").is_err());
        assert!(Period::parse(Granularity::Month, "2025-xx").is_err());
        assert!(Period::parse(Granularity::Hour, "2025-07-04").is_err());
    }

    #[test]
    fn ordering_follows_time() {
        let jan = Period::month(2025, 1).unwrap();
        let dec = Period::month(2024, 12).unwrap();
        assert!(dec < jan);
        assert!(jan < jan.next());
    }

    #[test]
    fn latest_complete_at_month_end() {
        let watermark = at(2025, 1, 31, 23, 59, 0);
        assert_eq!(
            Period::latest_complete(Granularity::Month, watermark),
            Period::month(2025, 1).unwrap()
        );
    }

    #[test]
    fn latest_complete_mid_month_is_previous() {
        let watermark = at(2025, 1, 15, 10, 0, 0);
        assert_eq!(
            Period::latest_complete(Granularity::Month, watermark),
            Period::month(2024, 12).unwrap()
        );
    }

    #[test]
    fn latest_complete_last_day_before_final_minute() {
        let watermark = at(2025, 3, 31, 12, 59, 59);
        assert_eq!(
            Period::latest_complete(Granularity::Month, watermark),
            Period::month(2025, 2).unwrap()
        );
    }

    #[test]
    fn latest_complete_hourly() {
        assert_eq!(
            Period::latest_complete(Granularity::Hour, at(2025, 1, 1, 5, 59, 0)),
            Period::hour(2025, 1, 1, 5).unwrap()
        );
        assert_eq!(
            Period::latest_complete(Granularity::Hour, at(2025, 1, 1, 0, 30, 0)),
            Period::hour(2024, 12, 31, 23).unwrap()
        );
    }

    #[test]
    fn granularity_from_str() {
        assert_eq!("month".parse::<Granularity>().unwrap(), Granularity::Month);
        assert_eq!("Hourly".parse::<Granularity>().unwrap(), Granularity::Hour);
        assert!("weekly".parse::<Granularity>().is_err());
    }
}
