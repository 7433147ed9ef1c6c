use std::fmt;

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DayRangeError {
    #[error("range start {from} is after range end {to}")]
    Inverted { from: NaiveDate, to: NaiveDate },
    #[error("range must cover at least one day")]
    Empty,
    #[error("range falls outside of the supported calendar")]
    OutOfCalendar,
}

/// Inclusive range of UTC calendar days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DayRange {
    from: NaiveDate,
    to: NaiveDate,
}

impl DayRange {
    pub fn new(from: NaiveDate, to: NaiveDate) -> Result<Self, DayRangeError> {
        if from > to {
            return Err(DayRangeError::Inverted { from, to });
        }
        Ok(Self { from, to })
    }

    pub fn single(day: NaiveDate) -> Self {
        Self { from: day, to: day }
    }

    /// `days` trailing days ending at `today`, used by backfills.
    pub fn trailing(days: u32, today: NaiveDate) -> Result<Self, DayRangeError> {
        if days == 0 {
            return Err(DayRangeError::Empty);
        }
        let from = today
            .checked_sub_days(Days::new(days as u64 - 1))
            .ok_or(DayRangeError::OutOfCalendar)?;
        Self::new(from, today)
    }

    /// The short "yesterday to today" range refreshed by the daily cycle.
    pub fn yesterday_to_today(today: NaiveDate) -> Result<Self, DayRangeError> {
        Self::trailing(2, today)
    }

    pub fn from(&self) -> NaiveDate {
        self.from
    }

    pub fn to(&self) -> NaiveDate {
        self.to
    }

    pub fn len(&self) -> u32 {
        (self.to - self.from).num_days() as u32 + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        day >= self.from && day <= self.to
    }

    /// Individual day buckets, oldest first.
    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let to = self.to;
        self.from.iter_days().take_while(move |day| *day <= to)
    }
}

impl fmt::Display for DayRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.from, self.to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn splits_into_buckets() {
        let range = DayRange::new(date(2024, 2, 27), date(2024, 3, 2)).unwrap();
        let days: Vec<_> = range.days().collect();
        assert_eq!(days.len(), 5);
        assert_eq!(range.len(), 5);
        assert_eq!(days[2], date(2024, 2, 29));
        assert_eq!(days[4], date(2024, 3, 2));
    }

    #[test]
    fn trailing_ranges() {
        let today = date(2024, 1, 1);
        let range = DayRange::yesterday_to_today(today).unwrap();
        assert_eq!(range.from(), date(2023, 12, 31));
        assert_eq!(range.to(), today);
        assert_eq!(DayRange::trailing(365, today).unwrap().len(), 365);
        assert_eq!(DayRange::trailing(0, today), Err(DayRangeError::Empty));
    }

    #[test]
    fn rejects_inverted() {
        assert!(matches!(
            DayRange::new(date(2024, 1, 2), date(2024, 1, 1)),
            Err(DayRangeError::Inverted { .. })
        ));
        assert_eq!(
            DayRange::single(date(2024, 1, 1)).to_string(),
            "2024-01-01..2024-01-01"
        );
    }
}
