use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};

/// Trailing time range over which contribution counts are summed.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    EnumIter,
    EnumString,
    Display,
    AsRefStr,
)]
pub enum Window {
    #[serde(rename = "all")]
    #[strum(to_string = "all", serialize = "all-time")]
    AllTime,
    #[serde(rename = "30d")]
    #[strum(serialize = "30d")]
    Last30Days,
    #[serde(rename = "365d")]
    #[strum(serialize = "365d")]
    Last365Days,
}

impl Window {
    pub fn days(&self) -> Option<u64> {
        match self {
            Window::AllTime => None,
            Window::Last30Days => Some(30),
            Window::Last365Days => Some(365),
        }
    }

    /// First day (inclusive) covered by the window when it ends at `today`.
    pub fn start_day(&self, today: NaiveDate) -> Option<NaiveDate> {
        let days = self.days()?;
        today.checked_sub_days(Days::new(days - 1))
    }

    /// Future-dated days only belong to the all-time window.
    pub fn contains(&self, day: NaiveDate, today: NaiveDate) -> bool {
        match self.start_day(today) {
            None => true,
            Some(start) => day >= start && day <= today,
        }
    }
}
