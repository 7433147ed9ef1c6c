use std::ops::Add;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::{Provider, ProviderSelector, Window};

/// Rolling-window sums for one user and provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContributionTotals {
    pub all_time: u64,
    pub last_30d: u64,
    pub last_365d: u64,
}

impl ContributionTotals {
    /// Recomputes every window from scratch out of the day buckets.
    pub fn from_days<I>(days: I, today: NaiveDate) -> Self
    where
        I: IntoIterator<Item = (NaiveDate, u32)>,
    {
        days.into_iter()
            .fold(Self::default(), |mut totals, (day, count)| {
                let count = count as u64;
                totals.all_time += count;
                if Window::Last30Days.contains(day, today) {
                    totals.last_30d += count;
                }
                if Window::Last365Days.contains(day, today) {
                    totals.last_365d += count;
                }
                totals
            })
    }

    pub fn get(&self, window: Window) -> u64 {
        match window {
            Window::AllTime => self.all_time,
            Window::Last30Days => self.last_30d,
            Window::Last365Days => self.last_365d,
        }
    }
}

impl Add for ContributionTotals {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self {
            all_time: self.all_time + rhs.all_time,
            last_30d: self.last_30d + rhs.last_30d,
            last_365d: self.last_365d + rhs.last_365d,
        }
    }
}

/// Every provider's totals for one user. A missing provider counts as zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UserTotals {
    pub github: Option<ContributionTotals>,
    pub gitlab: Option<ContributionTotals>,
}

impl UserTotals {
    pub fn get(&self, provider: Provider) -> Option<ContributionTotals> {
        match provider {
            Provider::Github => self.github,
            Provider::Gitlab => self.gitlab,
        }
    }

    pub fn set(&mut self, provider: Provider, totals: ContributionTotals) {
        match provider {
            Provider::Github => self.github = Some(totals),
            Provider::Gitlab => self.gitlab = Some(totals),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.github.is_none() && self.gitlab.is_none()
    }

    pub fn combined(&self) -> ContributionTotals {
        self.github.unwrap_or_default() + self.gitlab.unwrap_or_default()
    }

    pub fn score(&self, window: Window, selector: ProviderSelector) -> u64 {
        selector
            .providers()
            .into_iter()
            .map(|provider| self.get(provider).unwrap_or_default().get(window))
            .sum()
    }
}

impl FromIterator<(Provider, ContributionTotals)> for UserTotals {
    fn from_iter<T: IntoIterator<Item = (Provider, ContributionTotals)>>(iter: T) -> Self {
        let mut result = Self::default();
        for (provider, totals) in iter {
            result.set(provider, totals);
        }
        result
    }
}
