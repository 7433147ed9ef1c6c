use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{Days, NaiveDate, Utc};
use tokio::{sync::OnceCell, time::Instant};
use tracing::{debug, instrument};

use crate::{
    fetcher::{
        classify_status, with_retry, AttemptError, ContributionFetcher, DailyCounts, FetchError,
        RetryPolicy,
    },
    DayRange, Provider, UserIdentity,
};

pub const DEFAULT_GITLAB_URL: &str = "https://gitlab.com";

// GitLab only publishes the trailing year of the activity calendar
const CALENDAR_SPAN_DAYS: u64 = 365;

/// How long a downloaded calendar answers further day buckets. Covers one
/// refresh cycle, which fetches the same calendar once per day.
pub const CALENDAR_CACHE_TTL: Duration = Duration::from_secs(60);

pub type Calendar = HashMap<String, u32>;

struct CachedCalendar {
    fetched_at: Instant,
    calendar: Arc<OnceCell<Arc<Calendar>>>,
}

/// Short-lived per-username calendar cache. Concurrent lookups for the same
/// user share a single download; failed downloads are not cached.
pub struct CalendarCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, CachedCalendar>>,
}

impl CalendarCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::default(),
        }
    }

    fn slot(&self, username: &str) -> Arc<OnceCell<Arc<Calendar>>> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|_, cached| now.duration_since(cached.fetched_at) < self.ttl);
        entries
            .entry(username.to_string())
            .or_insert_with(|| CachedCalendar {
                fetched_at: now,
                calendar: Arc::new(OnceCell::new()),
            })
            .calendar
            .clone()
    }

    pub async fn get_or_fetch<E, F, Fut>(&self, username: &str, fetch: F) -> Result<Arc<Calendar>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Calendar, E>>,
    {
        let slot = self.slot(username);
        let calendar = slot
            .get_or_try_init(move || async move {
                debug!("Downloading GitLab calendar of {username}");
                fetch().await.map(Arc::new)
            })
            .await?;
        Ok(calendar.clone())
    }
}

/// Reads the public GitLab activity calendar (`/users/<name>/calendar.json`).
///
/// Works without a token; when one is configured it is sent as
/// `PRIVATE-TOKEN` so private activity of the token owner is included.
pub struct GitlabFetcher {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    retry: RetryPolicy,
    cache: CalendarCache,
}

impl GitlabFetcher {
    pub fn new(base_url: Option<String>, token: Option<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .user_agent(concat!("contribution-leaderboard/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_GITLAB_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            token: token.filter(|token| !token.trim().is_empty()),
            retry: RetryPolicy::default(),
            cache: CalendarCache::new(CALENDAR_CACHE_TTL),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn calendar(&self, username: &str) -> Result<Calendar, AttemptError> {
        let url = format!("{}/users/{}/calendar.json", self.base_url, username);
        let mut request = self.client.get(&url);
        if let Some(token) = &self.token {
            request = request.header("PRIVATE-TOKEN", token);
        }

        let response = request.send().await.map_err(classify_reqwest)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), body));
        }

        response
            .json::<Calendar>()
            .await
            .map_err(|e| AttemptError::Permanent(format!("Malformed calendar for {username}: {e}")))
    }
}

fn classify_reqwest(error: reqwest::Error) -> AttemptError {
    if error.is_timeout() || error.is_connect() || error.is_request() {
        AttemptError::Transient(error.to_string())
    } else {
        AttemptError::Permanent(error.to_string())
    }
}

/// Picks the requested days out of a calendar. Days the calendar covers but
/// omits had no activity; days older than the calendar span are left out
/// entirely since nothing is known about them.
pub fn counts_in_range(
    calendar: &Calendar,
    range: DayRange,
    today: NaiveDate,
) -> DailyCounts {
    let coverage_start = today
        .checked_sub_days(Days::new(CALENDAR_SPAN_DAYS))
        .unwrap_or(NaiveDate::MIN);
    range
        .days()
        .filter(|day| *day >= coverage_start && *day <= today)
        .map(|day| {
            let count = calendar
                .get(&day.format("%Y-%m-%d").to_string())
                .copied()
                .unwrap_or_default();
            (day, count)
        })
        .collect()
}

#[async_trait]
impl ContributionFetcher for GitlabFetcher {
    fn provider(&self) -> Provider {
        Provider::Gitlab
    }

    #[instrument(skip(self, identity), fields(user = %identity.user_id))]
    async fn fetch_daily_counts(
        &self,
        identity: &UserIdentity,
        range: DayRange,
    ) -> Result<DailyCounts, FetchError> {
        let Some(username) = identity.login(Provider::Gitlab) else {
            return Err(FetchError::Skipped {
                provider: Provider::Gitlab,
                reason: "no GitLab username linked".to_string(),
            });
        };

        let calendar = self
            .cache
            .get_or_fetch(username, || {
                with_retry(Provider::Gitlab, self.retry, move || self.calendar(username))
            })
            .await?;
        Ok(counts_in_range(&calendar, range, Utc::now().date_naive()))
    }
}
