use std::{collections::BTreeSet, sync::Arc};

use chrono::NaiveDate;
use futures::{stream, StreamExt};
use serde::Serialize;
use shared::{
    fetcher::{ContributionFetcher, FetchError},
    DayRange, Provider, UserIdentity,
};
use tracing::{info, instrument, warn};

use crate::{
    error::{ProviderError, RefreshError},
    store::ContributionStore,
};

pub const DEFAULT_CONCURRENCY: usize = 4;
pub const MAX_CONCURRENCY: usize = 8;
pub const MAX_RANGE_DAYS: u32 = 365;

pub fn clamp_concurrency(requested: Option<usize>) -> usize {
    requested
        .unwrap_or(DEFAULT_CONCURRENCY)
        .clamp(1, MAX_CONCURRENCY)
}

#[derive(Debug, Clone)]
pub struct RefreshRequest {
    pub identity: UserIdentity,
    pub range: DayRange,
    pub concurrency: usize,
}

impl RefreshRequest {
    pub fn new(identity: UserIdentity, range: DayRange, concurrency: Option<usize>) -> Self {
        Self {
            identity,
            range,
            concurrency: clamp_concurrency(concurrency),
        }
    }

    /// Rejects requests that could not do anything useful.
    pub fn validate(&self) -> Result<(), RefreshError> {
        if self.identity.user_id.trim().is_empty() {
            return Err(RefreshError::usage("userId is required"));
        }
        if !self.identity.has_any_login() {
            return Err(RefreshError::usage(
                "at least one of githubLogin or gitlabUsername is required",
            ));
        }
        if self.range.len() > MAX_RANGE_DAYS {
            return Err(RefreshError::usage(format!(
                "range {} spans {} days, at most {MAX_RANGE_DAYS} are allowed",
                self.range,
                self.range.len()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRefresh {
    #[schema(value_type = String)]
    pub provider: Provider,
    pub days_written: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshOutcome {
    /// Distinct days written for any provider.
    pub days_refreshed: usize,
    /// Providers that were fetched, whether or not every day succeeded.
    pub providers: Vec<Provider>,
    pub skipped: Vec<ProviderError>,
    pub errors: Vec<ProviderError>,
    pub per_provider: Vec<ProviderRefresh>,
}

/// Sole writer of day buckets.
pub struct Refresher {
    fetchers: Vec<Arc<dyn ContributionFetcher>>,
    store: Arc<dyn ContributionStore>,
}

impl Refresher {
    pub fn new(
        fetchers: Vec<Arc<dyn ContributionFetcher>>,
        store: Arc<dyn ContributionStore>,
    ) -> Self {
        Self { fetchers, store }
    }

    fn fetcher(&self, provider: Provider) -> Option<&Arc<dyn ContributionFetcher>> {
        self.fetchers.iter().find(|f| f.provider() == provider)
    }

    /// Fetches each day of the range as its own bucket and upserts whatever
    /// came back. Provider failures are collected, store failures abort.
    #[instrument(skip(self, request), fields(user = %request.identity.user_id, range = %request.range))]
    pub async fn refresh(&self, request: &RefreshRequest) -> Result<RefreshOutcome, RefreshError> {
        request.validate()?;

        let mut outcome = RefreshOutcome::default();
        let mut written_days = BTreeSet::new();

        for provider in request.identity.providers() {
            let Some(fetcher) = self.fetcher(provider) else {
                outcome.skipped.push(ProviderError {
                    provider,
                    message: format!("no {provider} fetcher configured"),
                });
                continue;
            };

            let (days, failure) = self.fetch_provider(fetcher.clone(), request).await;
            match failure {
                Some(error) if error.is_skip() && days.is_empty() => {
                    info!("Skipping {provider}: {error}");
                    outcome.skipped.push(ProviderError::from(&error));
                    continue;
                }
                Some(error) => {
                    warn!("{provider} refresh incomplete: {error}");
                    outcome.errors.push(ProviderError::from(&error));
                }
                None => {}
            }

            outcome.providers.push(provider);
            let written = if days.is_empty() {
                0
            } else {
                self.store
                    .upsert_days(&request.identity.user_id, provider, &days)
                    .await?
            };
            written_days.extend(days.iter().map(|(day, _)| *day));
            outcome.per_provider.push(ProviderRefresh {
                provider,
                days_written: written,
            });
        }

        outcome.days_refreshed = written_days.len();
        info!(
            "Refreshed {} days for {:?} ({} errors)",
            outcome.days_refreshed,
            outcome.providers,
            outcome.errors.len()
        );
        Ok(outcome)
    }

    /// Returns every day that was fetched successfully, and the first failure.
    async fn fetch_provider(
        &self,
        fetcher: Arc<dyn ContributionFetcher>,
        request: &RefreshRequest,
    ) -> (Vec<(NaiveDate, u32)>, Option<FetchError>) {
        let identity = Arc::new(request.identity.clone());
        let results: Vec<_> = stream::iter(request.range.days())
            .map(move |day| {
                let fetcher = fetcher.clone();
                let identity = identity.clone();
                async move {
                    fetcher
                        .fetch_daily_counts(&identity, DayRange::single(day))
                        .await
                }
            })
            .buffer_unordered(request.concurrency)
            .collect()
            .await;

        let mut days = Vec::new();
        let mut failure = None;
        for result in results {
            match result {
                Ok(counts) => days.extend(
                    counts
                        .into_iter()
                        .filter(|(day, _)| request.range.contains(*day)),
                ),
                Err(error) => {
                    failure.get_or_insert(error);
                }
            }
        }
        days.sort_unstable();
        days.dedup_by_key(|(day, _)| *day);
        (days, failure)
    }
}
