use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use shared::{fetcher::ContributionFetcher, DayRange, LockKey, Provider, UserIdentity, UserTotals};
use tracing::{info, instrument, warn};

use crate::{
    aggregator::Aggregator,
    error::{ProviderError, RefreshError},
    leaderboard::Synchronizer,
    lock::{ttl_for_days, LockBackend, LockManager, REFRESH_TTL},
    ranking::RankingStore,
    refresher::{ProviderRefresh, RefreshOutcome, RefreshRequest, Refresher, MAX_RANGE_DAYS},
    store::{ContributionStore, KnownUsers},
};

pub const DEFAULT_BACKFILL_DAYS: u32 = 365;

/// What triggered a cycle. Decides the lock keys and their TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum CycleKind {
    RefreshDay,
    Backfill,
    Scheduled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
enum CycleState {
    Idle,
    Fetching,
    Aggregating,
    Syncing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub user_id: String,
    pub range: DayRange,
    pub concurrency: usize,
    pub providers: Vec<Provider>,
    pub days_refreshed: usize,
    pub per_provider: Vec<ProviderRefresh>,
    pub errors: Vec<ProviderError>,
    pub skipped: Vec<ProviderError>,
    pub totals: UserTotals,
    /// False when the ranking index could not be updated; the next sync or a
    /// rebuild repairs it.
    pub index_synced: bool,
}

impl CycleKind {
    /// Keys for every provider the identity links: the key naming this kind
    /// of cycle plus the provider's write key, which any other cycle for the
    /// same user and provider also needs.
    pub fn lock_keys(&self, identity: &UserIdentity, range: DayRange) -> Vec<LockKey> {
        let user_id = &identity.user_id;
        identity
            .providers()
            .into_iter()
            .flat_map(|provider| {
                let own = match self {
                    CycleKind::Backfill => LockKey::backfill(provider, user_id.clone()),
                    CycleKind::RefreshDay | CycleKind::Scheduled => {
                        LockKey::day_range(provider, user_id.clone(), range)
                    }
                };
                [own, LockKey::write(provider, user_id.clone())]
            })
            .collect()
    }

    pub fn ttl(&self, range: DayRange) -> std::time::Duration {
        match self {
            CycleKind::Backfill => ttl_for_days(range.len()),
            CycleKind::RefreshDay | CycleKind::Scheduled => REFRESH_TTL,
        }
    }
}

/// One user's write path: lock, fetch, aggregate, sync, unlock.
pub struct Engine {
    locks: LockManager,
    refresher: Refresher,
    aggregator: Aggregator,
    synchronizer: Synchronizer,
    known: Arc<dyn KnownUsers>,
}

impl Engine {
    pub fn new(
        fetchers: Vec<Arc<dyn ContributionFetcher>>,
        store: Arc<dyn ContributionStore>,
        known: Arc<dyn KnownUsers>,
        ranking: Arc<dyn RankingStore>,
        locks: Arc<dyn LockBackend>,
    ) -> Self {
        Self {
            locks: LockManager::new(locks),
            refresher: Refresher::new(fetchers, store.clone()),
            aggregator: Aggregator::new(store.clone()),
            synchronizer: Synchronizer::new(store, ranking),
            known,
        }
    }

    pub fn known(&self) -> &Arc<dyn KnownUsers> {
        &self.known
    }

    pub fn synchronizer(&self) -> &Synchronizer {
        &self.synchronizer
    }

    /// Fills in stored logins when the caller only names the user.
    async fn resolve(&self, identity: UserIdentity) -> Result<UserIdentity, RefreshError> {
        if identity.has_any_login() || identity.user_id.trim().is_empty() {
            return Ok(identity);
        }
        Ok(match self.known.identity(&identity.user_id).await? {
            Some(stored) => identity.merged_with(&stored),
            None => identity,
        })
    }

    /// Refreshes a short range, `yesterday..today` unless given.
    pub async fn refresh_day(
        &self,
        identity: UserIdentity,
        range: Option<DayRange>,
        concurrency: Option<usize>,
        today: NaiveDate,
    ) -> Result<CycleReport, RefreshError> {
        let range = match range {
            Some(range) => range,
            None => DayRange::yesterday_to_today(today)?,
        };
        let request = RefreshRequest::new(self.resolve(identity).await?, range, concurrency);
        request.validate()?;
        self.known.remember(&request.identity).await?;
        self.run(CycleKind::RefreshDay, &request, today).await
    }

    /// Refreshes the trailing `days` days ending today.
    pub async fn backfill(
        &self,
        identity: UserIdentity,
        days: Option<u32>,
        concurrency: Option<usize>,
        today: NaiveDate,
    ) -> Result<CycleReport, RefreshError> {
        let days = days.unwrap_or(DEFAULT_BACKFILL_DAYS);
        if !(1..=MAX_RANGE_DAYS).contains(&days) {
            return Err(RefreshError::usage(format!(
                "days must be between 1 and {MAX_RANGE_DAYS}, got {days}"
            )));
        }
        let range = DayRange::trailing(days, today)?;
        let request = RefreshRequest::new(self.resolve(identity).await?, range, concurrency);
        request.validate()?;
        self.known.remember(&request.identity).await?;
        self.run(CycleKind::Backfill, &request, today).await
    }

    /// Runs the full cycle while holding the provider locks. Fails fast with
    /// a conflict when any of them is taken.
    #[instrument(skip(self, request), fields(user = %request.identity.user_id, range = %request.range))]
    pub async fn run(
        &self,
        kind: CycleKind,
        request: &RefreshRequest,
        today: NaiveDate,
    ) -> Result<CycleReport, RefreshError> {
        request.validate()?;
        let keys = kind.lock_keys(&request.identity, request.range);
        self.locks
            .with_locks(&keys, kind.ttl(request.range), || {
                self.cycle(kind, request, today)
            })
            .await
    }

    async fn cycle(
        &self,
        kind: CycleKind,
        request: &RefreshRequest,
        today: NaiveDate,
    ) -> Result<CycleReport, RefreshError> {
        let user_id = request.identity.user_id.as_str();

        transition(kind, user_id, CycleState::Idle, CycleState::Fetching);
        let RefreshOutcome {
            days_refreshed,
            providers,
            skipped,
            errors,
            per_provider,
        } = self.refresher.refresh(request).await?;

        transition(kind, user_id, CycleState::Fetching, CycleState::Aggregating);
        let totals = self.aggregator.recompute(user_id, today).await?;

        transition(kind, user_id, CycleState::Aggregating, CycleState::Syncing);
        let index_synced = match self.synchronizer.sync(user_id).await {
            Ok(_) => true,
            Err(e) => {
                warn!("Ranking index left stale for {user_id}: {e:#}");
                false
            }
        };

        transition(kind, user_id, CycleState::Syncing, CycleState::Idle);
        Ok(CycleReport {
            user_id: user_id.to_string(),
            range: request.range,
            concurrency: request.concurrency,
            providers,
            days_refreshed,
            per_provider,
            errors,
            skipped,
            totals,
            index_synced,
        })
    }
}

fn transition(kind: CycleKind, user_id: &str, from: CycleState, to: CycleState) {
    info!("{kind} {user_id}: {from} -> {to}");
}

#[cfg(test)]
mod tests {
    use shared::{ProviderSelector, Window};

    use super::*;
    use crate::test_utils::{date, FetchBehavior, TestEngine};

    fn both() -> UserIdentity {
        UserIdentity::new("u1").with_github("octo").with_gitlab("lab")
    }

    #[test]
    fn backfill_and_refresh_keys_differ() {
        let range = DayRange::new(date(1), date(2)).unwrap();
        let refresh = CycleKind::RefreshDay.lock_keys(&both(), range);
        let backfill = CycleKind::Backfill.lock_keys(&both(), range);
        assert_eq!(refresh.len(), 4);
        assert_eq!(
            refresh[0].canonical(),
            "lock:refresh-day:github:u1:2024-06-01:2024-06-02"
        );
        assert_eq!(refresh[1].canonical(), "lock:write:github:u1");
        assert_eq!(backfill[2].canonical(), "lock:backfill:gitlab:u1");
        assert_eq!(backfill[3], refresh[3]);
        assert_eq!(CycleKind::Backfill.ttl(range), ttl_for_days(2));
    }

    #[tokio::test]
    async fn running_backfill_blocks_refresh_day() {
        let test = TestEngine::new(FetchBehavior::Counts(|_| 1), FetchBehavior::Counts(|_| 1));
        let backfill = DayRange::trailing(DEFAULT_BACKFILL_DAYS, date(10)).unwrap();
        let held = test
            .locks
            .acquire_all(
                &CycleKind::Backfill.lock_keys(&both(), backfill),
                ttl_for_days(DEFAULT_BACKFILL_DAYS),
            )
            .await
            .unwrap();

        let result = test.engine.refresh_day(both(), None, None, date(10)).await;
        match result {
            Err(RefreshError::Conflict(conflict)) => {
                assert_eq!(conflict.key, "lock:write:github:u1");
                assert_eq!(conflict.provider, Provider::Github);
            }
            other => panic!("expected a conflict, got {other:?}"),
        }
        assert!(test.store.snapshot().days.is_empty());

        for guard in held {
            guard.release().await;
        }
        assert!(test
            .engine
            .refresh_day(both(), None, None, date(10))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn enclosing_range_blocks_inner_refresh() {
        let test = TestEngine::new(FetchBehavior::Counts(|_| 1), FetchBehavior::Counts(|_| 1));
        let outer = DayRange::new(date(1), date(10)).unwrap();
        let held = test
            .locks
            .acquire_all(&CycleKind::RefreshDay.lock_keys(&both(), outer), REFRESH_TTL)
            .await
            .unwrap();

        let inner = DayRange::new(date(9), date(10)).unwrap();
        let result = test
            .engine
            .refresh_day(both(), Some(inner), None, date(10))
            .await;
        assert!(matches!(result, Err(RefreshError::Conflict(_))));

        for guard in held {
            guard.release().await;
        }
    }

    #[tokio::test]
    async fn full_cycle_updates_every_layer() {
        let test = TestEngine::new(FetchBehavior::Counts(|_| 2), FetchBehavior::Counts(|_| 1));
        let report = test
            .engine
            .backfill(both(), Some(3), None, date(10))
            .await
            .unwrap();

        assert_eq!(report.days_refreshed, 3);
        assert_eq!(report.providers, vec![Provider::Github, Provider::Gitlab]);
        assert!(report.index_synced);
        assert_eq!(
            report.totals.score(Window::Last30Days, ProviderSelector::Combined),
            9
        );
        let board = crate::ranking::Board::new(Window::AllTime, ProviderSelector::Combined);
        assert_eq!(test.ranking.snapshot()[&board]["u1"], 9);
        assert!(test.store.snapshot().known.contains_key("u1"));
    }

    #[tokio::test]
    async fn partial_failure_then_retry() {
        let failing = TestEngine::new(FetchBehavior::Fail, FetchBehavior::Counts(|_| 1));
        let report = failing
            .engine
            .refresh_day(both(), None, None, date(10))
            .await
            .unwrap();
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].provider, Provider::Github);
        assert_eq!(report.totals.github, None);
        assert_eq!(report.totals.gitlab.map(|t| t.all_time), Some(2));
        let gitlab_days = failing.store.snapshot().days;

        // Same stores, github back online
        let healthy =
            failing.with_behaviors(FetchBehavior::Counts(|_| 4), FetchBehavior::Counts(|_| 1));
        let report = healthy
            .engine
            .refresh_day(both(), None, None, date(10))
            .await
            .unwrap();
        assert!(report.errors.is_empty());
        assert_eq!(report.totals.github.map(|t| t.all_time), Some(8));
        assert_eq!(report.totals.gitlab.map(|t| t.all_time), Some(2));
        let days = healthy.store.snapshot().days;
        assert_eq!(
            days[&("u1".to_string(), Provider::Gitlab)],
            gitlab_days[&("u1".to_string(), Provider::Gitlab)]
        );
    }

    #[tokio::test]
    async fn usage_errors_leave_no_trace() {
        let test = TestEngine::new(FetchBehavior::Counts(|_| 1), FetchBehavior::Counts(|_| 1));
        let result = test
            .engine
            .refresh_day(UserIdentity::new("u1"), None, None, date(10))
            .await;
        assert!(matches!(result, Err(RefreshError::Usage(_))));
        let result = test.engine.backfill(both(), Some(0), None, date(10)).await;
        assert!(matches!(result, Err(RefreshError::Usage(_))));
        let result = test.engine.backfill(both(), Some(366), None, date(10)).await;
        assert!(matches!(result, Err(RefreshError::Usage(_))));
        assert_eq!(test.store.snapshot(), Default::default());
    }

    #[tokio::test]
    async fn known_user_can_be_refreshed_by_id() {
        let test = TestEngine::new(FetchBehavior::Counts(|_| 1), FetchBehavior::Counts(|_| 3));
        test.engine
            .known()
            .remember(&UserIdentity::new("u1").with_gitlab("lab"))
            .await
            .unwrap();
        let report = test
            .engine
            .refresh_day(UserIdentity::new("u1"), None, None, date(10))
            .await
            .unwrap();
        assert_eq!(report.providers, vec![Provider::Gitlab]);
        assert_eq!(report.totals.gitlab.map(|t| t.all_time), Some(6));
    }

    #[tokio::test]
    async fn index_failure_does_not_fail_the_cycle() {
        let test = TestEngine::new(FetchBehavior::Counts(|_| 1), FetchBehavior::Counts(|_| 1));
        test.ranking.set_unavailable(true);
        let report = test
            .engine
            .refresh_day(both(), None, None, date(10))
            .await
            .unwrap();
        assert!(!report.index_synced);

        test.ranking.set_unavailable(false);
        test.engine.synchronizer().rebuild().await.unwrap();
        let board = crate::ranking::Board::new(Window::AllTime, ProviderSelector::Combined);
        assert_eq!(test.ranking.snapshot()[&board]["u1"], 4);
    }
}
