use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use async_trait::async_trait;
use chrono::NaiveDate;
use shared::{
    fetcher::{ContributionFetcher, DailyCounts, FetchError},
    DayRange, Provider, UserIdentity,
};

use crate::{
    lock::LockManager,
    memory::{MemoryLocks, MemoryRanking, MemoryStore},
    pipeline::Engine,
};

pub fn date(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 6, d).unwrap()
}

#[derive(Clone, Copy)]
pub enum FetchBehavior {
    Counts(fn(NaiveDate) -> u32),
    Fail,
    Skip,
}

pub struct FakeFetcher {
    provider: Provider,
    behavior: FetchBehavior,
    calls: Arc<AtomicUsize>,
}

impl FakeFetcher {
    pub fn new(provider: Provider, behavior: FetchBehavior) -> Arc<dyn ContributionFetcher> {
        Self::counted(provider, behavior).0
    }

    pub fn counted(
        provider: Provider,
        behavior: FetchBehavior,
    ) -> (Arc<dyn ContributionFetcher>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = Arc::new(FakeFetcher {
            provider,
            behavior,
            calls: calls.clone(),
        });
        (fetcher, calls)
    }
}

#[async_trait]
impl ContributionFetcher for FakeFetcher {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn fetch_daily_counts(
        &self,
        _identity: &UserIdentity,
        range: DayRange,
    ) -> Result<DailyCounts, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            FetchBehavior::Counts(count) => Ok(range.days().map(|day| (day, count(day))).collect()),
            FetchBehavior::Fail => Err(FetchError::Exhausted {
                provider: self.provider,
                attempts: 3,
                message: "HTTP 502: bad gateway".to_string(),
            }),
            FetchBehavior::Skip => Err(FetchError::Skipped {
                provider: self.provider,
                reason: "no token configured".to_string(),
            }),
        }
    }
}

/// An engine over in-memory stores, with handles to inspect them.
pub struct TestEngine {
    pub engine: Arc<Engine>,
    pub store: Arc<MemoryStore>,
    pub ranking: Arc<MemoryRanking>,
    pub locks: LockManager,
    lock_backend: Arc<MemoryLocks>,
}

impl TestEngine {
    pub fn new(github: FetchBehavior, gitlab: FetchBehavior) -> Self {
        Self::build(
            github,
            gitlab,
            Arc::new(MemoryStore::default()),
            Arc::new(MemoryRanking::default()),
            Arc::new(MemoryLocks::default()),
        )
    }

    /// New fetchers over the same stores and locks.
    pub fn with_behaviors(&self, github: FetchBehavior, gitlab: FetchBehavior) -> Self {
        Self::build(
            github,
            gitlab,
            self.store.clone(),
            self.ranking.clone(),
            self.lock_backend.clone(),
        )
    }

    fn build(
        github: FetchBehavior,
        gitlab: FetchBehavior,
        store: Arc<MemoryStore>,
        ranking: Arc<MemoryRanking>,
        lock_backend: Arc<MemoryLocks>,
    ) -> Self {
        let engine = Arc::new(Engine::new(
            vec![
                FakeFetcher::new(Provider::Github, github),
                FakeFetcher::new(Provider::Gitlab, gitlab),
            ],
            store.clone(),
            store.clone(),
            ranking.clone(),
            lock_backend.clone(),
        ));
        Self {
            engine,
            store,
            ranking,
            locks: LockManager::new(lock_backend.clone()),
            lock_backend,
        }
    }
}
