//! In-process backends, used when no Redis is configured and by the tests.

use std::{
    cmp::Reverse,
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, MutexGuard,
    },
    time::Duration,
};

use anyhow::bail;
use async_trait::async_trait;
use chrono::NaiveDate;
use itertools::Itertools;
use shared::{
    ContributionTotals, Provider, ProviderSelector, UserId, UserIdentity, UserTotals, Window,
};
use tokio::time::Instant;

use crate::{
    lock::LockBackend,
    ranking::{Board, RankingStore},
    store::{ContributionStore, KnownUsers, RankedUser},
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn rank(mut entries: Vec<RankedUser>) -> Vec<RankedUser> {
    entries.sort_by(|a, b| {
        (Reverse(a.score), &a.user_id).cmp(&(Reverse(b.score), &b.user_id))
    });
    entries
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct KnownUser {
    pub identity: UserIdentity,
    /// Sequence number of the last refresh, `None` if never refreshed.
    pub refreshed: Option<u64>,
}

/// Full copy of the relational state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemorySnapshot {
    pub days: BTreeMap<(UserId, Provider), BTreeMap<NaiveDate, u32>>,
    pub totals: BTreeMap<UserId, UserTotals>,
    pub known: BTreeMap<UserId, KnownUser>,
    refresh_seq: u64,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemorySnapshot>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn snapshot(&self) -> MemorySnapshot {
        lock(&self.state).clone()
    }

    /// Makes every subsequent write fail, to exercise error paths.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> anyhow::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("store is read-only");
        }
        Ok(())
    }

    fn ranked(&self, window: Window, selector: ProviderSelector) -> Vec<RankedUser> {
        let state = lock(&self.state);
        rank(
            state
                .totals
                .iter()
                .filter(|(_, totals)| !totals.is_empty())
                .map(|(user_id, totals)| {
                    RankedUser::new(user_id.clone(), totals.score(window, selector))
                })
                .collect(),
        )
    }
}

#[async_trait]
impl ContributionStore for MemoryStore {
    async fn upsert_days(
        &self,
        user_id: &str,
        provider: Provider,
        days: &[(NaiveDate, u32)],
    ) -> anyhow::Result<usize> {
        self.check_writable()?;
        let mut state = lock(&self.state);
        let stored = state
            .days
            .entry((user_id.to_string(), provider))
            .or_default();
        stored.extend(days.iter().copied());
        Ok(days.len())
    }

    async fn days(
        &self,
        user_id: &str,
        provider: Provider,
    ) -> anyhow::Result<Vec<(NaiveDate, u32)>> {
        let state = lock(&self.state);
        Ok(state
            .days
            .get(&(user_id.to_string(), provider))
            .map(|days| days.iter().map(|(day, count)| (*day, *count)).collect())
            .unwrap_or_default())
    }

    async fn providers_with_days(&self, user_id: &str) -> anyhow::Result<Vec<Provider>> {
        let state = lock(&self.state);
        Ok(state
            .days
            .iter()
            .filter(|((user, _), days)| user == user_id && !days.is_empty())
            .map(|((_, provider), _)| *provider)
            .collect())
    }

    async fn replace_totals(
        &self,
        user_id: &str,
        provider: Provider,
        totals: ContributionTotals,
    ) -> anyhow::Result<()> {
        self.check_writable()?;
        let mut state = lock(&self.state);
        state
            .totals
            .entry(user_id.to_string())
            .or_default()
            .set(provider, totals);
        Ok(())
    }

    async fn totals(&self, user_id: &str) -> anyhow::Result<UserTotals> {
        Ok(lock(&self.state)
            .totals
            .get(user_id)
            .copied()
            .unwrap_or_default())
    }

    async fn totals_for(&self, user_ids: &[UserId]) -> anyhow::Result<HashMap<UserId, UserTotals>> {
        let state = lock(&self.state);
        Ok(user_ids
            .iter()
            .filter_map(|user_id| {
                state
                    .totals
                    .get(user_id)
                    .map(|totals| (user_id.clone(), *totals))
            })
            .collect())
    }

    async fn scan_ranked(
        &self,
        window: Window,
        selector: ProviderSelector,
        offset: u64,
        limit: u64,
    ) -> anyhow::Result<Vec<RankedUser>> {
        Ok(self
            .ranked(window, selector)
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn place_of(
        &self,
        window: Window,
        selector: ProviderSelector,
        user_id: &str,
    ) -> anyhow::Result<Option<(u64, u64)>> {
        Ok(self
            .ranked(window, selector)
            .into_iter()
            .find_position(|entry| entry.user_id == user_id)
            .map(|(index, entry)| (index as u64 + 1, entry.score)))
    }

    async fn count_ranked(&self) -> anyhow::Result<u64> {
        let state = lock(&self.state);
        Ok(state.totals.values().filter(|t| !t.is_empty()).count() as u64)
    }

    async fn users_with_totals(&self) -> anyhow::Result<Vec<UserId>> {
        let state = lock(&self.state);
        Ok(state
            .totals
            .iter()
            .filter(|(_, totals)| !totals.is_empty())
            .map(|(user_id, _)| user_id.clone())
            .collect())
    }
}

#[async_trait]
impl KnownUsers for MemoryStore {
    async fn remember(&self, identity: &UserIdentity) -> anyhow::Result<UserIdentity> {
        self.check_writable()?;
        let mut state = lock(&self.state);
        let entry = state.known.entry(identity.user_id.clone()).or_default();
        entry.identity = identity.clone().merged_with(&entry.identity);
        Ok(entry.identity.clone())
    }

    async fn identity(&self, user_id: &str) -> anyhow::Result<Option<UserIdentity>> {
        Ok(lock(&self.state)
            .known
            .get(user_id)
            .map(|known| known.identity.clone()))
    }

    async fn identities(
        &self,
        user_ids: &[UserId],
    ) -> anyhow::Result<HashMap<UserId, UserIdentity>> {
        let state = lock(&self.state);
        Ok(user_ids
            .iter()
            .filter_map(|user_id| state.known.get(user_id))
            .map(|known| (known.identity.user_id.clone(), known.identity.clone()))
            .collect())
    }

    async fn list_known_users(&self, limit: u64) -> anyhow::Result<Vec<UserIdentity>> {
        let state = lock(&self.state);
        Ok(state
            .known
            .values()
            .sorted_by(|a, b| {
                (a.refreshed, &a.identity.user_id).cmp(&(b.refreshed, &b.identity.user_id))
            })
            .take(limit as usize)
            .map(|known| known.identity.clone())
            .collect())
    }

    async fn mark_refreshed(&self, user_id: &str) -> anyhow::Result<()> {
        self.check_writable()?;
        let mut state = lock(&self.state);
        state.refresh_seq += 1;
        let seq = state.refresh_seq;
        if let Some(known) = state.known.get_mut(user_id) {
            known.refreshed = Some(seq);
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryRanking {
    boards: Mutex<HashMap<Board, BTreeMap<UserId, u64>>>,
    unavailable: AtomicBool,
}

impl MemoryRanking {
    pub fn snapshot(&self) -> HashMap<Board, BTreeMap<UserId, u64>> {
        lock(&self.boards).clone()
    }

    /// Makes every call fail, as an unreachable index would.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> anyhow::Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            bail!("ranking index unavailable");
        }
        Ok(())
    }

    fn ranked(&self, board: Board) -> Vec<RankedUser> {
        let boards = lock(&self.boards);
        rank(
            boards
                .get(&board)
                .map(|entries| {
                    entries
                        .iter()
                        .map(|(user_id, score)| RankedUser::new(user_id.clone(), *score))
                        .collect()
                })
                .unwrap_or_default(),
        )
    }
}

#[async_trait]
impl RankingStore for MemoryRanking {
    async fn set_scores(&self, user_id: &str, scores: &[(Board, u64)]) -> anyhow::Result<()> {
        self.check_available()?;
        let mut boards = lock(&self.boards);
        for (board, score) in scores {
            boards
                .entry(*board)
                .or_default()
                .insert(user_id.to_string(), *score);
        }
        Ok(())
    }

    async fn remove(&self, user_id: &str, boards: &[Board]) -> anyhow::Result<()> {
        self.check_available()?;
        let mut stored = lock(&self.boards);
        for board in boards {
            if let Some(entries) = stored.get_mut(board) {
                entries.remove(user_id);
            }
        }
        Ok(())
    }

    async fn page(
        &self,
        board: Board,
        offset: u64,
        limit: u64,
    ) -> anyhow::Result<Vec<RankedUser>> {
        self.check_available()?;
        Ok(self
            .ranked(board)
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn place_of(&self, board: Board, user_id: &str) -> anyhow::Result<Option<(u64, u64)>> {
        self.check_available()?;
        Ok(self
            .ranked(board)
            .into_iter()
            .find_position(|entry| entry.user_id == user_id)
            .map(|(index, entry)| (index as u64 + 1, entry.score)))
    }

    async fn len(&self, board: Board) -> anyhow::Result<u64> {
        self.check_available()?;
        Ok(lock(&self.boards)
            .get(&board)
            .map(|entries| entries.len() as u64)
            .unwrap_or_default())
    }

    async fn clear(&self, boards: &[Board]) -> anyhow::Result<()> {
        self.check_available()?;
        let mut stored = lock(&self.boards);
        for board in boards {
            stored.remove(board);
        }
        Ok(())
    }
}

/// Locks that expire on the tokio clock, so paused-time tests can age them.
#[derive(Default)]
pub struct MemoryLocks {
    held: Mutex<HashMap<String, (String, Instant)>>,
}

#[async_trait]
impl LockBackend for MemoryLocks {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> anyhow::Result<bool> {
        let now = Instant::now();
        let mut held = lock(&self.held);
        if let Some((_, expires_at)) = held.get(key) {
            if *expires_at > now {
                return Ok(false);
            }
        }
        held.insert(key.to_string(), (token.to_string(), now + ttl));
        Ok(true)
    }

    async fn release(&self, key: &str, token: &str) -> anyhow::Result<()> {
        let mut held = lock(&self.held);
        if held.get(key).is_some_and(|(holder, _)| holder == token) {
            held.remove(key);
        }
        Ok(())
    }
}
