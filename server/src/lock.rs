use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use deadpool_redis::{redis, Pool as RedisPool};
use itertools::Itertools;
use rand::Rng;
use shared::LockKey;
use tracing::{debug, warn};

use crate::error::{ConflictError, LockError};

/// TTL for short "yesterday to today" refreshes.
pub const REFRESH_TTL: Duration = Duration::from_secs(180);

const MIN_BACKFILL_TTL_SECS: u64 = 120;
const MAX_BACKFILL_TTL_SECS: u64 = 900;
const SECS_PER_DAY_FETCHED: u64 = 2;

/// TTL long enough to cover a backfill of `days` days.
pub fn ttl_for_days(days: u32) -> Duration {
    let secs = (days as u64 * SECS_PER_DAY_FETCHED).clamp(MIN_BACKFILL_TTL_SECS, MAX_BACKFILL_TTL_SECS);
    Duration::from_secs(secs)
}

/// Storage for TTL-bound, token-owned locks. Acquisition never blocks.
#[async_trait]
pub trait LockBackend: Send + Sync {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> anyhow::Result<bool>;

    /// Deletes the lock only if `token` still holds it.
    async fn release(&self, key: &str, token: &str) -> anyhow::Result<()>;
}

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Compare-and-delete sent as a plain `EVAL`.
fn release_cmd(key: &str, token: &str) -> redis::Cmd {
    let mut cmd = redis::cmd("EVAL");
    cmd.arg(RELEASE_SCRIPT).arg(1).arg(key).arg(token);
    cmd
}

#[derive(Clone)]
pub struct RedisLocks {
    pool: RedisPool,
}

impl RedisLocks {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockBackend for RedisLocks {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> anyhow::Result<bool> {
        let mut conn = self.pool.get().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn release(&self, key: &str, token: &str) -> anyhow::Result<()> {
        let mut conn = self.pool.get().await?;
        let _: i64 = release_cmd(key, token).query_async(&mut conn).await?;
        Ok(())
    }
}

/// A held lock. Released explicitly with [`LockGuard::release`]; if the guard
/// is dropped instead (early return, cancellation, panic) the release is
/// spawned onto the runtime, and the TTL covers the case where even that
/// cannot run.
pub struct LockGuard {
    backend: Arc<dyn LockBackend>,
    key: String,
    token: String,
    released: bool,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn release(mut self) {
        self.released = true;
        if let Err(e) = self.backend.release(&self.key, &self.token).await {
            warn!("Failed to release lock {}: {e:#}", self.key);
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let backend = self.backend.clone();
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = backend.release(&key, &token).await {
                        warn!("Failed to release abandoned lock {key}: {e:#}");
                    }
                });
            }
            Err(_) => warn!("Lock {key} dropped outside of a runtime, leaving it to expire"),
        }
    }
}

#[derive(Clone)]
pub struct LockManager {
    backend: Arc<dyn LockBackend>,
}

impl LockManager {
    pub fn new(backend: Arc<dyn LockBackend>) -> Self {
        Self { backend }
    }

    fn new_token() -> String {
        format!("{:032x}", rand::thread_rng().gen::<u128>())
    }

    /// `None` when the key is already held and unexpired.
    pub async fn acquire(&self, key: &LockKey, ttl: Duration) -> anyhow::Result<Option<LockGuard>> {
        let key = key.canonical();
        let token = Self::new_token();
        if !self.backend.try_acquire(&key, &token, ttl).await? {
            debug!("Lock {key} is busy");
            return Ok(None);
        }
        debug!("Acquired lock {key} for {ttl:?}");
        Ok(Some(LockGuard {
            backend: self.backend.clone(),
            key,
            token,
            released: false,
        }))
    }

    /// Acquires every key in canonical order, so two operations that need
    /// overlapping sets cannot deadlock. Either all keys are held or none.
    pub async fn acquire_all(
        &self,
        keys: &[LockKey],
        ttl: Duration,
    ) -> Result<Vec<LockGuard>, LockError> {
        let ordered = keys
            .iter()
            .sorted_by_key(|key| key.canonical())
            .dedup_by(|a, b| a.canonical() == b.canonical());

        let mut guards = Vec::with_capacity(keys.len());
        for key in ordered {
            let acquired = match self.acquire(key, ttl).await {
                Ok(acquired) => acquired,
                Err(e) => {
                    Self::release_all(guards).await;
                    return Err(LockError::Backend(e));
                }
            };
            match acquired {
                Some(guard) => guards.push(guard),
                None => {
                    Self::release_all(guards).await;
                    return Err(ConflictError {
                        key: key.canonical(),
                        provider: key.provider(),
                    }
                    .into());
                }
            }
        }
        Ok(guards)
    }

    async fn release_all(guards: Vec<LockGuard>) {
        for guard in guards.into_iter().rev() {
            guard.release().await;
        }
    }

    /// Runs `f` while holding `key`.
    pub async fn with_lock<T, E, F, Fut>(&self, key: &LockKey, ttl: Duration, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        self.with_locks(std::slice::from_ref(key), ttl, f).await
    }

    /// Runs `f` while holding every key, releasing them on every exit path.
    pub async fn with_locks<T, E, F, Fut>(
        &self,
        keys: &[LockKey],
        ttl: Duration,
        f: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        let guards = self.acquire_all(keys, ttl).await?;
        let result = f().await;
        Self::release_all(guards).await;
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::NaiveDate;
    use shared::{DayRange, Provider};

    use super::*;
    use crate::{error::RefreshError, memory::MemoryLocks};

    fn manager() -> (LockManager, Arc<MemoryLocks>) {
        let backend = Arc::new(MemoryLocks::default());
        (LockManager::new(backend.clone()), backend)
    }

    fn key(user: &str) -> LockKey {
        LockKey::backfill(Provider::Github, user)
    }

    #[test]
    fn ttl_is_clamped() {
        assert_eq!(ttl_for_days(1), Duration::from_secs(120));
        assert_eq!(ttl_for_days(100), Duration::from_secs(200));
        assert_eq!(ttl_for_days(365), Duration::from_secs(730));
        assert_eq!(ttl_for_days(10_000), Duration::from_secs(900));
    }

    #[test]
    fn release_is_a_single_eval() {
        let packed = release_cmd("lock:write:github:1", "abc").get_packed_command();
        let packed = String::from_utf8(packed).unwrap();
        let args: Vec<&str> = packed.split("\r\n").collect();
        // *5, then $len/value pairs
        assert_eq!(args[0], "*5");
        assert_eq!(args[2], "EVAL");
        assert_eq!(args[4], RELEASE_SCRIPT);
        assert_eq!(args[6], "1");
        assert_eq!(args[8], "lock:write:github:1");
        assert_eq!(args[10], "abc");
    }

    #[tokio::test]
    async fn acquire_is_exclusive_and_release_is_idempotent() {
        let (manager, backend) = manager();
        let guard = manager.acquire(&key("1"), REFRESH_TTL).await.unwrap().unwrap();
        assert!(manager.acquire(&key("1"), REFRESH_TTL).await.unwrap().is_none());
        assert!(manager.acquire(&key("2"), REFRESH_TTL).await.unwrap().is_some());

        guard.release().await;
        backend.release(&key("1").canonical(), "not-the-holder").await.unwrap();
        backend.release("lock:never-taken", "token").await.unwrap();
        assert!(manager.acquire(&key("1"), REFRESH_TTL).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn concurrent_with_lock_runs_once() {
        let (manager, _) = manager();
        let runs = Arc::new(AtomicUsize::new(0));
        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
        let (finish_tx, finish_rx) = tokio::sync::oneshot::channel::<()>();

        let first = {
            let manager = manager.clone();
            let runs = runs.clone();
            tokio::spawn(async move {
                manager
                    .with_lock(&key("1"), REFRESH_TTL, || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        let _ = started_tx.send(());
                        let _ = finish_rx.await;
                        Ok::<_, RefreshError>(())
                    })
                    .await
            })
        };

        started_rx.await.unwrap();
        let second = manager
            .with_lock(&key("1"), REFRESH_TTL, || async {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok::<_, RefreshError>(())
            })
            .await;
        match second {
            Err(RefreshError::Conflict(conflict)) => {
                assert_eq!(conflict.key, "lock:backfill:github:1");
                assert_eq!(conflict.provider, Provider::Github);
            }
            other => panic!("expected a conflict, got {other:?}"),
        }

        finish_tx.send(()).unwrap();
        first.await.unwrap().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lock_can_be_taken_over() {
        let (manager, _) = manager();
        let abandoned = manager
            .acquire(&key("1"), Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        // Simulates a crashed holder: the guard never runs its release
        std::mem::forget(abandoned);

        assert!(manager.acquire(&key("1"), REFRESH_TTL).await.unwrap().is_none());
        tokio::time::advance(Duration::from_millis(1001)).await;
        assert!(manager.acquire(&key("1"), REFRESH_TTL).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn partial_acquisition_is_rolled_back() {
        let (manager, _) = manager();
        let range = DayRange::single(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        let github = LockKey::day_range(Provider::Github, "1", range);
        let gitlab = LockKey::day_range(Provider::Gitlab, "1", range);

        let held = manager.acquire(&gitlab, REFRESH_TTL).await.unwrap().unwrap();
        let result = manager
            .acquire_all(&[gitlab.clone(), github.clone()], REFRESH_TTL)
            .await;
        match result {
            Err(LockError::Conflict(conflict)) => assert_eq!(conflict.provider, Provider::Gitlab),
            _ => panic!("expected a gitlab conflict"),
        }
        // github was taken first (sorted order) and must have been released
        assert!(manager.acquire(&github, REFRESH_TTL).await.unwrap().is_some());
        held.release().await;
    }

    #[tokio::test]
    async fn panic_inside_critical_section_releases() {
        let (manager, _) = manager();
        let task = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .with_lock(&key("1"), REFRESH_TTL, || async {
                        if true {
                            panic!("boom");
                        }
                        Ok::<_, RefreshError>(())
                    })
                    .await
            })
        };
        assert!(task.await.is_err());

        let mut reacquired = None;
        for _ in 0..10 {
            tokio::task::yield_now().await;
            if let Some(guard) = manager.acquire(&key("1"), REFRESH_TTL).await.unwrap() {
                reacquired = Some(guard);
                break;
            }
        }
        assert!(reacquired.is_some());
    }
}
