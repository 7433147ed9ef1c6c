use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::NaiveDate;
use futures::{stream, StreamExt};
use rocket::fairing::AdHoc;
use serde::Serialize;
use shared::{DayRange, Provider, UserIdentity};
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;

use crate::{
    error::RefreshError,
    pipeline::{CycleKind, Engine},
    refresher::RefreshRequest,
};

pub const DEFAULT_CRON_LIMIT: u64 = 200;
pub const MAX_CRON_LIMIT: u64 = 1000;
pub const MAX_USER_CONCURRENCY: usize = 6;
const PREVIEW_SIZE: usize = 10;

/// Fewer users at once as each unit of work grows.
pub fn default_user_concurrency(days: u32) -> usize {
    let concurrency = match days {
        0..=2 => 6,
        3..=30 => 4,
        _ => 3,
    };
    concurrency.clamp(1, MAX_USER_CONCURRENCY)
}

#[derive(Debug, Clone, Default)]
pub struct CronRequest {
    pub limit: Option<u64>,
    pub concurrency: Option<usize>,
    pub dry: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum UserErrorKind {
    Usage,
    Conflict,
    Fatal,
    Provider,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserError {
    pub user_id: String,
    pub kind: UserErrorKind,
    pub message: String,
    pub retryable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlannedRefresh {
    pub user_id: String,
    #[schema(value_type = Vec<String>)]
    pub providers: Vec<Provider>,
    #[schema(value_type = String)]
    pub from: NaiveDate,
    #[schema(value_type = String)]
    pub to: NaiveDate,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CronReport {
    pub scanned: usize,
    pub processed: usize,
    pub skipped: usize,
    pub errors: Vec<UserError>,
    pub dry: bool,
    pub preview: Vec<PlannedRefresh>,
}

enum UserResult {
    Processed(Vec<UserError>),
    Skipped(Option<UserError>),
    Failed(UserError),
}

/// Refreshes "yesterday to today" for a bounded, rotating slice of the known
/// users. One user's failure never stops the batch.
pub struct Scheduler {
    engine: Arc<Engine>,
    default_limit: u64,
}

impl Scheduler {
    pub fn new(engine: Arc<Engine>, default_limit: Option<u64>) -> Self {
        Self {
            engine,
            default_limit: default_limit.unwrap_or(DEFAULT_CRON_LIMIT),
        }
    }

    #[instrument(skip(self))]
    pub async fn run_daily(
        &self,
        request: CronRequest,
        today: NaiveDate,
    ) -> Result<CronReport, RefreshError> {
        let limit = request
            .limit
            .unwrap_or(self.default_limit)
            .clamp(1, MAX_CRON_LIMIT);
        let range = DayRange::yesterday_to_today(today)?;
        let concurrency = request
            .concurrency
            .unwrap_or_else(|| default_user_concurrency(range.len()))
            .clamp(1, MAX_USER_CONCURRENCY);

        let users = self.engine.known().list_known_users(limit).await?;
        let mut report = CronReport {
            scanned: users.len(),
            dry: request.dry,
            ..Default::default()
        };

        if request.dry {
            report.preview = users
                .iter()
                .filter(|identity| identity.has_any_login())
                .take(PREVIEW_SIZE)
                .map(|identity| PlannedRefresh {
                    user_id: identity.user_id.clone(),
                    providers: identity.providers(),
                    from: range.from(),
                    to: range.to(),
                })
                .collect();
            report.skipped = users.iter().filter(|i| !i.has_any_login()).count();
            info!("Dry run planned {} of {} users", report.preview.len(), report.scanned);
            return Ok(report);
        }

        let results: Vec<UserResult> = stream::iter(users)
            .map(|identity| self.refresh_user(identity, range, today))
            .buffer_unordered(concurrency)
            .collect()
            .await;

        for result in results {
            match result {
                UserResult::Processed(errors) => {
                    report.processed += 1;
                    report.errors.extend(errors);
                }
                UserResult::Skipped(error) => {
                    report.skipped += 1;
                    report.errors.extend(error);
                }
                UserResult::Failed(error) => report.errors.push(error),
            }
        }
        report.errors.sort_by(|a, b| a.user_id.cmp(&b.user_id));

        info!(
            "Daily refresh: scanned {}, processed {}, skipped {}, errors {}",
            report.scanned,
            report.processed,
            report.skipped,
            report.errors.len()
        );
        Ok(report)
    }

    async fn refresh_user(
        &self,
        identity: UserIdentity,
        range: DayRange,
        today: NaiveDate,
    ) -> UserResult {
        if !identity.has_any_login() {
            return UserResult::Skipped(None);
        }
        let user_id = identity.user_id.clone();
        let request = RefreshRequest::new(identity, range, None);
        match self.engine.run(CycleKind::Scheduled, &request, today).await {
            Ok(cycle) => {
                if let Err(e) = self.engine.known().mark_refreshed(&user_id).await {
                    warn!("Failed to mark {user_id} as refreshed: {e:#}");
                }
                UserResult::Processed(
                    cycle
                        .errors
                        .into_iter()
                        .map(|error| UserError {
                            user_id: user_id.clone(),
                            kind: UserErrorKind::Provider,
                            message: error.message,
                            retryable: true,
                        })
                        .collect(),
                )
            }
            Err(error @ RefreshError::Conflict(_)) => UserResult::Skipped(Some(UserError {
                user_id,
                kind: UserErrorKind::Conflict,
                message: error.to_string(),
                retryable: true,
            })),
            Err(error) => {
                let kind = match error {
                    RefreshError::Usage(_) => UserErrorKind::Usage,
                    _ => UserErrorKind::Fatal,
                };
                error!("Daily refresh failed for {user_id}: {error}");
                UserResult::Failed(UserError {
                    user_id,
                    kind,
                    message: error.to_string(),
                    retryable: error.is_retryable(),
                })
            }
        }
    }
}

/// Runs the daily refresh on an interval, like the other periodic pulls.
pub fn stage(scheduler: Arc<Scheduler>, interval: Duration) -> AdHoc {
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();

    AdHoc::on_ignite("Daily contribution refresh", move |rocket| async move {
        rocket
            .attach(AdHoc::on_liftoff(
                "Refresh known users every X minutes",
                move |_| {
                    Box::pin(async move {
                        rocket::tokio::spawn(async move {
                            let mut interval = rocket::tokio::time::interval(interval);
                            // The first tick fires immediately; skip it so a
                            // restart does not hit the providers straight away.
                            interval.tick().await;
                            while running.load(Ordering::Relaxed) {
                                interval.tick().await;
                                let today = chrono::Utc::now().date_naive();
                                if let Err(e) =
                                    scheduler.run_daily(CronRequest::default(), today).await
                                {
                                    error!("Daily refresh failed: {e}");
                                }
                            }
                        });
                    })
                },
            ))
            .attach(AdHoc::on_shutdown("Stop daily refresh", |_| {
                Box::pin(async move {
                    running_clone.store(false, Ordering::Relaxed);
                })
            }))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{date, FetchBehavior, TestEngine};

    async fn seed_users(test: &TestEngine) {
        let known = test.engine.known();
        known
            .remember(&UserIdentity::new("a").with_github("a-gh"))
            .await
            .unwrap();
        known
            .remember(&UserIdentity::new("b").with_gitlab("b-gl"))
            .await
            .unwrap();
        known.remember(&UserIdentity::new("c")).await.unwrap();
    }

    #[test]
    fn user_concurrency_shrinks_with_range() {
        assert_eq!(default_user_concurrency(2), 6);
        assert_eq!(default_user_concurrency(30), 4);
        assert_eq!(default_user_concurrency(365), 3);
    }

    #[tokio::test]
    async fn dry_run_writes_nothing() {
        let test = TestEngine::new(FetchBehavior::Counts(|_| 1), FetchBehavior::Counts(|_| 1));
        seed_users(&test).await;
        let before = (test.store.snapshot(), test.ranking.snapshot());

        let scheduler = Scheduler::new(test.engine.clone(), None);
        let report = scheduler
            .run_daily(
                CronRequest {
                    dry: true,
                    ..Default::default()
                },
                date(10),
            )
            .await
            .unwrap();

        assert_eq!(report.scanned, 3);
        assert_eq!(report.processed, 0);
        assert_eq!(report.preview.len(), 2);
        assert_eq!(report.preview[0].from, date(9));
        assert_eq!((test.store.snapshot(), test.ranking.snapshot()), before);
    }

    #[tokio::test]
    async fn batch_continues_past_failures() {
        let test = TestEngine::new(FetchBehavior::Fail, FetchBehavior::Counts(|_| 2));
        seed_users(&test).await;

        let scheduler = Scheduler::new(test.engine.clone(), None);
        let report = scheduler
            .run_daily(CronRequest::default(), date(10))
            .await
            .unwrap();

        assert_eq!(report.scanned, 3);
        assert_eq!(report.processed, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].user_id, "a");
        assert_eq!(report.errors[0].kind, UserErrorKind::Provider);
        let totals = test.store.snapshot().totals;
        assert_eq!(totals["b"].gitlab.map(|t| t.last_30d), Some(4));
    }

    #[tokio::test]
    async fn conflicting_users_are_skipped_and_retryable() {
        let test = TestEngine::new(FetchBehavior::Counts(|_| 1), FetchBehavior::Counts(|_| 1));
        seed_users(&test).await;
        let range = DayRange::yesterday_to_today(date(10)).unwrap();
        let held = test
            .locks
            .acquire(
                &shared::LockKey::day_range(Provider::Github, "a", range),
                crate::lock::REFRESH_TTL,
            )
            .await
            .unwrap()
            .unwrap();

        let scheduler = Scheduler::new(test.engine.clone(), None);
        let report = scheduler
            .run_daily(CronRequest::default(), date(10))
            .await
            .unwrap();
        held.release().await;

        assert_eq!(report.processed, 1);
        assert_eq!(report.skipped, 2);
        let conflict = &report.errors[0];
        assert_eq!(conflict.user_id, "a");
        assert_eq!(conflict.kind, UserErrorKind::Conflict);
        assert!(conflict.retryable);
        assert!(conflict.message.contains("github"));
    }

    #[tokio::test]
    async fn processed_users_rotate_to_the_back() {
        let test = TestEngine::new(FetchBehavior::Counts(|_| 1), FetchBehavior::Counts(|_| 1));
        seed_users(&test).await;
        let scheduler = Scheduler::new(test.engine.clone(), None);
        scheduler
            .run_daily(
                CronRequest {
                    limit: Some(1),
                    ..Default::default()
                },
                date(10),
            )
            .await
            .unwrap();

        let order: Vec<_> = test
            .engine
            .known()
            .list_known_users(10)
            .await
            .unwrap()
            .into_iter()
            .map(|identity| identity.user_id)
            .collect();
        assert_eq!(order, ["b", "c", "a"]);
    }
}
