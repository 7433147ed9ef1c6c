use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use rocket::{
    fairing::{self, AdHoc},
    Build, Rocket,
};
use rocket_db_pools::Database;
use shared::{
    ContributionTotals, Provider, ProviderSelector, UserId, UserIdentity, UserTotals, Window,
};
use sqlx::PgPool;
use tracing::instrument;

use crate::store::{ContributionStore, KnownUsers, RankedUser};

#[derive(Database, Clone, Debug)]
#[database("contributions")]
pub struct DB(PgPool);

pub mod types;

use types::{DayRecord, KnownUserRecord, PlaceRecord, ScoreRecord, TotalsRecord};

fn window_column(window: Window) -> &'static str {
    match window {
        Window::AllTime => "all_time",
        Window::Last30Days => "last_30d",
        Window::Last365Days => "last_365d",
    }
}

fn selector_providers(selector: ProviderSelector) -> Vec<String> {
    selector
        .providers()
        .into_iter()
        .map(|provider| provider.to_string())
        .collect()
}

// Every user with a totals row, scored for one window and selector. `$1` is the
// provider list. The "C" collation keeps tie-breaks in byte order, like the
// ranking index.
fn scores_query(window: Window) -> String {
    format!(
        r#"
        SELECT user_id,
               COALESCE(SUM({column}) FILTER (WHERE provider = ANY($1)), 0)::BIGINT AS score
        FROM contribution_totals
        GROUP BY user_id
        "#,
        column = window_column(window)
    )
}

#[async_trait]
impl ContributionStore for DB {
    #[instrument(skip(self, days), fields(days = days.len()))]
    async fn upsert_days(
        &self,
        user_id: &str,
        provider: Provider,
        days: &[(NaiveDate, u32)],
    ) -> anyhow::Result<usize> {
        let (dates, counts): (Vec<NaiveDate>, Vec<i32>) = days
            .iter()
            .map(|(day, count)| (*day, (*count).min(i32::MAX as u32) as i32))
            .unzip();
        let result = sqlx::query(
            r#"
            INSERT INTO contribution_days (user_id, provider, day, count)
            SELECT $1, $2, t.day, t.count
            FROM UNNEST($3::DATE[], $4::INTEGER[]) AS t(day, count)
            ON CONFLICT (user_id, provider, day) DO UPDATE
            SET count = EXCLUDED.count,
                updated_at = now()
            "#,
        )
        .bind(user_id)
        .bind(provider.to_string())
        .bind(dates)
        .bind(counts)
        .execute(&self.0)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn days(
        &self,
        user_id: &str,
        provider: Provider,
    ) -> anyhow::Result<Vec<(NaiveDate, u32)>> {
        let records = sqlx::query_as::<_, DayRecord>(
            r#"
            SELECT day, count
            FROM contribution_days
            WHERE user_id = $1 AND provider = $2
            ORDER BY day
            "#,
        )
        .bind(user_id)
        .bind(provider.to_string())
        .fetch_all(&self.0)
        .await?;
        Ok(records
            .into_iter()
            .map(|record| (record.day, record.count.max(0) as u32))
            .collect())
    }

    async fn providers_with_days(&self, user_id: &str) -> anyhow::Result<Vec<Provider>> {
        let providers: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT provider
            FROM contribution_days
            WHERE user_id = $1
            ORDER BY provider
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.0)
        .await?;
        providers.iter().map(|raw| types::parse_provider(raw)).collect()
    }

    #[instrument(skip(self))]
    async fn replace_totals(
        &self,
        user_id: &str,
        provider: Provider,
        totals: ContributionTotals,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO contribution_totals (user_id, provider, all_time, last_30d, last_365d)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id, provider) DO UPDATE
            SET all_time = EXCLUDED.all_time,
                last_30d = EXCLUDED.last_30d,
                last_365d = EXCLUDED.last_365d,
                updated_at = now()
            "#,
        )
        .bind(user_id)
        .bind(provider.to_string())
        .bind(totals.all_time as i64)
        .bind(totals.last_30d as i64)
        .bind(totals.last_365d as i64)
        .execute(&self.0)
        .await?;
        Ok(())
    }

    async fn totals(&self, user_id: &str) -> anyhow::Result<UserTotals> {
        let mut totals = self.totals_for(&[user_id.to_string()]).await?;
        Ok(totals.remove(user_id).unwrap_or_default())
    }

    async fn totals_for(&self, user_ids: &[UserId]) -> anyhow::Result<HashMap<UserId, UserTotals>> {
        let records = sqlx::query_as::<_, TotalsRecord>(
            r#"
            SELECT user_id, provider, all_time, last_30d, last_365d
            FROM contribution_totals
            WHERE user_id = ANY($1)
            "#,
        )
        .bind(user_ids)
        .fetch_all(&self.0)
        .await?;

        let mut result: HashMap<UserId, UserTotals> = HashMap::new();
        for record in records {
            let provider = record.provider()?;
            result
                .entry(record.user_id.clone())
                .or_default()
                .set(provider, record.totals());
        }
        Ok(result)
    }

    #[instrument(skip(self))]
    async fn scan_ranked(
        &self,
        window: Window,
        selector: ProviderSelector,
        offset: u64,
        limit: u64,
    ) -> anyhow::Result<Vec<RankedUser>> {
        let query = format!(
            r#"
            SELECT user_id, score
            FROM ({scores}) scores
            ORDER BY score DESC, user_id COLLATE "C" ASC
            OFFSET $2 LIMIT $3
            "#,
            scores = scores_query(window)
        );
        let records = sqlx::query_as::<_, ScoreRecord>(&query)
            .bind(selector_providers(selector))
            .bind(i64::try_from(offset).context("offset out of range")?)
            .bind(i64::try_from(limit).context("limit out of range")?)
            .fetch_all(&self.0)
            .await?;
        Ok(records
            .into_iter()
            .map(|record| RankedUser::new(record.user_id, record.score.max(0) as u64))
            .collect())
    }

    async fn place_of(
        &self,
        window: Window,
        selector: ProviderSelector,
        user_id: &str,
    ) -> anyhow::Result<Option<(u64, u64)>> {
        let query = format!(
            r#"
            SELECT place, score
            FROM (
                SELECT user_id,
                       score,
                       ROW_NUMBER() OVER (ORDER BY score DESC, user_id COLLATE "C" ASC) AS place
                FROM ({scores}) scores
            ) ranked
            WHERE user_id = $2
            "#,
            scores = scores_query(window)
        );
        let record = sqlx::query_as::<_, PlaceRecord>(&query)
            .bind(selector_providers(selector))
            .bind(user_id)
            .fetch_optional(&self.0)
            .await?;
        Ok(record.map(|record| (record.place as u64, record.score.max(0) as u64)))
    }

    async fn count_ranked(&self) -> anyhow::Result<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(DISTINCT user_id)
            FROM contribution_totals
            "#,
        )
        .fetch_one(&self.0)
        .await?;
        Ok(count as u64)
    }

    async fn users_with_totals(&self) -> anyhow::Result<Vec<UserId>> {
        Ok(sqlx::query_scalar(
            r#"
            SELECT DISTINCT user_id
            FROM contribution_totals
            ORDER BY user_id
            "#,
        )
        .fetch_all(&self.0)
        .await?)
    }
}

#[async_trait]
impl KnownUsers for DB {
    #[instrument(skip(self, identity), fields(user = %identity.user_id))]
    async fn remember(&self, identity: &UserIdentity) -> anyhow::Result<UserIdentity> {
        let record = sqlx::query_as::<_, KnownUserRecord>(
            r#"
            INSERT INTO known_users (user_id, github_login, gitlab_username)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id) DO UPDATE
            SET github_login = COALESCE(EXCLUDED.github_login, known_users.github_login),
                gitlab_username = COALESCE(EXCLUDED.gitlab_username, known_users.gitlab_username),
                updated_at = now()
            RETURNING user_id, github_login, gitlab_username
            "#,
        )
        .bind(&identity.user_id)
        .bind(identity.login(Provider::Github))
        .bind(identity.login(Provider::Gitlab))
        .fetch_one(&self.0)
        .await?;
        Ok(record.into())
    }

    async fn identity(&self, user_id: &str) -> anyhow::Result<Option<UserIdentity>> {
        let record = sqlx::query_as::<_, KnownUserRecord>(
            r#"
            SELECT user_id, github_login, gitlab_username
            FROM known_users
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.0)
        .await?;
        Ok(record.map(Into::into))
    }

    async fn identities(
        &self,
        user_ids: &[UserId],
    ) -> anyhow::Result<HashMap<UserId, UserIdentity>> {
        let records = sqlx::query_as::<_, KnownUserRecord>(
            r#"
            SELECT user_id, github_login, gitlab_username
            FROM known_users
            WHERE user_id = ANY($1)
            "#,
        )
        .bind(user_ids)
        .fetch_all(&self.0)
        .await?;
        Ok(records
            .into_iter()
            .map(|record| (record.user_id.clone(), record.into()))
            .collect())
    }

    async fn list_known_users(&self, limit: u64) -> anyhow::Result<Vec<UserIdentity>> {
        let records = sqlx::query_as::<_, KnownUserRecord>(
            r#"
            SELECT user_id, github_login, gitlab_username
            FROM known_users
            ORDER BY last_refreshed_at ASC NULLS FIRST, user_id
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.0)
        .await?;
        Ok(records.into_iter().map(Into::into).collect())
    }

    async fn mark_refreshed(&self, user_id: &str) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE known_users
            SET last_refreshed_at = now()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .execute(&self.0)
        .await?;
        Ok(())
    }
}

async fn run_migrations(rocket: Rocket<Build>) -> fairing::Result {
    match DB::fetch(&rocket) {
        Some(db) => match sqlx::migrate!("./migrations").run(&**db).await {
            Ok(_) => Ok(rocket),
            Err(e) => {
                rocket::error!("Failed to initialize SQLx database: {}", e);
                Err(rocket)
            }
        },
        None => Err(rocket),
    }
}

pub fn stage() -> AdHoc {
    AdHoc::on_ignite("SQLx Stage", |rocket| async {
        rocket
            .attach(DB::init())
            .attach(AdHoc::try_on_ignite("SQLx Migrations", run_migrations))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scores_query_targets_window_column() {
        assert!(scores_query(Window::Last30Days).contains("SUM(last_30d)"));
        assert!(scores_query(Window::AllTime).contains("SUM(all_time)"));
        assert_eq!(
            selector_providers(ProviderSelector::Combined),
            vec!["github".to_string(), "gitlab".to_string()]
        );
    }

    #[test]
    fn unknown_provider_rows_are_rejected() {
        assert!(types::parse_provider("bitbucket").is_err());
        assert_eq!(types::parse_provider("GitHub").unwrap(), Provider::Github);
    }
}
