use std::str::FromStr;

use chrono::NaiveDate;
use shared::{ContributionTotals, Provider, UserIdentity};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DayRecord {
    pub day: NaiveDate,
    pub count: i32,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TotalsRecord {
    pub user_id: String,
    pub provider: String,
    pub all_time: i64,
    pub last_30d: i64,
    pub last_365d: i64,
}

impl TotalsRecord {
    pub fn provider(&self) -> anyhow::Result<Provider> {
        parse_provider(&self.provider)
    }

    pub fn totals(&self) -> ContributionTotals {
        ContributionTotals {
            all_time: self.all_time.max(0) as u64,
            last_30d: self.last_30d.max(0) as u64,
            last_365d: self.last_365d.max(0) as u64,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ScoreRecord {
    pub user_id: String,
    pub score: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PlaceRecord {
    pub place: i64,
    pub score: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct KnownUserRecord {
    pub user_id: String,
    pub github_login: Option<String>,
    pub gitlab_username: Option<String>,
}

impl From<KnownUserRecord> for UserIdentity {
    fn from(record: KnownUserRecord) -> Self {
        UserIdentity {
            user_id: record.user_id,
            github_login: record.github_login,
            gitlab_username: record.gitlab_username,
        }
    }
}

pub fn parse_provider(raw: &str) -> anyhow::Result<Provider> {
    Provider::from_str(raw).map_err(|_| anyhow::anyhow!("Unknown provider in database: {raw}"))
}
