use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;
use shared::{
    ContributionTotals, Provider, ProviderSelector, UserId, UserIdentity, UserTotals, Window,
};

/// One row of a ranked listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RankedUser {
    pub user_id: UserId,
    pub score: u64,
}

impl RankedUser {
    pub fn new(user_id: impl Into<UserId>, score: u64) -> Self {
        Self {
            user_id: user_id.into(),
            score,
        }
    }
}

/// Relational source of truth: day buckets and the totals derived from them.
///
/// Listings over totals include every user with at least one totals row; a
/// provider without a row contributes zero to the score.
#[async_trait]
pub trait ContributionStore: Send + Sync {
    /// Overwrites the count of every given day. Returns the number of rows written.
    async fn upsert_days(
        &self,
        user_id: &str,
        provider: Provider,
        days: &[(NaiveDate, u32)],
    ) -> anyhow::Result<usize>;

    async fn days(&self, user_id: &str, provider: Provider)
        -> anyhow::Result<Vec<(NaiveDate, u32)>>;

    async fn providers_with_days(&self, user_id: &str) -> anyhow::Result<Vec<Provider>>;

    /// Replaces the stored totals; never increments.
    async fn replace_totals(
        &self,
        user_id: &str,
        provider: Provider,
        totals: ContributionTotals,
    ) -> anyhow::Result<()>;

    async fn totals(&self, user_id: &str) -> anyhow::Result<UserTotals>;

    async fn totals_for(&self, user_ids: &[UserId]) -> anyhow::Result<HashMap<UserId, UserTotals>>;

    /// Ranked scan ordered by score descending, then user id ascending.
    async fn scan_ranked(
        &self,
        window: Window,
        selector: ProviderSelector,
        offset: u64,
        limit: u64,
    ) -> anyhow::Result<Vec<RankedUser>>;

    /// 1-based place and score of a user in the ranked scan.
    async fn place_of(
        &self,
        window: Window,
        selector: ProviderSelector,
        user_id: &str,
    ) -> anyhow::Result<Option<(u64, u64)>>;

    async fn count_ranked(&self) -> anyhow::Result<u64>;

    async fn users_with_totals(&self) -> anyhow::Result<Vec<UserId>>;
}

/// The set of users the scheduler refreshes, with their provider logins.
#[async_trait]
pub trait KnownUsers: Send + Sync {
    /// Adds the user to the known set, keeping stored logins the identity
    /// does not mention.
    async fn remember(&self, identity: &UserIdentity) -> anyhow::Result<UserIdentity>;

    async fn identity(&self, user_id: &str) -> anyhow::Result<Option<UserIdentity>>;

    async fn identities(&self, user_ids: &[UserId])
        -> anyhow::Result<HashMap<UserId, UserIdentity>>;

    /// Least recently refreshed users first, so bounded scans rotate through
    /// the whole set.
    async fn list_known_users(&self, limit: u64) -> anyhow::Result<Vec<UserIdentity>>;

    async fn mark_refreshed(&self, user_id: &str) -> anyhow::Result<()>;
}
