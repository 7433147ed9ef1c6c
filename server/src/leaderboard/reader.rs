use std::{collections::HashMap, sync::Arc};

use itertools::Itertools;
use serde::Serialize;
use shared::{Provider, ProviderSelector, UserId, UserTotals, Window};
use tracing::{debug, instrument, warn};
use utoipa::ToSchema;

use crate::{
    ranking::{Board, RankingStore},
    store::{ContributionStore, KnownUsers, RankedUser},
};

pub const DEFAULT_PAGE_LIMIT: u64 = 50;
pub const MAX_PAGE_LIMIT: u64 = 100;
pub const MAX_EXPORT_LIMIT: u64 = 2000;
pub const MAX_DETAILS_USERS: usize = 100;
/// Largest offset a cursor may carry. Both stores index with signed 64-bit
/// integers.
pub const MAX_CURSOR_OFFSET: u64 = i64::MAX as u64 - MAX_EXPORT_LIMIT - 1;

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("invalid cursor {0:?}")]
    InvalidCursor(String),
    #[error("at most {MAX_DETAILS_USERS} users can be requested at once, got {0}")]
    TooManyUsers(usize),
    #[error("{0:#}")]
    Store(#[from] anyhow::Error),
}

impl ReadError {
    pub fn is_usage(&self) -> bool {
        !matches!(self, ReadError::Store(_))
    }
}

/// Where a page was read from. `Relational` means the index was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PageSource {
    Index,
    Relational,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Interactive,
    Export,
}

impl PageKind {
    fn max_limit(&self) -> u64 {
        match self {
            PageKind::Interactive => MAX_PAGE_LIMIT,
            PageKind::Export => MAX_EXPORT_LIMIT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PageQuery {
    pub window: Window,
    pub selector: ProviderSelector,
    pub limit: Option<u64>,
    /// Opaque token handed out as `next_cursor` by the previous page. It is
    /// a rank offset, so a user crossing the page boundary between two
    /// requests shows up twice or not at all.
    pub cursor: Option<String>,
}

impl PageQuery {
    pub fn new(window: Window, selector: ProviderSelector) -> Self {
        Self {
            window,
            selector,
            limit: None,
            cursor: None,
        }
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn cursor(mut self, cursor: Option<String>) -> Self {
        self.cursor = cursor;
        self
    }

    fn effective_limit(&self, kind: PageKind) -> u64 {
        self.limit
            .unwrap_or(DEFAULT_PAGE_LIMIT)
            .clamp(1, kind.max_limit())
    }

    fn offset(&self) -> Result<u64, ReadError> {
        match self.cursor.as_deref().map(str::trim) {
            None | Some("") => Ok(0),
            Some(cursor) => cursor
                .parse()
                .ok()
                .filter(|offset| *offset <= MAX_CURSOR_OFFSET)
                .ok_or_else(|| ReadError::InvalidCursor(cursor.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    pub rank: u64,
    pub user_id: UserId,
    pub score: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardPage {
    pub entries: Vec<LeaderboardEntry>,
    pub next_cursor: Option<String>,
    pub source: PageSource,
    /// Ranked users in the whole board.
    pub total_records: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserPlace {
    pub user_id: UserId,
    pub rank: u64,
    pub score: u64,
    pub source: PageSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserBreakdown {
    pub user_id: UserId,
    pub github_login: Option<String>,
    pub gitlab_username: Option<String>,
    pub github: u64,
    pub gitlab: u64,
    pub combined: u64,
}

impl UserBreakdown {
    fn new(user_id: UserId, totals: &UserTotals, window: Window) -> Self {
        Self {
            user_id,
            github_login: None,
            gitlab_username: None,
            github: totals.score(window, ProviderSelector::Github),
            gitlab: totals.score(window, ProviderSelector::Gitlab),
            combined: totals.score(window, ProviderSelector::Combined),
        }
    }
}

#[derive(Debug, Serialize)]
struct ExportRow<'a> {
    rank: u64,
    user_id: &'a str,
    github_login: Option<&'a str>,
    gitlab_username: Option<&'a str>,
    total: u64,
    github: u64,
    gitlab: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportPage {
    pub csv: String,
    pub next_cursor: Option<String>,
    pub source: PageSource,
}

/// Read side of the leaderboard. Prefers the ranking index and falls back to
/// scanning the relational totals when the index is unavailable or empty.
pub struct Reader {
    store: Arc<dyn ContributionStore>,
    ranking: Arc<dyn RankingStore>,
    known: Arc<dyn KnownUsers>,
}

impl Reader {
    pub fn new(
        store: Arc<dyn ContributionStore>,
        ranking: Arc<dyn RankingStore>,
        known: Arc<dyn KnownUsers>,
    ) -> Self {
        Self {
            store,
            ranking,
            known,
        }
    }

    async fn from_index(
        &self,
        board: Board,
        offset: u64,
        limit: u64,
    ) -> anyhow::Result<Option<(Vec<RankedUser>, u64)>> {
        let len = self.ranking.len(board).await?;
        if len == 0 {
            return Ok(None);
        }
        Ok(Some((self.ranking.page(board, offset, limit).await?, len)))
    }

    async fn ranked_slice(
        &self,
        board: Board,
        offset: u64,
        limit: u64,
    ) -> anyhow::Result<(Vec<RankedUser>, u64, PageSource)> {
        match self.from_index(board, offset, limit).await {
            Ok(Some((entries, len))) => return Ok((entries, len, PageSource::Index)),
            Ok(None) => debug!("Index {} is empty, scanning totals", board.key()),
            Err(e) => warn!("Ranking index unavailable, scanning totals: {e:#}"),
        }
        let entries = self
            .store
            .scan_ranked(board.window, board.selector, offset, limit)
            .await?;
        let total = self.store.count_ranked().await?;
        Ok((entries, total, PageSource::Relational))
    }

    async fn page(&self, query: &PageQuery, kind: PageKind) -> Result<LeaderboardPage, ReadError> {
        let limit = query.effective_limit(kind);
        let offset = query.offset()?;
        let board = Board::new(query.window, query.selector);

        // One extra row tells whether another page exists
        let (mut ranked, total_records, source) =
            self.ranked_slice(board, offset, limit + 1).await?;
        let next_cursor = if ranked.len() as u64 > limit {
            ranked.truncate(limit as usize);
            Some((offset + limit).to_string())
        } else {
            None
        };

        let entries = ranked
            .into_iter()
            .enumerate()
            .map(|(i, entry)| LeaderboardEntry {
                rank: offset + i as u64 + 1,
                user_id: entry.user_id,
                score: entry.score,
            })
            .collect();
        Ok(LeaderboardPage {
            entries,
            next_cursor,
            source,
            total_records,
        })
    }

    #[instrument(skip(self))]
    pub async fn get_page(&self, query: &PageQuery) -> Result<LeaderboardPage, ReadError> {
        self.page(query, PageKind::Interactive).await
    }

    #[instrument(skip(self))]
    pub async fn rank_of(
        &self,
        user_id: &str,
        window: Window,
        selector: ProviderSelector,
    ) -> Result<Option<UserPlace>, ReadError> {
        let board = Board::new(window, selector);
        let indexed = match self.ranking.place_of(board, user_id).await {
            Ok(Some(place)) => Some(place),
            Ok(None) => match self.ranking.len(board).await {
                Ok(len) if len > 0 => return Ok(None),
                _ => None,
            },
            Err(e) => {
                warn!("Ranking index unavailable, scanning totals: {e:#}");
                None
            }
        };
        let (place, source) = match indexed {
            Some(place) => (Some(place), PageSource::Index),
            None => (
                self.store.place_of(window, selector, user_id).await?,
                PageSource::Relational,
            ),
        };
        Ok(place.map(|(rank, score)| UserPlace {
            user_id: user_id.to_string(),
            rank,
            score,
            source,
        }))
    }

    /// Per-provider scores straight from the relational totals, in request
    /// order. Unknown users are reported with zero scores.
    #[instrument(skip(self, user_ids), fields(users = user_ids.len()))]
    pub async fn details(
        &self,
        user_ids: &[UserId],
        window: Window,
    ) -> Result<Vec<UserBreakdown>, ReadError> {
        let user_ids: Vec<UserId> = user_ids.iter().unique().cloned().collect();
        if user_ids.len() > MAX_DETAILS_USERS {
            return Err(ReadError::TooManyUsers(user_ids.len()));
        }
        let totals = self.store.totals_for(&user_ids).await?;
        let identities = self.known.identities(&user_ids).await?;
        Ok(user_ids
            .into_iter()
            .map(|user_id| {
                let mut breakdown = UserBreakdown::new(
                    user_id.clone(),
                    &totals.get(&user_id).copied().unwrap_or_default(),
                    window,
                );
                if let Some(identity) = identities.get(&user_id) {
                    breakdown.github_login = identity.login(Provider::Github).map(Into::into);
                    breakdown.gitlab_username = identity.login(Provider::Gitlab).map(Into::into);
                }
                breakdown
            })
            .collect())
    }

    /// A page rendered as CSV with identifiers and per-provider scores.
    #[instrument(skip(self))]
    pub async fn export(&self, query: &PageQuery) -> Result<ExportPage, ReadError> {
        let page = self.page(query, PageKind::Export).await?;
        let user_ids: Vec<UserId> = page.entries.iter().map(|e| e.user_id.clone()).collect();
        let totals = self.store.totals_for(&user_ids).await?;
        let identities = self.known.identities(&user_ids).await?;
        let csv = render_csv(&page.entries, &totals, &identities, query.window)?;
        Ok(ExportPage {
            csv,
            next_cursor: page.next_cursor,
            source: page.source,
        })
    }
}

fn render_csv(
    entries: &[LeaderboardEntry],
    totals: &HashMap<UserId, UserTotals>,
    identities: &HashMap<UserId, shared::UserIdentity>,
    window: Window,
) -> anyhow::Result<String> {
    let mut writer = csv::Writer::from_writer(vec![]);
    if entries.is_empty() {
        writer.write_record([
            "rank",
            "user_id",
            "github_login",
            "gitlab_username",
            "total",
            "github",
            "gitlab",
        ])?;
    }
    for entry in entries {
        let user_totals = totals.get(&entry.user_id).copied().unwrap_or_default();
        let identity = identities.get(&entry.user_id);
        writer.serialize(ExportRow {
            rank: entry.rank,
            user_id: &entry.user_id,
            github_login: identity.and_then(|i| i.login(Provider::Github)),
            gitlab_username: identity.and_then(|i| i.login(Provider::Gitlab)),
            total: entry.score,
            github: user_totals.score(window, ProviderSelector::Github),
            gitlab: user_totals.score(window, ProviderSelector::Gitlab),
        })?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("Failed to flush csv: {}", e.error()))?;
    Ok(String::from_utf8(bytes)?)
}
