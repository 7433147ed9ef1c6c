use anyhow::Context;
use async_trait::async_trait;
use deadpool_redis::{
    redis::{self, AsyncCommands},
    Config, Pool as RedisPool, Runtime,
};
use itertools::iproduct;
use shared::{IntoEnumIterator, ProviderSelector, Window};

use crate::store::RankedUser;

/// One sorted structure of the ranking index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Board {
    pub window: Window,
    pub selector: ProviderSelector,
}

impl Board {
    pub fn new(window: Window, selector: ProviderSelector) -> Self {
        Self { window, selector }
    }

    /// Every window × provider selector combination.
    pub fn all() -> Vec<Board> {
        iproduct!(Window::iter(), ProviderSelector::iter())
            .map(|(window, selector)| Board::new(window, selector))
            .collect()
    }

    pub fn key(&self) -> String {
        format!("leaderboard:{}:{}", self.window, self.selector)
    }
}

/// Read-optimized, derived ranking index. Never authoritative; it can always
/// be rebuilt from the relational totals.
///
/// Entries are ordered by score descending, ties broken by user id ascending.
#[async_trait]
pub trait RankingStore: Send + Sync {
    /// Replaces the user's score in each listed board.
    async fn set_scores(&self, user_id: &str, scores: &[(Board, u64)]) -> anyhow::Result<()>;

    async fn remove(&self, user_id: &str, boards: &[Board]) -> anyhow::Result<()>;

    async fn page(&self, board: Board, offset: u64, limit: u64)
        -> anyhow::Result<Vec<RankedUser>>;

    /// 1-based place and score.
    async fn place_of(&self, board: Board, user_id: &str) -> anyhow::Result<Option<(u64, u64)>>;

    async fn len(&self, board: Board) -> anyhow::Result<u64>;

    async fn clear(&self, boards: &[Board]) -> anyhow::Result<()>;
}

pub fn create_pool(redis_url: &str) -> anyhow::Result<RedisPool> {
    Config::from_url(redis_url)
        .create_pool(Some(Runtime::Tokio1))
        .context("Failed to init redis pool")
}

// Scores are stored negated: ascending ZRANGE order then yields score
// descending with equal scores ordered by member ascending.
fn encode_score(score: u64) -> f64 {
    -(score as f64)
}

fn decode_score(raw: f64) -> u64 {
    (-raw).max(0.0).round() as u64
}

/// Ranking index kept in Redis sorted sets, one per [`Board`].
#[derive(Clone)]
pub struct RedisRanking {
    pool: RedisPool,
}

impl RedisRanking {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RankingStore for RedisRanking {
    async fn set_scores(&self, user_id: &str, scores: &[(Board, u64)]) -> anyhow::Result<()> {
        let mut conn = self.pool.get().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (board, score) in scores {
            pipe.zadd(board.key(), user_id, encode_score(*score)).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn remove(&self, user_id: &str, boards: &[Board]) -> anyhow::Result<()> {
        let mut conn = self.pool.get().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        for board in boards {
            pipe.zrem(board.key(), user_id).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn page(
        &self,
        board: Board,
        offset: u64,
        limit: u64,
    ) -> anyhow::Result<Vec<RankedUser>> {
        if limit == 0 {
            return Ok(vec![]);
        }
        let start = isize::try_from(offset)?;
        let stop = offset
            .checked_add(limit - 1)
            .and_then(|stop| isize::try_from(stop).ok())
            .ok_or_else(|| anyhow::anyhow!("page {offset}+{limit} is out of range"))?;
        let mut conn = self.pool.get().await?;
        let entries: Vec<(String, f64)> = conn
            .zrange_withscores(board.key(), start, stop)
            .await?;
        Ok(entries
            .into_iter()
            .map(|(user_id, raw)| RankedUser::new(user_id, decode_score(raw)))
            .collect())
    }

    async fn place_of(&self, board: Board, user_id: &str) -> anyhow::Result<Option<(u64, u64)>> {
        let mut conn = self.pool.get().await?;
        let rank: Option<u64> = conn.zrank(board.key(), user_id).await?;
        let score: Option<f64> = conn.zscore(board.key(), user_id).await?;
        Ok(rank.zip(score).map(|(rank, raw)| (rank + 1, decode_score(raw))))
    }

    async fn len(&self, board: Board) -> anyhow::Result<u64> {
        let mut conn = self.pool.get().await?;
        Ok(conn.zcard(board.key()).await?)
    }

    async fn clear(&self, boards: &[Board]) -> anyhow::Result<()> {
        if boards.is_empty() {
            return Ok(());
        }
        let mut conn = self.pool.get().await?;
        let keys: Vec<String> = boards.iter().map(Board::key).collect();
        let _: () = conn.del(keys).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn nine_boards_with_distinct_keys() {
        let boards = Board::all();
        assert_eq!(boards.len(), 9);
        let keys: HashSet<_> = boards.iter().map(Board::key).collect();
        assert_eq!(keys.len(), 9);
        assert!(keys.contains("leaderboard:30d:combined"));
        assert!(keys.contains("leaderboard:all:github"));
    }

    #[test]
    fn score_encoding_orders_descending() {
        assert!(encode_score(17) < encode_score(3));
        assert_eq!(decode_score(encode_score(17)), 17);
        assert_eq!(decode_score(-0.0), 0);
    }
}
