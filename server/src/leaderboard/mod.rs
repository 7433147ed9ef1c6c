use std::sync::Arc;

use shared::{IntoEnumIterator, ProviderSelector, UserTotals, Window};
use tracing::{info, instrument, warn};

use crate::{
    ranking::{Board, RankingStore},
    store::ContributionStore,
};

mod reader;

pub use reader::*;

/// Sole writer of the ranking index.
///
/// The index is only ever derived from the relational totals, so a crash
/// between the totals write and [`Synchronizer::sync`] is repaired by
/// syncing the user again or by [`Synchronizer::rebuild`].
pub struct Synchronizer {
    store: Arc<dyn ContributionStore>,
    ranking: Arc<dyn RankingStore>,
}

pub fn board_scores(totals: &UserTotals) -> Vec<(Board, u64)> {
    Board::all()
        .into_iter()
        .map(|board| (board, totals.score(board.window, board.selector)))
        .collect()
}

impl Synchronizer {
    pub fn new(store: Arc<dyn ContributionStore>, ranking: Arc<dyn RankingStore>) -> Self {
        Self { store, ranking }
    }

    /// Pushes the user's stored totals into every board, or drops the user
    /// from the index when nothing is stored.
    #[instrument(skip(self))]
    pub async fn sync(&self, user_id: &str) -> anyhow::Result<UserTotals> {
        let totals = self.store.totals(user_id).await?;
        if totals.is_empty() {
            self.ranking.remove(user_id, &Board::all()).await?;
        } else {
            self.ranking.set_scores(user_id, &board_scores(&totals)).await?;
        }
        Ok(totals)
    }

    /// Recreates the whole index from the relational totals.
    #[instrument(skip(self))]
    pub async fn rebuild(&self) -> anyhow::Result<usize> {
        self.ranking.clear(&Board::all()).await?;
        let users = self.store.users_with_totals().await?;
        let mut synced = 0;
        for user_id in &users {
            match self.sync(user_id).await {
                Ok(_) => synced += 1,
                Err(e) => warn!("Failed to sync {user_id} during rebuild: {e:#}"),
            }
        }
        info!("Rebuilt ranking index with {synced}/{} users", users.len());
        Ok(synced)
    }

    /// Number of entries per board, for spotting a drifted index.
    pub async fn board_sizes(&self) -> anyhow::Result<Vec<(Window, ProviderSelector, u64)>> {
        let mut sizes = Vec::new();
        for window in Window::iter() {
            for selector in ProviderSelector::iter() {
                let len = self.ranking.len(Board::new(window, selector)).await?;
                sizes.push((window, selector, len));
            }
        }
        Ok(sizes)
    }
}
