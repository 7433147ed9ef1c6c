use std::sync::Arc;

use chrono::NaiveDate;
use shared::{ContributionTotals, UserTotals};
use tracing::{debug, instrument};

use crate::store::ContributionStore;

/// Sole writer of the rolling-window totals.
///
/// Every run recomputes all windows from the full day history, so a rerun
/// after a partial failure converges on the same values.
pub struct Aggregator {
    store: Arc<dyn ContributionStore>,
}

impl Aggregator {
    pub fn new(store: Arc<dyn ContributionStore>) -> Self {
        Self { store }
    }

    #[instrument(skip(self))]
    pub async fn recompute(&self, user_id: &str, today: NaiveDate) -> anyhow::Result<UserTotals> {
        let mut result = UserTotals::default();
        for provider in self.store.providers_with_days(user_id).await? {
            let days = self.store.days(user_id, provider).await?;
            let totals = ContributionTotals::from_days(days, today);
            debug!("{provider} totals for {user_id}: {totals:?}");
            self.store.replace_totals(user_id, provider, totals).await?;
            result.set(provider, totals);
        }
        Ok(result)
    }
}
