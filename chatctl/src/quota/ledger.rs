//! The usage ledger seam.
//!
//! Enforcement only needs two things from storage: a sum over a window and an atomic increment.
//! [`PgQuotaStore`](super::PgQuotaStore) backs both with PostgreSQL; [`InMemoryLedger`] keeps the
//! same aggregation rules in process memory.

use chrono::NaiveDate;
use dashmap::DashMap;

use crate::db::errors::Result;
use crate::db::models::usages::{UsageIncrement, UsageOwner, UsageSumQuery};
use crate::types::{GroupId, UserId};

#[async_trait::async_trait]
pub trait UsageLedger: Send + Sync {
    /// Total count for the query's owner and counter over `[date_from, date_to)`. No rows sums to 0.
    async fn sum(&self, query: &UsageSumQuery) -> Result<i64>;

    /// Add to the row identified by `(date, user_id, counter, key, sub_key)`.
    async fn record(&self, increment: &UsageIncrement) -> Result<()>;
}

type RowKey = (NaiveDate, UserId, String, String, String);

/// Ledger held in memory, aggregated the same way as the `usages` table.
///
/// Group sums cover the users registered through [`InMemoryLedger::set_memberships`].
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    rows: DashMap<RowKey, i64>,
    memberships: DashMap<UserId, Vec<GroupId>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the groups `user_id` counts towards for group-wide sums.
    pub fn set_memberships(&self, user_id: impl Into<UserId>, group_ids: Vec<GroupId>) {
        self.memberships.insert(user_id.into(), group_ids);
    }

    /// Number of distinct aggregated rows.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    fn owns(&self, owner: &UsageOwner, user_id: &str) -> bool {
        match owner {
            UsageOwner::User(id) => id == user_id,
            UsageOwner::Group(group_id) => self
                .memberships
                .get(user_id)
                .is_some_and(|groups| groups.iter().any(|g| g == group_id)),
        }
    }
}

#[async_trait::async_trait]
impl UsageLedger for InMemoryLedger {
    async fn sum(&self, query: &UsageSumQuery) -> Result<i64> {
        let total = self
            .rows
            .iter()
            .filter(|row| {
                let (date, user_id, counter, _, _) = row.key();
                query.date_from <= *date
                    && *date < query.date_to
                    && query.counter.as_ref().is_none_or(|c| c == counter)
                    && self.owns(&query.owner, user_id)
            })
            .map(|row| *row.value())
            .sum();

        Ok(total)
    }

    async fn record(&self, increment: &UsageIncrement) -> Result<()> {
        let key = (
            increment.date,
            increment.user_id.clone(),
            increment.counter.clone(),
            increment.key.clone(),
            increment.sub_key.clone(),
        );
        *self.rows.entry(key).or_insert(0) += increment.count;
        Ok(())
    }
}
