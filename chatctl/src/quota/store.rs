//! PostgreSQL-backed quota storage.

use sqlx::PgPool;

use crate::db::errors::Result;
use crate::db::handlers::{Repository, UserGroups, Usages};
use crate::db::models::usages::{UsageIncrement, UsageSumQuery};
use crate::db::models::user_groups::UserGroupDBResponse;
use crate::quota::ledger::UsageLedger;
use crate::quota::policy::GroupLookup;

/// Ledger and group lookup over the connection pool. Each call runs on its own pooled connection.
#[derive(Clone)]
pub struct PgQuotaStore {
    pool: PgPool,
}

impl PgQuotaStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl UsageLedger for PgQuotaStore {
    async fn sum(&self, query: &UsageSumQuery) -> Result<i64> {
        let mut conn = self.pool.acquire().await?;
        Usages::new(&mut conn).sum(query).await
    }

    async fn record(&self, increment: &UsageIncrement) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        Usages::new(&mut conn).record(increment).await
    }
}

#[async_trait::async_trait]
impl GroupLookup for PgQuotaStore {
    async fn find_by_id(&self, id: &str) -> Result<Option<UserGroupDBResponse>> {
        let mut conn = self.pool.acquire().await?;
        UserGroups::new(&mut conn).get_by_id(id.to_string()).await
    }
}
