//! Fixtures shared by the quota tests.

use chrono::Utc;

use crate::db::errors::{DbError, Result};
use crate::db::models::usages::{UsageIncrement, UsageSumQuery};
use crate::db::models::user_groups::UserGroupDBResponse;
use crate::quota::ledger::UsageLedger;
use crate::quota::policy::GroupLookup;

pub(crate) fn group(id: &str, monthly_tokens: Option<i64>, monthly_user_tokens: Option<i64>) -> UserGroupDBResponse {
    let now = Utc::now();
    UserGroupDBResponse {
        id: id.to_string(),
        name: id.to_string(),
        is_admin: false,
        is_built_in: false,
        monthly_tokens,
        monthly_user_tokens,
        created_at: now,
        updated_at: now,
    }
}

/// Storage that is always unreachable.
pub(crate) struct FailingLedger;

fn unreachable_storage() -> DbError {
    DbError::Other(anyhow::anyhow!("connection refused"))
}

#[async_trait::async_trait]
impl UsageLedger for FailingLedger {
    async fn sum(&self, _query: &UsageSumQuery) -> Result<i64> {
        Err(unreachable_storage())
    }

    async fn record(&self, _increment: &UsageIncrement) -> Result<()> {
        Err(unreachable_storage())
    }
}

#[async_trait::async_trait]
impl GroupLookup for FailingLedger {
    async fn find_by_id(&self, _id: &str) -> Result<Option<UserGroupDBResponse>> {
        Err(unreachable_storage())
    }
}
