//! Appends the tokens reported for each completed request to the usage ledger.

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use tracing::{debug, warn};

use crate::chat::context::{ChatContext, ChatResponse};
use crate::chat::pipeline::{ChatMiddleware, Next};
use crate::config::UsageConfig;
use crate::db::models::usages::UsageIncrement;
use crate::errors::Result;
use crate::quota::UsageLedger;
use crate::types::abbrev_id;

/// Records usage after the inner chain succeeds, keyed by model name.
///
/// Runs right after quota enforcement so that rejected requests are never recorded.
pub struct RecordUsage {
    ledger: Arc<dyn UsageLedger>,
    counter: String,
    today: fn() -> NaiveDate,
}

impl RecordUsage {
    pub const ORDER: i32 = -500;

    pub fn new(config: &UsageConfig, ledger: Arc<dyn UsageLedger>) -> Self {
        Self {
            ledger,
            counter: config.counter.clone(),
            today: || Utc::now().date_naive(),
        }
    }

    /// Replace the clock used to date ledger rows.
    pub fn with_clock(mut self, today: fn() -> NaiveDate) -> Self {
        self.today = today;
        self
    }
}

#[async_trait::async_trait]
impl ChatMiddleware for RecordUsage {
    fn order(&self) -> i32 {
        Self::ORDER
    }

    fn name(&self) -> &'static str {
        "record_usage"
    }

    async fn invoke(&self, ctx: ChatContext, next: Next<'_>) -> Result<ChatResponse> {
        let user_id = ctx.user.id.clone();
        let model = ctx.request.model.clone();

        let response = next.run(ctx).await?;

        let tokens = response.usage.map(|usage| usage.total()).unwrap_or(0);
        if tokens <= 0 {
            debug!("No token usage reported for user {}", abbrev_id(&user_id));
            return Ok(response);
        }

        let increment = UsageIncrement {
            date: (self.today)(),
            user_id,
            counter: self.counter.clone(),
            key: model,
            sub_key: String::new(),
            count: tokens,
        };

        // The request already completed; a lost increment only under-counts
        if let Err(e) = self.ledger.record(&increment).await {
            warn!(
                "Failed to record {} tokens for user {}: {:#}",
                tokens,
                abbrev_id(&increment.user_id),
                e
            );
        }

        Ok(response)
    }
}
