//! Monthly token quotas for chat requests.
//!
//! A user's quota comes from the first group in their membership list. That group can cap the
//! tokens used by the whole group (`monthly_tokens`) and by each member individually
//! (`monthly_user_tokens`), counted over the current calendar month in UTC. Members of the built-in
//! `admin` and `default` groups are never limited.
//!
//! - [`policy`]: Resolving a user's groups into a [`QuotaPolicy`]
//! - [`window`]: The calendar-month accounting window
//! - [`ledger`]: The [`UsageLedger`] seam plus an in-memory implementation
//! - [`store`]: The PostgreSQL-backed ledger and group lookup
//! - [`enforcement`]: The [`CheckUsage`] pipeline stage that rejects over-quota requests

use serde::{Deserialize, Serialize};

pub mod enforcement;
pub mod ledger;
pub mod policy;
pub mod store;
pub mod window;

#[cfg(test)]
pub(crate) mod testing;

pub use enforcement::{CapCheck, CheckUsage, Evaluation};
pub use ledger::{InMemoryLedger, UsageLedger};
pub use policy::{Cap, CapScope, GroupLookup, PolicyResolver, QuotaPolicy, ZeroCapPolicy};
pub use store::PgQuotaStore;
pub use window::MonthWindow;

/// What the enforcement stage does when the ledger or the group lookup fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerErrorPolicy {
    /// Reject the request with a database error
    #[default]
    FailClosed,
    /// Log a warning and let the request through unchecked
    FailOpen,
}
