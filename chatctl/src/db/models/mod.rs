//! Database record models matching table schemas.
//!
//! These models are used by repositories to return query results and accept insertion/update data.
//! Request types carry already-validated, already-hashed values; response types mirror table rows.
//!
//! - [`users`]: User accounts and their ordered group memberships
//! - [`user_groups`]: Quota-bearing user groups
//! - [`usages`]: The aggregated usage ledger

pub mod usages;
pub mod user_groups;
pub mod users;
