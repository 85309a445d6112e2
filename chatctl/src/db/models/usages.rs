//! Database models for the usage ledger.

use crate::types::{GroupId, UserId};
use chrono::NaiveDate;
use serde::Serialize;

/// Amount to add to one aggregated ledger row.
///
/// `(date, user_id, counter, key, sub_key)` identifies the row; recording the same tuple again adds
/// to its count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageIncrement {
    pub date: NaiveDate,
    pub user_id: UserId,
    pub counter: String,
    pub key: String,
    pub sub_key: String,
    pub count: i64,
}

/// Whose usage a sum covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsageOwner {
    User(UserId),
    /// Every current member of the group
    Group(GroupId),
}

/// Summation over `[date_from, date_to)`.
#[derive(Debug, Clone)]
pub struct UsageSumQuery {
    /// `None` sums all counters
    pub counter: Option<String>,
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    pub owner: UsageOwner,
}

/// Filter for listing ledger rows of one user
#[derive(Debug, Clone)]
pub struct UsageFilter {
    pub user_id: UserId,
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
}

/// Database response for an aggregated ledger row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageDBResponse {
    pub date: NaiveDate,
    pub user_id: UserId,
    pub counter: String,
    pub key: String,
    pub sub_key: String,
    pub count: i64,
}
