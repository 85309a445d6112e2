//! Database models for user groups.

use crate::types::GroupId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Database request for creating a new user group
#[derive(Debug, Clone)]
pub struct UserGroupCreateDBRequest {
    pub id: GroupId,
    pub name: String,
    pub is_admin: bool,
    pub is_built_in: bool,
    pub monthly_tokens: Option<i64>,
    pub monthly_user_tokens: Option<i64>,
}

impl UserGroupCreateDBRequest {
    /// A regular, administrator-created group with a per-user cap.
    pub fn new(id: impl Into<GroupId>, name: impl Into<String>, monthly_user_tokens: Option<i64>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            is_admin: false,
            is_built_in: false,
            monthly_tokens: None,
            monthly_user_tokens,
        }
    }
}

/// Database request for updating a user group. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct UserGroupUpdateDBRequest {
    pub name: Option<String>,
    pub is_admin: Option<bool>,
    pub monthly_tokens: Option<i64>,
    pub monthly_user_tokens: Option<i64>,
}

/// Database response for a user group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserGroupDBResponse {
    pub id: GroupId,
    pub name: String,
    pub is_admin: bool,
    pub is_built_in: bool,
    pub monthly_tokens: Option<i64>,
    pub monthly_user_tokens: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
