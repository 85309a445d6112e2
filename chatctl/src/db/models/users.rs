//! Database models for users.

use crate::types::{GroupId, UserId};
use chrono::{DateTime, Utc};

/// Database request for creating a new user.
///
/// Credentials arrive already hashed: `password_hash` is an Argon2 PHC string and `api_key` the
/// SHA-256 digest of the raw key.
#[derive(Debug, Clone)]
pub struct UserCreateDBRequest {
    pub id: UserId,
    pub name: String,
    pub email: String,
    pub api_key: Option<String>,
    pub password_hash: Option<String>,
    /// Ordered; the first entry decides the quota
    pub user_group_ids: Vec<GroupId>,
}

/// Database request for updating a user. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct UserUpdateDBRequest {
    pub name: Option<String>,
    pub email: Option<String>,
    pub api_key: Option<String>,
    pub password_hash: Option<String>,
    /// Replaces all memberships when set
    pub user_group_ids: Option<Vec<GroupId>>,
}

/// Database response for a user
#[derive(Debug, Clone)]
pub struct UserDBResponse {
    pub id: UserId,
    pub name: String,
    pub email: String,
    pub api_key: Option<String>,
    pub password_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub user_group_ids: Vec<GroupId>,
}
