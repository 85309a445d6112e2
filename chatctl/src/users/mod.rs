//! User accounts: creation, the public user view, and the startup and login flows that assign
//! group memberships.
//!
//! - [`bootstrap`]: Seeding built-in groups and the initial admin
//! - [`login`]: Password login and identity-provider login with group sync

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgConnection;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::auth::password::{self, Argon2Params};
use crate::chat::ChatUser;
use crate::config::PasswordConfig;
use crate::db::handlers::{Repository, Users};
use crate::db::models::users::{UserCreateDBRequest, UserDBResponse};
use crate::errors::{Error, Result};
use crate::types::{GroupId, UserId, abbrev_id};

pub mod bootstrap;
pub mod login;

/// A user as shown to callers. Secrets are reduced to presence flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub email: String,
    pub user_group_ids: Vec<GroupId>,
    pub has_password: bool,
    pub has_api_key: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<UserDBResponse> for User {
    fn from(db: UserDBResponse) -> Self {
        Self {
            id: db.id,
            name: db.name,
            email: db.email,
            user_group_ids: db.user_group_ids,
            has_password: db.password_hash.is_some(),
            has_api_key: db.api_key.is_some(),
            created_at: db.created_at,
            updated_at: db.updated_at,
        }
    }
}

impl From<&User> for ChatUser {
    fn from(user: &User) -> Self {
        Self {
            id: user.id.clone(),
            user_group_ids: user.user_group_ids.clone(),
        }
    }
}

/// Values for a new user. Password and API key are given in the clear and stored hashed.
#[derive(Debug, Clone, Default)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub password: Option<String>,
    pub api_key: Option<String>,
    /// Ordered; may be empty
    pub user_group_ids: Vec<GroupId>,
}

pub(crate) fn check_password_length(password: &str, config: &PasswordConfig) -> Result<()> {
    let len = password.chars().count();
    if len < config.min_length || len > config.max_length {
        return Err(Error::BadRequest {
            message: format!(
                "Password must be between {} and {} characters.",
                config.min_length, config.max_length
            ),
        });
    }
    Ok(())
}

/// Create a user with a fresh UUID, hashing the password (Argon2) and API key (SHA-256).
#[instrument(skip(conn, config, values), fields(groups = values.user_group_ids.len()), err)]
pub async fn create_user(conn: &mut PgConnection, config: &PasswordConfig, values: NewUser) -> Result<User> {
    let password_hash = match values.password.as_deref().filter(|p| !p.is_empty()) {
        Some(password) => {
            check_password_length(password, config)?;
            Some(password::hash_string_with_params(password, Some(Argon2Params::from(config)))?)
        }
        None => None,
    };

    let api_key = values.api_key.as_deref().filter(|k| !k.is_empty()).map(password::hash_api_key);

    let request = UserCreateDBRequest {
        id: Uuid::new_v4().to_string(),
        name: values.name,
        email: values.email,
        api_key,
        password_hash,
        user_group_ids: values.user_group_ids,
    };

    let created = Users::new(conn).create(&request).await?;
    info!("Created user {}", abbrev_id(&created.id));

    Ok(User::from(created))
}
