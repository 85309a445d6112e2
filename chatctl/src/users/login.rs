//! Login-time user resolution.
//!
//! Password logins check the stored Argon2 hash. Identity-provider logins upsert the user and,
//! when `auth.accept_user_groups_from_auth_provider` is enabled, take the group memberships from
//! the provider's claims.

use serde_json::Value;
use sqlx::{Connection, PgConnection};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::auth::password;
use crate::config::AuthConfig;
use crate::db::handlers::{Repository, UserGroups, Users};
use crate::db::models::users::{UserCreateDBRequest, UserDBResponse, UserUpdateDBRequest};
use crate::errors::{Error, Result};
use crate::types::{BUILTIN_USER_GROUP_ADMIN, BUILTIN_USER_GROUP_DEFAULT, GroupId, UserId, abbrev_id};
use crate::users::User;

/// Identity asserted by an external provider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderUser {
    pub id: Option<UserId>,
    pub email: Option<String>,
    pub name: String,
    /// Group ids claimed by the provider, in claim order
    pub user_group_ids: Vec<GroupId>,
}

impl ProviderUser {
    /// Read an identity from provider user info, taking groups from the configured claim.
    ///
    /// The group claim may be a list of strings or a single string; anything else yields no groups.
    pub fn from_claims(claims: &Value, config: &AuthConfig) -> Self {
        let text = |key: &str| claims.get(key).and_then(Value::as_str).map(str::to_string);

        let user_group_ids = match claims.get(&config.user_groups_property_name) {
            Some(Value::Array(values)) => values.iter().filter_map(Value::as_str).map(str::to_string).collect(),
            Some(Value::String(single)) => vec![single.clone()],
            _ => Vec::new(),
        };

        let email = text("email");
        Self {
            id: text("sub").or_else(|| text("id")),
            name: text("name").or_else(|| email.clone()).unwrap_or_default(),
            email,
            user_group_ids,
        }
    }
}

/// Check an email/password pair.
#[instrument(skip(conn, email, password), err)]
pub async fn login_with_password(conn: &mut PgConnection, email: &str, password: &str) -> Result<User> {
    let user = Users::new(conn).get_user_by_email(email).await?;

    let Some((user, hash)) = user.and_then(|u| u.password_hash.clone().map(|h| (u, h))) else {
        return Err(Error::BadRequest {
            message: "Unknown user.".to_string(),
        });
    };

    if !password::verify_string(password, &hash)? {
        return Err(Error::BadRequest {
            message: "Wrong password.".to_string(),
        });
    }

    Ok(User::from(user))
}

/// Create or update the user behind a provider login and return it as stored.
///
/// A new user gets the provider's groups (when accepted) plus a mandatory group: `admin` while no
/// admin exists yet, `default` otherwise. An existing user only has their memberships touched when
/// provider groups are accepted, in which case they are replaced, possibly by nothing.
#[instrument(skip(conn, config, login), fields(email = ?login.email), err)]
pub async fn sync_login_user(conn: &mut PgConnection, config: &AuthConfig, login: &ProviderUser) -> Result<User> {
    let mut tx = conn.begin().await?;

    let existing = find_login_user(&mut tx, login).await?;

    let accepted_groups: Vec<GroupId> = if config.accept_user_groups_from_auth_provider {
        UserGroups::new(&mut tx)
            .find_existing(&login.user_group_ids)
            .await?
            .into_iter()
            .map(|g| g.id)
            .collect()
    } else {
        Vec::new()
    };

    let user = match existing {
        None => {
            let Some(email) = login.email.clone() else {
                return Err(Error::BadRequest {
                    message: "The identity provider did not return an email address.".to_string(),
                });
            };

            let mandatory = if Users::new(&mut tx).count_admins().await? == 0 {
                BUILTIN_USER_GROUP_ADMIN
            } else {
                BUILTIN_USER_GROUP_DEFAULT
            };
            let mut user_group_ids = accepted_groups;
            if !user_group_ids.iter().any(|g| g == mandatory) {
                user_group_ids.push(mandatory.to_string());
            }

            let created = Users::new(&mut tx)
                .create(&UserCreateDBRequest {
                    id: login.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string()),
                    name: login.name.clone(),
                    email,
                    api_key: None,
                    password_hash: None,
                    user_group_ids,
                })
                .await?;
            info!("Created user {} on first login", abbrev_id(&created.id));
            created
        }
        Some(existing) if config.accept_user_groups_from_auth_provider => {
            debug!(
                "Replacing groups of user {} with {:?} from auth provider",
                abbrev_id(&existing.id),
                accepted_groups
            );
            Users::new(&mut tx)
                .update(
                    existing.id,
                    &UserUpdateDBRequest {
                        name: Some(login.name.clone()).filter(|n| !n.is_empty()),
                        user_group_ids: Some(accepted_groups),
                        ..Default::default()
                    },
                )
                .await?
        }
        Some(existing) => existing,
    };

    tx.commit().await?;
    Ok(User::from(user))
}

async fn find_login_user(conn: &mut PgConnection, login: &ProviderUser) -> Result<Option<UserDBResponse>> {
    let mut users = Users::new(conn);
    match (&login.email, &login.id) {
        (Some(email), _) => Ok(users.get_user_by_email(email).await?),
        (None, Some(id)) => Ok(users.get_by_id(id.clone()).await?),
        (None, None) => Err(Error::BadRequest {
            message: "The identity provider returned neither an email nor an id.".to_string(),
        }),
    }
}
