//! First-start seeding: the built-in groups and the initial admin.
//!
//! Both steps are idempotent and safe to run on every start.

use sqlx::{Connection, PgConnection, PgPool};
use tracing::{info, instrument};

use crate::auth::password::{self, Argon2Params};
use crate::config::{AdminConfig, Config, PasswordConfig};
use crate::db::handlers::{Repository, UserGroups, Users};
use crate::db::models::user_groups::UserGroupCreateDBRequest;
use crate::db::models::users::UserUpdateDBRequest;
use crate::errors::Result;
use crate::types::{BUILTIN_USER_GROUP_ADMIN, BUILTIN_USER_GROUP_DEFAULT};
use crate::users::{NewUser, User, check_password_length, create_user};

/// Seed the `admin` and `default` groups. Does nothing if any group exists.
///
/// Returns whether the groups were created.
#[instrument(skip(conn), err)]
pub async fn setup_user_groups(conn: &mut PgConnection) -> Result<bool> {
    let mut tx = conn.begin().await?;
    let mut groups = UserGroups::new(&mut tx);

    if groups.count().await? > 0 {
        return Ok(false);
    }

    for (id, name, is_admin) in [
        (BUILTIN_USER_GROUP_ADMIN, "Admin", true),
        (BUILTIN_USER_GROUP_DEFAULT, "Default", false),
    ] {
        groups
            .create(&UserGroupCreateDBRequest {
                id: id.to_string(),
                name: name.to_string(),
                is_admin,
                is_built_in: true,
                monthly_tokens: None,
                monthly_user_tokens: None,
            })
            .await?;
    }

    tx.commit().await?;
    info!("Created built-in user groups");
    Ok(true)
}

/// Make sure the configured admin exists and is in the admin group.
///
/// Needs both `admin.email` and `admin.password`. Skipped when some admin already exists, unless
/// `admin.role_required` is set. An existing user with that email has their memberships replaced by
/// just the admin group; their password and API key are only filled in when missing.
#[instrument(skip(conn, admin, password_config), err)]
pub async fn setup_admins(
    conn: &mut PgConnection,
    admin: &AdminConfig,
    password_config: &PasswordConfig,
) -> Result<Option<User>> {
    let (Some(email), Some(admin_password)) = (admin.email.as_deref(), admin.password.as_deref()) else {
        return Ok(None);
    };

    let mut tx = conn.begin().await?;

    if Users::new(&mut tx).count_admins().await? > 0 && !admin.role_required {
        return Ok(None);
    }

    let existing = Users::new(&mut tx).get_user_by_email(email).await?;

    let user = match existing {
        Some(existing) => {
            let password_hash = match existing.password_hash {
                Some(_) => None,
                None => {
                    check_password_length(admin_password, password_config)?;
                    Some(password::hash_string_with_params(
                        admin_password,
                        Some(Argon2Params::from(password_config)),
                    )?)
                }
            };
            let api_key = match existing.api_key {
                Some(_) => None,
                None => admin.api_key.as_deref().map(password::hash_api_key),
            };

            let updated = Users::new(&mut tx)
                .update(
                    existing.id,
                    &UserUpdateDBRequest {
                        password_hash,
                        api_key,
                        user_group_ids: Some(vec![BUILTIN_USER_GROUP_ADMIN.to_string()]),
                        ..Default::default()
                    },
                )
                .await?;

            info!("Granted admin to existing user with email '{}'", email);
            User::from(updated)
        }
        None => {
            let created = create_user(
                &mut tx,
                password_config,
                NewUser {
                    name: email.to_string(),
                    email: email.to_string(),
                    password: Some(admin_password.to_string()),
                    api_key: admin.api_key.clone(),
                    user_group_ids: vec![BUILTIN_USER_GROUP_ADMIN.to_string()],
                },
            )
            .await?;

            info!("Created initial admin with email '{}'", email);
            created
        }
    };

    tx.commit().await?;
    Ok(Some(user))
}

/// Run migrations, then seed groups and the initial admin.
#[instrument(skip_all, err)]
pub async fn bootstrap(pool: &PgPool, config: &Config) -> anyhow::Result<()> {
    crate::migrator().run(pool).await?;

    let mut conn = pool.acquire().await?;
    setup_user_groups(&mut conn).await?;
    setup_admins(&mut conn, &config.admin, &config.auth.password).await?;

    Ok(())
}
