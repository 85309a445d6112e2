use crate::db::{
    errors::{DbError, Result},
    handlers::repository::Repository,
    models::users::{UserCreateDBRequest, UserDBResponse, UserUpdateDBRequest},
};
use crate::types::{BUILTIN_USER_GROUP_ADMIN, GroupId, UserId, abbrev_id};
use chrono::{DateTime, Utc};
use sqlx::{Connection, FromRow, PgConnection, QueryBuilder};
use std::collections::HashMap;
use tracing::instrument;

/// Filter for listing users
#[derive(Debug, Clone)]
pub struct UserFilter {
    pub skip: i64,
    pub limit: i64,
    pub search: Option<String>, // Case-insensitive substring search on name and email
}

impl UserFilter {
    pub fn new(skip: i64, limit: i64) -> Self {
        Self { skip, limit, search: None }
    }

    pub fn with_search(mut self, search: String) -> Self {
        self.search = Some(search);
        self
    }
}

// Users with their group memberships aggregated in membership order
const SELECT_USERS: &str = r#"
    SELECT
        u.id, u.name, u.email, u.api_key, u.password_hash, u.created_at, u.updated_at,
        COALESCE(
            ARRAY_AGG(m.user_group_id ORDER BY m.position) FILTER (WHERE m.user_group_id IS NOT NULL),
            ARRAY[]::VARCHAR[]
        ) AS user_group_ids
    FROM users u
    LEFT JOIN users_user_groups m ON m.user_id = u.id
"#;

// Database entity model
#[derive(Debug, Clone, FromRow)]
struct User {
    pub id: UserId,
    pub name: String,
    pub email: String,
    pub api_key: Option<String>,
    pub password_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub user_group_ids: Vec<GroupId>,
}

impl From<User> for UserDBResponse {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            name: user.name,
            email: user.email,
            api_key: user.api_key,
            password_hash: user.password_hash,
            created_at: user.created_at,
            updated_at: user.updated_at,
            user_group_ids: user.user_group_ids,
        }
    }
}

pub struct Users<'c> {
    db: &'c mut PgConnection,
}

/// Replace every membership of a user, keeping the order of `group_ids`.
async fn replace_memberships(conn: &mut PgConnection, user_id: &str, group_ids: &[GroupId]) -> Result<()> {
    sqlx::query("DELETE FROM users_user_groups WHERE user_id = $1")
        .bind(user_id)
        .execute(&mut *conn)
        .await?;

    let mut position: i32 = 0;
    for group_id in group_ids {
        let inserted = sqlx::query(
            r#"
            INSERT INTO users_user_groups (user_id, user_group_id, position)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id, user_group_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(group_id)
        .bind(position)
        .execute(&mut *conn)
        .await?;

        // Duplicates keep their first position
        if inserted.rows_affected() > 0 {
            position += 1;
        }
    }

    Ok(())
}

#[async_trait::async_trait]
impl<'c> Repository for Users<'c> {
    type CreateRequest = UserCreateDBRequest;
    type UpdateRequest = UserUpdateDBRequest;
    type Response = UserDBResponse;
    type Id = UserId;
    type Filter = UserFilter;

    #[instrument(skip(self, request), fields(user_id = %abbrev_id(&request.id)), err)]
    async fn create(&mut self, request: &Self::CreateRequest) -> Result<Self::Response> {
        let mut tx = self.db.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO users (id, name, email, api_key, password_hash)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&request.id)
        .bind(&request.name)
        .bind(&request.email)
        .bind(&request.api_key)
        .bind(&request.password_hash)
        .execute(&mut *tx)
        .await?;

        replace_memberships(&mut tx, &request.id, &request.user_group_ids).await?;

        let user = sqlx::query_as::<_, User>(&format!("{SELECT_USERS} WHERE u.id = $1 GROUP BY u.id"))
            .bind(&request.id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(UserDBResponse::from(user))
    }

    #[instrument(skip(self), fields(user_id = %abbrev_id(&id)), err)]
    async fn get_by_id(&mut self, id: Self::Id) -> Result<Option<Self::Response>> {
        let user = sqlx::query_as::<_, User>(&format!("{SELECT_USERS} WHERE u.id = $1 GROUP BY u.id"))
            .bind(&id)
            .fetch_optional(&mut *self.db)
            .await?;

        Ok(user.map(UserDBResponse::from))
    }

    #[instrument(skip(self, ids), fields(count = ids.len()), err)]
    async fn get_bulk(&mut self, ids: Vec<UserId>) -> Result<HashMap<Self::Id, UserDBResponse>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let users = sqlx::query_as::<_, User>(&format!("{SELECT_USERS} WHERE u.id = ANY($1) GROUP BY u.id"))
            .bind(&ids)
            .fetch_all(&mut *self.db)
            .await?;

        Ok(users.into_iter().map(|u| (u.id.clone(), UserDBResponse::from(u))).collect())
    }

    #[instrument(skip(self, filter), fields(limit = filter.limit, skip = filter.skip), err)]
    async fn list(&mut self, filter: &Self::Filter) -> Result<Vec<Self::Response>> {
        let mut query = QueryBuilder::new(SELECT_USERS);
        query.push(" WHERE 1=1");

        if let Some(ref search) = filter.search {
            let search_pattern = format!("%{}%", search.to_lowercase());
            query.push(" AND (LOWER(u.name) LIKE ");
            query.push_bind(search_pattern.clone());
            query.push(" OR LOWER(u.email) LIKE ");
            query.push_bind(search_pattern);
            query.push(")");
        }

        query.push(" GROUP BY u.id ORDER BY u.created_at DESC, u.id LIMIT ");
        query.push_bind(filter.limit);
        query.push(" OFFSET ");
        query.push_bind(filter.skip);

        let users = query.build_query_as::<User>().fetch_all(&mut *self.db).await?;

        Ok(users.into_iter().map(UserDBResponse::from).collect())
    }

    #[instrument(skip(self), fields(user_id = %abbrev_id(&id)), err)]
    async fn delete(&mut self, id: Self::Id) -> Result<bool> {
        // Memberships go with the user (ON DELETE CASCADE)
        let result = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(&id)
            .execute(&mut *self.db)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, request), fields(user_id = %abbrev_id(&id)), err)]
    async fn update(&mut self, id: Self::Id, request: &Self::UpdateRequest) -> Result<Self::Response> {
        let mut tx = self.db.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE users SET
                name = COALESCE($2, name),
                email = COALESCE($3, email),
                api_key = COALESCE($4, api_key),
                password_hash = COALESCE($5, password_hash),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(&id)
        .bind(&request.name)
        .bind(&request.email)
        .bind(&request.api_key)
        .bind(&request.password_hash)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(DbError::NotFound);
        }

        if let Some(group_ids) = &request.user_group_ids {
            replace_memberships(&mut tx, &id, group_ids).await?;
        }

        let user = sqlx::query_as::<_, User>(&format!("{SELECT_USERS} WHERE u.id = $1 GROUP BY u.id"))
            .bind(&id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(UserDBResponse::from(user))
    }
}

impl<'c> Users<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self, email), err)]
    pub async fn get_user_by_email(&mut self, email: &str) -> Result<Option<UserDBResponse>> {
        let user = sqlx::query_as::<_, User>(&format!("{SELECT_USERS} WHERE u.email = $1 GROUP BY u.id"))
            .bind(email)
            .fetch_optional(&mut *self.db)
            .await?;

        Ok(user.map(UserDBResponse::from))
    }

    /// Number of users in the built-in admin group.
    #[instrument(skip(self), err)]
    pub async fn count_admins(&mut self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users_user_groups WHERE user_group_id = $1")
            .bind(BUILTIN_USER_GROUP_ADMIN)
            .fetch_one(&mut *self.db)
            .await?;

        Ok(count)
    }

    /// Replace the user's memberships. An empty list leaves the user without groups.
    #[instrument(skip(self, group_ids), fields(user_id = %abbrev_id(user_id), groups = group_ids.len()), err)]
    pub async fn set_user_groups(&mut self, user_id: &str, group_ids: &[GroupId]) -> Result<()> {
        let mut tx = self.db.begin().await?;

        let exists = sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM users WHERE id = $1)")
            .bind(user_id)
            .fetch_one(&mut *tx)
            .await?;
        if !exists {
            return Err(DbError::NotFound);
        }

        replace_memberships(&mut tx, user_id, group_ids).await?;
        tx.commit().await?;

        Ok(())
    }
}
