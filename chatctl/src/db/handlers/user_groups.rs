//! Database repository for user groups.

use std::collections::HashMap;

use crate::db::{
    errors::{DbError, Result},
    handlers::repository::Repository,
    models::user_groups::{UserGroupCreateDBRequest, UserGroupDBResponse, UserGroupUpdateDBRequest},
};
use crate::types::{GroupId, Operation};
use chrono::{DateTime, Utc};
use sqlx::{Connection, FromRow, PgConnection};
use tracing::instrument;

/// Filter for listing user groups
#[derive(Debug, Clone)]
pub struct UserGroupFilter {
    pub skip: i64,
    pub limit: i64,
    pub search: Option<String>, // Case-insensitive substring search on id and name
}

impl UserGroupFilter {
    pub fn new(skip: i64, limit: i64) -> Self {
        Self { skip, limit, search: None }
    }

    pub fn with_search(mut self, search: String) -> Self {
        self.search = Some(search);
        self
    }
}

// Database entity model
#[derive(Debug, Clone, FromRow)]
struct UserGroup {
    pub id: GroupId,
    pub name: String,
    pub is_admin: bool,
    pub is_built_in: bool,
    pub monthly_tokens: Option<i64>,
    pub monthly_user_tokens: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<UserGroup> for UserGroupDBResponse {
    fn from(group: UserGroup) -> Self {
        Self {
            id: group.id,
            name: group.name,
            is_admin: group.is_admin,
            is_built_in: group.is_built_in,
            monthly_tokens: group.monthly_tokens,
            monthly_user_tokens: group.monthly_user_tokens,
            created_at: group.created_at,
            updated_at: group.updated_at,
        }
    }
}

pub struct UserGroups<'c> {
    db: &'c mut PgConnection,
}

#[async_trait::async_trait]
impl<'c> Repository for UserGroups<'c> {
    type CreateRequest = UserGroupCreateDBRequest;
    type UpdateRequest = UserGroupUpdateDBRequest;
    type Response = UserGroupDBResponse;
    type Id = GroupId;
    type Filter = UserGroupFilter;

    #[instrument(skip(self, request), fields(group_id = %request.id), err)]
    async fn create(&mut self, request: &Self::CreateRequest) -> Result<Self::Response> {
        let group = sqlx::query_as::<_, UserGroup>(
            r#"
            INSERT INTO user_groups (id, name, is_admin, is_built_in, monthly_tokens, monthly_user_tokens)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(&request.id)
        .bind(&request.name)
        .bind(request.is_admin)
        .bind(request.is_built_in)
        .bind(request.monthly_tokens)
        .bind(request.monthly_user_tokens)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(UserGroupDBResponse::from(group))
    }

    #[instrument(skip(self), fields(group_id = %id), err)]
    async fn get_by_id(&mut self, id: Self::Id) -> Result<Option<Self::Response>> {
        let group = sqlx::query_as::<_, UserGroup>("SELECT * FROM user_groups WHERE id = $1")
            .bind(&id)
            .fetch_optional(&mut *self.db)
            .await?;

        Ok(group.map(UserGroupDBResponse::from))
    }

    #[instrument(skip(self, ids), fields(count = ids.len()), err)]
    async fn get_bulk(&mut self, ids: Vec<GroupId>) -> Result<HashMap<GroupId, UserGroupDBResponse>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let groups = sqlx::query_as::<_, UserGroup>("SELECT * FROM user_groups WHERE id = ANY($1)")
            .bind(&ids)
            .fetch_all(&mut *self.db)
            .await?;

        Ok(groups.into_iter().map(|g| (g.id.clone(), UserGroupDBResponse::from(g))).collect())
    }

    #[instrument(skip(self, filter), fields(limit = filter.limit, skip = filter.skip), err)]
    async fn list(&mut self, filter: &Self::Filter) -> Result<Vec<Self::Response>> {
        use sqlx::QueryBuilder;

        let mut query = QueryBuilder::new("SELECT * FROM user_groups WHERE 1=1");

        if let Some(ref search) = filter.search {
            let search_pattern = format!("%{}%", search.to_lowercase());
            query.push(" AND (LOWER(id) LIKE ");
            query.push_bind(search_pattern.clone());
            query.push(" OR LOWER(name) LIKE ");
            query.push_bind(search_pattern);
            query.push(")");
        }

        // Built-in groups first, then alphabetical
        query.push(" ORDER BY is_built_in DESC, name LIMIT ");
        query.push_bind(filter.limit);
        query.push(" OFFSET ");
        query.push_bind(filter.skip);

        let groups = query.build_query_as::<UserGroup>().fetch_all(&mut *self.db).await?;

        tracing::debug!("Retrieved {} user groups", groups.len());

        Ok(groups.into_iter().map(UserGroupDBResponse::from).collect())
    }

    #[instrument(skip(self), fields(group_id = %id), err)]
    async fn delete(&mut self, id: Self::Id) -> Result<bool> {
        let mut tx = self.db.begin().await?;

        let is_built_in = sqlx::query_scalar::<_, bool>("SELECT is_built_in FROM user_groups WHERE id = $1")
            .bind(&id)
            .fetch_optional(&mut *tx)
            .await?;

        match is_built_in {
            None => return Ok(false),
            Some(true) => {
                return Err(DbError::ProtectedEntity {
                    operation: Operation::Delete,
                    reason: "Built-in user groups cannot be deleted".to_string(),
                    entity_type: "UserGroup".to_string(),
                    entity_id: Some(id),
                });
            }
            Some(false) => {}
        }

        sqlx::query("DELETE FROM users_user_groups WHERE user_group_id = $1")
            .bind(&id)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query("DELETE FROM user_groups WHERE id = $1")
            .bind(&id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, request), fields(group_id = %id), err)]
    async fn update(&mut self, id: Self::Id, request: &Self::UpdateRequest) -> Result<Self::Response> {
        let group = sqlx::query_as::<_, UserGroup>(
            r#"
            UPDATE user_groups SET
                name = COALESCE($2, name),
                is_admin = COALESCE($3, is_admin),
                monthly_tokens = COALESCE($4, monthly_tokens),
                monthly_user_tokens = COALESCE($5, monthly_user_tokens),
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(&id)
        .bind(&request.name)
        .bind(request.is_admin)
        .bind(request.monthly_tokens)
        .bind(request.monthly_user_tokens)
        .fetch_optional(&mut *self.db)
        .await?
        .ok_or(DbError::NotFound)?;

        Ok(UserGroupDBResponse::from(group))
    }
}

impl<'c> UserGroups<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self), err)]
    pub async fn count(&mut self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM user_groups")
            .fetch_one(&mut *self.db)
            .await?;

        Ok(count)
    }

    /// Groups among `ids` that exist, in the order given. Unknown ids are dropped.
    #[instrument(skip(self, ids), fields(count = ids.len()), err)]
    pub async fn find_existing(&mut self, ids: &[GroupId]) -> Result<Vec<UserGroupDBResponse>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut found = self.get_bulk(ids.to_vec()).await?;
        Ok(ids.iter().filter_map(|id| found.remove(id)).collect())
    }
}
