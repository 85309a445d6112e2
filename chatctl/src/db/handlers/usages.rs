//! Database access for the aggregated usage ledger.
//!
//! The ledger is append-by-increment: each `(date, user_id, counter, key, sub_key)` row holds a
//! running count, and recording the same tuple again adds to it atomically.

use crate::db::{
    errors::Result,
    models::usages::{UsageDBResponse, UsageFilter, UsageIncrement, UsageOwner, UsageSumQuery},
};
use crate::types::{UserId, abbrev_id};
use chrono::NaiveDate;
use sqlx::{FromRow, PgConnection, QueryBuilder};
use tracing::instrument;

// Database entity model
#[derive(Debug, Clone, FromRow)]
struct Usage {
    pub date: NaiveDate,
    pub user_id: UserId,
    pub counter: String,
    pub key: String,
    pub sub_key: String,
    pub count: i64,
}

impl From<Usage> for UsageDBResponse {
    fn from(usage: Usage) -> Self {
        Self {
            date: usage.date,
            user_id: usage.user_id,
            counter: usage.counter,
            key: usage.key,
            sub_key: usage.sub_key,
            count: usage.count,
        }
    }
}

pub struct Usages<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Usages<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// Add `increment.count` to its ledger row, creating the row if needed.
    #[instrument(skip(self, increment), fields(user_id = %abbrev_id(&increment.user_id), counter = %increment.counter, count = increment.count), err)]
    pub async fn record(&mut self, increment: &UsageIncrement) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO usages (date, user_id, counter, key, sub_key, count)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (date, user_id, counter, key, sub_key)
            DO UPDATE SET count = usages.count + EXCLUDED.count
            "#,
        )
        .bind(increment.date)
        .bind(&increment.user_id)
        .bind(&increment.counter)
        .bind(&increment.key)
        .bind(&increment.sub_key)
        .bind(increment.count)
        .execute(&mut *self.db)
        .await?;

        Ok(())
    }

    /// Sum of counts over `[date_from, date_to)` for a user or every current member of a group.
    #[instrument(skip(self, query), fields(owner = ?query.owner, from = %query.date_from, to = %query.date_to), err)]
    pub async fn sum(&mut self, query: &UsageSumQuery) -> Result<i64> {
        let mut builder = QueryBuilder::new("SELECT COALESCE(SUM(count), 0)::BIGINT FROM usages WHERE date >= ");
        builder.push_bind(query.date_from);
        builder.push(" AND date < ");
        builder.push_bind(query.date_to);

        match &query.owner {
            UsageOwner::User(user_id) => {
                builder.push(" AND user_id = ");
                builder.push_bind(user_id.clone());
            }
            UsageOwner::Group(group_id) => {
                builder.push(" AND user_id IN (SELECT user_id FROM users_user_groups WHERE user_group_id = ");
                builder.push_bind(group_id.clone());
                builder.push(")");
            }
        }

        if let Some(counter) = &query.counter {
            builder.push(" AND counter = ");
            builder.push_bind(counter.clone());
        }

        let total = builder.build_query_scalar::<i64>().fetch_one(&mut *self.db).await?;

        Ok(total)
    }

    /// Ledger rows of one user, newest first.
    #[instrument(skip(self, filter), fields(user_id = %abbrev_id(&filter.user_id)), err)]
    pub async fn list(&mut self, filter: &UsageFilter) -> Result<Vec<UsageDBResponse>> {
        let rows = sqlx::query_as::<_, Usage>(
            r#"
            SELECT date, user_id, counter, key, sub_key, count
            FROM usages
            WHERE user_id = $1 AND date >= $2 AND date < $3
            ORDER BY date DESC, counter, key, sub_key
            "#,
        )
        .bind(&filter.user_id)
        .bind(filter.date_from)
        .bind(filter.date_to)
        .fetch_all(&mut *self.db)
        .await?;

        Ok(rows.into_iter().map(UsageDBResponse::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::handlers::{Repository, UserGroups, Users};
    use crate::db::models::{user_groups::UserGroupCreateDBRequest, users::UserCreateDBRequest};
    use sqlx::PgPool;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn increment(date: NaiveDate, user_id: &str, counter: &str, key: &str, count: i64) -> UsageIncrement {
        UsageIncrement {
            date,
            user_id: user_id.to_string(),
            counter: counter.to_string(),
            key: key.to_string(),
            sub_key: String::new(),
            count,
        }
    }

    fn user_sum(user_id: &str, counter: Option<&str>, from: NaiveDate, to: NaiveDate) -> UsageSumQuery {
        UsageSumQuery {
            counter: counter.map(str::to_string),
            date_from: from,
            date_to: to,
            owner: UsageOwner::User(user_id.to_string()),
        }
    }

    async fn seed_user(conn: &mut PgConnection, id: &str, groups: &[&str]) {
        Users::new(conn)
            .create(&UserCreateDBRequest {
                id: id.to_string(),
                name: id.to_string(),
                email: format!("{id}@example.com"),
                api_key: None,
                password_hash: None,
                user_group_ids: groups.iter().map(|g| g.to_string()).collect(),
            })
            .await
            .unwrap();
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_record_accumulates_same_row(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        seed_user(&mut conn, "u1", &[]).await;

        let mut repo = Usages::new(&mut conn);
        let day = ymd(2025, 3, 10);
        repo.record(&increment(day, "u1", "token_count", "gpt", 30)).await.unwrap();
        repo.record(&increment(day, "u1", "token_count", "gpt", 12)).await.unwrap();

        let rows = repo
            .list(&UsageFilter {
                user_id: "u1".to_string(),
                date_from: ymd(2025, 3, 1),
                date_to: ymd(2025, 4, 1),
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].count, 42);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_sum_respects_window_and_counter(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        seed_user(&mut conn, "u1", &[]).await;

        let mut repo = Usages::new(&mut conn);
        repo.record(&increment(ymd(2025, 2, 28), "u1", "token_count", "a", 100)).await.unwrap();
        repo.record(&increment(ymd(2025, 3, 1), "u1", "token_count", "a", 5)).await.unwrap();
        repo.record(&increment(ymd(2025, 3, 31), "u1", "token_count", "b", 7)).await.unwrap();
        repo.record(&increment(ymd(2025, 3, 15), "u1", "requests", "a", 1)).await.unwrap();
        repo.record(&increment(ymd(2025, 4, 1), "u1", "token_count", "a", 1000)).await.unwrap();

        let (from, to) = (ymd(2025, 3, 1), ymd(2025, 4, 1));
        assert_eq!(repo.sum(&user_sum("u1", Some("token_count"), from, to)).await.unwrap(), 12);
        assert_eq!(repo.sum(&user_sum("u1", None, from, to)).await.unwrap(), 13);
        assert_eq!(repo.sum(&user_sum("nobody", None, from, to)).await.unwrap(), 0);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_group_sum_covers_current_members(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        UserGroups::new(&mut conn)
            .create(&UserGroupCreateDBRequest::new("g1", "Group One", None))
            .await
            .unwrap();
        seed_user(&mut conn, "u1", &["g1"]).await;
        seed_user(&mut conn, "u2", &["g1"]).await;
        seed_user(&mut conn, "u3", &[]).await;

        let mut repo = Usages::new(&mut conn);
        let day = ymd(2025, 3, 10);
        repo.record(&increment(day, "u1", "token_count", "m", 10)).await.unwrap();
        repo.record(&increment(day, "u2", "token_count", "m", 20)).await.unwrap();
        repo.record(&increment(day, "u3", "token_count", "m", 40)).await.unwrap();

        let total = repo
            .sum(&UsageSumQuery {
                counter: Some("token_count".to_string()),
                date_from: ymd(2025, 3, 1),
                date_to: ymd(2025, 4, 1),
                owner: UsageOwner::Group("g1".to_string()),
            })
            .await
            .unwrap();
        assert_eq!(total, 30);
    }
}
