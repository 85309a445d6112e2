//! Repository implementations for database access.
//!
//! Each repository wraps a borrowed `PgConnection` (a pooled connection or an open transaction),
//! binds parameters, and returns the models from [`crate::db::models`].
//!
//! - [`Users`]: User accounts and their ordered group memberships
//! - [`UserGroups`]: Quota-bearing user groups
//! - [`Usages`]: The aggregated usage ledger (not a [`Repository`]; rows are only ever incremented)
//!
//! ```ignore
//! use chatctl::db::handlers::{Repository, Users};
//!
//! async fn example(pool: &sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
//!     let mut tx = pool.begin().await?;
//!     let mut repo = Users::new(&mut tx);
//!
//!     if let Some(user) = repo.get_user_by_email("user@example.com").await? {
//!         println!("{} is in {:?}", user.name, user.user_group_ids);
//!     }
//!
//!     tx.commit().await?;
//!     Ok(())
//! }
//! ```

pub mod repository;
pub mod usages;
pub mod user_groups;
pub mod users;

pub use repository::Repository;
pub use usages::Usages;
pub use user_groups::UserGroups;
pub use users::Users;
