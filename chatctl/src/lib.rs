//! # chatctl: quota-enforced chat backend core
//!
//! `chatctl` holds the parts of a multi-tenant chat backend that decide whether a chat request may
//! run: user and group management, a per-group monthly token quota, and the ordered middleware
//! pipeline that enforces it before the model is called.
//!
//! ## Request Flow
//!
//! A [`chat::ChatPipeline`] is built once from a list of [`chat::ChatMiddleware`] stages and a
//! terminal [`chat::ChatHandler`] (the model call). Stages run in ascending `order`:
//!
//! 1. [`quota::CheckUsage`] (order `-1000`) resolves the caller's quota from the first group they
//!    belong to, sums the current month's usage from the ledger and rejects the request with
//!    [`errors::Error::QuotaExceeded`] (HTTP 429) once a cap is reached.
//! 2. [`chat::RecordUsage`] (order `-500`) lets the request through and adds the tokens the model
//!    reported to the ledger.
//! 3. Any further stages, then the model.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use chatctl::chat::{ChatContext, ChatHandler, ChatPipeline, ChatResponse, RecordUsage};
//! use chatctl::quota::{CheckUsage, PgQuotaStore, PolicyResolver};
//!
//! struct Model;
//!
//! #[async_trait::async_trait]
//! impl ChatHandler for Model {
//!     async fn handle(&self, _ctx: ChatContext) -> chatctl::errors::Result<ChatResponse> {
//!         todo!("call the provider")
//!     }
//! }
//!
//! # async fn example(config: chatctl::Config) -> anyhow::Result<()> {
//! let pool = chatctl::connect(&config).await?;
//! let store = Arc::new(PgQuotaStore::new(pool));
//!
//! let resolver = PolicyResolver::new(&config.quota, store.clone());
//! let pipeline = ChatPipeline::builder()
//!     .with(CheckUsage::new(&config.quota, resolver, store.clone()))
//!     .with(RecordUsage::new(&config.usage, store))
//!     .build(Model);
//! # Ok(())
//! # }
//! ```
//!
//! ## Database Setup
//!
//! Migrations are embedded and run by [`users::bootstrap::bootstrap`], which also seeds the
//! built-in `admin` and `default` groups and the configured initial admin.
//!
//! ## Configuration
//!
//! See the [`config`] module for configuration options.

pub mod auth;
pub mod chat;
pub mod config;
pub mod db;
pub mod errors;
pub mod quota;
pub mod telemetry;
pub mod types;
pub mod users;

pub use config::Config;
pub use types::{GroupId, UserId};

use sqlx::ConnectOptions;
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, instrument};

/// Get the chatctl database migrator
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

/// Open the connection pool described by `config.database`.
///
/// Statements slower than `slow_statement_threshold_ms` are logged at warn.
#[instrument(skip_all, err)]
pub async fn connect(config: &Config) -> anyhow::Result<PgPool> {
    let settings = &config.database.pool;

    let connect_options = PgConnectOptions::from_str(&config.database.url)?.log_slow_statements(
        log::LevelFilter::Warn,
        Duration::from_millis(config.slow_statement_threshold_ms),
    );

    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .min_connections(settings.min_connections)
        .acquire_timeout(settings.acquire_timeout())
        .idle_timeout(settings.idle_timeout())
        .max_lifetime(settings.max_lifetime())
        .connect_with(connect_options)
        .await?;

    debug!(
        "Connected to database (max_connections: {}, min_connections: {})",
        settings.max_connections, settings.min_connections
    );

    Ok(pool)
}
