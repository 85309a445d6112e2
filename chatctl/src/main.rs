use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use chatctl::chat::ChatUser;
use chatctl::config::{Args, Command};
use chatctl::db::handlers::{Repository, Users};
use chatctl::quota::{CheckUsage, PgQuotaStore, PolicyResolver};
use chatctl::users::{User, bootstrap};
use chatctl::{Config, telemetry};
use serde_json::json;

async fn run(args: &Args, config: Config) -> anyhow::Result<()> {
    let pool = chatctl::connect(&config).await?;

    match &args.command {
        None | Some(Command::Bootstrap) => {
            bootstrap::bootstrap(&pool, &config).await?;
            tracing::info!("Bootstrap complete");
        }
        Some(Command::Usage { user }) => {
            let mut conn = pool.acquire().await?;
            let user = Users::new(&mut conn)
                .get_by_id(user.clone())
                .await?
                .map(User::from)
                .with_context(|| format!("User with ID {user} not found"))?;
            drop(conn);

            let store = Arc::new(PgQuotaStore::new(pool.clone()));
            let resolver = PolicyResolver::new(&config.quota, store.clone());
            let evaluation = CheckUsage::new(&config.quota, resolver, store)
                .evaluate(&ChatUser::from(&user))
                .await?;

            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "user": user,
                    "allowed": evaluation.is_allowed(),
                    "evaluation": evaluation,
                }))?
            );
        }
    }

    pool.close().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI args
    let args = Args::parse();

    // Load configuration
    let config = Config::load(&args)?;

    // If --validate flag is set, exit successfully after config validation
    if args.validate {
        println!("Configuration is valid.");
        return Ok(());
    }

    // Initialize telemetry (tracing + optional OpenTelemetry)
    telemetry::init_telemetry(config.enable_otel_export)?;

    tracing::debug!("{:?}", args);

    let result = run(&args, config).await;
    telemetry::shutdown_telemetry();
    result
}
