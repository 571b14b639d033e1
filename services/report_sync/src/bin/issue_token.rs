//! services/report_sync/src/bin/issue_token.rs
//!
//! Issues a bootstrap token for an existing user. The printed token is handed
//! to the editor page as `/ws?token=...`, which signs in as that user.

use chrono::Duration;
use clap::Parser;
use nippou_core::domain::UserId;
use report_sync_lib::{
    adapters::DbAdapter,
    config::{Config, ConfigError},
    error::ServiceError,
};
use sqlx::postgres::PgPoolOptions;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "issue_token", about = "Issue a bootstrap sign-in token for a user")]
struct Args {
    /// The user the token signs in as.
    user_id: String,

    /// Minutes until the token expires.
    #[arg(long, default_value_t = 60, value_parser = clap::value_parser!(i64).range(1..))]
    ttl_minutes: i64,
}

#[tokio::main]
async fn main() -> Result<(), ServiceError> {
    let args = Args::parse();

    let config = Config::from_env()?;
    // Logs go to stderr so stdout carries only the token.
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_level.to_string()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let database_url = config
        .database_url
        .as_deref()
        .ok_or_else(|| ConfigError::MissingVar("DATABASE_URL".to_string()))?;
    let db_pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(database_url)
        .await?;
    let db_adapter = DbAdapter::new(db_pool);
    db_adapter.run_migrations().await?;

    let token = db_adapter
        .issue_custom_token(&UserId::new(args.user_id), Duration::minutes(args.ttl_minutes))
        .await?;
    info!("Token valid for {} minutes", args.ttl_minutes);
    println!("{}", token);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn arguments_are_well_formed() {
        Args::command().debug_assert();
    }

    #[test]
    fn ttl_defaults_to_an_hour_and_must_be_positive() {
        let args = Args::try_parse_from(["issue_token", "u-1"]).unwrap();
        assert_eq!(args.user_id, "u-1");
        assert_eq!(args.ttl_minutes, 60);

        assert!(Args::try_parse_from(["issue_token", "u-1", "--ttl-minutes", "0"]).is_err());
        assert!(Args::try_parse_from(["issue_token"]).is_err());
    }
}
