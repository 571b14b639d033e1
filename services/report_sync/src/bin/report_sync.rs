//! services/report_sync/src/bin/report_sync.rs

use report_sync_lib::{
    adapters::{db::spawn_anonymous_user_sweep, DbAdapter, MemoryAuthService, MemoryDocumentStore},
    config::Config,
    error::ServiceError,
    web::{router, state::AppState},
};
use nippou_core::ports::{AuthService, DocumentStore};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const ANONYMOUS_SWEEP_EVERY: Duration = Duration::from_secs(60 * 60);

#[tokio::main]
async fn main() -> Result<(), ServiceError> {
    // --- 1. Load Configuration & Set Up Logging ---
    let config = Arc::new(Config::from_env()?);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_level.to_string()))
        .with(tracing_subscriber::fmt::layer())
        .init();
    info!(
        "Configuration loaded for project '{}'. Starting server...",
        config.backend.project_id
    );

    // --- 2. Initialize the Backend Adapters ---
    let (auth, store): (Arc<dyn AuthService>, Arc<dyn DocumentStore>) =
        match &config.database_url {
            Some(database_url) => {
                info!("Connecting to database...");
                let db_pool = PgPoolOptions::new()
                    .max_connections(5)
                    .connect(database_url)
                    .await?;
                let db_adapter = Arc::new(DbAdapter::new(db_pool));
                info!("Running database migrations...");
                db_adapter.run_migrations().await?;
                info!("Database migrations complete.");
                if let Some(ttl) = config.anonymous_user_ttl {
                    info!("Purging anonymous users idle for {:?}", ttl);
                    spawn_anonymous_user_sweep((*db_adapter).clone(), ttl, ANONYMOUS_SWEEP_EVERY);
                }
                (
                    db_adapter.clone() as Arc<dyn AuthService>,
                    db_adapter as Arc<dyn DocumentStore>,
                )
            }
            None => {
                warn!("DATABASE_URL not set; drafts are kept in memory only.");
                (
                    Arc::new(MemoryAuthService::new()) as Arc<dyn AuthService>,
                    Arc::new(MemoryDocumentStore::new()) as Arc<dyn DocumentStore>,
                )
            }
        };

    // --- 3. Build the Shared AppState ---
    let app_state = Arc::new(AppState {
        config: config.clone(),
        auth,
        store,
    });

    // --- 4. Create the Web Router ---
    let app = router(app_state)?;

    // --- 5. Start the Server ---
    info!("Starting server on {}", config.bind_address);
    info!(
        "Editors connect to ws://{}/ws (debounce {:?})",
        config.bind_address, config.debounce
    );
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
