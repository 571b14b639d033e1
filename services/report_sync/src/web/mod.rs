pub mod protocol;
pub mod state;
pub mod ws_handler;

use axum::http::{HeaderValue, Method};
use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::error::ServiceError;
use state::AppState;

// Re-export the main WebSocket handler to make it easily accessible
// to the binary that builds the web server router.
pub use ws_handler::ws_handler;

async fn health_handler() -> &'static str {
    "ok"
}

/// Builds the service router: the editor WebSocket plus a health check.
pub fn router(app_state: Arc<AppState>) -> Result<Router, ServiceError> {
    let origin = app_state
        .config
        .allowed_origin
        .parse::<HeaderValue>()
        .map_err(|e| {
            ServiceError::Internal(format!(
                "Invalid ALLOWED_ORIGIN '{}': {}",
                app_state.config.allowed_origin, e
            ))
        })?;
    let cors = CorsLayer::new()
        .allow_origin(origin)
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::OPTIONS]);

    Ok(Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .with_state(app_state))
}
