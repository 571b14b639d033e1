//! services/report_sync/src/web/state.rs
//!
//! Defines the application's shared state.

use crate::config::Config;
use crate::sync::{ClientOptions, ReportSyncClient};
use nippou_core::ports::{AuthService, DocumentStore};
use std::sync::Arc;

//=========================================================================================
// AppState (Shared Across All Connections)
//=========================================================================================

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub auth: Arc<dyn AuthService>,
    pub store: Arc<dyn DocumentStore>,
}

impl AppState {
    /// A fresh sync client for one connection.
    pub fn new_client(&self, bootstrap_token: Option<String>) -> ReportSyncClient {
        ReportSyncClient::new(
            self.auth.clone(),
            self.store.clone(),
            ClientOptions {
                debounce: self.config.debounce,
                bootstrap_token,
            },
        )
    }
}
