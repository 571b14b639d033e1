//! services/report_sync/src/sync/mod.rs
//!
//! The client side of draft synchronization: auth gating, realtime
//! reconciliation and debounced autosave.

pub mod auth_gate;
pub mod client;
pub mod debounce;
pub mod draft_sync;
pub mod state;
pub mod writer;

use nippou_core::ports::PortError;

pub use auth_gate::{AuthFailure, AuthGate, FATAL_AUTH_MESSAGE};
pub use client::{ClientOptions, ClientSnapshot, ReportSyncClient};
pub use state::ClientEvent;

/// Failures of the sync client. None of them end the session.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("no user is signed in")]
    NotSignedIn,
    #[error("draft subscription failed: {0}")]
    Subscription(PortError),
    #[error("draft write failed: {0}")]
    Write(PortError),
}

impl SyncError {
    /// The message shown to the user.
    pub fn user_message(&self) -> String {
        match self {
            SyncError::NotSignedIn => "ログインしてください".to_string(),
            SyncError::Subscription(e) => format!("同期エラー: {}", e),
            SyncError::Write(e) => format!("保存エラー: {}", e),
        }
    }
}
