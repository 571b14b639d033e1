//! crates/nippou_core/src/ports.rs
//!
//! Defines the service contracts (traits) for the report client's core logic.
//! These traits form the boundary of the hexagonal architecture, so the sync client
//! stays independent of the concrete auth provider and document database.

use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use crate::domain::{DocumentFields, DocumentPath, DocumentSnapshot, Session};

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port operations.
/// This abstracts away the specific errors from external services (e.g., database, network).
#[derive(Debug, Clone, thiserror::Error)]
pub enum PortError {
    #[error("Item not found: {0}")]
    NotFound(String),
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
    #[error("Unauthorized")]
    Unauthorized,
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

/// Classified failures of the auth service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("email already in use")]
    EmailAlreadyInUse,
    #[error("weak password")]
    WeakPassword,
    #[error("invalid credential")]
    InvalidCredential,
    #[error("auth failure: {0}")]
    Other(String),
}

impl AuthError {
    /// The message shown to the user for this failure.
    pub fn user_message(&self) -> String {
        match self {
            AuthError::EmailAlreadyInUse => "このメールアドレスは既に使用されています".to_string(),
            AuthError::WeakPassword => "パスワードは6文字以上で入力してください".to_string(),
            AuthError::InvalidCredential => {
                "メールアドレスまたはパスワードが間違っています".to_string()
            }
            AuthError::Other(detail) => format!("エラーが発生しました: {}", detail),
        }
    }
}

pub type AuthResult<T> = Result<T, AuthError>;

/// A live feed of a single document. The first item is the current state;
/// `None` means the document does not exist.
pub type SnapshotStream =
    Pin<Box<dyn Stream<Item = PortResult<Option<DocumentSnapshot>>> + Send>>;

//=========================================================================================
// Service Ports (Traits)
//=========================================================================================

#[async_trait]
pub trait AuthService: Send + Sync {
    async fn sign_in_anonymously(&self) -> AuthResult<Session>;

    async fn sign_in_with_custom_token(&self, token: &str) -> AuthResult<Session>;

    async fn create_user_with_email(&self, email: &str, password: &str) -> AuthResult<Session>;

    async fn sign_in_with_email(&self, email: &str, password: &str) -> AuthResult<Session>;

    async fn sign_out(&self, session: &Session) -> AuthResult<()>;
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Reads a document once.
    async fn get(&self, path: &DocumentPath) -> PortResult<Option<DocumentSnapshot>>;

    /// Merges `fields` into the document, creating it if needed. Fields not named
    /// in `fields` are preserved.
    async fn merge_set(&self, path: &DocumentPath, fields: DocumentFields) -> PortResult<()>;

    /// Opens a realtime subscription. Dropping the stream closes it.
    async fn subscribe(&self, path: &DocumentPath) -> PortResult<SnapshotStream>;
}
