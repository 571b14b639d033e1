//! services/report_sync/src/sync/auth_gate.rs
//!
//! Tracks the session of one client and runs the auth actions on its behalf.

use nippou_core::domain::{Session, UserId};
use nippou_core::ports::{AuthError, AuthResult, AuthService};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::state::{emit, ClientEvent, EventSender};

/// Shown when neither the bootstrap token nor anonymous sign-in worked.
pub const FATAL_AUTH_MESSAGE: &str = "認証に失敗しました";

/// The last auth failure, as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthFailure {
    pub message: String,
    pub fatal: bool,
}

pub struct AuthGate {
    auth: Arc<dyn AuthService>,
    bootstrap_token: Option<String>,
    session: watch::Sender<Option<Session>>,
    last_error: watch::Sender<Option<AuthFailure>>,
    events: EventSender,
}

impl AuthGate {
    pub fn new(
        auth: Arc<dyn AuthService>,
        bootstrap_token: Option<String>,
        events: EventSender,
    ) -> Self {
        Self {
            auth,
            bootstrap_token,
            session: watch::channel(None).0,
            last_error: watch::channel(None).0,
            events,
        }
    }

    pub fn current_session(&self) -> Option<Session> {
        self.session.borrow().clone()
    }

    pub fn current_user(&self) -> Option<UserId> {
        self.session.borrow().as_ref().map(|s| s.user_id.clone())
    }

    pub fn last_error(&self) -> Option<AuthFailure> {
        self.last_error.borrow().clone()
    }

    /// A receiver that sees every session change.
    pub fn observe(&self) -> watch::Receiver<Option<Session>> {
        self.session.subscribe()
    }

    /// Records the active session. A present session clears any earlier error.
    pub fn record(&self, session: Option<Session>) {
        if session.is_some() {
            self.last_error.send_replace(None);
        }
        let user_id = session.as_ref().map(|s| s.user_id.clone());
        self.session.send_replace(session);
        emit(&self.events, ClientEvent::SessionChanged { user_id });
    }

    fn fail(&self, failure: AuthFailure) {
        emit(
            &self.events,
            ClientEvent::AuthError {
                message: failure.message.clone(),
                fatal: failure.fatal,
            },
        );
        self.last_error.send_replace(Some(failure));
    }

    fn fail_with(&self, error: &AuthError) {
        self.fail(AuthFailure {
            message: error.user_message(),
            fatal: false,
        });
    }

    /// Tries to obtain a session when none exists: the bootstrap token first,
    /// then an anonymous session. Without a token the client stays signed out.
    pub async fn bootstrap(&self) -> Option<Session> {
        let token = self.bootstrap_token.as_deref()?;

        match self.auth.sign_in_with_custom_token(token).await {
            Ok(session) => {
                info!("Signed in {} with the bootstrap token", session.user_id);
                return Some(session);
            }
            Err(e) => warn!("Bootstrap token rejected ({}); trying anonymous sign-in", e),
        }

        match self.auth.sign_in_anonymously().await {
            Ok(session) => {
                info!("Signed in anonymously as {}", session.user_id);
                Some(session)
            }
            Err(e) => {
                error!("Anonymous sign-in failed: {}", e);
                self.fail(AuthFailure {
                    message: FATAL_AUTH_MESSAGE.to_string(),
                    fatal: true,
                });
                None
            }
        }
    }

    pub async fn register(&self, email: &str, password: &str) -> AuthResult<Session> {
        self.auth
            .create_user_with_email(email, password)
            .await
            .inspect_err(|e| {
                warn!("Registration failed: {}", e);
                self.fail_with(e);
            })
    }

    pub async fn login(&self, email: &str, password: &str) -> AuthResult<Session> {
        self.auth
            .sign_in_with_email(email, password)
            .await
            .inspect_err(|e| {
                warn!("Login failed: {}", e);
                self.fail_with(e);
            })
    }

    /// Ends the session with the auth service. Signed-out clients have nothing to do.
    pub async fn sign_out(&self) -> AuthResult<()> {
        let Some(session) = self.current_session() else {
            return Ok(());
        };
        self.auth.sign_out(&session).await.inspect_err(|e| {
            warn!("Sign-out failed: {}", e);
            self.fail_with(e);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryAuthService;
    use crate::sync::state::EVENT_CAPACITY;
    use tokio::sync::broadcast;

    fn gate(auth: Arc<MemoryAuthService>, token: Option<String>) -> AuthGate {
        AuthGate::new(auth, token, broadcast::channel(EVENT_CAPACITY).0)
    }

    #[tokio::test]
    async fn no_token_stays_signed_out() {
        let gate = gate(Arc::new(MemoryAuthService::new()), None);
        assert!(gate.bootstrap().await.is_none());
        assert!(gate.last_error().is_none());
    }

    #[tokio::test]
    async fn valid_token_signs_in_its_user() {
        let auth = Arc::new(MemoryAuthService::new());
        let token = auth.issue_custom_token(&UserId::new("u-7"));
        let gate = gate(auth, Some(token));
        let session = gate.bootstrap().await.unwrap();
        assert_eq!(session.user_id, UserId::new("u-7"));
    }

    #[tokio::test]
    async fn rejected_token_falls_back_to_anonymous() {
        let gate = gate(Arc::new(MemoryAuthService::new()), Some("stale".to_string()));
        let session = gate.bootstrap().await.unwrap();
        assert_eq!(session.method, nippou_core::SignInMethod::Anonymous);
        assert!(gate.last_error().is_none());
    }

    #[tokio::test]
    async fn exhausted_chain_is_fatal() {
        let auth = Arc::new(MemoryAuthService::new());
        auth.set_fail_anonymous(true);
        let gate = gate(auth, Some("stale".to_string()));
        assert!(gate.bootstrap().await.is_none());
        assert_eq!(
            gate.last_error(),
            Some(AuthFailure {
                message: FATAL_AUTH_MESSAGE.to_string(),
                fatal: true,
            })
        );
    }

    #[tokio::test]
    async fn recording_a_session_clears_the_error() {
        let auth = Arc::new(MemoryAuthService::new());
        let gate = gate(auth, None);
        assert!(gate.login("a@x.com", "secret1").await.is_err());
        assert!(gate.last_error().is_some());

        let session = gate.register("a@x.com", "secret1").await.unwrap();
        gate.record(Some(session));
        assert!(gate.last_error().is_none());
        assert!(gate.current_user().is_some());
    }
}
