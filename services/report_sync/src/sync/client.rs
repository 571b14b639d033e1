//! services/report_sync/src/sync/client.rs
//!
//! The report sync client: one per connected editor. It wires the auth gate,
//! the draft synchronizer and the debounced writer to a shared editor state and
//! serializes session transitions between them.

use nippou_core::domain::{SaveStatus, Session, SyncPhase, UserId};
use nippou_core::ports::{AuthResult, AuthService, DocumentStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{info, warn};

use super::auth_gate::{AuthFailure, AuthGate};
use super::draft_sync::DraftSynchronizer;
use super::state::{ClientEvent, EditorState, SharedEditor, EVENT_CAPACITY};
use super::writer::DebouncedWriter;
use super::SyncError;
use crate::config::DEFAULT_DEBOUNCE;

/// Per-client settings.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub debounce: Duration,
    /// A credential handed over by the embedding page, tried when no session exists.
    pub bootstrap_token: Option<String>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            bootstrap_token: None,
        }
    }
}

/// A point-in-time copy of what the UI shows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSnapshot {
    pub user_id: Option<UserId>,
    pub auth_error: Option<AuthFailure>,
    pub content: String,
    pub save_status: SaveStatus,
    pub phase: SyncPhase,
}

struct ClientInner {
    gate: AuthGate,
    synchronizer: DraftSynchronizer,
    writer: DebouncedWriter,
    editor: SharedEditor,
    events: broadcast::Sender<ClientEvent>,
    /// Session transitions run one at a time.
    transition: Mutex<()>,
}

#[derive(Clone)]
pub struct ReportSyncClient {
    inner: Arc<ClientInner>,
}

impl ReportSyncClient {
    pub fn new(
        auth: Arc<dyn AuthService>,
        store: Arc<dyn DocumentStore>,
        options: ClientOptions,
    ) -> Self {
        let events = broadcast::channel(EVENT_CAPACITY).0;
        let editor: SharedEditor = Arc::new(Mutex::new(EditorState::default()));
        let inner = ClientInner {
            gate: AuthGate::new(auth, options.bootstrap_token, events.clone()),
            synchronizer: DraftSynchronizer::new(store.clone(), editor.clone(), events.clone()),
            writer: DebouncedWriter::new(store, editor.clone(), events.clone(), options.debounce),
            editor,
            events,
            transition: Mutex::new(()),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Fires the auth-state handler once with no session, as on page load.
    pub async fn start(&self) {
        self.on_auth_state_changed(None).await;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    pub fn observe_session(&self) -> watch::Receiver<Option<Session>> {
        self.inner.gate.observe()
    }

    pub fn current_user(&self) -> Option<UserId> {
        self.inner.gate.current_user()
    }

    pub fn auth_error(&self) -> Option<AuthFailure> {
        self.inner.gate.last_error()
    }

    pub async fn snapshot(&self) -> ClientSnapshot {
        let editor = self.inner.editor.lock().await;
        ClientSnapshot {
            user_id: editor.user_id.clone(),
            auth_error: self.inner.gate.last_error(),
            content: editor.content.clone(),
            save_status: editor.save_status,
            phase: editor.phase,
        }
    }

    //=====================================================================================
    // Auth actions
    //=====================================================================================

    pub async fn register(&self, email: &str, password: &str) -> AuthResult<()> {
        let session = self.inner.gate.register(email, password).await?;
        self.on_auth_state_changed(Some(session)).await;
        Ok(())
    }

    pub async fn login(&self, email: &str, password: &str) -> AuthResult<()> {
        let session = self.inner.gate.login(email, password).await?;
        self.on_auth_state_changed(Some(session)).await;
        Ok(())
    }

    pub async fn logout(&self) -> AuthResult<()> {
        {
            // Nothing may reach the store once the provider considers us signed out.
            let _gate = self.inner.writer.cancel_pending().await;
            self.inner.gate.sign_out().await?;
        }
        self.on_auth_state_changed(None).await;
        Ok(())
    }

    //=====================================================================================
    // Editing
    //=====================================================================================

    /// Called on every local edit.
    pub async fn submit_change(&self, content: impl Into<String>) -> Result<(), SyncError> {
        self.inner.writer.submit_change(content.into()).await
    }

    /// Writes any pending edit and closes the subscription; the session itself
    /// is left alone. Used when the editor goes away.
    pub async fn close(&self) {
        let _transition = self.inner.transition.lock().await;
        self.inner.writer.flush().await;
        let _gate = self.inner.writer.cancel_pending().await;
        self.inner.synchronizer.detach().await;
    }

    //=====================================================================================
    // Session transitions
    //=====================================================================================

    /// The auth-state handler. `None` means the provider reports no session.
    pub async fn on_auth_state_changed(&self, session: Option<Session>) {
        let _transition = self.inner.transition.lock().await;
        match session {
            Some(session) => self.establish(session).await,
            None => {
                self.teardown().await;
                if let Some(session) = self.inner.gate.bootstrap().await {
                    self.establish(session).await;
                }
            }
        }
    }

    async fn establish(&self, session: Session) {
        let user_id = session.user_id.clone();
        if self.inner.synchronizer.subscribed_user().await.as_ref() == Some(&user_id) {
            // Same user again (e.g. a second login): keep the live subscription.
            self.inner.gate.record(Some(session));
            return;
        }

        {
            let _gate = self.inner.writer.cancel_pending().await;
            self.inner.gate.record(Some(session));
            if let Err(e) = self.inner.synchronizer.attach(user_id.clone()).await {
                warn!("Session for {} has no live draft: {}", user_id, e);
                return;
            }
        }
        info!("Session established for {}", user_id);
    }

    async fn teardown(&self) {
        let _gate = self.inner.writer.cancel_pending().await;
        self.inner.synchronizer.detach().await;
        self.inner.gate.record(None);
    }
}
