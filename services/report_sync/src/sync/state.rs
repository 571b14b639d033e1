//! services/report_sync/src/sync/state.rs
//!
//! Defines the client-local editor state shared by the sync components, and the
//! events they publish to the UI.

use nippou_core::domain::{SaveStatus, SyncPhase, UserId};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

//=========================================================================================
// EditorState (One Per Client)
//=========================================================================================

/// The transient, reconciled copy of the user's draft.
#[derive(Debug)]
pub struct EditorState {
    pub user_id: Option<UserId>,
    pub content: String,
    pub save_status: SaveStatus,
    pub phase: SyncPhase,
    /// Bumped whenever the session is established or torn down. Timers and
    /// listeners remember the epoch they were started in and go quiet once it moves.
    pub epoch: u64,
    /// Content of the last write this client issued, used to recognise its echo.
    pub last_written: Option<String>,
    /// Counts local edits; a write is only current if no edit followed it.
    pub local_edits: u64,
}

impl Default for EditorState {
    fn default() -> Self {
        Self {
            user_id: None,
            content: String::new(),
            save_status: SaveStatus::SignedOut,
            phase: SyncPhase::NoSession,
            epoch: 0,
            last_written: None,
            local_edits: 0,
        }
    }
}

pub type SharedEditor = Arc<Mutex<EditorState>>;

//=========================================================================================
// Client Events
//=========================================================================================

/// Notifications published by a client. The web layer forwards them to the browser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The signed-in user changed (or signed out).
    SessionChanged { user_id: Option<UserId> },
    /// An auth action failed. `fatal` means no usable session could be obtained.
    AuthError { message: String, fatal: bool },
    /// The editor content was replaced from outside the editor.
    ContentReplaced { content: String },
    SaveStatusChanged(SaveStatus),
    /// The first snapshot of the draft has been applied.
    Synced,
    SyncFailed { message: String },
}

pub type EventSender = broadcast::Sender<ClientEvent>;

pub const EVENT_CAPACITY: usize = 256;

/// Publishes an event. Having no listener is not an error.
pub fn emit(events: &EventSender, event: ClientEvent) {
    let _ = events.send(event);
}

/// Updates the status, publishing only actual changes.
pub fn set_status(editor: &mut EditorState, status: SaveStatus, events: &EventSender) {
    if editor.save_status != status {
        editor.save_status = status;
        emit(events, ClientEvent::SaveStatusChanged(status));
    }
}
