//! services/report_sync/src/web/protocol.rs
//!
//! Defines the WebSocket message protocol between the browser editor and the
//! report sync service.

use nippou_core::domain::SaveStatus;
use serde::{Deserialize, Serialize};

use crate::report::ReportForm;
use crate::sync::ClientEvent;

//=========================================================================================
// Messages Sent FROM the Client (Browser) TO the Server
//=========================================================================================

/// Represents the structured text messages a browser can send to the server.
#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Register { email: String, password: String },

    Login { email: String, password: String },

    Logout,

    /// The full editor text after a keystroke.
    Edit { content: String },

    /// A structured report; stored as its rendered text.
    SubmitForm { form: ReportForm },
}

//=========================================================================================
// Messages Sent FROM the Server TO the Client (Browser)
//=========================================================================================

/// Represents the structured text messages the server can send to the browser.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The signed-in user changed; `null` when signed out.
    SessionChanged { user_id: Option<String> },

    AuthError { message: String, fatal: bool },

    /// Replace the editor text. Not sent for the browser's own edits.
    Content { content: String },

    SaveStatus { status: SaveStatusCode, label: String },

    /// The stored draft has been loaded.
    Synced,

    SyncError { message: String },

    /// A request could not be handled.
    Error { message: String },
}

/// Wire form of [`SaveStatus`].
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SaveStatusCode {
    UnsavedChanges,
    Saving,
    Saved,
    SaveError,
    SignedOut,
}

impl From<SaveStatus> for SaveStatusCode {
    fn from(status: SaveStatus) -> Self {
        match status {
            SaveStatus::UnsavedChanges => SaveStatusCode::UnsavedChanges,
            SaveStatus::Saving => SaveStatusCode::Saving,
            SaveStatus::Saved => SaveStatusCode::Saved,
            SaveStatus::SaveError => SaveStatusCode::SaveError,
            SaveStatus::SignedOut => SaveStatusCode::SignedOut,
        }
    }
}

impl From<ClientEvent> for ServerMessage {
    fn from(event: ClientEvent) -> Self {
        match event {
            ClientEvent::SessionChanged { user_id } => ServerMessage::SessionChanged {
                user_id: user_id.map(|id| id.to_string()),
            },
            ClientEvent::AuthError { message, fatal } => ServerMessage::AuthError { message, fatal },
            ClientEvent::ContentReplaced { content } => ServerMessage::Content { content },
            ClientEvent::SaveStatusChanged(status) => ServerMessage::SaveStatus {
                status: status.into(),
                label: status.label().to_string(),
            },
            ClientEvent::Synced => ServerMessage::Synced,
            ClientEvent::SyncFailed { message } => ServerMessage::SyncError { message },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_messages_are_tagged() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"login","email":"a@x.com","password":"secret1"}"#)
                .unwrap();
        assert!(matches!(msg, ClientMessage::Login { ref email, .. } if email == "a@x.com"));

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"logout"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Logout));

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"submit_form","form":{"name":"山田"}}"#).unwrap();
        assert!(matches!(msg, ClientMessage::SubmitForm { ref form } if form.name == "山田"));
    }

    #[test]
    fn save_status_carries_its_label() {
        let msg = ServerMessage::from(ClientEvent::SaveStatusChanged(SaveStatus::Saved));
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({ "type": "save_status", "status": "saved", "label": "保存済み" })
        );
    }

    #[test]
    fn signed_out_session_is_null() {
        let msg = ServerMessage::from(ClientEvent::SessionChanged { user_id: None });
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({ "type": "session_changed", "user_id": null })
        );
    }
}
