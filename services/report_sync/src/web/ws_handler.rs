//! services/report_sync/src/web/ws_handler.rs
//!
//! The entry point and control loop for an editor's WebSocket connection. Each
//! connection gets its own sync client; client events are forwarded to the
//! browser while browser messages are dispatched to the client.

use crate::{
    sync::{ClientEvent, ReportSyncClient},
    web::{
        protocol::{ClientMessage, ServerMessage},
        state::AppState,
    },
};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{
    stream::{SplitSink, StreamExt},
    SinkExt,
};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{error, info, warn};

type WsSender = Arc<Mutex<SplitSink<WebSocket, Message>>>;

/// Query parameters accepted on connect.
#[derive(Deserialize, Debug, Default)]
pub struct ConnectParams {
    /// Bootstrap credential supplied by the embedding page.
    pub token: Option<String>,
}

/// The handler for upgrading HTTP requests to WebSocket connections.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<Arc<AppState>>,
    Query(params): Query<ConnectParams>,
) -> Response {
    let token = params.token.filter(|t| !t.is_empty());
    ws.on_upgrade(move |socket| handle_socket(socket, app_state, token))
}

async fn handle_socket(socket: WebSocket, app_state: Arc<AppState>, token: Option<String>) {
    info!("New editor connection (bootstrap token: {})", token.is_some());

    let (sender, mut receiver) = socket.split();
    let ws_sender: WsSender = Arc::new(Mutex::new(sender));
    let client = app_state.new_client(token);

    // --- 1. Forward client events; subscribed before start so nothing is missed ---
    let forward_task = {
        let events = client.subscribe();
        let client = client.clone();
        let ws_sender = ws_sender.clone();
        tokio::spawn(async move { forward_events(events, client, ws_sender).await })
    };

    // --- 2. Fire the auth-state handler as on page load ---
    client.start().await;

    // --- 3. Main Message Loop ---
    loop {
        match receiver.next().await {
            Some(Ok(Message::Text(text))) => {
                handle_text_message(text.as_str(), &client, &ws_sender).await;
            }
            Some(Ok(Message::Close(_))) => {
                info!("Client sent close message.");
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!("WebSocket receive failed: {}", e);
                break;
            }
            None => {
                info!("Client disconnected.");
                break;
            }
        }
    }

    // --- 4. Cleanup: keep the last edit, then stop listening ---
    client.close().await;
    forward_task.abort();
    info!("Editor connection closed.");
}

async fn forward_events(
    mut events: broadcast::Receiver<ClientEvent>,
    client: ReportSyncClient,
    ws_sender: WsSender,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if send_message(&ws_sender, &ServerMessage::from(event)).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                // Some updates were lost; send the full picture instead.
                warn!("Event forwarder lagged by {}; resending state", skipped);
                let snapshot = client.snapshot().await;
                let resync = [
                    ServerMessage::SessionChanged {
                        user_id: snapshot.user_id.map(|id| id.to_string()),
                    },
                    ServerMessage::Content {
                        content: snapshot.content,
                    },
                    ServerMessage::from(ClientEvent::SaveStatusChanged(snapshot.save_status)),
                ];
                for msg in &resync {
                    if send_message(&ws_sender, msg).await.is_err() {
                        return;
                    }
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn send_message(ws_sender: &WsSender, msg: &ServerMessage) -> Result<(), axum::Error> {
    let json = serde_json::to_string(msg).map_err(axum::Error::new)?;
    ws_sender.lock().await.send(Message::Text(json.into())).await
}

/// Helper function to handle the logic for different `ClientMessage` variants.
async fn handle_text_message(text: &str, client: &ReportSyncClient, ws_sender: &WsSender) {
    let client_msg = match serde_json::from_str::<ClientMessage>(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!("Failed to deserialize client message: {}", e);
            let err_msg = ServerMessage::Error {
                message: format!("Unrecognised message: {}", e),
            };
            let _ = send_message(ws_sender, &err_msg).await;
            return;
        }
    };

    match client_msg {
        // Auth failures reach the browser as `auth_error` events.
        ClientMessage::Register { email, password } => {
            if client.register(&email, &password).await.is_ok() {
                info!("Registration succeeded.");
            }
        }
        ClientMessage::Login { email, password } => {
            if client.login(&email, &password).await.is_ok() {
                info!("Login succeeded.");
            }
        }
        ClientMessage::Logout => {
            if let Err(e) = client.logout().await {
                error!("Logout failed: {}", e);
            }
        }
        ClientMessage::Edit { content } => {
            if let Err(e) = client.submit_change(content).await {
                let err_msg = ServerMessage::Error {
                    message: e.user_message(),
                };
                let _ = send_message(ws_sender, &err_msg).await;
            }
        }
        ClientMessage::SubmitForm { form } => {
            let content = form.render();
            match client.submit_change(content.clone()).await {
                Ok(()) => {
                    // The textarea did not produce this text, so show it.
                    let _ = send_message(ws_sender, &ServerMessage::Content { content }).await;
                }
                Err(e) => {
                    let err_msg = ServerMessage::Error {
                        message: e.user_message(),
                    };
                    let _ = send_message(ws_sender, &err_msg).await;
                }
            }
        }
    }
}
