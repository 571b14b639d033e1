//! services/report_sync/src/sync/draft_sync.rs
//!
//! Keeps the editor in step with the user's remote draft through a realtime
//! subscription, and owns that subscription's lifecycle.

use futures::StreamExt;
use nippou_core::domain::{
    DocumentPath, DocumentSnapshot, ReportDraft, SaveStatus, SyncPhase, UserId,
};
use nippou_core::ports::{DocumentStore, SnapshotStream};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::state::{emit, set_status, ClientEvent, EditorState, EventSender, SharedEditor};
use super::SyncError;

struct ActiveSubscription {
    user_id: UserId,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct DraftSynchronizer {
    store: Arc<dyn DocumentStore>,
    editor: SharedEditor,
    events: EventSender,
    active: Mutex<Option<ActiveSubscription>>,
}

impl DraftSynchronizer {
    pub fn new(store: Arc<dyn DocumentStore>, editor: SharedEditor, events: EventSender) -> Self {
        Self {
            store,
            editor,
            events,
            active: Mutex::new(None),
        }
    }

    /// The user whose draft is currently subscribed, if any.
    pub async fn subscribed_user(&self) -> Option<UserId> {
        self.active.lock().await.as_ref().map(|a| a.user_id.clone())
    }

    /// Starts following `user_id`'s draft, replacing any previous subscription.
    pub async fn attach(&self, user_id: UserId) -> Result<(), SyncError> {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            close(previous);
        }

        let epoch = {
            let mut editor = self.editor.lock().await;
            editor.epoch += 1;
            editor.user_id = Some(user_id.clone());
            editor.phase = SyncPhase::Loading;
            editor.last_written = None;
            replace_content(&mut editor, String::new(), &self.events);
            set_status(&mut editor, SaveStatus::Saved, &self.events);
            editor.epoch
        };

        let path = DocumentPath::current_draft(&user_id);
        let stream = match self.store.subscribe(&path).await {
            Ok(stream) => stream,
            Err(e) => {
                let error = SyncError::Subscription(e);
                warn!("Could not subscribe to {}: {}", path, error);
                emit(
                    &self.events,
                    ClientEvent::SyncFailed {
                        message: error.user_message(),
                    },
                );
                return Err(error);
            }
        };
        info!("Subscribed to {}", path);

        let token = CancellationToken::new();
        let handle = tokio::spawn(follow(
            stream,
            self.editor.clone(),
            self.events.clone(),
            token.clone(),
            epoch,
        ));
        *active = Some(ActiveSubscription {
            user_id,
            token,
            handle,
        });
        Ok(())
    }

    /// Closes the subscription and clears the editor.
    pub async fn detach(&self) {
        let mut active = self.active.lock().await;
        // The listener is cancelled before the state it writes into is cleared.
        if let Some(previous) = active.take() {
            info!("Closing subscription for {}", previous.user_id);
            close(previous);
        }

        let mut editor = self.editor.lock().await;
        editor.epoch += 1;
        editor.user_id = None;
        editor.phase = SyncPhase::NoSession;
        editor.last_written = None;
        replace_content(&mut editor, String::new(), &self.events);
        set_status(&mut editor, SaveStatus::SignedOut, &self.events);
    }
}

fn close(subscription: ActiveSubscription) {
    subscription.token.cancel();
    subscription.handle.abort();
}

fn replace_content(editor: &mut EditorState, content: String, events: &EventSender) {
    if editor.content != content {
        editor.content = content.clone();
        emit(events, ClientEvent::ContentReplaced { content });
    }
}

/// Applies one subscription event to the editor.
pub(crate) fn reconcile(
    editor: &mut EditorState,
    snapshot: Option<DocumentSnapshot>,
    events: &EventSender,
) {
    let remote = snapshot
        .map(|s| ReportDraft::from_snapshot(&s).content)
        .unwrap_or_default();
    let own_write = editor.last_written.take();

    if remote == editor.content {
        debug!("Remote draft matches the editor; nothing to apply");
    } else if own_write.as_deref() == Some(remote.as_str()) {
        // Our own write coming back while the user has already typed further.
        debug!("Ignoring echo of an earlier local write");
    } else {
        replace_content(editor, remote, events);
    }

    if editor.phase == SyncPhase::Loading {
        editor.phase = SyncPhase::Synced;
        emit(events, ClientEvent::Synced);
    }
}

async fn follow(
    mut stream: SnapshotStream,
    editor: SharedEditor,
    events: EventSender,
    token: CancellationToken,
    epoch: u64,
) {
    loop {
        let item = tokio::select! {
            _ = token.cancelled() => break,
            item = stream.next() => item,
        };
        let Some(item) = item else {
            debug!("Draft subscription stream ended");
            break;
        };

        let mut editor = editor.lock().await;
        // Checked under the lock: a detach that already ran must win.
        if token.is_cancelled() || editor.epoch != epoch {
            break;
        }
        match item {
            Ok(snapshot) => reconcile(&mut editor, snapshot, &events),
            Err(e) => {
                let error = SyncError::Subscription(e);
                warn!("Draft subscription error: {}", error);
                emit(
                    &events,
                    ClientEvent::SyncFailed {
                        message: error.user_message(),
                    },
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::state::EVENT_CAPACITY;
    use nippou_core::domain::{DocumentFields, FieldValue, CONTENT_FIELD};
    use tokio::sync::broadcast;

    fn snapshot(content: &str) -> Option<DocumentSnapshot> {
        let mut fields = DocumentFields::new();
        fields.insert(CONTENT_FIELD.to_string(), FieldValue::Text(content.to_string()));
        Some(DocumentSnapshot {
            path: DocumentPath::from_raw("users/u/dailyReports/currentDraft"),
            fields,
        })
    }

    fn synced_editor(content: &str) -> EditorState {
        EditorState {
            user_id: Some(UserId::new("u")),
            content: content.to_string(),
            phase: SyncPhase::Synced,
            ..EditorState::default()
        }
    }

    fn drain(rx: &mut broadcast::Receiver<ClientEvent>) -> Vec<ClientEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        seen
    }

    #[test]
    fn matching_remote_is_a_no_op() {
        let (tx, mut rx) = broadcast::channel(EVENT_CAPACITY);
        let mut editor = synced_editor("A");
        reconcile(&mut editor, snapshot("A"), &tx);
        assert_eq!(editor.content, "A");
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn differing_remote_replaces_content() {
        let (tx, mut rx) = broadcast::channel(EVENT_CAPACITY);
        let mut editor = synced_editor("A");
        reconcile(&mut editor, snapshot("B"), &tx);
        assert_eq!(editor.content, "B");
        assert_eq!(
            drain(&mut rx),
            vec![ClientEvent::ContentReplaced {
                content: "B".to_string()
            }]
        );
    }

    #[test]
    fn missing_document_empties_the_editor() {
        let (tx, _rx) = broadcast::channel(EVENT_CAPACITY);
        let mut editor = synced_editor("stale");
        reconcile(&mut editor, None, &tx);
        assert_eq!(editor.content, "");
    }

    #[test]
    fn own_echo_does_not_rewind_newer_typing() {
        let (tx, mut rx) = broadcast::channel(EVENT_CAPACITY);
        let mut editor = synced_editor("abc");
        editor.last_written = Some("ab".to_string());
        reconcile(&mut editor, snapshot("ab"), &tx);
        assert_eq!(editor.content, "abc");
        assert!(editor.last_written.is_none());
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn first_event_marks_synced() {
        let (tx, mut rx) = broadcast::channel(EVENT_CAPACITY);
        let mut editor = EditorState {
            phase: SyncPhase::Loading,
            ..EditorState::default()
        };
        reconcile(&mut editor, snapshot("hello"), &tx);
        assert_eq!(editor.phase, SyncPhase::Synced);
        assert_eq!(
            drain(&mut rx),
            vec![
                ClientEvent::ContentReplaced {
                    content: "hello".to_string()
                },
                ClientEvent::Synced,
            ]
        );
    }
}
