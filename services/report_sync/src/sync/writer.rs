//! services/report_sync/src/sync/writer.rs
//!
//! Turns local edits into debounced merge-writes of the user's draft.

use nippou_core::domain::{DocumentPath, ReportDraft, SaveStatus};
use nippou_core::ports::DocumentStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use super::debounce::Debouncer;
use super::state::{set_status, EventSender, SharedEditor};
use super::SyncError;

struct WriteTarget {
    store: Arc<dyn DocumentStore>,
    editor: SharedEditor,
    events: EventSender,
    /// Held for the duration of every store write.
    write_gate: Arc<Mutex<()>>,
}

pub struct DebouncedWriter {
    target: Arc<WriteTarget>,
    slot: Mutex<Debouncer>,
    window: Duration,
}

impl DebouncedWriter {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        editor: SharedEditor,
        events: EventSender,
        window: Duration,
    ) -> Self {
        Self {
            target: Arc::new(WriteTarget {
                store,
                editor,
                events,
                write_gate: Arc::new(Mutex::new(())),
            }),
            slot: Mutex::new(Debouncer::new()),
            window,
        }
    }

    /// Applies a local edit and (re)schedules the write of `content`.
    pub async fn submit_change(&self, content: String) -> Result<(), SyncError> {
        // The slot is held across the editor update so schedules keep edit order.
        let mut slot = self.slot.lock().await;
        let (path, epoch, edit) = {
            let mut editor = self.target.editor.lock().await;
            let Some(user_id) = editor.user_id.clone() else {
                return Err(SyncError::NotSignedIn);
            };
            editor.content = content.clone();
            editor.local_edits += 1;
            set_status(&mut editor, SaveStatus::UnsavedChanges, &self.target.events);
            (DocumentPath::current_draft(&user_id), editor.epoch, editor.local_edits)
        };

        let target = self.target.clone();
        slot.schedule(self.window, async move {
            target.write(path, content, epoch, edit).await;
        });
        Ok(())
    }

    /// Cancels the pending write and waits out one already in flight.
    ///
    /// Keep the returned guard until the session state has been cleared; no
    /// write can start while it is held.
    pub async fn cancel_pending(&self) -> OwnedMutexGuard<()> {
        if self.slot.lock().await.cancel() {
            info!("Cancelled a pending draft write");
        }
        self.target.write_gate.clone().lock_owned().await
    }

    /// Writes the pending edit now instead of waiting for the window to pass.
    pub async fn flush(&self) {
        let handle = self.slot.lock().await.flush();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Flushed draft write did not complete: {:?}", e);
            }
        }
    }
}

impl WriteTarget {
    /// Writes `content`, which was produced by local edit number `edit`.
    async fn write(&self, path: DocumentPath, content: String, epoch: u64, edit: u64) {
        let _gate = self.write_gate.lock().await;
        {
            let mut editor = self.editor.lock().await;
            if editor.epoch != epoch {
                debug!("Dropping a draft write for a closed session");
                return;
            }
            editor.last_written = Some(content.clone());
            set_status(&mut editor, SaveStatus::Saving, &self.events);
        }

        let result = self
            .store
            .merge_set(&path, ReportDraft::write_fields(&content))
            .await;

        let mut editor = self.editor.lock().await;
        if editor.epoch != epoch {
            return;
        }
        match result {
            Ok(()) => {
                info!("Saved draft {} ({} chars)", path, content.chars().count());
                // A later local edit is still waiting for its own write. Remote
                // replacements do not count; the editor already matches the store.
                if editor.local_edits == edit {
                    set_status(&mut editor, SaveStatus::Saved, &self.events);
                } else {
                    set_status(&mut editor, SaveStatus::UnsavedChanges, &self.events);
                }
            }
            Err(e) => {
                let error = SyncError::Write(e);
                error!("Failed to save draft {}: {}", path, error);
                editor.last_written = None;
                set_status(&mut editor, SaveStatus::SaveError, &self.events);
            }
        }
    }
}
