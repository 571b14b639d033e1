//! services/report_sync/src/adapters/memory_store.rs
//!
//! An in-process implementation of the `DocumentStore` port with realtime
//! fan-out over tokio broadcast channels. Besides serving local development it
//! exposes the knobs tests need: read/write counters, a write log, and switches
//! that make writes or subscriptions fail.

use async_trait::async_trait;
use chrono::Utc;
use nippou_core::domain::{
    DocumentFields, DocumentPath, DocumentSnapshot, FieldValue, ReportDraft, CONTENT_FIELD,
};
use nippou_core::ports::{DocumentStore, PortError, PortResult, SnapshotStream};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

const CHANNEL_CAPACITY: usize = 64;

type Push = PortResult<Option<DocumentSnapshot>>;

#[derive(Default)]
struct Documents {
    fields: HashMap<DocumentPath, DocumentFields>,
    channels: HashMap<DocumentPath, broadcast::Sender<Push>>,
    write_log: Vec<(DocumentPath, DocumentFields)>,
}

impl Documents {
    fn snapshot(&self, path: &DocumentPath) -> Option<DocumentSnapshot> {
        self.fields.get(path).map(|fields| DocumentSnapshot {
            path: path.clone(),
            fields: fields.clone(),
        })
    }

    fn channel(&mut self, path: &DocumentPath) -> &broadcast::Sender<Push> {
        self.channels.retain(|_, tx| tx.receiver_count() > 0);
        self.channels
            .entry(path.clone())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
    }

    /// Delivers `push` to the subscribers of `path`, forgetting the channel
    /// once nobody listens on it.
    fn publish(&mut self, path: &DocumentPath, push: Push) {
        let delivered = self
            .channels
            .get(path)
            .is_some_and(|tx| tx.send(push).is_ok());
        if !delivered {
            self.channels.remove(path);
        }
    }

    /// Applies a merge and notifies subscribers.
    fn merge(&mut self, path: &DocumentPath, fields: DocumentFields) {
        let now = Utc::now();
        let resolved = fields.into_iter().map(|(key, value)| match value {
            FieldValue::ServerTimestamp => (key, FieldValue::Timestamp(now)),
            other => (key, other),
        });
        let document = self.fields.entry(path.clone()).or_default();
        document.extend(resolved);

        let snapshot = self.snapshot(path);
        self.publish(path, Ok(snapshot));
    }
}

#[derive(Default)]
pub struct MemoryDocumentStore {
    documents: Mutex<Documents>,
    reads: AtomicUsize,
    fail_writes: AtomicBool,
    fail_subscriptions: AtomicBool,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn documents(&self) -> MutexGuard<'_, Documents> {
        self.documents.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes every `merge_set` fail as if the network were down.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Makes every `subscribe` (and `get`) fail.
    pub fn set_fail_subscriptions(&self, fail: bool) {
        self.fail_subscriptions.store(fail, Ordering::SeqCst);
    }

    /// Writes as another client would, bypassing the write log.
    pub fn push_remote(&self, path: &DocumentPath, fields: DocumentFields) {
        self.documents().merge(path, fields);
    }

    /// Delivers an error to every live subscriber of `path`.
    pub fn push_error(&self, path: &DocumentPath, error: PortError) {
        self.documents().publish(path, Err(error));
    }

    /// Number of `get`/`subscribe` calls served.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of successful `merge_set` calls.
    pub fn write_count(&self) -> usize {
        self.documents().write_log.len()
    }

    /// The `content` of each successful write, oldest first.
    pub fn written_contents(&self) -> Vec<String> {
        self.documents()
            .write_log
            .iter()
            .filter_map(|(path, fields)| {
                let snapshot = DocumentSnapshot {
                    path: path.clone(),
                    fields: fields.clone(),
                };
                fields
                    .contains_key(CONTENT_FIELD)
                    .then(|| ReportDraft::from_snapshot(&snapshot).content)
            })
            .collect()
    }

    /// The stored fields of `path`, if the document exists.
    pub fn document(&self, path: &DocumentPath) -> Option<DocumentFields> {
        self.documents().fields.get(path).cloned()
    }

    /// Paths that currently have a broadcast channel.
    pub fn channel_count(&self) -> usize {
        self.documents().channels.len()
    }

    /// Live subscriptions on `path`.
    pub fn subscriber_count(&self, path: &DocumentPath) -> usize {
        self.documents()
            .channels
            .get(path)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, path: &DocumentPath) -> PortResult<Option<DocumentSnapshot>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_subscriptions.load(Ordering::SeqCst) {
            return Err(PortError::Unexpected("simulated read failure".to_string()));
        }
        Ok(self.documents().snapshot(path))
    }

    async fn merge_set(&self, path: &DocumentPath, fields: DocumentFields) -> PortResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PortError::Unexpected("simulated network error".to_string()));
        }
        let mut documents = self.documents();
        documents.write_log.push((path.clone(), fields.clone()));
        documents.merge(path, fields);
        debug!("Merged write into {}", path);
        Ok(())
    }

    async fn subscribe(&self, path: &DocumentPath) -> PortResult<SnapshotStream> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_subscriptions.load(Ordering::SeqCst) {
            return Err(PortError::Unexpected("simulated subscription failure".to_string()));
        }

        // Snapshot and receiver are taken under one lock so no write slips between them.
        let (initial, mut rx) = {
            let mut documents = self.documents();
            let initial = documents.snapshot(path);
            (initial, documents.channel(path).subscribe())
        };

        let path = path.clone();
        let stream = async_stream::stream! {
            yield Ok(initial);
            loop {
                match rx.recv().await {
                    Ok(push) => yield push,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Subscriber of {} lagged by {} updates", path, skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use nippou_core::domain::LAST_UPDATED_FIELD;

    fn path() -> DocumentPath {
        DocumentPath::from_raw("users/u/dailyReports/currentDraft")
    }

    #[tokio::test]
    async fn merge_preserves_other_fields_and_stamps_time() {
        let store = MemoryDocumentStore::new();
        let mut extra = DocumentFields::new();
        extra.insert("department".to_string(), FieldValue::Text("製造部".to_string()));
        store.push_remote(&path(), extra);

        store
            .merge_set(&path(), ReportDraft::write_fields("did X"))
            .await
            .unwrap();

        let doc = store.document(&path()).unwrap();
        assert_eq!(
            doc.get("department"),
            Some(&FieldValue::Text("製造部".to_string()))
        );
        assert_eq!(doc.get(CONTENT_FIELD), Some(&FieldValue::Text("did X".to_string())));
        assert!(matches!(doc.get(LAST_UPDATED_FIELD), Some(FieldValue::Timestamp(_))));
        assert_eq!(store.written_contents(), vec!["did X".to_string()]);
    }

    #[tokio::test]
    async fn subscription_yields_current_state_then_changes() {
        let store = MemoryDocumentStore::new();
        let mut stream = store.subscribe(&path()).await.unwrap();

        assert_eq!(stream.next().await.unwrap().unwrap(), None);

        store
            .merge_set(&path(), ReportDraft::write_fields("foo"))
            .await
            .unwrap();
        let snapshot = stream.next().await.unwrap().unwrap().unwrap();
        assert_eq!(ReportDraft::from_snapshot(&snapshot).content, "foo");
        assert_eq!(store.subscriber_count(&path()), 1);

        drop(stream);
        assert_eq!(store.subscriber_count(&path()), 0);
    }

    #[tokio::test]
    async fn channels_without_subscribers_are_dropped() {
        let store = MemoryDocumentStore::new();
        let other = DocumentPath::from_raw("users/v/dailyReports/currentDraft");

        let stream = store.subscribe(&path()).await.unwrap();
        drop(stream);
        store.push_remote(&path(), ReportDraft::write_fields("nobody watching"));
        assert_eq!(store.channel_count(), 0);

        let abandoned = store.subscribe(&path()).await.unwrap();
        drop(abandoned);
        let _live = store.subscribe(&other).await.unwrap();
        assert_eq!(store.channel_count(), 1);
        assert_eq!(store.subscriber_count(&other), 1);
    }

    #[tokio::test]
    async fn get_reads_once_and_counts() {
        let store = MemoryDocumentStore::new();
        assert_eq!(store.get(&path()).await.unwrap(), None);

        store.push_remote(&path(), ReportDraft::write_fields("foo"));
        let snapshot = store.get(&path()).await.unwrap().unwrap();
        assert_eq!(ReportDraft::from_snapshot(&snapshot).content, "foo");
        assert_eq!(store.read_count(), 2);
        // Remote pushes are not this client's writes.
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn failing_writes_leave_no_trace() {
        let store = MemoryDocumentStore::new();
        store.set_fail_writes(true);
        assert!(store
            .merge_set(&path(), ReportDraft::write_fields("x"))
            .await
            .is_err());
        assert_eq!(store.write_count(), 0);
        assert!(store.document(&path()).is_none());
    }
}
