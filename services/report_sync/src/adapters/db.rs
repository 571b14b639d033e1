//! services/report_sync/src/adapters/db.rs
//!
//! This module contains the database adapter, the PostgreSQL implementation of
//! both the `AuthService` and `DocumentStore` ports from the `core` crate.
//! Documents are stored as jsonb and merged with `||`; realtime updates are
//! delivered through `LISTEN/NOTIFY`. One listener connection per adapter is
//! shared by every subscription, so open editors do not hold pool connections.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use nippou_core::domain::{
    DocumentFields, DocumentPath, DocumentSnapshot, FieldValue, Session, SignInMethod, UserId,
};
use nippou_core::ports::{
    AuthError, AuthResult, AuthService, DocumentStore, PortError, PortResult, SnapshotStream,
};
use serde_json::{Map, Value};
use sqlx::postgres::PgListener;
use sqlx::{FromRow, PgPool};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::password::{check_strength, hash_password, verify_password};

/// The NOTIFY channel carrying the path of each changed document.
const CHANGE_CHANNEL: &str = "document_changes";

/// Key under which timestamps are encoded inside the jsonb document.
const TIMESTAMP_KEY: &str = "timestampValue";

const CHANGE_CAPACITY: usize = 16;

/// Pause before polling the listener again after it failed to reconnect.
const LISTENER_RETRY: std::time::Duration = std::time::Duration::from_secs(1);

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A database adapter that implements the `AuthService` and `DocumentStore` ports.
#[derive(Clone)]
pub struct DbAdapter {
    pool: PgPool,
    feed: Arc<ChangeFeed>,
    /// Set once the shared listener task is running.
    listener: Arc<OnceCell<()>>,
}

impl DbAdapter {
    /// Creates a new `DbAdapter`.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            feed: Arc::new(ChangeFeed::default()),
            listener: Arc::new(OnceCell::new()),
        }
    }

    /// A helper function to run database migrations at startup.
    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }

    /// Stores a bootstrap token for `user_id`, valid for `ttl`.
    pub async fn issue_custom_token(&self, user_id: &UserId, ttl: Duration) -> PortResult<String> {
        let token = Uuid::new_v4().to_string();
        sqlx::query("INSERT INTO custom_tokens (token, user_id, expires_at) VALUES ($1, $2, $3)")
            .bind(&token)
            .bind(user_id.as_str())
            .bind(Utc::now() + ttl)
            .execute(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                    PortError::NotFound(format!("user {}", user_id))
                }
                other => PortError::Unexpected(other.to_string()),
            })?;
        info!("Issued a bootstrap token for {}", user_id);
        Ok(token)
    }

    /// Deletes anonymous users created before `idle` ago whose documents have
    /// not been written since, together with those documents.
    pub async fn purge_idle_anonymous_users(&self, idle: Duration) -> PortResult<u64> {
        let cutoff = Utc::now() - idle;
        let result = sqlx::query(
            "WITH stale AS (
                 SELECT u.user_id FROM users u
                 WHERE u.email IS NULL AND u.created_at < $1
                   AND NOT EXISTS (
                       SELECT 1 FROM documents d
                       WHERE starts_with(d.path, 'users/' || u.user_id || '/')
                         AND d.updated_at >= $1)
             ), dropped AS (
                 DELETE FROM documents d USING stale s
                 WHERE starts_with(d.path, 'users/' || s.user_id || '/')
             )
             DELETE FROM users u USING stale s WHERE u.user_id = s.user_id",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| PortError::Unexpected(e.to_string()))?;
        Ok(result.rows_affected())
    }

    /// Starts the single `LISTEN` connection on first use.
    async fn ensure_listener(&self) -> PortResult<()> {
        self.listener
            .get_or_try_init(|| async {
                let mut listener = PgListener::connect_with(&self.pool)
                    .await
                    .map_err(|e| PortError::Unexpected(e.to_string()))?;
                listener
                    .listen(CHANGE_CHANNEL)
                    .await
                    .map_err(|e| PortError::Unexpected(e.to_string()))?;
                info!("Listening for document changes on '{}'", CHANGE_CHANNEL);
                tokio::spawn(run_change_listener(listener, Arc::downgrade(&self.feed)));
                Ok::<(), PortError>(())
            })
            .await?;
        Ok(())
    }
}

/// Sweeps idle anonymous users every `every` until the task is aborted.
pub fn spawn_anonymous_user_sweep(
    db: DbAdapter,
    idle: std::time::Duration,
    every: std::time::Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let idle = match Duration::from_std(idle) {
            Ok(idle) => idle,
            Err(e) => {
                error!("Anonymous user TTL {:?} is out of range: {}", idle, e);
                return;
            }
        };
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            match db.purge_idle_anonymous_users(idle).await {
                Ok(0) => debug!("No idle anonymous users to purge"),
                Ok(purged) => info!("Purged {} idle anonymous users", purged),
                Err(e) => warn!("Anonymous user sweep failed: {}", e),
            }
        }
    })
}

//=========================================================================================
// Change Fan-out
//=========================================================================================

/// A change of a watched document, or a failure of the shared listener.
type Change = PortResult<()>;

/// Routes notifications from the one listener connection to per-path subscribers.
#[derive(Default)]
struct ChangeFeed {
    channels: Mutex<HashMap<String, broadcast::Sender<Change>>>,
}

impl ChangeFeed {
    fn channels(&self) -> MutexGuard<'_, HashMap<String, broadcast::Sender<Change>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn watch(&self, path: &str) -> broadcast::Receiver<Change> {
        let mut channels = self.channels();
        channels.retain(|_, tx| tx.receiver_count() > 0);
        channels
            .entry(path.to_string())
            .or_insert_with(|| broadcast::channel(CHANGE_CAPACITY).0)
            .subscribe()
    }

    /// Wakes the subscribers of `path`. Returns `false` if nobody is watching it.
    fn notify(&self, path: &str) -> bool {
        let mut channels = self.channels();
        let delivered = channels
            .get(path)
            .is_some_and(|tx| tx.send(Ok(())).is_ok());
        if !delivered {
            channels.remove(path);
        }
        delivered
    }

    /// Sends `change` to every subscriber, e.g. after notifications may have been lost.
    fn notify_all(&self, change: Change) {
        self.channels()
            .retain(|_, tx| tx.send(change.clone()).is_ok());
    }

    fn watched_paths(&self) -> usize {
        self.channels().len()
    }
}

async fn run_change_listener(mut listener: PgListener, feed: Weak<ChangeFeed>) {
    loop {
        let received = listener.try_recv().await;
        let Some(feed) = feed.upgrade() else {
            debug!("Document adapter dropped; stopping the change listener");
            return;
        };
        match received {
            Ok(Some(notification)) => {
                if !feed.notify(notification.payload()) {
                    debug!("No subscriber for {}", notification.payload());
                }
            }
            Ok(None) => {
                // Reconnects on the next call; anything sent meanwhile is lost.
                warn!("Change listener lost its connection; reconnecting");
                feed.notify_all(Ok(()));
            }
            Err(e) => {
                error!("Change listener failed: {:?}", e);
                feed.notify_all(Err(PortError::Unexpected(e.to_string())));
                tokio::time::sleep(LISTENER_RETRY).await;
            }
        }
    }
}

//=========================================================================================
// "Impure" Database Record Structs
//=========================================================================================

#[derive(FromRow)]
struct UserCredentialsRecord {
    user_id: String,
    email: String,
    hashed_password: String,
}

#[derive(FromRow)]
struct DocumentRecord {
    path: String,
    fields: Value,
}
impl DocumentRecord {
    fn to_domain(self) -> DocumentSnapshot {
        DocumentSnapshot {
            path: DocumentPath::from_raw(self.path),
            fields: decode_fields(self.fields),
        }
    }
}

fn decode_fields(value: Value) -> DocumentFields {
    let Value::Object(map) = value else {
        warn!("Document body is not a JSON object; treating it as empty");
        return DocumentFields::new();
    };
    map.into_iter()
        .filter_map(|(key, value)| {
            let decoded = match value {
                Value::String(text) => Some(FieldValue::Text(text)),
                Value::Object(ref inner) => inner
                    .get(TIMESTAMP_KEY)
                    .and_then(Value::as_str)
                    .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                    .map(|ts| FieldValue::Timestamp(ts.with_timezone(&Utc))),
                _ => None,
            };
            if decoded.is_none() {
                debug!("Skipping undecodable field '{}'", key);
            }
            decoded.map(|field| (key, field))
        })
        .collect()
}

/// Splits a write into the jsonb patch and the keys the server must timestamp.
fn encode_fields(fields: DocumentFields) -> (Value, Vec<String>) {
    let mut patch = Map::new();
    let mut server_stamped = Vec::new();
    for (key, field) in fields {
        match field {
            FieldValue::Text(text) => {
                patch.insert(key, Value::String(text));
            }
            FieldValue::Timestamp(ts) => {
                let mut inner = Map::new();
                inner.insert(TIMESTAMP_KEY.to_string(), Value::String(ts.to_rfc3339()));
                patch.insert(key, Value::Object(inner));
            }
            FieldValue::ServerTimestamp => server_stamped.push(key),
        }
    }
    (Value::Object(patch), server_stamped)
}

async fn fetch_document(pool: &PgPool, path: &DocumentPath) -> PortResult<Option<DocumentSnapshot>> {
    let record = sqlx::query_as::<_, DocumentRecord>(
        "SELECT path, fields FROM documents WHERE path = $1",
    )
    .bind(path.as_str())
    .fetch_optional(pool)
    .await
    .map_err(|e| PortError::Unexpected(e.to_string()))?;
    Ok(record.map(DocumentRecord::to_domain))
}

fn map_auth_db_error(e: sqlx::Error) -> AuthError {
    match e {
        sqlx::Error::RowNotFound => AuthError::InvalidCredential,
        sqlx::Error::Database(db) if db.is_unique_violation() => AuthError::EmailAlreadyInUse,
        other => {
            error!("Auth query failed: {:?}", other);
            AuthError::Other(other.to_string())
        }
    }
}

//=========================================================================================
// `DocumentStore` Trait Implementation
//=========================================================================================

#[async_trait]
impl DocumentStore for DbAdapter {
    async fn get(&self, path: &DocumentPath) -> PortResult<Option<DocumentSnapshot>> {
        fetch_document(&self.pool, path).await
    }

    async fn merge_set(&self, path: &DocumentPath, fields: DocumentFields) -> PortResult<()> {
        let (patch, server_stamped) = encode_fields(fields);
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| PortError::Unexpected(e.to_string()))?;

        sqlx::query(
            "INSERT INTO documents (path, fields, updated_at)
             VALUES ($1, $2::jsonb || COALESCE(
                 (SELECT jsonb_object_agg(k, jsonb_build_object('timestampValue', to_jsonb(NOW())))
                  FROM unnest($3::text[]) AS k),
                 '{}'::jsonb), NOW())
             ON CONFLICT (path) DO UPDATE
             SET fields = documents.fields || EXCLUDED.fields, updated_at = NOW()",
        )
        .bind(path.as_str())
        .bind(&patch)
        .bind(&server_stamped)
        .execute(&mut *tx)
        .await
        .map_err(|e| PortError::Unexpected(e.to_string()))?;

        // Delivered to listeners on commit.
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(CHANGE_CHANNEL)
            .bind(path.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| PortError::Unexpected(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| PortError::Unexpected(e.to_string()))?;
        Ok(())
    }

    async fn subscribe(&self, path: &DocumentPath) -> PortResult<SnapshotStream> {
        self.ensure_listener().await?;
        // Watch before the first read so no change falls between the two.
        let mut changes = self.feed.watch(path.as_str());
        debug!("{} document(s) watched", self.feed.watched_paths());

        let pool = self.pool.clone();
        let path = path.clone();
        let stream = async_stream::stream! {
            yield fetch_document(&pool, &path).await;
            loop {
                match changes.recv().await {
                    Ok(Ok(())) => yield fetch_document(&pool, &path).await,
                    Ok(Err(e)) => yield Err(e),
                    Err(RecvError::Lagged(skipped)) => {
                        // One read covers every skipped change.
                        debug!("Coalesced {} changes of {}", skipped, path);
                        yield fetch_document(&pool, &path).await;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

//=========================================================================================
// `AuthService` Trait Implementation
//=========================================================================================

#[async_trait]
impl AuthService for DbAdapter {
    async fn sign_in_anonymously(&self) -> AuthResult<Session> {
        let user_id = UserId::new(Uuid::new_v4().simple().to_string());
        sqlx::query("INSERT INTO users (user_id) VALUES ($1)")
            .bind(user_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(map_auth_db_error)?;
        Ok(Session {
            user_id,
            email: None,
            method: SignInMethod::Anonymous,
        })
    }

    async fn sign_in_with_custom_token(&self, token: &str) -> AuthResult<Session> {
        let user_id: String = sqlx::query_scalar(
            "SELECT user_id FROM custom_tokens WHERE token = $1 AND expires_at > NOW()",
        )
        .bind(token)
        .fetch_one(&self.pool)
        .await
        .map_err(map_auth_db_error)?;
        Ok(Session {
            user_id: UserId::new(user_id),
            email: None,
            method: SignInMethod::CustomToken,
        })
    }

    async fn create_user_with_email(&self, email: &str, password: &str) -> AuthResult<Session> {
        check_strength(password)?;
        let hashed_password = hash_password(password)?;
        let user_id = UserId::new(Uuid::new_v4().simple().to_string());
        let email = email.trim().to_lowercase();

        sqlx::query("INSERT INTO users (user_id, email, hashed_password) VALUES ($1, $2, $3)")
            .bind(user_id.as_str())
            .bind(&email)
            .bind(&hashed_password)
            .execute(&self.pool)
            .await
            .map_err(map_auth_db_error)?;

        Ok(Session {
            user_id,
            email: Some(email),
            method: SignInMethod::EmailPassword,
        })
    }

    async fn sign_in_with_email(&self, email: &str, password: &str) -> AuthResult<Session> {
        let record = sqlx::query_as::<_, UserCredentialsRecord>(
            "SELECT user_id, email, hashed_password FROM users
             WHERE email = $1 AND hashed_password IS NOT NULL",
        )
        .bind(email.trim().to_lowercase())
        .fetch_one(&self.pool)
        .await
        .map_err(map_auth_db_error)?;

        verify_password(password, &record.hashed_password)?;
        Ok(Session {
            user_id: UserId::new(record.user_id),
            email: Some(record.email),
            method: SignInMethod::EmailPassword,
        })
    }

    async fn sign_out(&self, session: &Session) -> AuthResult<()> {
        // Sessions are not persisted server-side; nothing to revoke.
        debug!("Signed out {}", session.user_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encode_splits_out_server_timestamps() {
        let mut fields = DocumentFields::new();
        fields.insert("content".to_string(), FieldValue::Text("did X".to_string()));
        fields.insert("lastUpdated".to_string(), FieldValue::ServerTimestamp);

        let (patch, stamped) = encode_fields(fields);
        assert_eq!(patch, json!({ "content": "did X" }));
        assert_eq!(stamped, vec!["lastUpdated".to_string()]);
    }

    #[test]
    fn change_feed_routes_by_path() {
        let feed = ChangeFeed::default();
        let mut mine = feed.watch("users/a/dailyReports/currentDraft");
        let mut theirs = feed.watch("users/b/dailyReports/currentDraft");

        assert!(feed.notify("users/a/dailyReports/currentDraft"));
        assert!(matches!(mine.try_recv(), Ok(Ok(()))));
        assert!(theirs.try_recv().is_err());

        feed.notify_all(Err(PortError::Unexpected("listener down".to_string())));
        assert!(matches!(mine.try_recv(), Ok(Err(_))));
        assert!(matches!(theirs.try_recv(), Ok(Err(_))));
    }

    #[test]
    fn change_feed_drops_unwatched_paths() {
        let feed = ChangeFeed::default();
        let first = feed.watch("users/a/dailyReports/currentDraft");
        drop(first);
        assert!(!feed.notify("users/a/dailyReports/currentDraft"));
        assert_eq!(feed.watched_paths(), 0);

        let stale = feed.watch("users/b/dailyReports/currentDraft");
        drop(stale);
        let _live = feed.watch("users/c/dailyReports/currentDraft");
        assert_eq!(feed.watched_paths(), 1);
    }

    #[test]
    fn decode_reads_text_and_postgres_timestamps() {
        let fields = decode_fields(json!({
            "content": "did X",
            "lastUpdated": { "timestampValue": "2025-07-22T09:30:00.123456+00:00" },
            "count": 3
        }));
        assert_eq!(fields.get("content"), Some(&FieldValue::Text("did X".to_string())));
        assert!(matches!(fields.get("lastUpdated"), Some(FieldValue::Timestamp(_))));
        assert!(!fields.contains_key("count"));
    }
}
