//! crates/nippou_core/src/domain.rs
//!
//! Defines the pure, core data structures for the daily report application.
//! These structs are independent of any database, transport or serialization format.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;

//=========================================================================================
// Identity
//=========================================================================================

/// An opaque user identifier issued by the auth service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a session was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignInMethod {
    Anonymous,
    CustomToken,
    EmailPassword,
}

/// An authenticated user context. Signed-out is represented as `Option::None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: UserId,
    pub email: Option<String>, // Only set for email/password accounts
    pub method: SignInMethod,
}

//=========================================================================================
// Documents
//=========================================================================================

/// The path of a document in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentPath(String);

impl DocumentPath {
    /// The single draft document owned by `user_id`.
    ///
    /// This is the only constructor the client uses, so a user can never end
    /// up with a second draft.
    pub fn current_draft(user_id: &UserId) -> Self {
        Self(format!("users/{}/dailyReports/currentDraft", user_id))
    }

    /// Wraps a raw path, e.g. one read back from a database row.
    pub fn from_raw(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single field value inside a stored document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Text(String),
    Timestamp(DateTime<Utc>),
    /// Write-only sentinel; the store replaces it with its own clock at write time.
    ServerTimestamp,
}

pub type DocumentFields = BTreeMap<String, FieldValue>;

/// The state of a document as seen by a reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentSnapshot {
    pub path: DocumentPath,
    pub fields: DocumentFields,
}

//=========================================================================================
// Report Draft
//=========================================================================================

pub const CONTENT_FIELD: &str = "content";
pub const LAST_UPDATED_FIELD: &str = "lastUpdated";

/// The decoded form of a user's draft document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportDraft {
    pub content: String,
    pub last_updated: Option<DateTime<Utc>>,
}

impl ReportDraft {
    /// Decodes a snapshot. A missing or non-text `content` field reads as empty.
    pub fn from_snapshot(snapshot: &DocumentSnapshot) -> Self {
        let content = match snapshot.fields.get(CONTENT_FIELD) {
            Some(FieldValue::Text(text)) => text.clone(),
            _ => String::new(),
        };
        let last_updated = match snapshot.fields.get(LAST_UPDATED_FIELD) {
            Some(FieldValue::Timestamp(ts)) => Some(*ts),
            _ => None,
        };
        Self {
            content,
            last_updated,
        }
    }

    /// The fields of a merge-write carrying `content`.
    pub fn write_fields(content: &str) -> DocumentFields {
        let mut fields = DocumentFields::new();
        fields.insert(CONTENT_FIELD.to_string(), FieldValue::Text(content.to_string()));
        fields.insert(LAST_UPDATED_FIELD.to_string(), FieldValue::ServerTimestamp);
        fields
    }
}

//=========================================================================================
// Client-local state
//=========================================================================================

/// The autosave indicator shown next to the editor. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveStatus {
    UnsavedChanges,
    Saving,
    Saved,
    SaveError,
    SignedOut,
}

impl SaveStatus {
    /// The text shown in the status indicator.
    pub fn label(&self) -> &'static str {
        match self {
            SaveStatus::UnsavedChanges => "未保存の変更があります",
            SaveStatus::Saving => "保存中...",
            SaveStatus::Saved => "保存済み",
            SaveStatus::SaveError => "保存エラー",
            SaveStatus::SignedOut => "ログアウト中",
        }
    }
}

/// Where the draft synchronizer is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    NoSession,
    Loading,
    Synced,
}
