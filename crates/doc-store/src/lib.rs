//! Remotely observable document store used as a signaling medium.
//!
//! Documents live under collection paths (`sessions/<id>`), carry a flat map
//! of JSON fields, and may own append-only sub-collections of entries
//! (`sessions/<id>/offererCandidates`). Every document and collection can be
//! watched: watchers receive a snapshot immediately and again after each
//! relevant write.

use std::fmt;

use async_trait::async_trait;
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

mod local;
#[cfg(feature = "redis-store")]
mod redis_store;

pub use local::LocalStore;
#[cfg(feature = "redis-store")]
pub use redis_store::RedisStore;

/// Field map of a single document.
pub type Fields = serde_json::Map<String, Value>;

pub type StoreResult<T> = Result<T, StoreError>;

const AUTO_ID_LEN: usize = 20;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document {0} not found")]
    NotFound(String),
    #[error("document {0} already exists")]
    AlreadyExists(String),
    #[error("field {field} of {path} is already set")]
    Conflict { path: String, field: String },
    #[error("malformed stored value: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("store subscription closed")]
    Closed,
}

/// Generate a document or entry id: 20 characters of `[A-Za-z0-9]`, short
/// enough to read out loud and safe to paste anywhere.
pub fn auto_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(AUTO_ID_LEN)
        .map(char::from)
        .collect()
}

/// Returns true when `key` is present in `fields` with a non-null value.
pub fn is_set(fields: &Fields, key: &str) -> bool {
    matches!(fields.get(key), Some(value) if !value.is_null())
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionPath(String);

impl CollectionPath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Reference to the document `id` inside this collection. Nothing is
    /// written.
    pub fn doc(&self, id: impl Into<String>) -> DocHandle {
        DocHandle {
            collection: self.clone(),
            id: id.into(),
        }
    }
}

impl fmt::Display for CollectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocHandle {
    collection: CollectionPath,
    id: String,
}

impl DocHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn collection(&self) -> &CollectionPath {
        &self.collection
    }

    pub fn path(&self) -> String {
        format!("{}/{}", self.collection, self.id)
    }

    pub fn subcollection(&self, name: &str) -> CollectionPath {
        CollectionPath(format!("{}/{}", self.path(), name))
    }
}

impl fmt::Display for DocHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// State of one document at the moment a watcher was notified.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSnapshot {
    pub doc: DocHandle,
    pub fields: Option<Fields>,
}

impl DocumentSnapshot {
    pub fn exists(&self) -> bool {
        self.fields.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntryChange {
    pub kind: ChangeKind,
    pub id: String,
    pub value: Value,
}

/// Changes to a collection since the watcher's previous snapshot. The first
/// snapshot reports every existing entry as [`ChangeKind::Added`].
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionSnapshot {
    pub collection: CollectionPath,
    pub changes: Vec<EntryChange>,
}

/// Guard evaluated atomically with a merge update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// The document must exist.
    Exists,
    /// The document must exist and none of the written fields may already
    /// hold a non-null value.
    FieldsAbsent,
}

/// Live feed of snapshots. Dropping it detaches the watcher.
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<StoreResult<T>>,
    task: Option<JoinHandle<()>>,
}

impl<T> Subscription<T> {
    pub fn from_receiver(rx: mpsc::UnboundedReceiver<StoreResult<T>>) -> Self {
        Self { rx, task: None }
    }

    pub fn with_task(rx: mpsc::UnboundedReceiver<StoreResult<T>>, task: JoinHandle<()>) -> Self {
        Self {
            rx,
            task: Some(task),
        }
    }

    /// Next snapshot, or `None` once the store side has gone away.
    pub async fn next(&mut self) -> Option<StoreResult<T>> {
        self.rx.recv().await
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Pre-assign an id for a new document in `collection`. The write is
    /// deferred to a later `create_document`/`set_document`.
    fn new_document(&self, collection: &CollectionPath) -> DocHandle;

    /// Write `fields` as a new document; fails with
    /// [`StoreError::AlreadyExists`] if the document is already present.
    async fn create_document(&self, doc: &DocHandle, fields: Fields) -> StoreResult<()>;

    /// Replace the document with `fields`, creating it if necessary.
    async fn set_document(&self, doc: &DocHandle, fields: Fields) -> StoreResult<()>;

    /// Merge `patch` into the document. Fields not named in `patch` are kept.
    async fn update_document(
        &self,
        doc: &DocHandle,
        patch: Fields,
        precondition: Precondition,
    ) -> StoreResult<()>;

    async fn get_document(&self, doc: &DocHandle) -> StoreResult<Option<Fields>>;

    /// Append an entry to `collection` and return its id.
    async fn add_entry(&self, collection: &CollectionPath, value: Value) -> StoreResult<String>;

    /// All entries of `collection` in append order.
    async fn list_entries(&self, collection: &CollectionPath) -> StoreResult<Vec<(String, Value)>>;

    async fn watch_document(&self, doc: &DocHandle) -> StoreResult<Subscription<DocumentSnapshot>>;

    async fn watch_collection(
        &self,
        collection: &CollectionPath,
    ) -> StoreResult<Subscription<CollectionSnapshot>>;
}

/// Apply `patch` to `existing` under `precondition`. Shared by in-process
/// stores; remote stores evaluate the same rules server-side.
pub fn merge_fields(
    path: &str,
    existing: &mut Fields,
    patch: Fields,
    precondition: Precondition,
) -> StoreResult<()> {
    if precondition == Precondition::FieldsAbsent {
        if let Some(field) = patch.keys().find(|key| is_set(existing, key)) {
            return Err(StoreError::Conflict {
                path: path.to_string(),
                field: field.clone(),
            });
        }
    }
    for (key, value) in patch {
        existing.insert(key, value);
    }
    Ok(())
}
