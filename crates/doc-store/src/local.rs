use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::{
    ChangeKind, CollectionPath, CollectionSnapshot, DocHandle, DocumentSnapshot, DocumentStore,
    EntryChange, Fields, Precondition, StoreError, StoreResult, Subscription, auto_id,
    merge_fields,
};

type IdSource = Box<dyn FnMut() -> String + Send>;
type DocSender = mpsc::UnboundedSender<StoreResult<DocumentSnapshot>>;
type CollectionSender = mpsc::UnboundedSender<StoreResult<CollectionSnapshot>>;

/// In-process document store for tests and single-host runs.
///
/// Watchers are notified while the state lock is held, so every watcher sees
/// writes in the order they were applied and no write can slip between a
/// watcher's initial snapshot and its registration.
pub struct LocalStore {
    state: Mutex<State>,
    ids: Mutex<IdSource>,
}

#[derive(Default)]
struct State {
    documents: HashMap<String, Fields>,
    entries: HashMap<String, Vec<(String, Value)>>,
    doc_watchers: HashMap<String, Vec<DocSender>>,
    collection_watchers: HashMap<String, Vec<CollectionSender>>,
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalStore {
    pub fn new() -> Self {
        Self::with_id_source(auto_id)
    }

    /// Use `source` to name new documents. Entry ids stay random.
    pub fn with_id_source(source: impl FnMut() -> String + Send + 'static) -> Self {
        Self {
            state: Mutex::new(State::default()),
            ids: Mutex::new(Box::new(source)),
        }
    }

    /// Hand out `ids` in order for new documents, then fall back to random ids.
    pub fn with_ids<I>(ids: I) -> Self
    where
        I: IntoIterator<Item = String>,
        I::IntoIter: Send + 'static,
    {
        let mut ids = ids.into_iter();
        Self::with_id_source(move || ids.next().unwrap_or_else(auto_id))
    }
}

impl State {
    fn notify_document(&mut self, doc: &DocHandle) {
        let path = doc.path();
        let Some(watchers) = self.doc_watchers.get_mut(&path) else {
            return;
        };
        let snapshot = DocumentSnapshot {
            doc: doc.clone(),
            fields: self.documents.get(&path).cloned(),
        };
        watchers.retain(|tx| tx.send(Ok(snapshot.clone())).is_ok());
    }

    fn notify_added(&mut self, collection: &CollectionPath, id: &str, value: &Value) {
        let Some(watchers) = self.collection_watchers.get_mut(collection.as_str()) else {
            return;
        };
        let snapshot = CollectionSnapshot {
            collection: collection.clone(),
            changes: vec![EntryChange {
                kind: ChangeKind::Added,
                id: id.to_string(),
                value: value.clone(),
            }],
        };
        watchers.retain(|tx| tx.send(Ok(snapshot.clone())).is_ok());
    }
}

#[async_trait]
impl DocumentStore for LocalStore {
    fn new_document(&self, collection: &CollectionPath) -> DocHandle {
        let mut next_id = self.ids.lock();
        collection.doc((*next_id)())
    }

    async fn create_document(&self, doc: &DocHandle, fields: Fields) -> StoreResult<()> {
        let mut state = self.state.lock();
        let path = doc.path();
        if state.documents.contains_key(&path) {
            return Err(StoreError::AlreadyExists(path));
        }
        state.documents.insert(path, fields);
        state.notify_document(doc);
        Ok(())
    }

    async fn set_document(&self, doc: &DocHandle, fields: Fields) -> StoreResult<()> {
        let mut state = self.state.lock();
        state.documents.insert(doc.path(), fields);
        state.notify_document(doc);
        Ok(())
    }

    async fn update_document(
        &self,
        doc: &DocHandle,
        patch: Fields,
        precondition: Precondition,
    ) -> StoreResult<()> {
        let mut state = self.state.lock();
        let path = doc.path();
        let existing = state
            .documents
            .get_mut(&path)
            .ok_or_else(|| StoreError::NotFound(path.clone()))?;
        merge_fields(&path, existing, patch, precondition)?;
        state.notify_document(doc);
        Ok(())
    }

    async fn get_document(&self, doc: &DocHandle) -> StoreResult<Option<Fields>> {
        Ok(self.state.lock().documents.get(&doc.path()).cloned())
    }

    async fn add_entry(&self, collection: &CollectionPath, value: Value) -> StoreResult<String> {
        let id = auto_id();
        let mut state = self.state.lock();
        state
            .entries
            .entry(collection.as_str().to_string())
            .or_default()
            .push((id.clone(), value.clone()));
        state.notify_added(collection, &id, &value);
        Ok(id)
    }

    async fn list_entries(&self, collection: &CollectionPath) -> StoreResult<Vec<(String, Value)>> {
        Ok(self
            .state
            .lock()
            .entries
            .get(collection.as_str())
            .cloned()
            .unwrap_or_default())
    }

    async fn watch_document(&self, doc: &DocHandle) -> StoreResult<Subscription<DocumentSnapshot>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        let path = doc.path();
        let initial = DocumentSnapshot {
            doc: doc.clone(),
            fields: state.documents.get(&path).cloned(),
        };
        tx.send(Ok(initial)).map_err(|_| StoreError::Closed)?;
        state.doc_watchers.entry(path).or_default().push(tx);
        Ok(Subscription::from_receiver(rx))
    }

    async fn watch_collection(
        &self,
        collection: &CollectionPath,
    ) -> StoreResult<Subscription<CollectionSnapshot>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        let changes = state
            .entries
            .get(collection.as_str())
            .map(|entries| {
                entries
                    .iter()
                    .map(|(id, value)| EntryChange {
                        kind: ChangeKind::Added,
                        id: id.clone(),
                        value: value.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        tx.send(Ok(CollectionSnapshot {
            collection: collection.clone(),
            changes,
        }))
        .map_err(|_| StoreError::Closed)?;
        state
            .collection_watchers
            .entry(collection.as_str().to_string())
            .or_default()
            .push(tx);
        Ok(Subscription::from_receiver(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Fields {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test_timeout::timeout(5)]
    async fn pinned_ids_are_used_in_order() {
        let store = LocalStore::with_ids(["ABC123".to_string()]);
        let sessions = CollectionPath::new("sessions");
        assert_eq!(store.new_document(&sessions).id(), "ABC123");
        assert_ne!(store.new_document(&sessions).id(), "ABC123");
    }

    #[test_timeout::timeout(5)]
    async fn create_rejects_existing_document() {
        let store = LocalStore::new();
        let doc = CollectionPath::new("sessions").doc("a");
        store.create_document(&doc, Fields::new()).await.expect("create");
        let err = store
            .create_document(&doc, Fields::new())
            .await
            .expect_err("second create");
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[test_timeout::timeout(5)]
    async fn update_requires_document() {
        let store = LocalStore::new();
        let doc = CollectionPath::new("sessions").doc("missing");
        let err = store
            .update_document(&doc, fields(json!({"answer": 1})), Precondition::Exists)
            .await
            .expect_err("update of missing document");
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test_timeout::timeout(5)]
    async fn document_watch_sees_current_state_then_each_write() {
        let store = LocalStore::new();
        let doc = CollectionPath::new("sessions").doc("a");
        let mut watch = store.watch_document(&doc).await.expect("watch");

        let first = watch.next().await.expect("initial").expect("ok");
        assert!(!first.exists());

        store
            .set_document(&doc, fields(json!({"offer": "o"})))
            .await
            .expect("set");
        store
            .update_document(&doc, fields(json!({"answer": "a"})), Precondition::Exists)
            .await
            .expect("update");

        let second = watch.next().await.expect("set snapshot").expect("ok");
        assert_eq!(second.fields, Some(fields(json!({"offer": "o"}))));
        let third = watch.next().await.expect("update snapshot").expect("ok");
        assert_eq!(
            third.fields,
            Some(fields(json!({"offer": "o", "answer": "a"})))
        );
    }

    #[test_timeout::timeout(5)]
    async fn collection_watch_replays_existing_entries_then_streams_new_ones() {
        let store = LocalStore::new();
        let collection = CollectionPath::new("sessions/a/offererCandidates");
        store.add_entry(&collection, json!("c1")).await.expect("add");
        store.add_entry(&collection, json!("c2")).await.expect("add");

        let mut watch = store.watch_collection(&collection).await.expect("watch");
        let initial = watch.next().await.expect("initial").expect("ok");
        let values: Vec<_> = initial.changes.iter().map(|c| c.value.clone()).collect();
        assert_eq!(values, vec![json!("c1"), json!("c2")]);
        assert!(initial.changes.iter().all(|c| c.kind == ChangeKind::Added));

        store.add_entry(&collection, json!("c3")).await.expect("add");
        let late = watch.next().await.expect("late").expect("ok");
        assert_eq!(late.changes.len(), 1);
        assert_eq!(late.changes[0].value, json!("c3"));
    }

    #[test_timeout::timeout(5)]
    async fn collections_are_isolated() {
        let store = LocalStore::new();
        let ours = CollectionPath::new("sessions/a/offererCandidates");
        let theirs = CollectionPath::new("sessions/a/answererCandidates");
        let mut watch = store.watch_collection(&ours).await.expect("watch");
        let _ = watch.next().await;

        store.add_entry(&theirs, json!("x")).await.expect("add");
        store.add_entry(&ours, json!("y")).await.expect("add");

        let next = watch.next().await.expect("snapshot").expect("ok");
        assert_eq!(next.changes[0].value, json!("y"));
        assert_eq!(store.list_entries(&theirs).await.expect("list").len(), 1);
    }
}
