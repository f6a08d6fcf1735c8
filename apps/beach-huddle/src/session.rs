//! Session creation, join-by-code and the write-once record fields.

use std::sync::Arc;

use doc_store::{
    CollectionPath, DocHandle, DocumentSnapshot, DocumentStore, Precondition, StoreError,
    Subscription,
};

use crate::error::{SignalError, SignalResult};
use crate::relay::CandidateRelay;
use crate::schema::{
    ANSWER_FIELD, OFFER_FIELD, Role, SessionDescription, SessionRecord, description_patch,
};

pub const DEFAULT_COLLECTION: &str = "sessions";

/// Entry point to the Session Records of one root collection.
#[derive(Clone)]
pub struct Sessions {
    store: Arc<dyn DocumentStore>,
    collection: CollectionPath,
}

impl Sessions {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self::with_collection(store, DEFAULT_COLLECTION)
    }

    pub fn with_collection(store: Arc<dyn DocumentStore>, collection: impl Into<String>) -> Self {
        Self {
            store,
            collection: CollectionPath::new(collection),
        }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Reserve a session id without writing anything.
    pub fn allocate(&self) -> SessionHandle {
        self.handle_for(self.store.new_document(&self.collection))
    }

    /// Handle to an existing (or expected) session.
    pub fn handle(&self, session_id: &str) -> SessionHandle {
        self.handle_for(self.collection.doc(session_id))
    }

    /// Create a record with `offer` and `answer` both unset. The returned id
    /// is the join code.
    pub async fn create_session(&self) -> SignalResult<SessionHandle> {
        let session = self.allocate();
        self.store
            .create_document(&session.doc, SessionRecord::default().to_fields())
            .await
            .map_err(|err| match err {
                StoreError::AlreadyExists(path) => {
                    SignalError::InvalidState(format!("session {path} already exists"))
                }
                other => SignalError::Transport(other),
            })?;
        tracing::info!(target = "huddle::session", session = %session.id(), "created session");
        Ok(session)
    }

    /// Read the record behind a join code. Fails `NotFound` for an unknown
    /// code and `InvalidState` while no offer has been published.
    pub async fn join_session(&self, session_id: &str) -> SignalResult<SessionRecord> {
        let record = self.handle(session_id).fetch().await?;
        if record.offer.is_none() {
            return Err(SignalError::InvalidState(format!(
                "session {session_id} has no offer yet"
            )));
        }
        tracing::debug!(target = "huddle::session", session = %session_id, "joined session");
        Ok(record)
    }

    /// Record contents plus relay sizes, for diagnostics.
    pub async fn inspect(&self, session_id: &str) -> SignalResult<SessionSummary> {
        let session = self.handle(session_id);
        let record = session.fetch().await?;
        // The Initiator's outbound collection is `offererCandidates`.
        let relay = session.relay(Role::Initiator);
        let offerer_candidates = self.store.list_entries(relay.outbound()).await?.len();
        let answerer_candidates = self.store.list_entries(relay.inbound()).await?.len();
        Ok(SessionSummary {
            session_id: session_id.to_string(),
            record,
            offerer_candidates,
            answerer_candidates,
        })
    }

    fn handle_for(&self, doc: DocHandle) -> SessionHandle {
        SessionHandle {
            store: self.store.clone(),
            doc,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub session_id: String,
    pub record: SessionRecord,
    pub offerer_candidates: usize,
    pub answerer_candidates: usize,
}

#[derive(Clone)]
pub struct SessionHandle {
    store: Arc<dyn DocumentStore>,
    doc: DocHandle,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        self.doc.id()
    }

    pub fn doc(&self) -> &DocHandle {
        &self.doc
    }

    pub fn relay(&self, role: Role) -> CandidateRelay {
        CandidateRelay::new(self.store.clone(), &self.doc, role)
    }

    /// Write the `offer` field once. Creates the record if `create_session`
    /// was skipped; fails `InvalidState` if an offer is already there.
    pub async fn publish_offer(&self, offer: &SessionDescription) -> SignalResult<()> {
        let patch = description_patch(OFFER_FIELD, offer);
        let result = self
            .store
            .update_document(&self.doc, patch, Precondition::FieldsAbsent)
            .await;
        match result {
            Ok(()) => {}
            Err(StoreError::NotFound(_)) => {
                let record = SessionRecord {
                    offer: Some(offer.clone()),
                    answer: None,
                };
                self.store
                    .create_document(&self.doc, record.to_fields())
                    .await
                    .map_err(|err| self.write_once_error(OFFER_FIELD, err))?;
            }
            Err(err) => return Err(self.write_once_error(OFFER_FIELD, err)),
        }
        tracing::debug!(target = "huddle::session", session = %self.id(), "published offer");
        Ok(())
    }

    /// Merge the `answer` field into the record, leaving `offer` untouched.
    /// Fails `InvalidState` without an offer or if an answer already exists.
    pub async fn publish_answer(&self, answer: &SessionDescription) -> SignalResult<()> {
        let record = self.fetch().await?;
        if record.offer.is_none() {
            return Err(SignalError::InvalidState(format!(
                "session {} has no offer to answer",
                self.id()
            )));
        }
        self.store
            .update_document(
                &self.doc,
                description_patch(ANSWER_FIELD, answer),
                Precondition::FieldsAbsent,
            )
            .await
            .map_err(|err| self.write_once_error(ANSWER_FIELD, err))?;
        tracing::debug!(target = "huddle::session", session = %self.id(), "published answer");
        Ok(())
    }

    pub async fn fetch(&self) -> SignalResult<SessionRecord> {
        match self.store.get_document(&self.doc).await? {
            Some(fields) => SessionRecord::from_fields(&fields),
            None => Err(SignalError::NotFound(self.id().to_string())),
        }
    }

    pub async fn watch(&self) -> SignalResult<RecordWatch> {
        let subscription = self.store.watch_document(&self.doc).await?;
        Ok(RecordWatch { subscription })
    }

    fn write_once_error(&self, field: &str, err: StoreError) -> SignalError {
        match err {
            StoreError::Conflict { .. } | StoreError::AlreadyExists(_) => SignalError::InvalidState(
                format!("{field} of session {} is already set", self.id()),
            ),
            StoreError::NotFound(_) => SignalError::NotFound(self.id().to_string()),
            other => SignalError::Transport(other),
        }
    }
}

/// Live view of one Session Record. A record that does not exist yet reads as
/// empty.
pub struct RecordWatch {
    subscription: Subscription<DocumentSnapshot>,
}

impl RecordWatch {
    pub async fn next(&mut self) -> Option<SignalResult<SessionRecord>> {
        let snapshot = match self.subscription.next().await? {
            Ok(snapshot) => snapshot,
            Err(err) => return Some(Err(err.into())),
        };
        Some(match snapshot.fields {
            Some(fields) => SessionRecord::from_fields(&fields),
            None => Ok(SessionRecord::default()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use doc_store::LocalStore;

    fn sessions() -> Sessions {
        Sessions::new(Arc::new(LocalStore::with_ids(["ABC123".to_string()])))
    }

    #[test_timeout::timeout(5)]
    async fn created_session_has_no_offer_or_answer() {
        let sessions = sessions();
        let session = sessions.create_session().await.expect("create");
        assert_eq!(session.id(), "ABC123");
        assert_eq!(session.fetch().await.expect("fetch"), SessionRecord::default());
    }

    #[test_timeout::timeout(5)]
    async fn join_unknown_session_is_not_found() {
        let err = sessions().join_session("nope").await.expect_err("missing");
        assert!(matches!(err, SignalError::NotFound(id) if id == "nope"));
    }

    #[test_timeout::timeout(5)]
    async fn join_before_offer_is_invalid_state() {
        let sessions = sessions();
        sessions.create_session().await.expect("create");
        let err = sessions.join_session("ABC123").await.expect_err("no offer");
        assert!(matches!(err, SignalError::InvalidState(_)));
    }

    #[test_timeout::timeout(5)]
    async fn offer_is_written_once() {
        let sessions = sessions();
        let session = sessions.create_session().await.expect("create");
        session
            .publish_offer(&SessionDescription::offer("v=0 first"))
            .await
            .expect("first offer");
        let err = session
            .publish_offer(&SessionDescription::offer("v=0 second"))
            .await
            .expect_err("second offer");
        assert!(matches!(err, SignalError::InvalidState(_)));

        let record = sessions.join_session("ABC123").await.expect("join");
        assert_eq!(record.offer, Some(SessionDescription::offer("v=0 first")));
    }

    #[test_timeout::timeout(5)]
    async fn offer_creates_missing_record() {
        let sessions = sessions();
        let session = sessions.allocate();
        session
            .publish_offer(&SessionDescription::offer("v=0"))
            .await
            .expect("offer");
        assert!(sessions.join_session(session.id()).await.is_ok());
    }

    #[test_timeout::timeout(5)]
    async fn answer_requires_offer_and_keeps_it() {
        let sessions = sessions();
        let session = sessions.create_session().await.expect("create");
        let err = session
            .publish_answer(&SessionDescription::answer("v=0"))
            .await
            .expect_err("no offer");
        assert!(matches!(err, SignalError::InvalidState(_)));

        session
            .publish_offer(&SessionDescription::offer("v=0 offer"))
            .await
            .expect("offer");
        session
            .publish_answer(&SessionDescription::answer("v=0 answer"))
            .await
            .expect("answer");
        let err = session
            .publish_answer(&SessionDescription::answer("v=0 again"))
            .await
            .expect_err("second answer");
        assert!(matches!(err, SignalError::InvalidState(_)));

        let record = session.fetch().await.expect("fetch");
        assert_eq!(record.offer, Some(SessionDescription::offer("v=0 offer")));
        assert_eq!(record.answer, Some(SessionDescription::answer("v=0 answer")));
    }

    #[test_timeout::timeout(5)]
    async fn inspect_counts_relay_entries() {
        let sessions = sessions();
        let session = sessions.create_session().await.expect("create");
        let relay = session.relay(Role::Initiator);
        relay
            .append(&crate::schema::IceCandidateBlob::new("c1"))
            .await
            .expect("append");
        relay
            .append(&crate::schema::IceCandidateBlob::new("c2"))
            .await
            .expect("append");

        let summary = sessions.inspect("ABC123").await.expect("inspect");
        assert_eq!(summary.offerer_candidates, 2);
        assert_eq!(summary.answerer_candidates, 0);
        assert_eq!(summary.record, SessionRecord::default());
    }
}
