//! Trickle-ICE exchange over the two append-only candidate collections of a
//! session.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use doc_store::{
    ChangeKind, CollectionPath, CollectionSnapshot, DocHandle, DocumentStore, Subscription,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::connection::Connection;
use crate::error::{SignalError, SignalResult};
use crate::negotiation::{CallEvent, RelayDirection};
use crate::schema::{IceCandidateBlob, Role};

/// One participant's view of the relay: it appends to its own collection and
/// reads the other side's.
#[derive(Clone)]
pub struct CandidateRelay {
    store: Arc<dyn DocumentStore>,
    role: Role,
    outbound: CollectionPath,
    inbound: CollectionPath,
}

impl CandidateRelay {
    pub fn new(store: Arc<dyn DocumentStore>, session: &DocHandle, role: Role) -> Self {
        Self {
            store,
            role,
            outbound: session.subcollection(role.outbound_collection()),
            inbound: session.subcollection(role.inbound_collection()),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn outbound(&self) -> &CollectionPath {
        &self.outbound
    }

    pub fn inbound(&self) -> &CollectionPath {
        &self.inbound
    }

    /// Append a local candidate. Calls from one producer land in call order.
    pub async fn append(&self, candidate: &IceCandidateBlob) -> SignalResult<String> {
        let value = serde_json::to_value(candidate).map_err(doc_store::StoreError::from)?;
        let id = self.store.add_entry(&self.outbound, value).await?;
        tracing::trace!(
            target = "huddle::relay",
            role = self.role.as_str(),
            collection = %self.outbound,
            entry = %id,
            "appended local candidate"
        );
        Ok(id)
    }

    /// Start receiving the other side's candidates, including those written
    /// before this call.
    pub async fn subscribe_additions(&self) -> SignalResult<CandidateFeed> {
        let subscription = self.store.watch_collection(&self.inbound).await?;
        Ok(CandidateFeed::new(subscription))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InboundCandidate {
    pub id: String,
    pub candidate: IceCandidateBlob,
}

/// Additions to a candidate collection, each delivered once.
///
/// Modified and removed changes are ignored, and an entry id that was already
/// delivered is skipped if the store reports it again.
pub struct CandidateFeed {
    subscription: Subscription<CollectionSnapshot>,
    seen: HashSet<String>,
    queue: VecDeque<SignalResult<InboundCandidate>>,
}

impl CandidateFeed {
    pub fn new(subscription: Subscription<CollectionSnapshot>) -> Self {
        Self {
            subscription,
            seen: HashSet::new(),
            queue: VecDeque::new(),
        }
    }

    /// Next unseen candidate. Errors do not end the feed; `None` means the
    /// store side has gone away.
    pub async fn next(&mut self) -> Option<SignalResult<InboundCandidate>> {
        loop {
            if let Some(item) = self.queue.pop_front() {
                return Some(item);
            }
            let snapshot = match self.subscription.next().await? {
                Ok(snapshot) => snapshot,
                Err(err) => return Some(Err(err.into())),
            };
            for change in snapshot.changes {
                if change.kind != ChangeKind::Added || !self.seen.insert(change.id.clone()) {
                    continue;
                }
                let id = change.id;
                let item = serde_json::from_value::<IceCandidateBlob>(change.value)
                    .map(|candidate| InboundCandidate {
                        id: id.clone(),
                        candidate,
                    })
                    .map_err(|err| {
                        SignalError::InvalidState(format!("malformed candidate entry {id}: {err}"))
                    });
                self.queue.push_back(item);
            }
        }
    }
}

/// Feed every inbound candidate into `connection` until the feed ends.
/// Failures are reported as [`CallEvent::RelayFailed`] and the loop keeps
/// going.
pub(crate) fn spawn_inbound(
    mut feed: CandidateFeed,
    connection: Arc<dyn Connection>,
    events: mpsc::UnboundedSender<CallEvent>,
    role: Role,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(item) = feed.next().await {
            let result = match item {
                Ok(inbound) => {
                    tracing::trace!(
                        target = "huddle::relay",
                        role = role.as_str(),
                        entry = %inbound.id,
                        "applying remote candidate"
                    );
                    connection
                        .add_ice_candidate(inbound.candidate)
                        .await
                        .map_err(SignalError::from)
                }
                Err(err) => Err(err),
            };
            if let Err(err) = result {
                tracing::warn!(
                    target = "huddle::relay",
                    role = role.as_str(),
                    error = %err,
                    "inbound candidate dropped"
                );
                let _ = events.send(CallEvent::RelayFailed {
                    direction: RelayDirection::Inbound,
                    error: err.to_string(),
                });
            }
        }
        tracing::debug!(target = "huddle::relay", role = role.as_str(), "inbound feed ended");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use doc_store::{EntryChange, LocalStore};
    use serde_json::json;

    fn added(id: &str, candidate: &str) -> EntryChange {
        EntryChange {
            kind: ChangeKind::Added,
            id: id.to_string(),
            value: json!({ "candidate": candidate }),
        }
    }

    fn snapshot(changes: Vec<EntryChange>) -> CollectionSnapshot {
        CollectionSnapshot {
            collection: CollectionPath::new("sessions/s/offererCandidates"),
            changes,
        }
    }

    #[test_timeout::timeout(5)]
    async fn redelivered_entries_are_skipped() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut feed = CandidateFeed::new(Subscription::from_receiver(rx));

        tx.send(Ok(snapshot(vec![added("1", "c1")]))).expect("send");
        tx.send(Ok(snapshot(vec![
            added("1", "c1"),
            EntryChange {
                kind: ChangeKind::Modified,
                id: "1".into(),
                value: json!({ "candidate": "c1-edited" }),
            },
            added("2", "c2"),
        ])))
        .expect("send");
        drop(tx);

        let mut got = Vec::new();
        while let Some(item) = feed.next().await {
            got.push(item.expect("candidate").candidate.candidate);
        }
        assert_eq!(got, vec!["c1", "c2"]);
    }

    #[test_timeout::timeout(5)]
    async fn malformed_entry_does_not_end_feed() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut feed = CandidateFeed::new(Subscription::from_receiver(rx));
        tx.send(Ok(snapshot(vec![
            EntryChange {
                kind: ChangeKind::Added,
                id: "1".into(),
                value: json!(42),
            },
            added("2", "c2"),
        ])))
        .expect("send");

        assert!(matches!(
            feed.next().await,
            Some(Err(SignalError::InvalidState(_)))
        ));
        let next = feed.next().await.expect("item").expect("candidate");
        assert_eq!(next.id, "2");
    }

    #[test_timeout::timeout(5)]
    async fn relays_never_see_their_own_candidates() {
        let store: Arc<dyn DocumentStore> = Arc::new(LocalStore::new());
        let session = CollectionPath::new("sessions").doc("ABC123");
        let initiator = CandidateRelay::new(store.clone(), &session, Role::Initiator);
        let responder = CandidateRelay::new(store.clone(), &session, Role::Responder);
        assert_eq!(initiator.outbound(), responder.inbound());
        assert_eq!(initiator.inbound(), responder.outbound());
        assert_eq!(
            initiator.outbound().as_str(),
            "sessions/ABC123/offererCandidates"
        );

        let mut initiator_feed = initiator.subscribe_additions().await.expect("subscribe");
        let mut responder_feed = responder.subscribe_additions().await.expect("subscribe");

        initiator
            .append(&IceCandidateBlob::new("from-initiator"))
            .await
            .expect("append");
        responder
            .append(&IceCandidateBlob::new("from-responder"))
            .await
            .expect("append");

        let at_responder = responder_feed.next().await.expect("item").expect("candidate");
        let at_initiator = initiator_feed.next().await.expect("item").expect("candidate");
        assert_eq!(at_responder.candidate.candidate, "from-initiator");
        assert_eq!(at_initiator.candidate.candidate, "from-responder");
    }
}
