use std::collections::HashSet;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{Connection, ConnectionError, ConnectionEvent, MediaKind, RemoteTrack};
use crate::schema::{IceCandidateBlob, SessionDescription};

/// Scriptable in-memory connection for exercising the signaling scripts
/// without a media stack. Tests push local candidates and remote tracks in,
/// and read back what the scripts applied.
pub struct MockConnection {
    label: String,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_attempts: usize,
    pending: Vec<IceCandidateBlob>,
    accepted: Vec<IceCandidateBlob>,
    rejected: HashSet<String>,
    remote_failure: Option<String>,
}

impl MockConnection {
    pub fn new(label: impl Into<String>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            label: label.into(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            state: Mutex::new(MockState::default()),
        }
    }

    pub fn emit_local_candidate(&self, candidate: IceCandidateBlob) {
        let _ = self
            .events_tx
            .send(ConnectionEvent::LocalCandidate(candidate));
    }

    pub fn finish_gathering(&self) {
        let _ = self.events_tx.send(ConnectionEvent::GatheringComplete);
    }

    pub fn emit_remote_track(&self, kind: MediaKind) {
        let track = RemoteTrack {
            id: format!("{}-{kind:?}", self.label).to_lowercase(),
            stream_id: format!("{}-stream", self.label),
            kind,
        };
        let _ = self.events_tx.send(ConnectionEvent::RemoteTrack(track));
    }

    /// Make `add_ice_candidate` fail for this candidate string.
    pub fn reject_candidate(&self, candidate: &str) {
        self.state.lock().rejected.insert(candidate.to_string());
    }

    /// Make every `set_remote_description` call fail with `reason`.
    pub fn reject_remote_description(&self, reason: impl Into<String>) {
        self.state.lock().remote_failure = Some(reason.into());
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    /// Number of `set_remote_description` calls, successful or not.
    pub fn remote_description_attempts(&self) -> usize {
        self.state.lock().remote_attempts
    }

    /// Candidates applied to the connection, in application order.
    pub fn accepted_candidates(&self) -> Vec<IceCandidateBlob> {
        self.state.lock().accepted.clone()
    }

    /// Candidates received before a remote description existed.
    pub fn pending_candidates(&self) -> Vec<IceCandidateBlob> {
        self.state.lock().pending.clone()
    }

    fn fake_sdp(&self, kind: &str) -> String {
        format!("v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns={}-{kind}\r\nt=0 0\r\n", self.label)
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn create_offer(&self) -> Result<SessionDescription, ConnectionError> {
        Ok(SessionDescription::offer(self.fake_sdp("offer")))
    }

    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError> {
        if self.state.lock().remote.is_none() {
            return Err(ConnectionError::failed(
                "create_answer",
                "no remote offer applied",
            ));
        }
        Ok(SessionDescription::answer(self.fake_sdp("answer")))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectionError> {
        self.state.lock().local = Some(description);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectionError> {
        let mut state = self.state.lock();
        state.remote_attempts += 1;
        if let Some(reason) = &state.remote_failure {
            return Err(ConnectionError::failed("set_remote_description", reason));
        }
        if state.remote.is_some() {
            return Err(ConnectionError::RemoteDescriptionAlreadySet);
        }
        state.remote = Some(description);
        let pending = std::mem::take(&mut state.pending);
        state.accepted.extend(pending);
        Ok(())
    }

    async fn current_remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateBlob) -> Result<(), ConnectionError> {
        let mut state = self.state.lock();
        if state.rejected.contains(&candidate.candidate) {
            return Err(ConnectionError::failed(
                "add_ice_candidate",
                format!("rejected {}", candidate.candidate),
            ));
        }
        if state.remote.is_some() {
            state.accepted.push(candidate);
        } else {
            state.pending.push(candidate);
        }
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
        self.events_rx.lock().take()
    }
}
