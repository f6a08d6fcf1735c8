//! The peer-connection capability the negotiation scripts drive.
//!
//! Implementations own media and ICE internals; the scripts only move
//! descriptions and candidates in and out.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::schema::{IceCandidateBlob, SessionDescription};

pub mod mock;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("remote description already applied")]
    RemoteDescriptionAlreadySet,
    #[error("{operation} failed: {reason}")]
    Failed {
        operation: &'static str,
        reason: String,
    },
}

impl ConnectionError {
    pub fn failed(operation: &'static str, reason: impl ToString) -> Self {
        ConnectionError::Failed {
            operation,
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// A local candidate was discovered and should be trickled to the peer.
    LocalCandidate(IceCandidateBlob),
    /// Candidate gathering finished.
    GatheringComplete,
    /// Remote media started arriving.
    RemoteTrack(RemoteTrack),
}

#[async_trait]
pub trait Connection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, ConnectionError>;

    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError>;

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectionError>;

    /// Applies the peer's description. A second call fails with
    /// [`ConnectionError::RemoteDescriptionAlreadySet`].
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectionError>;

    async fn current_remote_description(&self) -> Option<SessionDescription>;

    /// Accepts a remote candidate. Candidates that arrive before the remote
    /// description are held by the implementation and applied once it is set.
    async fn add_ice_candidate(&self, candidate: IceCandidateBlob) -> Result<(), ConnectionError>;

    /// Takes the event stream. Only the first caller gets it.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>>;
}
