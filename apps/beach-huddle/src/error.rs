use doc_store::StoreError;
use thiserror::Error;

use crate::connection::ConnectionError;

/// Failure of a lifecycle or negotiation operation. Nothing is retried; the
/// caller abandons the call and starts over with a fresh session.
#[derive(Debug, Error)]
pub enum SignalError {
    /// No session record exists under the given join code.
    #[error("session {0} not found")]
    NotFound(String),
    /// A protocol precondition does not hold (offer missing, field already
    /// written, remote description applied twice, malformed record).
    #[error("invalid signaling state: {0}")]
    InvalidState(String),
    #[error("signaling transport error: {0}")]
    Transport(#[source] StoreError),
    #[error("connection error: {0}")]
    Connection(#[source] ConnectionError),
}

pub type SignalResult<T> = Result<T, SignalError>;

impl From<StoreError> for SignalError {
    fn from(err: StoreError) -> Self {
        SignalError::Transport(err)
    }
}

impl From<ConnectionError> for SignalError {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::RemoteDescriptionAlreadySet => {
                SignalError::InvalidState("remote description already applied".into())
            }
            other => SignalError::Connection(other),
        }
    }
}
