//! Two-party WebRTC call setup signaled through a shared document store.
//!
//! The Initiator writes an offer into a Session Record and trickles its ICE
//! candidates into `offererCandidates`; the Responder reads the offer by join
//! code, writes an answer back and trickles into `answererCandidates`.

pub mod config;
pub mod connection;
pub mod error;
pub mod negotiation;
pub mod relay;
pub mod rtc;
pub mod schema;
pub mod session;
pub mod telemetry;

pub use connection::{Connection, ConnectionError, ConnectionEvent, MediaKind, RemoteTrack};
pub use error::{SignalError, SignalResult};
pub use negotiation::{CallEvent, CallHandle, InitiatorState, ResponderState, join_call, start_call};
pub use session::{SessionHandle, Sessions};
