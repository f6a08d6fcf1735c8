//! Per-role negotiation scripts.
//!
//! Each role is a pure transition function over an explicit state enum that
//! returns the effects to run; a driver task performs the effects against the
//! session and the connection and feeds the outcomes back in as events.

use std::fmt;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::connection::{ConnectionEvent, RemoteTrack};
use crate::relay::CandidateRelay;
use crate::schema::Role;

pub mod initiator;
pub mod responder;

pub use initiator::{InitiatorState, start_call};
pub use responder::{ResponderState, join_call};

/// Result of feeding one event to a role's transition function.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition<S, X> {
    pub state: S,
    pub effects: Vec<X>,
}

impl<S, X> Transition<S, X> {
    pub fn to(state: S, effects: Vec<X>) -> Self {
        Self { state, effects }
    }

    pub fn stay(state: S) -> Self {
        Self {
            state,
            effects: Vec::new(),
        }
    }
}

pub trait RoleState: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {
    /// Connected or failed; no further transitions are expected.
    fn is_settled(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayDirection {
    Outbound,
    Inbound,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    RemoteTrack(RemoteTrack),
    /// A candidate could not be appended or applied. The relay keeps running.
    RelayFailed {
        direction: RelayDirection,
        error: String,
    },
    /// The negotiation ended in the failed state.
    Failed(String),
}

/// Background tasks of one call, aborted together.
#[derive(Default)]
pub(crate) struct CallTasks(Vec<JoinHandle<()>>);

impl CallTasks {
    pub(crate) fn push(&mut self, task: JoinHandle<()>) {
        self.0.push(task);
    }
}

impl Drop for CallTasks {
    fn drop(&mut self) {
        for task in self.0.drain(..) {
            task.abort();
        }
    }
}

/// A running call. Dropping the handle abandons the call: its relay and
/// watch tasks stop, nothing is written to the store.
pub struct CallHandle<S> {
    session_id: String,
    role: Role,
    state: watch::Receiver<S>,
    events: mpsc::UnboundedReceiver<CallEvent>,
    _tasks: CallTasks,
}

impl<S: RoleState> CallHandle<S> {
    pub(crate) fn new(
        session_id: String,
        role: Role,
        state: watch::Receiver<S>,
        events: mpsc::UnboundedReceiver<CallEvent>,
        tasks: CallTasks,
    ) -> Self {
        Self {
            session_id,
            role,
            state,
            events,
            _tasks: tasks,
        }
    }

    /// The join code.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> S {
        self.state.borrow().clone()
    }

    pub fn state_watch(&self) -> watch::Receiver<S> {
        self.state.clone()
    }

    pub async fn next_event(&mut self) -> Option<CallEvent> {
        self.events.recv().await
    }

    /// Wait until the role reaches a terminal state and return it. If the
    /// driver has stopped first, returns the last state it reported.
    pub async fn wait_until_settled(&mut self) -> S {
        let settled = self
            .state
            .wait_for(|state| state.is_settled())
            .await
            .map(|state| state.clone());
        match settled {
            Ok(state) => state,
            Err(_) => self.state.borrow().clone(),
        }
    }
}

/// Run one transition against the shared state cell and return its effects.
pub(crate) fn advance<S, E, X>(
    cell: &watch::Sender<S>,
    role: Role,
    event: E,
    on_event: impl FnOnce(&S, E) -> Transition<S, X>,
) -> Vec<X>
where
    S: RoleState,
    E: fmt::Debug,
{
    let current = cell.borrow().clone();
    tracing::trace!(target = "huddle::negotiation", role = role.as_str(), ?event, "event");
    let Transition { state, effects } = on_event(&current, event);
    if state != current {
        tracing::debug!(
            target = "huddle::negotiation",
            role = role.as_str(),
            from = ?current,
            to = ?state,
            "state transition"
        );
        cell.send_replace(state);
    }
    effects
}

/// Forward connection events: local candidates go to the outbound relay in
/// discovery order, remote tracks go to the call's listeners.
pub(crate) fn spawn_connection_pump(
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    relay: CandidateRelay,
    call_events: mpsc::UnboundedSender<CallEvent>,
    tracks: Option<mpsc::UnboundedSender<RemoteTrack>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let role = relay.role();
        while let Some(event) = events.recv().await {
            match event {
                ConnectionEvent::LocalCandidate(candidate) => {
                    if let Err(err) = relay.append(&candidate).await {
                        tracing::warn!(
                            target = "huddle::relay",
                            role = role.as_str(),
                            error = %err,
                            "failed to relay local candidate"
                        );
                        let _ = call_events.send(CallEvent::RelayFailed {
                            direction: RelayDirection::Outbound,
                            error: err.to_string(),
                        });
                    }
                }
                ConnectionEvent::GatheringComplete => {
                    tracing::debug!(
                        target = "huddle::relay",
                        role = role.as_str(),
                        "local candidate gathering complete"
                    );
                }
                ConnectionEvent::RemoteTrack(track) => {
                    tracing::info!(
                        target = "huddle::negotiation",
                        role = role.as_str(),
                        track = %track.id,
                        kind = ?track.kind,
                        "remote track arrived"
                    );
                    if let Some(tracks) = &tracks {
                        let _ = tracks.send(track.clone());
                    }
                    let _ = call_events.send(CallEvent::RemoteTrack(track));
                }
            }
        }
        tracing::debug!(target = "huddle::relay", role = role.as_str(), "connection events closed");
    })
}
