use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use super::{
    CallEvent, CallHandle, CallTasks, RoleState, Transition, advance, spawn_connection_pump,
};
use crate::connection::{Connection, RemoteTrack};
use crate::error::{SignalError, SignalResult};
use crate::relay::spawn_inbound;
use crate::schema::{Role, SessionDescription, SessionRecord};
use crate::session::{SessionHandle, Sessions};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponderState {
    Idle,
    OfferApplied,
    AnswerPublished,
    /// Remote media is flowing. Nothing in the store marks this.
    Connected,
    Failed(String),
}

impl RoleState for ResponderState {
    fn is_settled(&self) -> bool {
        matches!(self, ResponderState::Connected | ResponderState::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponderEvent {
    RecordFetched {
        record: SessionRecord,
        remote_description_set: bool,
    },
    /// The connection accepted the offer.
    OfferAccepted,
    AnswerReady(SessionDescription),
    /// The answer is stored in the record.
    AnswerWritten,
    RemoteTrack(RemoteTrack),
    Failure(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponderEffect {
    SetRemoteDescription(SessionDescription),
    RelayCandidates,
    CreateAnswer,
    SetLocalDescription(SessionDescription),
    PublishAnswer(SessionDescription),
}

pub fn on_event(
    state: &ResponderState,
    event: ResponderEvent,
) -> Transition<ResponderState, ResponderEffect> {
    use ResponderEffect as Fx;
    use ResponderEvent as Ev;
    use ResponderState as St;

    match (state, event) {
        (St::Failed(_), _) => Transition::stay(state.clone()),
        (_, Ev::Failure(reason)) => Transition::to(St::Failed(reason), Vec::new()),
        (
            St::Idle,
            Ev::RecordFetched {
                record,
                remote_description_set,
            },
        ) => match (record.offer, record.answer) {
            (None, _) => Transition::to(St::Failed("session has no offer".into()), Vec::new()),
            (Some(_), Some(_)) => {
                Transition::to(St::Failed("session is already answered".into()), Vec::new())
            }
            (Some(_), None) if remote_description_set => Transition::to(
                St::Failed("connection already holds a remote description".into()),
                Vec::new(),
            ),
            (Some(offer), None) => Transition::to(St::Idle, vec![Fx::SetRemoteDescription(offer)]),
        },
        (St::Idle, Ev::OfferAccepted) => {
            Transition::to(St::OfferApplied, vec![Fx::RelayCandidates, Fx::CreateAnswer])
        }
        (St::OfferApplied, Ev::AnswerReady(answer)) => Transition::to(
            St::OfferApplied,
            vec![
                Fx::SetLocalDescription(answer.clone()),
                Fx::PublishAnswer(answer),
            ],
        ),
        (St::OfferApplied, Ev::AnswerWritten) => Transition::to(St::AnswerPublished, Vec::new()),
        (St::AnswerPublished, Ev::RemoteTrack(_)) => Transition::to(St::Connected, Vec::new()),
        _ => Transition::stay(state.clone()),
    }
}

/// Run the Responder script for `session_id`. Returns once the answer is
/// published; the handle settles on `Connected` when the first remote track
/// arrives.
pub async fn join_call(
    sessions: &Sessions,
    connection: Arc<dyn Connection>,
    session_id: &str,
) -> SignalResult<CallHandle<ResponderState>> {
    let record = sessions.join_session(session_id).await?;
    let session = sessions.handle(session_id);
    let events = connection.take_events().ok_or_else(|| {
        SignalError::InvalidState("connection events are already being consumed".into())
    })?;
    let (call_events, call_rx) = mpsc::unbounded_channel();
    let (state, state_rx) = watch::channel(ResponderState::Idle);
    let (track_tx, track_rx) = mpsc::unbounded_channel();

    let mut tasks = CallTasks::default();
    tasks.push(spawn_connection_pump(
        events,
        session.relay(Role::Responder),
        call_events.clone(),
        Some(track_tx),
    ));

    let mut driver = Driver {
        session,
        connection,
        state,
        call_events,
        tasks,
    };
    let remote_description_set =
        driver.connection.current_remote_description().await.is_some();
    driver
        .run(ResponderEvent::RecordFetched {
            record,
            remote_description_set,
        })
        .await?;
    if let ResponderState::Failed(reason) = driver.state.borrow().clone() {
        return Err(SignalError::InvalidState(format!(
            "cannot join session {session_id}: {reason}"
        )));
    }

    let mut tasks = std::mem::take(&mut driver.tasks);
    tasks.push(tokio::spawn(driver.await_media(track_rx)));
    tracing::info!(
        target = "huddle::negotiation",
        role = "responder",
        session = %session_id,
        "answer published; waiting for media"
    );
    Ok(CallHandle::new(
        session_id.to_string(),
        Role::Responder,
        state_rx,
        call_rx,
        tasks,
    ))
}

struct Driver {
    session: SessionHandle,
    connection: Arc<dyn Connection>,
    state: watch::Sender<ResponderState>,
    call_events: mpsc::UnboundedSender<CallEvent>,
    tasks: CallTasks,
}

impl Driver {
    fn advance(&self, event: ResponderEvent) -> Vec<ResponderEffect> {
        advance(&self.state, Role::Responder, event, on_event)
    }

    async fn run(&mut self, event: ResponderEvent) -> SignalResult<()> {
        let mut pending: VecDeque<ResponderEffect> = self.advance(event).into();
        while let Some(effect) = pending.pop_front() {
            match self.execute(effect).await {
                Ok(Some(next)) => pending.extend(self.advance(next)),
                Ok(None) => {}
                Err(err) => return Err(self.fail(err)),
            }
        }
        Ok(())
    }

    async fn execute(&mut self, effect: ResponderEffect) -> SignalResult<Option<ResponderEvent>> {
        match effect {
            ResponderEffect::SetRemoteDescription(offer) => {
                self.connection.set_remote_description(offer).await?;
                Ok(Some(ResponderEvent::OfferAccepted))
            }
            ResponderEffect::RelayCandidates => {
                let feed = self
                    .session
                    .relay(Role::Responder)
                    .subscribe_additions()
                    .await?;
                self.tasks.push(spawn_inbound(
                    feed,
                    self.connection.clone(),
                    self.call_events.clone(),
                    Role::Responder,
                ));
                Ok(None)
            }
            ResponderEffect::CreateAnswer => {
                let answer = self.connection.create_answer().await?;
                Ok(Some(ResponderEvent::AnswerReady(answer)))
            }
            ResponderEffect::SetLocalDescription(answer) => {
                self.connection.set_local_description(answer).await?;
                Ok(None)
            }
            ResponderEffect::PublishAnswer(answer) => {
                self.session.publish_answer(&answer).await?;
                Ok(Some(ResponderEvent::AnswerWritten))
            }
        }
    }

    fn fail(&self, err: SignalError) -> SignalError {
        let reason = err.to_string();
        tracing::warn!(
            target = "huddle::negotiation",
            role = "responder",
            session = %self.session.id(),
            error = %reason,
            "negotiation failed"
        );
        self.advance(ResponderEvent::Failure(reason.clone()));
        let _ = self.call_events.send(CallEvent::Failed(reason));
        err
    }

    /// Tracks that arrived while the answer was being published are queued in
    /// `tracks`, so the first one still settles the call.
    async fn await_media(mut self, mut tracks: mpsc::UnboundedReceiver<RemoteTrack>) {
        while let Some(track) = tracks.recv().await {
            if self.run(ResponderEvent::RemoteTrack(track)).await.is_err() {
                return;
            }
            if self.state.borrow().is_settled() {
                tracing::info!(
                    target = "huddle::negotiation",
                    role = "responder",
                    session = %self.session.id(),
                    "connected"
                );
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::MediaKind;

    fn offer() -> SessionDescription {
        SessionDescription::offer("v=0 offer")
    }

    fn answer() -> SessionDescription {
        SessionDescription::answer("v=0 answer")
    }

    fn track() -> RemoteTrack {
        RemoteTrack {
            id: "audio".into(),
            stream_id: "stream".into(),
            kind: MediaKind::Audio,
        }
    }

    fn fetched(record: SessionRecord) -> ResponderEvent {
        ResponderEvent::RecordFetched {
            record,
            remote_description_set: false,
        }
    }

    #[test]
    fn walks_to_connected_on_first_track() {
        let t = on_event(
            &ResponderState::Idle,
            fetched(SessionRecord {
                offer: Some(offer()),
                answer: None,
            }),
        );
        assert_eq!(t.state, ResponderState::Idle);
        assert_eq!(t.effects, vec![ResponderEffect::SetRemoteDescription(offer())]);

        let t = on_event(&t.state, ResponderEvent::OfferAccepted);
        assert_eq!(t.state, ResponderState::OfferApplied);
        assert_eq!(
            t.effects,
            vec![ResponderEffect::RelayCandidates, ResponderEffect::CreateAnswer]
        );

        let t = on_event(&t.state, ResponderEvent::AnswerReady(answer()));
        assert_eq!(t.state, ResponderState::OfferApplied);
        assert_eq!(
            t.effects,
            vec![
                ResponderEffect::SetLocalDescription(answer()),
                ResponderEffect::PublishAnswer(answer()),
            ]
        );

        let t = on_event(&t.state, ResponderEvent::AnswerWritten);
        assert_eq!(t.state, ResponderState::AnswerPublished);
        assert!(t.effects.is_empty());

        let t = on_event(&t.state, ResponderEvent::RemoteTrack(track()));
        assert_eq!(t.state, ResponderState::Connected);

        let again = on_event(&t.state, ResponderEvent::RemoteTrack(track()));
        assert_eq!(again.state, ResponderState::Connected);
        assert!(again.effects.is_empty());
    }

    #[test]
    fn answered_record_is_not_joined_again() {
        let t = on_event(
            &ResponderState::Idle,
            fetched(SessionRecord {
                offer: Some(offer()),
                answer: Some(answer()),
            }),
        );
        assert!(matches!(t.state, ResponderState::Failed(_)));
        assert!(t.effects.is_empty());
    }

    #[test]
    fn record_without_offer_fails() {
        let t = on_event(&ResponderState::Idle, fetched(SessionRecord::default()));
        assert!(matches!(t.state, ResponderState::Failed(_)));
    }

    #[test]
    fn remote_description_is_never_set_twice() {
        let t = on_event(
            &ResponderState::Idle,
            ResponderEvent::RecordFetched {
                record: SessionRecord {
                    offer: Some(offer()),
                    answer: None,
                },
                remote_description_set: true,
            },
        );
        assert!(matches!(t.state, ResponderState::Failed(_)));
        assert!(t.effects.is_empty());
    }

    #[test]
    fn offer_that_fails_to_apply_is_never_reported_applied() {
        let t = on_event(
            &ResponderState::Idle,
            fetched(SessionRecord {
                offer: Some(offer()),
                answer: None,
            }),
        );
        let t = on_event(&t.state, ResponderEvent::Failure("bad sdp".into()));
        assert_eq!(t.state, ResponderState::Failed("bad sdp".into()));
        assert!(t.effects.is_empty());
    }

    #[test]
    fn failed_answer_write_never_reports_published() {
        let t = on_event(&ResponderState::OfferApplied, ResponderEvent::AnswerReady(answer()));
        assert_eq!(t.state, ResponderState::OfferApplied);
        let t = on_event(&t.state, ResponderEvent::Failure("answer already set".into()));
        assert!(matches!(t.state, ResponderState::Failed(_)));
    }

    #[test]
    fn track_before_answer_does_not_connect() {
        let t = on_event(&ResponderState::OfferApplied, ResponderEvent::RemoteTrack(track()));
        assert_eq!(t.state, ResponderState::OfferApplied);
    }
}
