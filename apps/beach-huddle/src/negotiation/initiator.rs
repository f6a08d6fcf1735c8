use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use super::{
    CallEvent, CallHandle, CallTasks, RoleState, Transition, advance, spawn_connection_pump,
};
use crate::connection::Connection;
use crate::error::{SignalError, SignalResult};
use crate::relay::spawn_inbound;
use crate::schema::{Role, SessionDescription, SessionRecord};
use crate::session::{RecordWatch, SessionHandle, Sessions};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitiatorState {
    Idle,
    OfferCreated,
    AwaitingAnswer,
    Connected,
    Failed(String),
}

impl RoleState for InitiatorState {
    fn is_settled(&self) -> bool {
        matches!(self, InitiatorState::Connected | InitiatorState::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InitiatorEvent {
    OfferReady(SessionDescription),
    OfferPublished,
    /// A record notification, paired with whether the connection already
    /// holds a remote description.
    RecordChanged {
        record: SessionRecord,
        remote_description_set: bool,
    },
    /// The connection accepted the answer.
    AnswerApplied,
    Failure(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum InitiatorEffect {
    SetLocalDescription(SessionDescription),
    PublishOffer(SessionDescription),
    RelayCandidates,
    WatchRecord,
    SetRemoteDescription(SessionDescription),
}

pub fn on_event(
    state: &InitiatorState,
    event: InitiatorEvent,
) -> Transition<InitiatorState, InitiatorEffect> {
    use InitiatorEffect as Fx;
    use InitiatorEvent as Ev;
    use InitiatorState as St;

    match (state, event) {
        (St::Failed(_), _) => Transition::stay(state.clone()),
        (_, Ev::Failure(reason)) => Transition::to(St::Failed(reason), Vec::new()),
        (St::Idle, Ev::OfferReady(offer)) => Transition::to(
            St::OfferCreated,
            vec![
                Fx::SetLocalDescription(offer.clone()),
                Fx::PublishOffer(offer),
                Fx::RelayCandidates,
            ],
        ),
        (St::OfferCreated, Ev::OfferPublished) => {
            Transition::to(St::AwaitingAnswer, vec![Fx::WatchRecord])
        }
        (
            St::AwaitingAnswer,
            Ev::RecordChanged {
                record:
                    SessionRecord {
                        answer: Some(answer),
                        ..
                    },
                remote_description_set: false,
            },
        ) => Transition::to(St::AwaitingAnswer, vec![Fx::SetRemoteDescription(answer)]),
        (St::AwaitingAnswer, Ev::AnswerApplied) => Transition::to(St::Connected, Vec::new()),
        _ => Transition::stay(state.clone()),
    }
}

/// Run the Initiator script on `connection`: create a session, publish the
/// offer, and keep watching for the answer in the background. Returns once
/// the offer is published, so the join code is usable immediately.
pub async fn start_call(
    sessions: &Sessions,
    connection: Arc<dyn Connection>,
) -> SignalResult<CallHandle<InitiatorState>> {
    let session = sessions.create_session().await?;
    let events = connection.take_events().ok_or_else(|| {
        SignalError::InvalidState("connection events are already being consumed".into())
    })?;
    let (call_events, call_rx) = mpsc::unbounded_channel();
    let (state, state_rx) = watch::channel(InitiatorState::Idle);

    let mut tasks = CallTasks::default();
    tasks.push(spawn_connection_pump(
        events,
        session.relay(Role::Initiator),
        call_events.clone(),
        None,
    ));

    let mut driver = Driver {
        session,
        connection,
        state,
        call_events,
        tasks,
        watch: None,
    };
    let offer = match driver.connection.create_offer().await {
        Ok(offer) => offer,
        Err(err) => return Err(driver.fail(err.into())),
    };
    driver.run(InitiatorEvent::OfferReady(offer)).await?;

    let session_id = driver.session.id().to_string();
    let mut tasks = std::mem::take(&mut driver.tasks);
    tasks.push(tokio::spawn(driver.await_answer()));
    tracing::info!(
        target = "huddle::negotiation",
        role = "initiator",
        session = %session_id,
        "offer published; waiting for answer"
    );
    Ok(CallHandle::new(
        session_id,
        Role::Initiator,
        state_rx,
        call_rx,
        tasks,
    ))
}

struct Driver {
    session: SessionHandle,
    connection: Arc<dyn Connection>,
    state: watch::Sender<InitiatorState>,
    call_events: mpsc::UnboundedSender<CallEvent>,
    tasks: CallTasks,
    watch: Option<RecordWatch>,
}

impl Driver {
    fn advance(&self, event: InitiatorEvent) -> Vec<InitiatorEffect> {
        advance(&self.state, Role::Initiator, event, on_event)
    }

    async fn run(&mut self, event: InitiatorEvent) -> SignalResult<()> {
        let mut pending: VecDeque<InitiatorEffect> = self.advance(event).into();
        while let Some(effect) = pending.pop_front() {
            match self.execute(effect).await {
                Ok(Some(next)) => pending.extend(self.advance(next)),
                Ok(None) => {}
                Err(err) => return Err(self.fail(err)),
            }
        }
        Ok(())
    }

    async fn execute(&mut self, effect: InitiatorEffect) -> SignalResult<Option<InitiatorEvent>> {
        match effect {
            InitiatorEffect::SetLocalDescription(offer) => {
                self.connection.set_local_description(offer).await?;
                Ok(None)
            }
            InitiatorEffect::PublishOffer(offer) => {
                self.session.publish_offer(&offer).await?;
                Ok(Some(InitiatorEvent::OfferPublished))
            }
            InitiatorEffect::RelayCandidates => {
                let feed = self
                    .session
                    .relay(Role::Initiator)
                    .subscribe_additions()
                    .await?;
                self.tasks.push(spawn_inbound(
                    feed,
                    self.connection.clone(),
                    self.call_events.clone(),
                    Role::Initiator,
                ));
                Ok(None)
            }
            InitiatorEffect::WatchRecord => {
                self.watch = Some(self.session.watch().await?);
                Ok(None)
            }
            InitiatorEffect::SetRemoteDescription(answer) => {
                self.connection.set_remote_description(answer).await?;
                tracing::info!(
                    target = "huddle::negotiation",
                    role = "initiator",
                    session = %self.session.id(),
                    "answer applied"
                );
                Ok(Some(InitiatorEvent::AnswerApplied))
            }
        }
    }

    fn fail(&self, err: SignalError) -> SignalError {
        let reason = err.to_string();
        tracing::warn!(
            target = "huddle::negotiation",
            role = "initiator",
            session = %self.session.id(),
            error = %reason,
            "negotiation failed"
        );
        self.advance(InitiatorEvent::Failure(reason.clone()));
        let _ = self.call_events.send(CallEvent::Failed(reason));
        err
    }

    /// Feed record notifications to the state machine. Keeps running after
    /// the answer is applied so later redeliveries hit the guard as no-ops.
    async fn await_answer(mut self) {
        let Some(mut watch) = self.watch.take() else {
            return;
        };
        while let Some(update) = watch.next().await {
            let record = match update {
                Ok(record) => record,
                Err(err) if *self.state.borrow() == InitiatorState::Connected => {
                    tracing::debug!(
                        target = "huddle::negotiation",
                        role = "initiator",
                        error = %err,
                        "ignoring record watch error after connect"
                    );
                    continue;
                }
                Err(err) => {
                    self.fail(err);
                    return;
                }
            };
            let remote_description_set =
                self.connection.current_remote_description().await.is_some();
            let event = InitiatorEvent::RecordChanged {
                record,
                remote_description_set,
            };
            if self.run(event).await.is_err() {
                return;
            }
        }
        tracing::debug!(
            target = "huddle::negotiation",
            role = "initiator",
            session = %self.session.id(),
            "record watch ended"
        );
    }
}
