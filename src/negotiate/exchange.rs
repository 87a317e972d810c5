//! One offer/answer cycle as an explicit state machine.
//!
//! The driver performs whatever [`Action`] the exchange asks for and feeds
//! the outcome back as a [`StepEvent`]. [`Exchange::dispatch`] is the only
//! place outcomes are interpreted, and it resolves the caller at most once.

use tokio::sync::oneshot;
use tracing::{debug, error};

use crate::error::NegotiationError;

pub type Resolver = oneshot::Sender<Result<String, NegotiationError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    New,
    RemoteDescriptionSet,
    AnswerCreated,
    LocalDescriptionSet,
    Completed,
    Failed,
}

impl ExchangeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExchangeState::Completed | ExchangeState::Failed)
    }
}

/// Engine work the exchange wants done next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    SetRemoteDescription(String),
    CreateAnswer,
    SetLocalDescription(String),
    Serialize,
}

impl Action {
    pub fn step(&self) -> &'static str {
        match self {
            Action::SetRemoteDescription(_) => "set remote description",
            Action::CreateAnswer => "create answer",
            Action::SetLocalDescription(_) => "set local description",
            Action::Serialize => "serialize local description",
        }
    }
}

/// Outcome of one engine step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepEvent {
    RemoteDescriptionSet,
    AnswerCreated(String),
    LocalDescriptionSet,
    Serialized(String),
    Failed { step: &'static str, message: String },
}

pub struct Exchange {
    state: ExchangeState,
    offer: Option<String>,
    answer: Option<String>,
    resolver: Option<Resolver>,
    delivered: bool,
}

impl Exchange {
    pub fn new(offer: String, resolver: Resolver) -> Self {
        Self {
            state: ExchangeState::New,
            offer: Some(offer),
            answer: None,
            resolver: Some(resolver),
            delivered: false,
        }
    }

    pub fn state(&self) -> ExchangeState {
        self.state
    }

    /// True when the result reached a caller that was still waiting.
    pub fn delivered(&self) -> bool {
        self.delivered
    }

    pub fn answer(&self) -> Option<&str> {
        self.answer.as_deref()
    }

    /// First action, or `None` if the exchange already moved on.
    pub fn start(&mut self) -> Option<Action> {
        if self.state != ExchangeState::New {
            return None;
        }
        self.offer.take().map(Action::SetRemoteDescription)
    }

    /// Fails the exchange before any step ran, e.g. when no connection
    /// could be created.
    pub fn abort(&mut self, step: &'static str, message: String) {
        self.dispatch(StepEvent::Failed { step, message });
    }

    /// Applies one step outcome and returns the next action, if any.
    /// Events arriving after a terminal state are ignored.
    pub fn dispatch(&mut self, event: StepEvent) -> Option<Action> {
        if self.state.is_terminal() {
            debug!("late negotiation event ignored: {:?}", event);
            return None;
        }
        match (self.state, event) {
            (ExchangeState::New, StepEvent::RemoteDescriptionSet) => {
                self.state = ExchangeState::RemoteDescriptionSet;
                Some(Action::CreateAnswer)
            }
            (ExchangeState::RemoteDescriptionSet, StepEvent::AnswerCreated(sdp)) => {
                self.state = ExchangeState::AnswerCreated;
                Some(Action::SetLocalDescription(sdp))
            }
            (ExchangeState::AnswerCreated, StepEvent::LocalDescriptionSet) => {
                self.state = ExchangeState::LocalDescriptionSet;
                Some(Action::Serialize)
            }
            (ExchangeState::LocalDescriptionSet, StepEvent::Serialized(sdp)) => {
                if sdp.trim().is_empty() {
                    self.fail(Action::Serialize.step(), "empty local description".to_string());
                    return None;
                }
                self.state = ExchangeState::Completed;
                self.answer = Some(sdp.clone());
                self.resolve(Ok(sdp));
                None
            }
            (_, StepEvent::Failed { step, message }) => {
                self.fail(step, message);
                None
            }
            (state, event) => {
                self.fail("exchange", format!("{:?} in state {:?}", event, state));
                None
            }
        }
    }

    fn fail(&mut self, step: &'static str, message: String) {
        error!("negotiation step {} failed: {}", step, message);
        self.state = ExchangeState::Failed;
        self.resolve(Err(NegotiationError::StepFailed { step, message }));
    }

    fn resolve(&mut self, result: Result<String, NegotiationError>) {
        if let Some(tx) = self.resolver.take() {
            self.delivered = tx.send(result).is_ok();
        }
    }
}
