//! Negotiation state machine.
//!
//! [`Negotiator`] owns all negotiation state and performs no I/O: the driver
//! feeds it [`Input`]s one at a time and executes the [`Action`]s it returns.
//! Every asynchronous result comes back tagged with the role and token it was
//! issued for, and anything whose token is no longer current is dropped here.

use std::{fmt, time::Duration};

use pier_proto::{
    keepalive, Envelope, IceCandidate, SdpKind, SessionDescription, SessionToken, StartHint,
};
use tracing::{debug, info, warn};

use crate::config::NegotiatorConfig;
use crate::error::NegotiationError;
use crate::queue::{CandidateQueue, EarlyCandidates, RetiredTokens};
use crate::stack::{LinkEvent, RemoteTrack, TaggedLinkEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Initiator,
    Responder,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => f.write_str("initiator"),
            Role::Responder => f.write_str("responder"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitiatorState {
    Idle,
    Offering,
    AwaitingAnswer,
    Negotiated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponderState {
    Idle,
    AwaitingOffer,
    Answering,
    Negotiated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaState {
    Absent,
    Acquiring,
    Ready,
    Failed,
}

/// Peer-connection work for a role's worker.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkCommand {
    /// Close the role's current connection and create a fresh one.
    Open { attach_media: bool },
    /// Create an offer and set it as the local description.
    CreateOffer,
    /// Create an answer and set it as the local description.
    CreateAnswer,
    ApplyRemote(SessionDescription),
    AddCandidates(Vec<IceCandidate>),
    Close,
}

/// Result of a [`LinkCommand`] reported back by a worker.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkOutcome {
    LocalDescription(SessionDescription),
    RemoteApplied,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    /// The signaling channel (re)connected.
    SignalingOpened,
    Signal(Envelope),
    MediaReady,
    MediaFailed(String),
    Completed {
        role: Role,
        token: Option<SessionToken>,
        outcome: LinkOutcome,
    },
    Link(TaggedLinkEvent),
    AnswerTimeout {
        token: SessionToken,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Send(Envelope),
    Link {
        role: Role,
        token: Option<SessionToken>,
        command: LinkCommand,
    },
    AcquireMedia,
    ArmAnswerTimeout {
        token: SessionToken,
        after: Duration,
    },
    Emit(EndpointEvent),
}

/// What the endpoint reports to its user.
#[derive(Debug, Clone, PartialEq)]
pub enum EndpointEvent {
    Negotiated {
        role: Role,
        token: Option<SessionToken>,
    },
    RemoteTrack {
        role: Role,
        track: RemoteTrack,
    },
    RemoteMediaStopped,
    Failure(NegotiationError),
}

#[derive(Debug)]
struct InitiatorSession {
    token: SessionToken,
    queue: CandidateQueue,
    applying_answer: bool,
}

#[derive(Debug)]
struct ResponderSession {
    token: Option<SessionToken>,
    queue: CandidateQueue,
}

pub struct Negotiator {
    config: NegotiatorConfig,
    media: MediaState,
    offer_when_ready: bool,
    initiator_state: InitiatorState,
    initiator: Option<InitiatorSession>,
    unanswered: u32,
    responder_state: ResponderState,
    responder: Option<ResponderSession>,
    early: EarlyCandidates,
    retired: RetiredTokens,
}

impl Negotiator {
    pub fn new(config: NegotiatorConfig) -> Self {
        Self {
            config,
            media: MediaState::Absent,
            offer_when_ready: false,
            initiator_state: InitiatorState::Idle,
            initiator: None,
            unanswered: 0,
            responder_state: ResponderState::Idle,
            responder: None,
            early: EarlyCandidates::default(),
            retired: RetiredTokens::default(),
        }
    }

    pub fn handle(&mut self, input: Input) -> Vec<Action> {
        let mut actions = Vec::new();
        match input {
            Input::SignalingOpened => actions.push(Action::Send(Envelope::open(
                &self.config.local,
                &self.config.remote,
            ))),
            Input::Signal(envelope) => self.on_signal(envelope, &mut actions),
            Input::MediaReady => {
                self.media = MediaState::Ready;
                if std::mem::take(&mut self.offer_when_ready) {
                    self.enter_offering(&mut actions);
                }
            }
            Input::MediaFailed(message) => {
                warn!(error = %message, "media acquisition failed");
                self.media = MediaState::Failed;
                self.offer_when_ready = false;
                actions.push(Action::Emit(EndpointEvent::Failure(
                    NegotiationError::Media(message),
                )));
            }
            Input::Completed {
                role,
                token,
                outcome,
            } => self.on_completed(role, token, outcome, &mut actions),
            Input::Link(tagged) => self.on_link_event(tagged, &mut actions),
            Input::AnswerTimeout { token } => self.on_answer_timeout(token, &mut actions),
        }
        actions
    }

    pub fn initiator_state(&self) -> InitiatorState {
        self.initiator_state
    }

    pub fn responder_state(&self) -> ResponderState {
        self.responder_state
    }

    pub fn media_state(&self) -> MediaState {
        self.media
    }

    pub fn token(&self, role: Role) -> Option<&SessionToken> {
        match role {
            Role::Initiator => self.initiator.as_ref().map(|session| &session.token),
            Role::Responder => self
                .responder
                .as_ref()
                .and_then(|session| session.token.as_ref()),
        }
    }

    /// Candidates held for a role until its remote description is applied.
    pub fn pending_candidates(&self, role: Role) -> usize {
        match role {
            Role::Initiator => self.initiator.as_ref().map_or(0, |s| s.queue.len()),
            Role::Responder => self.responder.as_ref().map_or(0, |s| s.queue.len()),
        }
    }

    pub fn early_candidates(&self) -> usize {
        self.early.len()
    }

    fn on_signal(&mut self, envelope: Envelope, actions: &mut Vec<Action>) {
        if let Some(reply) = keepalive::reply_to(&envelope) {
            actions.push(Action::Send(reply));
            return;
        }

        match envelope {
            Envelope::Start(hint) => self.on_start(hint, actions),
            Envelope::Close => self.on_close(actions),
            Envelope::Sdp(routed) => match routed.payload.kind {
                SdpKind::Offer => self.on_offer(routed.payload, routed.token, actions),
                SdpKind::Answer => self.on_answer(routed.payload, routed.token, actions),
            },
            Envelope::Ice(routed) => self.on_remote_candidate(routed.token, routed.payload, actions),
            Envelope::ReOffer(request) => self.on_re_offer(request.token, actions),
            Envelope::Pong => {}
            other => debug!(kind = other.kind(), "ignoring envelope"),
        }
    }

    fn on_start(&mut self, hint: StartHint, actions: &mut Vec<Action>) {
        info!(?hint, remote = %self.config.remote, "remote endpoint present");
        self.unanswered = 0;
        if self.responder_state == ResponderState::Idle {
            self.responder_state = ResponderState::AwaitingOffer;
        }
        self.begin_offer(actions);
    }

    fn on_close(&mut self, actions: &mut Vec<Action>) {
        info!(remote = %self.config.remote, "remote endpoint disconnected");
        if let Some(session) = self.initiator.take() {
            actions.push(Action::Link {
                role: Role::Initiator,
                token: Some(session.token.clone()),
                command: LinkCommand::Close,
            });
            self.retire(Some(session.token));
        }
        if let Some(session) = self.responder.take() {
            actions.push(Action::Link {
                role: Role::Responder,
                token: session.token.clone(),
                command: LinkCommand::Close,
            });
            self.retire(session.token);
        }
        self.initiator_state = InitiatorState::Idle;
        self.responder_state = ResponderState::Idle;
        self.unanswered = 0;
        self.offer_when_ready = false;
        self.early.clear();
        actions.push(Action::Emit(EndpointEvent::RemoteMediaStopped));
    }

    /// Offers now if local media is available, otherwise once it is.
    fn begin_offer(&mut self, actions: &mut Vec<Action>) {
        match self.media {
            MediaState::Ready => self.enter_offering(actions),
            MediaState::Acquiring => self.offer_when_ready = true,
            MediaState::Absent | MediaState::Failed => {
                self.media = MediaState::Acquiring;
                self.offer_when_ready = true;
                actions.push(Action::AcquireMedia);
            }
        }
    }

    fn enter_offering(&mut self, actions: &mut Vec<Action>) {
        if let Some(previous) = self.initiator.take() {
            self.retire(Some(previous.token));
        }
        let token = SessionToken::generate();
        debug!(%token, "starting initiator session");
        self.initiator = Some(InitiatorSession {
            token: token.clone(),
            queue: CandidateQueue::new(),
            applying_answer: false,
        });
        self.initiator_state = InitiatorState::Offering;
        actions.push(Action::Link {
            role: Role::Initiator,
            token: Some(token.clone()),
            command: LinkCommand::Open { attach_media: true },
        });
        actions.push(Action::Link {
            role: Role::Initiator,
            token: Some(token),
            command: LinkCommand::CreateOffer,
        });
    }

    fn on_answer(
        &mut self,
        description: SessionDescription,
        token: Option<SessionToken>,
        actions: &mut Vec<Action>,
    ) {
        let Some(token) = token else {
            debug!("dropping answer without token");
            return;
        };
        let Some(session) = self.initiator.as_mut() else {
            debug!(%token, "dropping answer with no initiator session");
            return;
        };
        if session.token != token
            || self.initiator_state != InitiatorState::AwaitingAnswer
            || session.applying_answer
        {
            debug!(%token, current = %session.token, "dropping stale answer");
            return;
        }
        session.applying_answer = true;
        actions.push(Action::Link {
            role: Role::Initiator,
            token: Some(token),
            command: LinkCommand::ApplyRemote(description),
        });
    }

    fn on_offer(
        &mut self,
        description: SessionDescription,
        token: Option<SessionToken>,
        actions: &mut Vec<Action>,
    ) {
        if let Some(token) = &token {
            if self.retired.contains(token) {
                debug!(%token, "dropping offer for retired session");
                return;
            }
        }
        if let Some(session) = &self.responder {
            if token.is_some() && session.token == token {
                debug!("dropping duplicate offer");
                return;
            }
        }
        if let Some(previous) = self.responder.take() {
            info!(
                remote_description_set = previous.queue.remote_description_set(),
                "replacing responder session with newer offer"
            );
            self.retire(previous.token);
        }

        let early = self.early.take(token.as_ref());
        self.responder = Some(ResponderSession {
            token: token.clone(),
            queue: CandidateQueue::with_pending(early),
        });
        self.responder_state = ResponderState::Answering;
        actions.push(Action::Link {
            role: Role::Responder,
            token: token.clone(),
            command: LinkCommand::Open {
                attach_media: false,
            },
        });
        actions.push(Action::Link {
            role: Role::Responder,
            token,
            command: LinkCommand::ApplyRemote(description),
        });
    }

    fn on_remote_candidate(
        &mut self,
        token: Option<SessionToken>,
        candidate: IceCandidate,
        actions: &mut Vec<Action>,
    ) {
        let queue = if let Some(session) = self
            .initiator
            .as_mut()
            .filter(|session| token.as_ref() == Some(&session.token))
        {
            Some((Role::Initiator, &mut session.queue))
        } else {
            self.responder
                .as_mut()
                .filter(|session| session.token == token)
                .map(|session| (Role::Responder, &mut session.queue))
        };

        if let Some((role, queue)) = queue {
            if let Some(ready) = queue.push(candidate) {
                actions.push(Action::Link {
                    role,
                    token,
                    command: LinkCommand::AddCandidates(vec![ready]),
                });
            }
            return;
        }

        if let Some(stale) = &token {
            if self.retired.contains(stale) {
                debug!(token = %stale, "dropping candidate for retired session");
                return;
            }
        }
        if self.early.hold(token, candidate) {
            debug!("early candidate buffer full; dropped oldest");
        }
    }

    fn on_re_offer(&mut self, token: Option<SessionToken>, actions: &mut Vec<Action>) {
        let accepted = match &self.responder {
            None => true,
            Some(session) => session.token.is_none() || session.token == token,
        };
        if accepted {
            info!("remote endpoint requested a fresh negotiation");
            self.begin_offer(actions);
        } else {
            debug!("ignoring stale re-offer request");
        }
    }

    fn on_answer_timeout(&mut self, token: SessionToken, actions: &mut Vec<Action>) {
        let current = self
            .initiator
            .as_ref()
            .is_some_and(|session| session.token == token);
        if !current || self.initiator_state != InitiatorState::AwaitingAnswer {
            return;
        }
        if self.unanswered >= self.config.max_reoffers {
            let attempts = self.unanswered + 1;
            warn!(attempts, "giving up on unanswered offers");
            actions.push(Action::Emit(EndpointEvent::Failure(
                NegotiationError::AnswerTimeout { attempts },
            )));
            return;
        }
        self.unanswered += 1;
        info!(%token, attempt = self.unanswered, "offer unanswered; requesting renegotiation");
        actions.push(Action::Send(Envelope::re_offer(
            &self.config.remote,
            Some(token),
        )));
        self.begin_offer(actions);
    }

    fn on_completed(
        &mut self,
        role: Role,
        token: Option<SessionToken>,
        outcome: LinkOutcome,
        actions: &mut Vec<Action>,
    ) {
        if !self.is_current(role, token.as_ref()) {
            debug!(%role, "discarding completion for superseded session");
            return;
        }

        match (role, outcome) {
            (_, LinkOutcome::Failed(message)) => {
                warn!(%role, error = %message, "peer connection operation failed");
                if let Some(session) = self.initiator.as_mut().filter(|_| role == Role::Initiator) {
                    session.applying_answer = false;
                }
                actions.push(Action::Emit(EndpointEvent::Failure(
                    NegotiationError::Stack { role, message },
                )));
            }
            (Role::Initiator, LinkOutcome::LocalDescription(offer)) => {
                let Some(token) = token else { return };
                if self.initiator_state != InitiatorState::Offering {
                    return;
                }
                self.initiator_state = InitiatorState::AwaitingAnswer;
                actions.push(Action::Send(Envelope::sdp(
                    offer,
                    &self.config.remote,
                    Some(token.clone()),
                )));
                actions.push(Action::ArmAnswerTimeout {
                    token,
                    after: self.config.answer_timeout,
                });
            }
            (Role::Initiator, LinkOutcome::RemoteApplied) => {
                let Some(session) = self.initiator.as_mut() else {
                    return;
                };
                session.applying_answer = false;
                let flushed = session.queue.mark_remote_set();
                if !flushed.is_empty() {
                    actions.push(Action::Link {
                        role,
                        token: token.clone(),
                        command: LinkCommand::AddCandidates(flushed),
                    });
                }
                self.initiator_state = InitiatorState::Negotiated;
                self.unanswered = 0;
                info!(%role, "negotiated");
                actions.push(Action::Emit(EndpointEvent::Negotiated { role, token }));
            }
            (Role::Responder, LinkOutcome::RemoteApplied) => {
                let Some(session) = self.responder.as_mut() else {
                    return;
                };
                let flushed = session.queue.mark_remote_set();
                if !flushed.is_empty() {
                    actions.push(Action::Link {
                        role,
                        token: token.clone(),
                        command: LinkCommand::AddCandidates(flushed),
                    });
                }
                actions.push(Action::Link {
                    role,
                    token,
                    command: LinkCommand::CreateAnswer,
                });
            }
            (Role::Responder, LinkOutcome::LocalDescription(answer)) => {
                actions.push(Action::Send(Envelope::sdp(
                    answer,
                    &self.config.remote,
                    token.clone(),
                )));
                self.responder_state = ResponderState::Negotiated;
                info!(%role, "negotiated");
                actions.push(Action::Emit(EndpointEvent::Negotiated { role, token }));
            }
        }
    }

    fn on_link_event(&mut self, tagged: TaggedLinkEvent, actions: &mut Vec<Action>) {
        let TaggedLinkEvent { role, token, event } = tagged;
        if !self.is_current(role, token.as_ref()) {
            debug!(%role, "discarding event from superseded connection");
            return;
        }
        match event {
            LinkEvent::LocalCandidate(candidate) => actions.push(Action::Send(Envelope::ice(
                candidate,
                &self.config.remote,
                token,
            ))),
            LinkEvent::RemoteTrack(track) => {
                actions.push(Action::Emit(EndpointEvent::RemoteTrack { role, track }))
            }
        }
    }

    fn is_current(&self, role: Role, token: Option<&SessionToken>) -> bool {
        match role {
            Role::Initiator => self
                .initiator
                .as_ref()
                .is_some_and(|session| Some(&session.token) == token),
            Role::Responder => self
                .responder
                .as_ref()
                .is_some_and(|session| session.token.as_ref() == token),
        }
    }

    fn retire(&mut self, token: Option<SessionToken>) {
        if let Some(token) = token {
            self.early.discard(&token);
            self.retired.retire(token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::MediaKind;

    fn negotiator() -> Negotiator {
        Negotiator::new(NegotiatorConfig::new("a", "b"))
    }

    fn candidate(n: usize) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000 typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    fn signal(negotiator: &mut Negotiator, envelope: Envelope) -> Vec<Action> {
        negotiator.handle(Input::Signal(envelope))
    }

    fn completed(
        negotiator: &mut Negotiator,
        role: Role,
        token: Option<&SessionToken>,
        outcome: LinkOutcome,
    ) -> Vec<Action> {
        negotiator.handle(Input::Completed {
            role,
            token: token.cloned(),
            outcome,
        })
    }

    fn sent(actions: &[Action]) -> Vec<&Envelope> {
        actions
            .iter()
            .filter_map(|action| match action {
                Action::Send(envelope) => Some(envelope),
                _ => None,
            })
            .collect()
    }

    fn applied(actions: &[Action]) -> Vec<IceCandidate> {
        actions
            .iter()
            .filter_map(|action| match action {
                Action::Link {
                    command: LinkCommand::AddCandidates(candidates),
                    ..
                } => Some(candidates.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    fn events(actions: &[Action]) -> Vec<&EndpointEvent> {
        actions
            .iter()
            .filter_map(|action| match action {
                Action::Emit(event) => Some(event),
                _ => None,
            })
            .collect()
    }

    /// Drives the initiator to `AwaitingAnswer` and returns its token.
    fn offer_sent(negotiator: &mut Negotiator) -> SessionToken {
        signal(negotiator, Envelope::Start(StartHint::Offer));
        negotiator.handle(Input::MediaReady);
        let token = negotiator
            .token(Role::Initiator)
            .cloned()
            .expect("initiator session");
        completed(
            negotiator,
            Role::Initiator,
            Some(&token),
            LinkOutcome::LocalDescription(SessionDescription::offer("offer")),
        );
        token
    }

    #[test_timeout::timeout]
    fn registers_on_every_signaling_connect() {
        let mut negotiator = negotiator();
        for _ in 0..2 {
            assert_eq!(
                negotiator.handle(Input::SignalingOpened),
                vec![Action::Send(Envelope::open("a", "b"))]
            );
        }
    }

    #[test_timeout::timeout]
    fn every_ping_is_answered() {
        let mut negotiator = negotiator();
        let mut replies = signal(&mut negotiator, Envelope::Ping);
        replies.extend(signal(&mut negotiator, Envelope::Ping));
        assert_eq!(
            replies,
            vec![Action::Send(Envelope::Pong), Action::Send(Envelope::Pong)]
        );
    }

    #[test_timeout::timeout]
    fn start_acquires_media_before_offering() {
        let mut negotiator = negotiator();

        let actions = signal(&mut negotiator, Envelope::Start(StartHint::Answer));
        assert_eq!(actions, vec![Action::AcquireMedia]);
        assert_eq!(negotiator.responder_state(), ResponderState::AwaitingOffer);
        assert_eq!(negotiator.initiator_state(), InitiatorState::Idle);
        assert_eq!(negotiator.media_state(), MediaState::Acquiring);

        // A second start while capture is pending does not capture twice.
        assert!(signal(&mut negotiator, Envelope::Start(StartHint::Offer)).is_empty());

        let actions = negotiator.handle(Input::MediaReady);
        let token = negotiator.token(Role::Initiator).cloned();
        assert!(token.is_some());
        assert_eq!(
            actions,
            vec![
                Action::Link {
                    role: Role::Initiator,
                    token: token.clone(),
                    command: LinkCommand::Open { attach_media: true },
                },
                Action::Link {
                    role: Role::Initiator,
                    token,
                    command: LinkCommand::CreateOffer,
                },
            ]
        );
        assert_eq!(negotiator.initiator_state(), InitiatorState::Offering);
    }

    #[test_timeout::timeout]
    fn offer_is_sent_with_token_and_arms_timeout() {
        let mut negotiator = negotiator();
        signal(&mut negotiator, Envelope::Start(StartHint::Offer));
        negotiator.handle(Input::MediaReady);
        let token = negotiator.token(Role::Initiator).cloned().unwrap();

        let actions = completed(
            &mut negotiator,
            Role::Initiator,
            Some(&token),
            LinkOutcome::LocalDescription(SessionDescription::offer("v=0")),
        );

        assert_eq!(
            actions,
            vec![
                Action::Send(Envelope::sdp(
                    SessionDescription::offer("v=0"),
                    "b",
                    Some(token.clone())
                )),
                Action::ArmAnswerTimeout {
                    token,
                    after: Duration::from_secs(10),
                },
            ]
        );
        assert_eq!(negotiator.initiator_state(), InitiatorState::AwaitingAnswer);
    }

    #[test_timeout::timeout]
    fn answer_is_applied_once_and_completes_negotiation() {
        let mut negotiator = negotiator();
        let token = offer_sent(&mut negotiator);
        let answer = Envelope::sdp(SessionDescription::answer("ans"), "a", Some(token.clone()));

        let actions = signal(&mut negotiator, answer.clone());
        assert_eq!(
            actions,
            vec![Action::Link {
                role: Role::Initiator,
                token: Some(token.clone()),
                command: LinkCommand::ApplyRemote(SessionDescription::answer("ans")),
            }]
        );
        assert!(signal(&mut negotiator, answer).is_empty());

        let actions = completed(
            &mut negotiator,
            Role::Initiator,
            Some(&token),
            LinkOutcome::RemoteApplied,
        );
        assert_eq!(
            events(&actions),
            vec![&EndpointEvent::Negotiated {
                role: Role::Initiator,
                token: Some(token)
            }]
        );
        assert_eq!(negotiator.initiator_state(), InitiatorState::Negotiated);
    }

    #[test_timeout::timeout]
    fn answers_without_matching_token_are_dropped() {
        let mut negotiator = negotiator();
        assert!(signal(
            &mut negotiator,
            Envelope::sdp(SessionDescription::answer("x"), "a", Some("t".into()))
        )
        .is_empty());

        offer_sent(&mut negotiator);
        assert!(signal(
            &mut negotiator,
            Envelope::sdp(SessionDescription::answer("x"), "a", None)
        )
        .is_empty());
        assert!(signal(
            &mut negotiator,
            Envelope::sdp(SessionDescription::answer("x"), "a", Some("other".into()))
        )
        .is_empty());
        assert_eq!(negotiator.initiator_state(), InitiatorState::AwaitingAnswer);
    }

    #[test_timeout::timeout]
    fn late_answer_for_superseded_offer_does_not_touch_new_session() {
        let mut negotiator = negotiator();
        let old = offer_sent(&mut negotiator);

        let actions = negotiator.handle(Input::AnswerTimeout { token: old.clone() });
        assert_eq!(
            sent(&actions),
            vec![&Envelope::re_offer("b", Some(old.clone()))]
        );
        let new = negotiator.token(Role::Initiator).cloned().unwrap();
        assert_ne!(new, old);
        assert_eq!(negotiator.initiator_state(), InitiatorState::Offering);

        let late = Envelope::sdp(SessionDescription::answer("late"), "a", Some(old.clone()));
        assert!(signal(&mut negotiator, late).is_empty());
        assert!(completed(
            &mut negotiator,
            Role::Initiator,
            Some(&old),
            LinkOutcome::RemoteApplied
        )
        .is_empty());
        assert_eq!(negotiator.initiator_state(), InitiatorState::Offering);
        assert_eq!(negotiator.token(Role::Initiator), Some(&new));
    }

    #[test_timeout::timeout]
    fn candidates_wait_for_the_answer_and_replay_in_order() {
        let mut negotiator = negotiator();
        let token = offer_sent(&mut negotiator);

        for n in 1..=3 {
            let actions = signal(
                &mut negotiator,
                Envelope::ice(candidate(n), "a", Some(token.clone())),
            );
            assert!(actions.is_empty());
        }
        assert_eq!(negotiator.pending_candidates(Role::Initiator), 3);

        // A candidate for some other attempt never reaches this session.
        signal(
            &mut negotiator,
            Envelope::ice(candidate(9), "a", Some("elsewhere".into())),
        );

        signal(
            &mut negotiator,
            Envelope::sdp(SessionDescription::answer("ans"), "a", Some(token.clone())),
        );
        let actions = completed(
            &mut negotiator,
            Role::Initiator,
            Some(&token),
            LinkOutcome::RemoteApplied,
        );
        assert_eq!(applied(&actions), vec![candidate(1), candidate(2), candidate(3)]);

        let actions = signal(
            &mut negotiator,
            Envelope::ice(candidate(4), "a", Some(token.clone())),
        );
        assert_eq!(applied(&actions), vec![candidate(4)]);
    }

    #[test_timeout::timeout]
    fn responder_answers_with_the_offer_token() {
        let mut negotiator = negotiator();
        let token = SessionToken::from("t1");
        let offer = SessionDescription::offer("remote-offer");

        let actions = signal(
            &mut negotiator,
            Envelope::sdp(offer.clone(), "a", Some(token.clone())),
        );
        assert_eq!(
            actions,
            vec![
                Action::Link {
                    role: Role::Responder,
                    token: Some(token.clone()),
                    command: LinkCommand::Open {
                        attach_media: false
                    },
                },
                Action::Link {
                    role: Role::Responder,
                    token: Some(token.clone()),
                    command: LinkCommand::ApplyRemote(offer),
                },
            ]
        );
        assert_eq!(negotiator.responder_state(), ResponderState::Answering);

        let actions = completed(
            &mut negotiator,
            Role::Responder,
            Some(&token),
            LinkOutcome::RemoteApplied,
        );
        assert_eq!(
            actions,
            vec![Action::Link {
                role: Role::Responder,
                token: Some(token.clone()),
                command: LinkCommand::CreateAnswer,
            }]
        );

        let actions = completed(
            &mut negotiator,
            Role::Responder,
            Some(&token),
            LinkOutcome::LocalDescription(SessionDescription::answer("ans")),
        );
        assert_eq!(
            sent(&actions),
            vec![&Envelope::sdp(
                SessionDescription::answer("ans"),
                "b",
                Some(token.clone())
            )]
        );
        assert_eq!(negotiator.responder_state(), ResponderState::Negotiated);
    }

    #[test_timeout::timeout]
    fn duplicate_and_retired_offers_are_dropped() {
        let mut negotiator = negotiator();
        let first = Envelope::sdp(SessionDescription::offer("o1"), "a", Some("t1".into()));
        signal(&mut negotiator, first.clone());

        assert!(signal(&mut negotiator, first.clone()).is_empty());

        signal(
            &mut negotiator,
            Envelope::sdp(SessionDescription::offer("o2"), "a", Some("t2".into())),
        );
        assert!(signal(&mut negotiator, first).is_empty());
        assert_eq!(
            negotiator.token(Role::Responder),
            Some(&SessionToken::from("t2"))
        );
    }

    #[test_timeout::timeout]
    fn newer_offer_replaces_negotiated_responder() {
        let mut negotiator = negotiator();
        let t1 = SessionToken::from("t1");
        let t2 = SessionToken::from("t2");
        signal(
            &mut negotiator,
            Envelope::sdp(SessionDescription::offer("o1"), "a", Some(t1.clone())),
        );
        completed(&mut negotiator, Role::Responder, Some(&t1), LinkOutcome::RemoteApplied);
        completed(
            &mut negotiator,
            Role::Responder,
            Some(&t1),
            LinkOutcome::LocalDescription(SessionDescription::answer("a1")),
        );
        assert_eq!(negotiator.responder_state(), ResponderState::Negotiated);

        let actions = signal(
            &mut negotiator,
            Envelope::sdp(SessionDescription::offer("o2"), "a", Some(t2.clone())),
        );
        assert_eq!(actions.len(), 2);
        assert_eq!(negotiator.responder_state(), ResponderState::Answering);

        assert!(signal(&mut negotiator, Envelope::ice(candidate(1), "a", Some(t1.clone()))).is_empty());
        assert_eq!(negotiator.early_candidates(), 0);
        assert!(completed(
            &mut negotiator,
            Role::Responder,
            Some(&t1),
            LinkOutcome::LocalDescription(SessionDescription::answer("stale"))
        )
        .is_empty());
    }

    #[test_timeout::timeout]
    fn candidates_ahead_of_their_offer_are_adopted() {
        let mut negotiator = negotiator();
        let token = SessionToken::from("t1");
        signal(&mut negotiator, Envelope::ice(candidate(1), "a", Some(token.clone())));
        signal(&mut negotiator, Envelope::ice(candidate(2), "a", Some(token.clone())));
        assert_eq!(negotiator.early_candidates(), 2);

        signal(
            &mut negotiator,
            Envelope::sdp(SessionDescription::offer("o"), "a", Some(token.clone())),
        );
        assert_eq!(negotiator.early_candidates(), 0);
        assert_eq!(negotiator.pending_candidates(Role::Responder), 2);

        let actions = completed(
            &mut negotiator,
            Role::Responder,
            Some(&token),
            LinkOutcome::RemoteApplied,
        );
        assert_eq!(applied(&actions), vec![candidate(1), candidate(2)]);
    }

    #[test_timeout::timeout]
    fn tokenless_offers_and_candidates_pair_up() {
        let mut negotiator = negotiator();
        signal(
            &mut negotiator,
            Envelope::sdp(SessionDescription::offer("browser"), "a", None),
        );
        signal(&mut negotiator, Envelope::ice(candidate(1), "a", None));
        assert_eq!(negotiator.pending_candidates(Role::Responder), 1);

        let actions = completed(&mut negotiator, Role::Responder, None, LinkOutcome::RemoteApplied);
        assert_eq!(applied(&actions), vec![candidate(1)]);

        let actions = completed(
            &mut negotiator,
            Role::Responder,
            None,
            LinkOutcome::LocalDescription(SessionDescription::answer("ans")),
        );
        assert_eq!(
            sent(&actions),
            vec![&Envelope::sdp(SessionDescription::answer("ans"), "b", None)]
        );
    }

    #[test_timeout::timeout]
    fn unanswered_offers_give_up_after_max_reoffers() {
        let mut negotiator = negotiator();
        let mut token = offer_sent(&mut negotiator);

        for attempt in 1..=3 {
            let actions = negotiator.handle(Input::AnswerTimeout {
                token: token.clone(),
            });
            assert_eq!(
                sent(&actions),
                vec![&Envelope::re_offer("b", Some(token.clone()))],
                "attempt {attempt}"
            );
            token = negotiator.token(Role::Initiator).cloned().unwrap();
            completed(
                &mut negotiator,
                Role::Initiator,
                Some(&token),
                LinkOutcome::LocalDescription(SessionDescription::offer("again")),
            );
        }

        let actions = negotiator.handle(Input::AnswerTimeout {
            token: token.clone(),
        });
        assert_eq!(
            actions,
            vec![Action::Emit(EndpointEvent::Failure(
                NegotiationError::AnswerTimeout { attempts: 4 }
            ))]
        );
        assert_eq!(negotiator.token(Role::Initiator), Some(&token));
    }

    #[test_timeout::timeout]
    fn timeout_after_answer_is_ignored() {
        let mut negotiator = negotiator();
        let token = offer_sent(&mut negotiator);
        signal(
            &mut negotiator,
            Envelope::sdp(SessionDescription::answer("ans"), "a", Some(token.clone())),
        );
        completed(&mut negotiator, Role::Initiator, Some(&token), LinkOutcome::RemoteApplied);

        assert!(negotiator.handle(Input::AnswerTimeout { token }).is_empty());
    }

    #[test_timeout::timeout]
    fn re_offer_restarts_initiator_only_for_current_responder_token() {
        let mut negotiator = negotiator();
        negotiator.handle(Input::MediaReady);

        let actions = signal(&mut negotiator, Envelope::re_offer("a", Some("t0".into())));
        assert_eq!(negotiator.initiator_state(), InitiatorState::Offering);
        assert_eq!(actions.len(), 2);

        signal(
            &mut negotiator,
            Envelope::sdp(SessionDescription::offer("o"), "a", Some("t1".into())),
        );
        let before = negotiator.token(Role::Initiator).cloned();
        assert!(signal(&mut negotiator, Envelope::re_offer("a", Some("t0".into()))).is_empty());
        assert_eq!(negotiator.token(Role::Initiator).cloned(), before);

        signal(&mut negotiator, Envelope::re_offer("a", Some("t1".into())));
        assert_ne!(negotiator.token(Role::Initiator).cloned(), before);
    }

    #[test_timeout::timeout]
    fn close_tears_down_both_roles() {
        let mut negotiator = negotiator();
        let initiator = offer_sent(&mut negotiator);
        signal(
            &mut negotiator,
            Envelope::sdp(SessionDescription::offer("o"), "a", Some("t1".into())),
        );
        signal(&mut negotiator, Envelope::ice(candidate(1), "a", Some("later".into())));

        let actions = signal(&mut negotiator, Envelope::Close);

        assert_eq!(
            actions,
            vec![
                Action::Link {
                    role: Role::Initiator,
                    token: Some(initiator.clone()),
                    command: LinkCommand::Close,
                },
                Action::Link {
                    role: Role::Responder,
                    token: Some("t1".into()),
                    command: LinkCommand::Close,
                },
                Action::Emit(EndpointEvent::RemoteMediaStopped),
            ]
        );
        assert_eq!(negotiator.initiator_state(), InitiatorState::Idle);
        assert_eq!(negotiator.responder_state(), ResponderState::Idle);
        assert_eq!(negotiator.early_candidates(), 0);

        // Answers for the torn down attempt are stale.
        assert!(signal(
            &mut negotiator,
            Envelope::sdp(SessionDescription::answer("a"), "a", Some(initiator))
        )
        .is_empty());
    }

    #[test_timeout::timeout]
    fn link_events_are_forwarded_only_for_current_sessions() {
        let mut negotiator = negotiator();
        let token = offer_sent(&mut negotiator);

        let actions = negotiator.handle(Input::Link(TaggedLinkEvent {
            role: Role::Initiator,
            token: Some(token.clone()),
            event: LinkEvent::LocalCandidate(candidate(1)),
        }));
        assert_eq!(
            sent(&actions),
            vec![&Envelope::ice(candidate(1), "b", Some(token.clone()))]
        );

        let track = RemoteTrack {
            id: "video0".into(),
            stream_id: "stream".into(),
            kind: MediaKind::Video,
        };
        let stale = negotiator.handle(Input::Link(TaggedLinkEvent {
            role: Role::Initiator,
            token: Some("old".into()),
            event: LinkEvent::RemoteTrack(track.clone()),
        }));
        assert!(stale.is_empty());

        let actions = negotiator.handle(Input::Link(TaggedLinkEvent {
            role: Role::Initiator,
            token: Some(token),
            event: LinkEvent::RemoteTrack(track.clone()),
        }));
        assert_eq!(
            events(&actions),
            vec![&EndpointEvent::RemoteTrack {
                role: Role::Initiator,
                track
            }]
        );
    }

    #[test_timeout::timeout]
    fn media_failure_is_visible_and_blocks_offering() {
        let mut negotiator = negotiator();
        signal(&mut negotiator, Envelope::Start(StartHint::Offer));

        let actions = negotiator.handle(Input::MediaFailed("no camera".into()));

        assert_eq!(
            actions,
            vec![Action::Emit(EndpointEvent::Failure(NegotiationError::Media(
                "no camera".into()
            )))]
        );
        assert_eq!(negotiator.initiator_state(), InitiatorState::Idle);
        assert_eq!(negotiator.media_state(), MediaState::Failed);

        // The next start tries to capture again.
        assert_eq!(
            signal(&mut negotiator, Envelope::Start(StartHint::Offer)),
            vec![Action::AcquireMedia]
        );
    }

    #[test_timeout::timeout]
    fn stack_failure_is_visible_and_keeps_state() {
        let mut negotiator = negotiator();
        let token = offer_sent(&mut negotiator);
        signal(
            &mut negotiator,
            Envelope::sdp(SessionDescription::answer("bad"), "a", Some(token.clone())),
        );

        let actions = completed(
            &mut negotiator,
            Role::Initiator,
            Some(&token),
            LinkOutcome::Failed("malformed sdp".into()),
        );

        assert_eq!(
            events(&actions),
            vec![&EndpointEvent::Failure(NegotiationError::Stack {
                role: Role::Initiator,
                message: "malformed sdp".into()
            })]
        );
        assert_eq!(negotiator.initiator_state(), InitiatorState::AwaitingAnswer);

        // A corrected answer for the same attempt may still be applied.
        let retry = signal(
            &mut negotiator,
            Envelope::sdp(SessionDescription::answer("good"), "a", Some(token)),
        );
        assert_eq!(retry.len(), 1);
    }

    #[test_timeout::timeout]
    fn rejected_candidate_is_visible_and_keeps_responder_negotiated() {
        let mut negotiator = negotiator();
        let token = SessionToken::from("t1");
        signal(
            &mut negotiator,
            Envelope::sdp(SessionDescription::offer("o"), "a", Some(token.clone())),
        );
        completed(&mut negotiator, Role::Responder, Some(&token), LinkOutcome::RemoteApplied);
        completed(
            &mut negotiator,
            Role::Responder,
            Some(&token),
            LinkOutcome::LocalDescription(SessionDescription::answer("ans")),
        );

        let actions = signal(&mut negotiator, Envelope::ice(candidate(1), "a", Some(token.clone())));
        assert_eq!(applied(&actions), vec![candidate(1)]);

        let actions = completed(
            &mut negotiator,
            Role::Responder,
            Some(&token),
            LinkOutcome::Failed("invalid candidate".into()),
        );
        assert_eq!(
            events(&actions),
            vec![&EndpointEvent::Failure(NegotiationError::Stack {
                role: Role::Responder,
                message: "invalid candidate".into()
            })]
        );
        assert_eq!(negotiator.responder_state(), ResponderState::Negotiated);

        let actions = signal(&mut negotiator, Envelope::ice(candidate(2), "a", Some(token)));
        assert_eq!(applied(&actions), vec![candidate(2)]);
    }
}
