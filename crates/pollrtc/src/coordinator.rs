//! Public lifecycle of one signaling session.
//!
//! [`SignalingCoordinator`] resolves the role, drives the negotiator, runs
//! the offer/answer/candidate polls and turns peer connection notifications
//! into [`SignalingEvent`]s. Session state and the pending candidate queue
//! sit behind one async mutex, so description commits, candidate
//! application and flushes never interleave however the poll ticks and peer
//! events are scheduled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::candidates::{CandidateExchanger, ErrorSink};
use crate::config::SignalingConfig;
use crate::error::SignalingError;
use crate::negotiator::{AnswerOutcome, SessionNegotiator};
use crate::peer::{DataChannel, PeerConnection, PeerConnectionState, PeerEvent, PeerEventReceiver};
use crate::poll::{PollKind, PollScheduler, TickOutcome};
use crate::role::{resolver_for, RoleResolver};
use crate::session::{CoordinatorState, Role, Session};
use crate::signal::{Candidate, Payload, SessionDescription};
use crate::transport::SignalingTransport;

/// Notifications for the owner of a coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    /// The data channel opened.
    Open,
    Message(Payload),
    /// The data channel closed. Raised at most once.
    Close,
    Error(SignalingError),
    StateChanged(CoordinatorState),
}

pub type SignalingEventReceiver = mpsc::UnboundedReceiver<SignalingEvent>;

#[derive(Debug, Clone, Copy)]
struct Status {
    state: CoordinatorState,
    role: Role,
}

struct Negotiation {
    session: Session,
    candidates: CandidateExchanger,
}

pub struct SignalingCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    session_id: Uuid,
    peer: Arc<dyn PeerConnection>,
    transport: Arc<dyn SignalingTransport>,
    resolver: Box<dyn RoleResolver>,
    negotiator: SessionNegotiator,
    negotiation: Mutex<Negotiation>,
    scheduler: PollScheduler,
    status: watch::Sender<Status>,
    channel: SyncMutex<Option<Arc<dyn DataChannel>>>,
    close_reported: AtomicBool,
    events: mpsc::UnboundedSender<SignalingEvent>,
    local_candidates: mpsc::UnboundedSender<Candidate>,
    shutdown: CancellationToken,
}

impl SignalingCoordinator {
    /// Builds a coordinator using the role strategy from `config`. Fails
    /// with [`SignalingError::Config`] when `config` does not validate.
    ///
    /// Must be called from within a Tokio runtime: the peer event pump and
    /// the local candidate publisher are spawned here.
    pub fn new(
        config: SignalingConfig,
        peer: Arc<dyn PeerConnection>,
        transport: Arc<dyn SignalingTransport>,
    ) -> Result<(Self, SignalingEventReceiver), SignalingError> {
        let resolver = resolver_for(config.role_strategy);
        Self::with_resolver(config, peer, transport, resolver)
    }

    pub fn with_resolver(
        config: SignalingConfig,
        peer: Arc<dyn PeerConnection>,
        transport: Arc<dyn SignalingTransport>,
        resolver: Box<dyn RoleResolver>,
    ) -> Result<(Self, SignalingEventReceiver), SignalingError> {
        config.validate()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (candidates_tx, candidates_rx) = mpsc::unbounded_channel();
        let session = Session::new();
        let (status_tx, status_rx) = watch::channel(Status {
            state: session.state(),
            role: session.role(),
        });
        let peer_events = peer.take_events();

        let inner = Arc::new(Inner {
            session_id: session.id(),
            negotiator: SessionNegotiator::new(
                Arc::clone(&peer),
                Arc::clone(&transport),
                config.data_channel_label.clone(),
            ),
            peer,
            transport,
            resolver,
            negotiation: Mutex::new(Negotiation {
                session,
                candidates: CandidateExchanger::new(config.dedupe_candidates),
            }),
            scheduler: PollScheduler::new(config.poll_interval),
            status: status_tx,
            channel: SyncMutex::new(None),
            close_reported: AtomicBool::new(false),
            events: events_tx,
            local_candidates: candidates_tx,
            shutdown: CancellationToken::new(),
        });

        match peer_events {
            Some(rx) => {
                tokio::spawn(pump_peer_events(
                    Arc::downgrade(&inner),
                    rx,
                    inner.shutdown.clone(),
                ));
            }
            None => tracing::warn!(
                target = "pollrtc::coordinator",
                session_id = %inner.session_id,
                "peer events already taken; channel and candidate events will not be observed"
            ),
        }
        tokio::spawn(publish_local_candidates(
            Arc::downgrade(&inner),
            candidates_rx,
            status_rx,
            inner.shutdown.clone(),
        ));

        Ok((Self { inner }, events_rx))
    }

    /// Resolves the role and starts negotiating.
    ///
    /// Returns once the role-specific opening step is done: the caller has
    /// published its offer, the receiver has answered or started polling for
    /// an offer. Failures are also raised as [`SignalingEvent::Error`] and
    /// leave the coordinator `Failed`. Calling it again while a session is in
    /// progress does nothing.
    pub async fn connect(&self) -> Result<(), SignalingError> {
        match Arc::clone(&self.inner).run_connect().await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.inner.abort(&err).await;
                Err(err)
            }
        }
    }

    /// Sends over the data channel. Returns `false` without doing anything
    /// else when the channel is not open.
    pub async fn send(&self, message: impl Into<Payload>) -> bool {
        let channel = self.inner.channel.lock().clone();
        let channel = match channel {
            Some(channel) if channel.is_open() && !self.state().is_terminal() => channel,
            _ => {
                tracing::warn!(
                    target = "pollrtc::coordinator",
                    session_id = %self.inner.session_id,
                    "data channel is not open; message not sent"
                );
                return false;
            }
        };
        match channel.send(message.into()).await {
            Ok(()) => true,
            Err(err) => {
                self.inner
                    .report(SignalingError::Channel(format!("send failed: {err}")));
                false
            }
        }
    }

    /// Tears the session down. Safe to call from any state, any number of
    /// times.
    pub async fn close(&self) {
        self.inner.close().await;
    }

    pub fn state(&self) -> CoordinatorState {
        self.inner.status.borrow().state
    }

    pub fn role(&self) -> Role {
        self.inner.status.borrow().role
    }

    pub fn session_id(&self) -> Uuid {
        self.inner.session_id
    }

    pub fn is_polling(&self, kind: PollKind) -> bool {
        self.inner.scheduler.is_active(kind)
    }

    /// Remote candidates waiting for a remote description.
    pub async fn pending_candidates(&self) -> usize {
        self.inner.negotiation.lock().await.candidates.pending_len()
    }
}

impl Drop for SignalingCoordinator {
    fn drop(&mut self) {
        self.inner.scheduler.seal();
        self.inner.shutdown.cancel();
    }
}

impl ErrorSink for Inner {
    fn report(&self, error: SignalingError) {
        tracing::warn!(
            target = "pollrtc::coordinator",
            session_id = %self.session_id,
            error = %error,
            "signaling error"
        );
        let _ = self.events.send(SignalingEvent::Error(error));
    }
}

impl Inner {
    fn role(&self) -> Role {
        self.status.borrow().role
    }

    fn transition(&self, negotiation: &mut Negotiation, next: CoordinatorState) -> bool {
        if !negotiation.session.transition(next) {
            return false;
        }
        self.status.send_modify(|status| status.state = next);
        let _ = self.events.send(SignalingEvent::StateChanged(next));
        true
    }

    async fn run_connect(self: Arc<Self>) -> Result<(), SignalingError> {
        {
            let mut negotiation = self.negotiation.lock().await;
            match negotiation.session.state() {
                CoordinatorState::Idle => {}
                CoordinatorState::Closed => return Err(SignalingError::Closed),
                CoordinatorState::Failed => return Err(SignalingError::Failed),
                state => {
                    tracing::debug!(
                        target = "pollrtc::coordinator",
                        session_id = %self.session_id,
                        ?state,
                        "connect called while a session is in progress"
                    );
                    return Ok(());
                }
            }
            self.transition(&mut negotiation, CoordinatorState::RoleResolving);
        }

        let decision = self.resolver.resolve(self.transport.as_ref()).await?;
        {
            let mut negotiation = self.negotiation.lock().await;
            if negotiation.session.is_closed() {
                return Err(SignalingError::Closed);
            }
            negotiation.session.assign_role(decision.role)?;
            self.status.send_modify(|status| status.role = decision.role);
            self.transition(&mut negotiation, CoordinatorState::Negotiating);
        }
        tracing::info!(
            target = "pollrtc::coordinator",
            session_id = %self.session_id,
            role = %decision.role,
            "role resolved"
        );

        match decision.role {
            Role::Caller => self.open_as_caller().await?,
            Role::Receiver => match decision.offer {
                Some(offer) => self.handle_offer(offer).await?,
                None => self.start_offer_poll(),
            },
            Role::Undetermined => return Err(SignalingError::RoleUnresolved),
        }

        // Connected may already have been reported while the opening step ran.
        let negotiation = self.negotiation.lock().await;
        let state = negotiation.session.state();
        if state == CoordinatorState::Connected || state.is_terminal() {
            tracing::debug!(
                target = "pollrtc::coordinator",
                session_id = %self.session_id,
                ?state,
                "not starting candidate poll"
            );
            return Ok(());
        }
        self.start_candidate_poll();
        Ok(())
    }

    async fn open_as_caller(self: &Arc<Self>) -> Result<(), SignalingError> {
        let opening = self.negotiator.act_as_caller().await?;
        let mut negotiation = self.negotiation.lock().await;
        if negotiation.session.is_closed() {
            let _ = opening.channel.close().await;
            return Err(SignalingError::Closed);
        }
        negotiation.session.commit_local(opening.offer);
        *self.channel.lock() = Some(opening.channel);
        drop(negotiation);
        self.start_answer_poll();
        Ok(())
    }

    async fn handle_offer(&self, offer: SessionDescription) -> Result<(), SignalingError> {
        let mut guard = self.negotiation.lock().await;
        let negotiation = &mut *guard;
        if negotiation.session.is_closed() {
            return Err(SignalingError::Closed);
        }
        let answer = self
            .negotiator
            .act_as_receiver(offer.clone(), &mut negotiation.candidates, self)
            .await?;
        negotiation.session.commit_remote(offer);
        negotiation.session.commit_local(answer);
        self.transition(negotiation, CoordinatorState::CandidateExchange);
        Ok(())
    }

    fn start_offer_poll(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.scheduler.start(PollKind::Offer, move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(inner) => inner.offer_tick().await,
                    None => TickOutcome::Done,
                }
            }
        });
    }

    fn start_answer_poll(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.scheduler.start(PollKind::Answer, move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(inner) => inner.answer_tick().await,
                    None => TickOutcome::Done,
                }
            }
        });
    }

    fn start_candidate_poll(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.scheduler.start(PollKind::Candidates, move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(inner) => inner.candidate_tick().await,
                    None => TickOutcome::Done,
                }
            }
        });
    }

    async fn offer_tick(&self) -> TickOutcome {
        let offer = match self.transport.fetch_offer().await {
            Ok(Some(offer)) => offer,
            Ok(None) => return TickOutcome::Continue,
            Err(err) => {
                self.report(err.into());
                return TickOutcome::Continue;
            }
        };
        tracing::info!(
            target = "pollrtc::coordinator",
            session_id = %self.session_id,
            "offer received"
        );
        self.scheduler.cancel(PollKind::Offer);
        match self.handle_offer(offer).await {
            Ok(()) | Err(SignalingError::Closed) => {}
            Err(SignalingError::StateGuard(what)) => tracing::debug!(
                target = "pollrtc::coordinator",
                session_id = %self.session_id,
                what,
                "ignored out-of-order signal"
            ),
            Err(err) => self.abort(&err).await,
        }
        TickOutcome::Done
    }

    async fn answer_tick(&self) -> TickOutcome {
        let answer = match self.transport.fetch_answer().await {
            Ok(Some(answer)) => answer,
            Ok(None) => return TickOutcome::Continue,
            Err(err) => {
                self.report(err.into());
                return TickOutcome::Continue;
            }
        };
        let mut guard = self.negotiation.lock().await;
        let negotiation = &mut *guard;
        if negotiation.session.is_closed() {
            return TickOutcome::Done;
        }
        match self
            .negotiator
            .apply_answer(answer.clone(), &mut negotiation.candidates, self)
            .await
        {
            Ok(AnswerOutcome::Applied) => {
                negotiation.session.commit_remote(answer);
                self.transition(negotiation, CoordinatorState::CandidateExchange);
                TickOutcome::Done
            }
            Ok(AnswerOutcome::Ignored) => TickOutcome::Continue,
            Err(err) => {
                self.report(err);
                TickOutcome::Continue
            }
        }
    }

    async fn candidate_tick(&self) -> TickOutcome {
        let role = self.role();
        let candidates = match self.transport.fetch_candidates(role).await {
            Ok(candidates) => candidates,
            Err(err) => {
                self.report(err.into());
                return TickOutcome::Continue;
            }
        };
        if candidates.is_empty() {
            return TickOutcome::Continue;
        }
        let mut guard = self.negotiation.lock().await;
        let negotiation = &mut *guard;
        if negotiation.session.is_closed() {
            return TickOutcome::Done;
        }
        negotiation
            .candidates
            .accept_remote(self.peer.as_ref(), candidates, self)
            .await;
        TickOutcome::Continue
    }

    /// Marks the session failed after an unrecoverable error.
    async fn abort(&self, err: &SignalingError) {
        if matches!(err, SignalingError::Closed) {
            return;
        }
        let mut negotiation = self.negotiation.lock().await;
        if negotiation.session.is_closed() {
            return;
        }
        tracing::error!(
            target = "pollrtc::coordinator",
            session_id = %self.session_id,
            error = %err,
            "signaling failed"
        );
        if self.transition(&mut negotiation, CoordinatorState::Failed) {
            self.scheduler.cancel_all();
        }
        drop(negotiation);
        let _ = self.events.send(SignalingEvent::Error(err.clone()));
    }

    async fn close(&self) {
        {
            let mut negotiation = self.negotiation.lock().await;
            if negotiation.session.is_closed() {
                return;
            }
            self.transition(&mut negotiation, CoordinatorState::Closed);
            negotiation.candidates.clear();
            self.scheduler.seal();
        }

        let channel = self.channel.lock().take();
        if let Some(channel) = channel {
            if let Err(err) = channel.close().await {
                tracing::warn!(target = "pollrtc::coordinator", error = %err, "data channel close failed");
            }
            self.report_close();
        }
        tracing::trace!(target = "pollrtc::coordinator", await = "peer.close", state = "start");
        let result = self.peer.close().await;
        tracing::trace!(target = "pollrtc::coordinator", await = "peer.close", state = "end");
        if let Err(err) = result {
            tracing::warn!(target = "pollrtc::coordinator", error = %err, "peer close failed");
        }
        self.shutdown.cancel();
        tracing::info!(
            target = "pollrtc::coordinator",
            session_id = %self.session_id,
            "session closed"
        );
    }

    fn report_close(&self) {
        if !self.close_reported.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(SignalingEvent::Close);
        }
    }

    async fn handle_peer_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::ConnectionStateChanged(state) => self.on_connection_state(state).await,
            PeerEvent::LocalCandidate(candidate) => {
                let _ = self.local_candidates.send(candidate);
            }
            PeerEvent::IncomingDataChannel(channel) => {
                let mut slot = self.channel.lock();
                if slot.is_none() && !self.status.borrow().state.is_terminal() {
                    tracing::debug!(
                        target = "pollrtc::coordinator",
                        label = %channel.label(),
                        "adopting incoming data channel"
                    );
                    *slot = Some(channel);
                }
            }
            PeerEvent::ChannelOpen { label } => {
                tracing::info!(target = "pollrtc::coordinator", %label, "data channel open");
                let _ = self.events.send(SignalingEvent::Open);
            }
            PeerEvent::ChannelMessage { payload, .. } => {
                let _ = self.events.send(SignalingEvent::Message(payload));
            }
            PeerEvent::ChannelClosed { label } => {
                tracing::info!(target = "pollrtc::coordinator", %label, "data channel closed");
                self.report_close();
            }
            PeerEvent::ChannelError { label, message } => {
                self.report(SignalingError::Channel(format!("{label}: {message}")));
            }
        }
    }

    async fn on_connection_state(&self, state: PeerConnectionState) {
        tracing::debug!(
            target = "pollrtc::coordinator",
            session_id = %self.session_id,
            ?state,
            "peer connection state"
        );
        match state {
            PeerConnectionState::Connected => {
                let mut negotiation = self.negotiation.lock().await;
                self.scheduler.cancel(PollKind::Candidates);
                if self.transition(&mut negotiation, CoordinatorState::Connected) {
                    tracing::info!(
                        target = "pollrtc::coordinator",
                        session_id = %self.session_id,
                        "peer fully connected"
                    );
                }
            }
            PeerConnectionState::Failed => tracing::warn!(
                target = "pollrtc::coordinator",
                session_id = %self.session_id,
                "peer connection failed"
            ),
            _ => {}
        }
    }
}

async fn pump_peer_events(
    inner: Weak<Inner>,
    mut events: PeerEventReceiver,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Some(inner) = inner.upgrade() else { break };
        inner.handle_peer_event(event).await;
    }
    tracing::debug!(target = "pollrtc::coordinator", "peer event pump stopped");
}

/// Publishes local candidates one at a time, in discovery order, once the
/// role is known.
async fn publish_local_candidates(
    inner: Weak<Inner>,
    mut candidates: mpsc::UnboundedReceiver<Candidate>,
    mut status: watch::Receiver<Status>,
    shutdown: CancellationToken,
) {
    loop {
        let candidate = tokio::select! {
            _ = shutdown.cancelled() => break,
            candidate = candidates.recv() => match candidate {
                Some(candidate) => candidate,
                None => break,
            },
        };
        let role = tokio::select! {
            _ = shutdown.cancelled() => break,
            role = resolved_role(&mut status) => match role {
                Some(role) => role,
                None => break,
            },
        };
        if !role.is_resolved() {
            tracing::debug!(
                target = "pollrtc::coordinator",
                "session ended before role resolution; dropping local candidate"
            );
            continue;
        }
        let Some(inner) = inner.upgrade() else { break };
        if let Err(err) =
            CandidateExchanger::publish_local(inner.transport.as_ref(), role, &candidate).await
        {
            inner.report(err);
        }
    }
    tracing::debug!(target = "pollrtc::coordinator", "local candidate publisher stopped");
}

/// Waits until the role is known. Yields `Undetermined` if the session ended
/// first and `None` once the coordinator is gone.
async fn resolved_role(status: &mut watch::Receiver<Status>) -> Option<Role> {
    loop {
        let current = *status.borrow_and_update();
        if current.role.is_resolved() || current.state.is_terminal() {
            return Some(current.role);
        }
        status.changed().await.ok()?;
    }
}
