//! In-process fakes for the peer connection and the rendezvous store.
//!
//! [`MockPeer`] follows the offer/answer state rules of a real peer
//! connection closely enough for the coordinator to drive it, records every
//! call, and lets tests inject failures and push events. [`ScriptedTransport`]
//! replays queued fetch results and records every post.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::error::{PeerError, TransportError};
use crate::peer::{
    DataChannel, NegotiationState, PeerConnection, PeerConnectionState, PeerEvent,
    PeerEventReceiver,
};
use crate::session::Role;
use crate::signal::{Candidate, Payload, SdpKind, SessionDescription, SignalKind};
use crate::transport::SignalingTransport;

#[derive(Debug, Clone, PartialEq)]
pub enum PeerCall {
    CreateOffer,
    CreateAnswer,
    SetLocalDescription(SessionDescription),
    SetRemoteDescription(SessionDescription),
    AddCandidate(Candidate),
    CreateDataChannel(String),
    Close,
}

#[derive(Debug)]
struct PeerState {
    calls: Vec<PeerCall>,
    negotiation: NegotiationState,
    remote: Option<SessionDescription>,
    failing_steps: HashMap<&'static str, String>,
    rejected_candidates: HashSet<String>,
    channels: Vec<Arc<MockDataChannel>>,
    descriptions: usize,
}

pub struct MockPeer {
    state: Mutex<PeerState>,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    events_rx: Mutex<Option<PeerEventReceiver>>,
}

impl Default for MockPeer {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPeer {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            state: Mutex::new(PeerState {
                calls: Vec::new(),
                negotiation: NegotiationState::NoLocalOffer,
                remote: None,
                failing_steps: HashMap::new(),
                rejected_candidates: HashSet::new(),
                channels: Vec::new(),
                descriptions: 0,
            }),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    pub fn calls(&self) -> Vec<PeerCall> {
        self.state.lock().calls.clone()
    }

    pub fn count(&self, predicate: impl Fn(&PeerCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|call| predicate(call)).count()
    }

    /// Makes every later call of `step` (a trait method name) fail.
    pub fn fail_step(&self, step: &'static str, reason: impl Into<String>) {
        self.state.lock().failing_steps.insert(step, reason.into());
    }

    pub fn clear_failures(&self) {
        self.state.lock().failing_steps.clear();
    }

    /// `add_candidate` rejects candidates with this candidate line.
    pub fn reject_candidate(&self, candidate: impl Into<String>) {
        self.state.lock().rejected_candidates.insert(candidate.into());
    }

    /// Pushes an event as if the peer connection had raised it.
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn emit_state(&self, state: PeerConnectionState) {
        self.emit(PeerEvent::ConnectionStateChanged(state));
    }

    pub fn emit_local_candidate(&self, candidate: Candidate) {
        self.emit(PeerEvent::LocalCandidate(candidate));
    }

    /// Data channels created through `create_data_channel`.
    pub fn channel(&self, label: &str) -> Option<Arc<MockDataChannel>> {
        self.state
            .lock()
            .channels
            .iter()
            .find(|channel| channel.label == label)
            .cloned()
    }

    /// Announces a channel opened by the remote side, the way a receiver
    /// learns about the caller's channel.
    pub fn deliver_channel(&self, label: &str) -> Arc<MockDataChannel> {
        let channel = Arc::new(MockDataChannel::new(label));
        self.state.lock().channels.push(Arc::clone(&channel));
        self.emit(PeerEvent::IncomingDataChannel(channel.clone()));
        channel
    }

    /// Marks the channel open and raises the matching event.
    pub fn open_channel(&self, label: &str) -> Option<Arc<MockDataChannel>> {
        let channel = self.channel(label)?;
        channel.set_open(true);
        self.emit(PeerEvent::ChannelOpen {
            label: label.to_string(),
        });
        Some(channel)
    }

    fn record(&self, step: &'static str, call: PeerCall) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        state.calls.push(call);
        if state.negotiation == NegotiationState::Closed && step != "close" {
            return Err(PeerError::Closed);
        }
        match state.failing_steps.get(step) {
            Some(reason) => Err(PeerError::rejected(step, reason.clone())),
            None => Ok(()),
        }
    }

    fn next_description(&self, kind: SdpKind) -> SessionDescription {
        let mut state = self.state.lock();
        state.descriptions += 1;
        SessionDescription {
            kind,
            sdp: format!("v=0 mock-{}-{}", kind.as_str(), state.descriptions),
        }
    }
}

#[async_trait]
impl PeerConnection for MockPeer {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.record("create_offer", PeerCall::CreateOffer)?;
        Ok(self.next_description(SdpKind::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.record("create_answer", PeerCall::CreateAnswer)?;
        if self.state.lock().negotiation != NegotiationState::HaveRemoteOffer {
            return Err(PeerError::rejected("create_answer", "no remote offer"));
        }
        Ok(self.next_description(SdpKind::Answer))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        self.record(
            "set_local_description",
            PeerCall::SetLocalDescription(description.clone()),
        )?;
        let mut state = self.state.lock();
        state.negotiation = match (state.negotiation, description.kind) {
            (NegotiationState::NoLocalOffer | NegotiationState::Stable, SdpKind::Offer) => {
                NegotiationState::HaveLocalOffer
            }
            (NegotiationState::HaveRemoteOffer, SdpKind::Answer) => NegotiationState::Stable,
            (current, kind) => {
                return Err(PeerError::rejected(
                    "set_local_description",
                    format!("{kind} not allowed in {current:?}"),
                ))
            }
        };
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        self.record(
            "set_remote_description",
            PeerCall::SetRemoteDescription(description.clone()),
        )?;
        let mut state = self.state.lock();
        state.negotiation = match (state.negotiation, description.kind) {
            (NegotiationState::NoLocalOffer | NegotiationState::Stable, SdpKind::Offer) => {
                NegotiationState::HaveRemoteOffer
            }
            (NegotiationState::HaveLocalOffer, SdpKind::Answer) => NegotiationState::Stable,
            (current, kind) => {
                return Err(PeerError::rejected(
                    "set_remote_description",
                    format!("{kind} not allowed in {current:?}"),
                ))
            }
        };
        state.remote = Some(description);
        Ok(())
    }

    async fn add_candidate(&self, candidate: Candidate) -> Result<(), PeerError> {
        self.record("add_candidate", PeerCall::AddCandidate(candidate.clone()))?;
        let state = self.state.lock();
        if state.remote.is_none() {
            return Err(PeerError::rejected("add_candidate", "remote description not set"));
        }
        if state.rejected_candidates.contains(&candidate.candidate) {
            return Err(PeerError::rejected("add_candidate", "unusable candidate"));
        }
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, PeerError> {
        self.record(
            "create_data_channel",
            PeerCall::CreateDataChannel(label.to_string()),
        )?;
        let channel = Arc::new(MockDataChannel::new(label));
        self.state.lock().channels.push(Arc::clone(&channel));
        Ok(channel)
    }

    async fn remote_description_is_set(&self) -> bool {
        self.state.lock().remote.is_some()
    }

    fn negotiation_state(&self) -> NegotiationState {
        self.state.lock().negotiation
    }

    fn take_events(&self) -> Option<PeerEventReceiver> {
        self.events_rx.lock().take()
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.record("close", PeerCall::Close)?;
        let channels = {
            let mut state = self.state.lock();
            state.negotiation = NegotiationState::Closed;
            state.channels.clone()
        };
        for channel in channels {
            channel.set_open(false);
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct MockDataChannel {
    label: String,
    open: AtomicBool,
    closed: AtomicBool,
    sent: Mutex<Vec<Payload>>,
}

impl MockDataChannel {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Payload> {
        self.sent.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataChannel for MockDataChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send(&self, payload: Payload) -> Result<(), PeerError> {
        if !self.is_open() {
            return Err(PeerError::Closed);
        }
        self.sent.lock().push(payload);
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.open.store(false, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// One recorded `post_signal` call.
#[derive(Debug, Clone, PartialEq)]
pub struct PostedSignal {
    pub kind: SignalKind,
    pub role: Option<Role>,
    pub payload: Option<Value>,
}

type FetchResult<T> = Result<T, TransportError>;

#[derive(Debug, Default)]
struct Script {
    check: Option<FetchResult<Option<Value>>>,
    offers: VecDeque<FetchResult<Option<SessionDescription>>>,
    answers: VecDeque<FetchResult<Option<SessionDescription>>>,
    candidates: VecDeque<FetchResult<Vec<Candidate>>>,
    post_failures: HashMap<SignalKind, VecDeque<TransportError>>,
    post_delays: HashMap<SignalKind, Duration>,
    posts: Vec<PostedSignal>,
    candidate_roles: Vec<Role>,
}

/// Rendezvous store that replays queued results. An exhausted queue answers
/// "nothing yet".
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    script: Mutex<Script>,
    offer_fetches: AtomicUsize,
    answer_fetches: AtomicUsize,
    candidate_fetches: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport whose role check answers `{"caller": is_caller}`.
    pub fn with_caller(is_caller: bool) -> Self {
        let transport = Self::new();
        transport.set_check(Ok(Some(json!({ "caller": is_caller }))));
        transport
    }

    pub fn set_check(&self, response: FetchResult<Option<Value>>) {
        self.script.lock().check = Some(response);
    }

    pub fn push_offer(&self, offer: Option<SessionDescription>) {
        self.script.lock().offers.push_back(Ok(offer));
    }

    pub fn push_offer_error(&self, err: TransportError) {
        self.script.lock().offers.push_back(Err(err));
    }

    pub fn push_answer(&self, answer: Option<SessionDescription>) {
        self.script.lock().answers.push_back(Ok(answer));
    }

    pub fn push_answer_error(&self, err: TransportError) {
        self.script.lock().answers.push_back(Err(err));
    }

    pub fn push_candidates(&self, candidates: Vec<Candidate>) {
        self.script.lock().candidates.push_back(Ok(candidates));
    }

    pub fn push_candidates_error(&self, err: TransportError) {
        self.script.lock().candidates.push_back(Err(err));
    }

    /// The next post of `kind` fails with `err`.
    pub fn fail_next_post(&self, kind: SignalKind, err: TransportError) {
        self.script
            .lock()
            .post_failures
            .entry(kind)
            .or_default()
            .push_back(err);
    }

    /// Every post of `kind` takes `delay` before it is recorded.
    pub fn delay_posts(&self, kind: SignalKind, delay: Duration) {
        self.script.lock().post_delays.insert(kind, delay);
    }

    pub fn posts(&self) -> Vec<PostedSignal> {
        self.script.lock().posts.clone()
    }

    pub fn posts_of(&self, kind: SignalKind) -> Vec<PostedSignal> {
        self.script
            .lock()
            .posts
            .iter()
            .filter(|post| post.kind == kind)
            .cloned()
            .collect()
    }

    /// Roles passed to `fetch_candidates`, in call order.
    pub fn candidate_fetch_roles(&self) -> Vec<Role> {
        self.script.lock().candidate_roles.clone()
    }

    pub fn fetches(&self, kind: SignalKind) -> usize {
        let counter = match kind {
            SignalKind::Offer => &self.offer_fetches,
            SignalKind::Answer => &self.answer_fetches,
            SignalKind::Candidate => &self.candidate_fetches,
            SignalKind::Check => return 0,
        };
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SignalingTransport for ScriptedTransport {
    async fn post_signal(
        &self,
        kind: SignalKind,
        role: Option<Role>,
        payload: Option<Value>,
    ) -> Result<Option<Value>, TransportError> {
        let delay = self.script.lock().post_delays.get(&kind).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut script = self.script.lock();
        script.posts.push(PostedSignal {
            kind,
            role,
            payload,
        });
        if let Some(err) = script
            .post_failures
            .get_mut(&kind)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }
        match kind {
            SignalKind::Check => script
                .check
                .clone()
                .unwrap_or_else(|| Ok(Some(json!({ "caller": false })))),
            _ => Ok(None),
        }
    }

    async fn fetch_offer(&self) -> Result<Option<SessionDescription>, TransportError> {
        self.offer_fetches.fetch_add(1, Ordering::SeqCst);
        self.script.lock().offers.pop_front().unwrap_or(Ok(None))
    }

    async fn fetch_answer(&self) -> Result<Option<SessionDescription>, TransportError> {
        self.answer_fetches.fetch_add(1, Ordering::SeqCst);
        self.script.lock().answers.pop_front().unwrap_or(Ok(None))
    }

    async fn fetch_candidates(&self, role: Role) -> Result<Vec<Candidate>, TransportError> {
        self.candidate_fetches.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock();
        script.candidate_roles.push(role);
        script.candidates.pop_front().unwrap_or(Ok(Vec::new()))
    }
}
