use std::sync::Arc;
use std::time::Duration;

use pollrtc::mock::{MockPeer, PeerCall, ScriptedTransport};
use pollrtc::{
    Candidate, CoordinatorState, Payload, PeerConnectionState, PeerEvent, PollKind, Role,
    RoleStrategy, SdpKind, SessionDescription, SignalKind, SignalingConfig, SignalingCoordinator,
    SignalingError, SignalingEvent, SignalingEventReceiver, TransportError,
};
use tokio::time::sleep;
use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

const TICK: Duration = Duration::from_millis(1000);

fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

struct Harness {
    peer: Arc<MockPeer>,
    transport: Arc<ScriptedTransport>,
    coordinator: SignalingCoordinator,
    events: SignalingEventReceiver,
}

impl Harness {
    fn new(transport: ScriptedTransport) -> Self {
        Self::with_config(transport, SignalingConfig::default())
    }

    fn with_config(transport: ScriptedTransport, config: SignalingConfig) -> Self {
        init_tracing();
        let peer = Arc::new(MockPeer::new());
        let transport = Arc::new(transport);
        let (coordinator, events) =
            SignalingCoordinator::new(config, peer.clone(), transport.clone())
                .expect("valid config");
        Self {
            peer,
            transport,
            coordinator,
            events,
        }
    }

    fn drain_events(&mut self) -> Vec<SignalingEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            drained.push(event);
        }
        drained
    }

    fn position(&self, predicate: impl Fn(&PeerCall) -> bool) -> Option<usize> {
        self.peer.calls().iter().position(predicate)
    }

    fn added_candidates(&self) -> Vec<String> {
        self.peer
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                PeerCall::AddCandidate(candidate) => Some(candidate.candidate),
                _ => None,
            })
            .collect()
    }
}

fn errors(events: &[SignalingEvent]) -> Vec<&SignalingError> {
    events
        .iter()
        .filter_map(|event| match event {
            SignalingEvent::Error(err) => Some(err),
            _ => None,
        })
        .collect()
}

async fn ticks(count: u32) {
    sleep(TICK * count + TICK / 2).await;
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn receiver_answers_offer_from_first_poll_tick() {
    let transport = ScriptedTransport::with_caller(false);
    let offer = SessionDescription::offer("v=0 remote-offer");
    transport.push_offer(Some(offer.clone()));
    let mut harness = Harness::new(transport);

    harness.coordinator.connect().await.expect("connect");
    assert_eq!(harness.coordinator.role(), Role::Receiver);
    assert!(harness.coordinator.is_polling(PollKind::Offer));

    ticks(1).await;

    let remote = harness
        .position(|call| *call == PeerCall::SetRemoteDescription(offer.clone()))
        .expect("offer applied");
    let local = harness
        .position(|call| {
            matches!(call, PeerCall::SetLocalDescription(desc) if desc.kind == SdpKind::Answer)
        })
        .expect("answer committed");
    assert!(remote < local);
    assert_eq!(harness.transport.posts_of(SignalKind::Answer).len(), 1);
    assert!(!harness.coordinator.is_polling(PollKind::Offer));
    assert_eq!(harness.coordinator.state(), CoordinatorState::CandidateExchange);

    ticks(3).await;
    assert_eq!(harness.transport.fetches(SignalKind::Offer), 1);
    assert_eq!(harness.transport.posts_of(SignalKind::Answer).len(), 1);
    assert!(errors(&harness.drain_events()).is_empty());
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn caller_applies_answer_once_then_stops_polling() {
    let transport = ScriptedTransport::with_caller(true);
    transport.push_answer(None);
    transport.push_answer(None);
    transport.push_answer(Some(SessionDescription::answer("v=0 remote-answer")));
    let harness = Harness::new(transport);

    harness.coordinator.connect().await.expect("connect");
    assert_eq!(harness.coordinator.role(), Role::Caller);
    assert_eq!(harness.transport.posts_of(SignalKind::Offer).len(), 1);
    assert!(harness.coordinator.is_polling(PollKind::Answer));

    ticks(2).await;
    assert_eq!(harness.transport.fetches(SignalKind::Answer), 2);
    assert_eq!(
        harness
            .peer
            .count(|call| matches!(call, PeerCall::SetRemoteDescription(_))),
        0
    );

    ticks(1).await;
    assert_eq!(
        harness
            .peer
            .count(|call| matches!(call, PeerCall::SetRemoteDescription(_))),
        1
    );
    assert!(!harness.coordinator.is_polling(PollKind::Answer));
    assert_eq!(harness.coordinator.state(), CoordinatorState::CandidateExchange);

    ticks(3).await;
    assert_eq!(harness.transport.fetches(SignalKind::Answer), 3);
    assert_eq!(harness.transport.posts_of(SignalKind::Offer).len(), 1);
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn queued_candidates_apply_before_newly_polled_ones() {
    let transport = ScriptedTransport::with_caller(true);
    transport.push_answer(None);
    transport.push_answer(Some(SessionDescription::answer("v=0 remote-answer")));
    transport.push_candidates(vec![Candidate::new("candidate:early")]);
    transport.push_candidates(vec![]);
    transport.push_candidates(vec![Candidate::new("candidate:late")]);
    let harness = Harness::new(transport);

    harness.coordinator.connect().await.expect("connect");

    ticks(1).await;
    assert_eq!(harness.coordinator.pending_candidates().await, 1);
    assert!(harness.added_candidates().is_empty());

    ticks(2).await;
    assert_eq!(harness.coordinator.pending_candidates().await, 0);
    assert_eq!(
        harness.added_candidates(),
        vec!["candidate:early", "candidate:late"]
    );
    let remote = harness
        .position(|call| matches!(call, PeerCall::SetRemoteDescription(_)))
        .expect("answer applied");
    let first_added = harness
        .position(|call| matches!(call, PeerCall::AddCandidate(_)))
        .expect("candidate applied");
    assert!(remote < first_added);
    assert!(harness
        .transport
        .candidate_fetch_roles()
        .iter()
        .all(|role| *role == Role::Caller));
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn candidate_poll_survives_transport_error() {
    let transport = ScriptedTransport::with_caller(false);
    transport.push_offer(Some(SessionDescription::offer("v=0 remote-offer")));
    transport.push_candidates_error(TransportError::Request("connection reset".into()));
    transport.push_candidates(vec![Candidate::new("candidate:after-hiccup")]);
    let mut harness = Harness::new(transport);

    harness.coordinator.connect().await.expect("connect");
    ticks(1).await;
    assert!(harness.coordinator.is_polling(PollKind::Candidates));

    ticks(1).await;
    assert!(harness.coordinator.is_polling(PollKind::Candidates));
    assert_eq!(harness.added_candidates(), vec!["candidate:after-hiccup"]);
    assert!(harness.transport.fetches(SignalKind::Candidate) >= 2);

    let events = harness.drain_events();
    let reported = errors(&events);
    assert_eq!(reported.len(), 1);
    assert!(matches!(
        reported[0],
        SignalingError::Transport(TransportError::Request(_))
    ));
    assert_ne!(harness.coordinator.state(), CoordinatorState::Failed);
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn send_before_open_is_a_silent_no_op() {
    let mut harness = Harness::new(ScriptedTransport::with_caller(true));

    assert!(!harness.coordinator.send("hello").await);
    assert!(harness.transport.posts().is_empty());
    assert!(harness.drain_events().is_empty());

    harness.coordinator.connect().await.expect("connect");
    let posts_before = harness.transport.posts().len();
    assert!(!harness.coordinator.send("hello").await);
    assert_eq!(harness.transport.posts().len(), posts_before);
    let channel = harness.peer.channel("chat").expect("caller channel");
    assert!(channel.sent().is_empty());
    assert!(errors(&harness.drain_events()).is_empty());
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn close_cancels_every_poll_for_good() {
    let transport = ScriptedTransport::with_caller(true);
    let mut harness = Harness::new(transport);
    harness.coordinator.connect().await.expect("connect");
    ticks(1).await;
    assert!(harness.coordinator.is_polling(PollKind::Answer));
    assert!(harness.coordinator.is_polling(PollKind::Candidates));

    harness.coordinator.close().await;
    harness.coordinator.close().await;

    for kind in [PollKind::Offer, PollKind::Answer, PollKind::Candidates] {
        assert!(!harness.coordinator.is_polling(kind), "{kind} still polling");
    }
    assert_eq!(harness.coordinator.state(), CoordinatorState::Closed);
    let answer_fetches = harness.transport.fetches(SignalKind::Answer);
    let candidate_fetches = harness.transport.fetches(SignalKind::Candidate);

    ticks(5).await;
    assert_eq!(harness.transport.fetches(SignalKind::Answer), answer_fetches);
    assert_eq!(
        harness.transport.fetches(SignalKind::Candidate),
        candidate_fetches
    );
    assert_eq!(
        harness.coordinator.connect().await,
        Err(SignalingError::Closed)
    );
    assert!(!harness.coordinator.is_polling(PollKind::Answer));

    let events = harness.drain_events();
    let closed_transitions = events
        .iter()
        .filter(|event| **event == SignalingEvent::StateChanged(CoordinatorState::Closed))
        .count();
    assert_eq!(closed_transitions, 1);
    assert_eq!(
        events
            .iter()
            .filter(|event| **event == SignalingEvent::Close)
            .count(),
        1
    );
    assert_eq!(harness.peer.count(|call| *call == PeerCall::Close), 1);
    assert!(harness.peer.channel("chat").expect("channel").is_closed());
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn close_is_safe_from_idle_and_failed() {
    let idle = Harness::new(ScriptedTransport::with_caller(true));
    idle.coordinator.close().await;
    assert_eq!(idle.coordinator.state(), CoordinatorState::Closed);

    let transport = ScriptedTransport::new();
    transport.set_check(Err(TransportError::Unavailable));
    let failed = Harness::new(transport);
    assert!(failed.coordinator.connect().await.is_err());
    assert_eq!(failed.coordinator.state(), CoordinatorState::Failed);
    failed.coordinator.close().await;
    assert_eq!(failed.coordinator.state(), CoordinatorState::Closed);
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn role_is_resolved_once_per_session() {
    let harness = Harness::new(ScriptedTransport::with_caller(true));
    harness.coordinator.connect().await.expect("first connect");
    harness.coordinator.connect().await.expect("second connect");

    assert_eq!(harness.coordinator.role(), Role::Caller);
    assert_eq!(harness.transport.posts_of(SignalKind::Check).len(), 1);
    assert_eq!(harness.transport.posts_of(SignalKind::Offer).len(), 1);
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn role_check_failure_fails_the_session() {
    let transport = ScriptedTransport::new();
    transport.set_check(Err(TransportError::Status {
        status: 503,
        body: "busy".into(),
    }));
    let mut harness = Harness::new(transport);

    let err = harness.coordinator.connect().await.expect_err("check fails");
    assert!(matches!(
        err,
        SignalingError::Transport(TransportError::Status { status: 503, .. })
    ));
    assert_eq!(harness.coordinator.state(), CoordinatorState::Failed);
    assert_eq!(harness.coordinator.role(), Role::Undetermined);
    assert!(harness.peer.calls().is_empty());

    let events = harness.drain_events();
    assert_eq!(errors(&events), vec![&err]);
    assert!(events.contains(&SignalingEvent::StateChanged(CoordinatorState::Failed)));

    assert_eq!(
        harness.coordinator.connect().await,
        Err(SignalingError::Failed)
    );
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn rejected_offer_from_poll_fails_the_session() {
    let transport = ScriptedTransport::with_caller(false);
    transport.push_offer(Some(SessionDescription::offer("v=0 remote-offer")));
    let mut harness = Harness::new(transport);
    harness.peer.fail_step("set_remote_description", "bad sdp");

    harness.coordinator.connect().await.expect("connect");
    ticks(1).await;

    assert_eq!(harness.coordinator.state(), CoordinatorState::Failed);
    assert!(harness.transport.posts_of(SignalKind::Answer).is_empty());
    assert!(!harness.coordinator.is_polling(PollKind::Candidates));
    let events = harness.drain_events();
    assert!(matches!(
        errors(&events).as_slice(),
        [SignalingError::Negotiation(_)]
    ));
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn offer_probe_answers_without_polling() {
    let transport = ScriptedTransport::new();
    transport.push_offer(Some(SessionDescription::offer("v=0 remote-offer")));
    let config = SignalingConfig::default().with_role_strategy(RoleStrategy::OfferProbe);
    let harness = Harness::with_config(transport, config);

    harness.coordinator.connect().await.expect("connect");

    assert_eq!(harness.coordinator.role(), Role::Receiver);
    assert!(harness.transport.posts_of(SignalKind::Check).is_empty());
    assert_eq!(harness.transport.posts_of(SignalKind::Answer).len(), 1);
    assert!(!harness.coordinator.is_polling(PollKind::Offer));
    assert!(harness.coordinator.is_polling(PollKind::Candidates));
    assert_eq!(harness.coordinator.state(), CoordinatorState::CandidateExchange);
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn connected_peer_stops_candidate_poll() {
    let transport = ScriptedTransport::with_caller(true);
    transport.push_answer(Some(SessionDescription::answer("v=0 remote-answer")));
    let mut harness = Harness::new(transport);
    harness.coordinator.connect().await.expect("connect");
    ticks(1).await;
    assert!(harness.coordinator.is_polling(PollKind::Candidates));

    harness.peer.emit_state(PeerConnectionState::Connected);
    sleep(Duration::from_millis(10)).await;

    assert!(!harness.coordinator.is_polling(PollKind::Candidates));
    assert_eq!(harness.coordinator.state(), CoordinatorState::Connected);
    let fetches = harness.transport.fetches(SignalKind::Candidate);
    ticks(3).await;
    assert_eq!(harness.transport.fetches(SignalKind::Candidate), fetches);
    assert!(harness
        .drain_events()
        .contains(&SignalingEvent::StateChanged(CoordinatorState::Connected)));
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn connected_during_answer_post_keeps_candidate_poll_off() {
    let transport = ScriptedTransport::new();
    transport.push_offer(Some(SessionDescription::offer("v=0 remote-offer")));
    transport.delay_posts(SignalKind::Answer, Duration::from_millis(500));
    let config = SignalingConfig::default().with_role_strategy(RoleStrategy::OfferProbe);
    let harness = Harness::with_config(transport, config);

    let peer = Arc::clone(&harness.peer);
    tokio::spawn(async move {
        sleep(Duration::from_millis(200)).await;
        peer.emit_state(PeerConnectionState::Connected);
    });
    harness.coordinator.connect().await.expect("connect");
    sleep(Duration::from_millis(10)).await;

    assert_eq!(harness.transport.posts_of(SignalKind::Answer).len(), 1);
    assert_eq!(harness.coordinator.state(), CoordinatorState::Connected);
    assert!(!harness.coordinator.is_polling(PollKind::Candidates));
    ticks(5).await;
    assert_eq!(harness.transport.fetches(SignalKind::Candidate), 0);
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn zero_poll_interval_is_rejected_at_construction() {
    let peer = Arc::new(MockPeer::new());
    let transport = Arc::new(ScriptedTransport::with_caller(true));
    let config = SignalingConfig::default().with_poll_interval(Duration::ZERO);

    let err = SignalingCoordinator::new(config, peer.clone(), transport.clone())
        .err()
        .expect("zero interval rejected");

    assert!(matches!(err, SignalingError::Config(_)));
    assert!(transport.posts().is_empty());
    assert!(peer.calls().is_empty());
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn local_candidates_are_published_in_order_with_role_tag() {
    let harness = Harness::new(ScriptedTransport::with_caller(true));
    harness
        .peer
        .emit_local_candidate(Candidate::new("candidate:1").with_mid("0", 0));
    harness
        .peer
        .emit_local_candidate(Candidate::new("candidate:2").with_mid("0", 0));
    sleep(Duration::from_millis(10)).await;
    assert!(harness.transport.posts_of(SignalKind::Candidate).is_empty());

    harness.coordinator.connect().await.expect("connect");
    sleep(Duration::from_millis(10)).await;

    let posted = harness.transport.posts_of(SignalKind::Candidate);
    let lines: Vec<String> = posted
        .iter()
        .map(|post| {
            post.payload.as_ref().expect("payload")["candidate"]
                .as_str()
                .expect("candidate line")
                .to_string()
        })
        .collect();
    assert_eq!(lines, vec!["candidate:1", "candidate:2"]);
    assert!(posted.iter().all(|post| post.role == Some(Role::Caller)));
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn candidate_publish_failure_is_reported_not_fatal() {
    let transport = ScriptedTransport::with_caller(true);
    transport.fail_next_post(SignalKind::Candidate, TransportError::Unavailable);
    let mut harness = Harness::new(transport);
    harness.coordinator.connect().await.expect("connect");

    harness.peer.emit_local_candidate(Candidate::new("candidate:lost"));
    harness.peer.emit_local_candidate(Candidate::new("candidate:kept"));
    sleep(Duration::from_millis(10)).await;

    assert_eq!(harness.transport.posts_of(SignalKind::Candidate).len(), 2);
    let events = harness.drain_events();
    assert_eq!(
        errors(&events),
        vec![&SignalingError::Transport(TransportError::Unavailable)]
    );
    assert_eq!(harness.coordinator.state(), CoordinatorState::Negotiating);
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn caller_channel_events_reach_the_owner() {
    let mut harness = Harness::new(ScriptedTransport::with_caller(true));
    harness.coordinator.connect().await.expect("connect");

    let channel = harness.peer.open_channel("chat").expect("caller channel");
    sleep(Duration::from_millis(10)).await;
    assert!(harness.coordinator.send("hello").await);
    assert_eq!(channel.sent(), vec![Payload::Text("hello".into())]);

    harness.peer.emit(PeerEvent::ChannelMessage {
        label: "chat".into(),
        payload: Payload::from("hi back"),
    });
    harness.peer.emit(PeerEvent::ChannelClosed {
        label: "chat".into(),
    });
    sleep(Duration::from_millis(10)).await;
    harness.coordinator.close().await;

    let events: Vec<SignalingEvent> = harness
        .drain_events()
        .into_iter()
        .filter(|event| !matches!(event, SignalingEvent::StateChanged(_)))
        .collect();
    assert_eq!(
        events,
        vec![
            SignalingEvent::Open,
            SignalingEvent::Message(Payload::Text("hi back".into())),
            SignalingEvent::Close,
        ]
    );
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn receiver_adopts_incoming_channel() {
    let transport = ScriptedTransport::with_caller(false);
    transport.push_offer(Some(SessionDescription::offer("v=0 remote-offer")));
    let mut harness = Harness::new(transport);
    harness.coordinator.connect().await.expect("connect");
    ticks(1).await;

    let channel = harness.peer.deliver_channel("chat");
    sleep(Duration::from_millis(10)).await;
    assert!(!harness.coordinator.send("too early").await);

    harness.peer.open_channel("chat").expect("delivered channel");
    sleep(Duration::from_millis(10)).await;
    assert!(harness.coordinator.send(vec![1u8, 2, 3]).await);
    assert_eq!(channel.sent(), vec![Payload::from(vec![1u8, 2, 3])]);
    assert!(harness.drain_events().contains(&SignalingEvent::Open));
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn dedupe_drops_redelivered_candidates() {
    let transport = ScriptedTransport::with_caller(false);
    transport.push_offer(Some(SessionDescription::offer("v=0 remote-offer")));
    transport.push_candidates(vec![Candidate::new("candidate:1")]);
    transport.push_candidates(vec![Candidate::new("candidate:1"), Candidate::new("candidate:2")]);
    let config = SignalingConfig::default().with_dedupe_candidates(true);
    let harness = Harness::with_config(transport, config);

    harness.coordinator.connect().await.expect("connect");
    ticks(2).await;

    assert_eq!(harness.added_candidates(), vec!["candidate:1", "candidate:2"]);
}
