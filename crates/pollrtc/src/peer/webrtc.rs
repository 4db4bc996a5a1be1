use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;

use super::{
    DataChannel, NegotiationState, PeerConnection, PeerConnectionState, PeerEvent,
    PeerEventReceiver,
};
use crate::error::PeerError;
use crate::signal::{Candidate, Payload, SdpKind, SessionDescription};

const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub ice_servers: Vec<IceServer>,
    /// Ordered, reliable channel unless turned off.
    pub ordered: bool,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer::stun(DEFAULT_STUN_URL)],
            ordered: true,
        }
    }
}

impl PeerConfig {
    /// Host candidates only; no STUN/TURN.
    pub fn localhost() -> Self {
        Self {
            ice_servers: Vec::new(),
            ..Default::default()
        }
    }

    /// `POLLRTC_DISABLE_STUN` drops all ICE servers, `POLLRTC_ICE_SERVERS`
    /// replaces them with a comma separated url list.
    pub fn from_env() -> Self {
        if std::env::var("POLLRTC_DISABLE_STUN").is_ok() {
            return Self::localhost();
        }
        match std::env::var("POLLRTC_ICE_SERVERS") {
            Ok(list) if !list.trim().is_empty() => Self {
                ice_servers: list
                    .split(',')
                    .map(str::trim)
                    .filter(|url| !url.is_empty())
                    .map(IceServer::stun)
                    .collect(),
                ..Default::default()
            },
            _ => Self::default(),
        }
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }
}

fn build_api(setting: SettingEngine) -> Result<API, PeerError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// [`PeerConnection`] backed by the `webrtc` crate.
pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    ordered: bool,
    has_local: AtomicBool,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    events_rx: Mutex<Option<PeerEventReceiver>>,
}

impl WebRtcPeer {
    pub async fn new(config: PeerConfig) -> Result<Self, PeerError> {
        let mut setting = SettingEngine::default();
        setting.set_ice_timeouts(
            Some(Duration::from_secs(3)),
            Some(Duration::from_secs(10)),
            Some(Duration::from_millis(500)),
        );
        let api = build_api(setting)?;

        tracing::trace!(
            target = "pollrtc::peer::webrtc",
            await = "api.new_peer_connection",
            state = "start"
        );
        let pc_result = api.new_peer_connection(config.rtc_configuration()).await;
        tracing::trace!(
            target = "pollrtc::peer::webrtc",
            await = "api.new_peer_connection",
            state = "end",
            ok = pc_result.is_ok()
        );
        let pc = Arc::new(pc_result.map_err(to_setup_error)?);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        register_peer_handlers(&pc, &events_tx);

        Ok(Self {
            pc,
            ordered: config.ordered,
            has_local: AtomicBool::new(false),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        })
    }
}

fn register_peer_handlers(pc: &Arc<RTCPeerConnection>, events: &mpsc::UnboundedSender<PeerEvent>) {
    let tx = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let tx = tx.clone();
        Box::pin(async move {
            tracing::debug!(target = "pollrtc::peer::webrtc", ?state, "peer connection state changed");
            let _ = tx.send(PeerEvent::ConnectionStateChanged(connection_state(state)));
        })
    }));

    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let tx = tx.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                tracing::trace!(target = "pollrtc::peer::webrtc", "candidate gathering complete");
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    let _ = tx.send(PeerEvent::LocalCandidate(candidate_from_init(init)));
                }
                Err(err) => {
                    tracing::warn!(
                        target = "pollrtc::peer::webrtc",
                        error = %err,
                        "failed to serialize local candidate"
                    );
                }
            }
        })
    }));

    let tx = events.clone();
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let tx = tx.clone();
        Box::pin(async move {
            tracing::debug!(
                target = "pollrtc::peer::webrtc",
                label = dc.label(),
                "incoming data channel"
            );
            wire_channel(&dc, &tx);
            let channel: Arc<dyn DataChannel> = Arc::new(WebRtcDataChannel { inner: dc });
            let _ = tx.send(PeerEvent::IncomingDataChannel(channel));
        })
    }));
}

fn wire_channel(dc: &Arc<RTCDataChannel>, events: &mpsc::UnboundedSender<PeerEvent>) {
    let label = dc.label().to_string();

    let tx = events.clone();
    let open_label = label.clone();
    dc.on_open(Box::new(move || {
        let tx = tx.clone();
        let label = open_label.clone();
        Box::pin(async move {
            tracing::debug!(target = "pollrtc::peer::webrtc", %label, "data channel opened");
            let _ = tx.send(PeerEvent::ChannelOpen { label });
        })
    }));

    let tx = events.clone();
    let message_label = label.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let tx = tx.clone();
        let label = message_label.clone();
        Box::pin(async move {
            let payload = if msg.is_string {
                Payload::Text(String::from_utf8_lossy(&msg.data).into_owned())
            } else {
                Payload::Binary(msg.data)
            };
            let _ = tx.send(PeerEvent::ChannelMessage { label, payload });
        })
    }));

    let tx = events.clone();
    let close_label = label.clone();
    dc.on_close(Box::new(move || {
        let tx = tx.clone();
        let label = close_label.clone();
        Box::pin(async move {
            tracing::debug!(target = "pollrtc::peer::webrtc", %label, "data channel closed");
            let _ = tx.send(PeerEvent::ChannelClosed { label });
        })
    }));

    let tx = events.clone();
    dc.on_error(Box::new(move |err| {
        let tx = tx.clone();
        let label = label.clone();
        Box::pin(async move {
            tracing::warn!(target = "pollrtc::peer::webrtc", %label, error = %err, "data channel error");
            let _ = tx.send(PeerEvent::ChannelError {
                label,
                message: err.to_string(),
            });
        })
    }));
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|err| PeerError::rejected("create_offer", err))?;
        Ok(description_from_rtc(&offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|err| PeerError::rejected("create_answer", err))?;
        Ok(description_from_rtc(&answer))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        let rtc = description_to_rtc(&description)?;
        self.pc
            .set_local_description(rtc)
            .await
            .map_err(|err| PeerError::rejected("set_local_description", err))?;
        self.has_local.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        let rtc = description_to_rtc(&description)?;
        self.pc
            .set_remote_description(rtc)
            .await
            .map_err(|err| PeerError::rejected("set_remote_description", err))
    }

    async fn add_candidate(&self, candidate: Candidate) -> Result<(), PeerError> {
        self.pc
            .add_ice_candidate(candidate_to_init(candidate))
            .await
            .map_err(|err| PeerError::rejected("add_candidate", err))
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, PeerError> {
        let init = RTCDataChannelInit {
            ordered: Some(self.ordered),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(|err| PeerError::rejected("create_data_channel", err))?;
        wire_channel(&dc, &self.events_tx);
        Ok(Arc::new(WebRtcDataChannel { inner: dc }))
    }

    async fn remote_description_is_set(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    fn negotiation_state(&self) -> NegotiationState {
        map_signaling_state(self.pc.signaling_state(), self.has_local.load(Ordering::SeqCst))
    }

    fn take_events(&self) -> Option<PeerEventReceiver> {
        self.events_rx.lock().take()
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.pc.close().await.map_err(to_setup_error)
    }
}

struct WebRtcDataChannel {
    inner: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for WebRtcDataChannel {
    fn label(&self) -> String {
        self.inner.label().to_string()
    }

    fn is_open(&self) -> bool {
        self.inner.ready_state() == RTCDataChannelState::Open
    }

    async fn send(&self, payload: Payload) -> Result<(), PeerError> {
        let result = match payload {
            Payload::Text(text) => self.inner.send_text(text).await,
            Payload::Binary(bytes) => self.inner.send(&bytes).await,
        };
        result
            .map(|_| ())
            .map_err(|err| PeerError::rejected("data_channel.send", err))
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.inner.close().await.map_err(to_setup_error)
    }
}

/// A remote pranswer still leaves our offer waiting for its final answer; a
/// local pranswer means we are the answering side.
fn map_signaling_state(state: RTCSignalingState, has_local: bool) -> NegotiationState {
    match state {
        RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveRemotePranswer => {
            NegotiationState::HaveLocalOffer
        }
        RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveLocalPranswer => {
            NegotiationState::HaveRemoteOffer
        }
        RTCSignalingState::Closed => NegotiationState::Closed,
        RTCSignalingState::Stable | RTCSignalingState::Unspecified => {
            if has_local {
                NegotiationState::Stable
            } else {
                NegotiationState::NoLocalOffer
            }
        }
    }
}

fn connection_state(state: RTCPeerConnectionState) -> PeerConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => {
            PeerConnectionState::New
        }
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
    }
}

fn description_from_rtc(desc: &RTCSessionDescription) -> SessionDescription {
    let kind = match desc.sdp_type {
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        RTCSdpType::Offer | RTCSdpType::Unspecified => SdpKind::Offer,
    };
    SessionDescription {
        kind,
        sdp: desc.sdp.clone(),
    }
}

fn description_to_rtc(desc: &SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    let parsed = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp.clone()),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp.clone()),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(desc.sdp.clone()),
        SdpKind::Rollback => {
            return Err(PeerError::rejected(
                "session_description",
                format!("unsupported sdp type {}", desc.kind),
            ));
        }
    };
    parsed.map_err(|err| PeerError::rejected("session_description", err))
}

fn candidate_from_init(init: RTCIceCandidateInit) -> Candidate {
    Candidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn candidate_to_init(candidate: Candidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

fn to_setup_error<E: std::fmt::Display>(err: E) -> PeerError {
    PeerError::Setup(err.to_string())
}
