//! Peer connection seam.
//!
//! The coordinator never touches a WebRTC stack directly; it drives
//! whatever implements [`PeerConnection`] and listens to the push
//! notifications the implementation hands out once via
//! [`PeerConnection::take_events`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::PeerError;
use crate::signal::{Candidate, Payload, SessionDescription};

pub mod webrtc;

pub use self::webrtc::{PeerConfig, WebRtcPeer};

/// Connectivity state reported by the peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Where the local side stands in the offer/answer exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationState {
    /// Nothing committed yet.
    NoLocalOffer,
    /// Local offer committed, waiting for the remote answer.
    HaveLocalOffer,
    /// Remote offer committed, local answer not yet committed.
    HaveRemoteOffer,
    Stable,
    Closed,
}

pub enum PeerEvent {
    ConnectionStateChanged(PeerConnectionState),
    LocalCandidate(Candidate),
    IncomingDataChannel(Arc<dyn DataChannel>),
    ChannelOpen { label: String },
    ChannelMessage { label: String, payload: Payload },
    ChannelClosed { label: String },
    ChannelError { label: String, message: String },
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEvent::ConnectionStateChanged(state) => {
                f.debug_tuple("ConnectionStateChanged").field(state).finish()
            }
            PeerEvent::LocalCandidate(candidate) => {
                f.debug_tuple("LocalCandidate").field(candidate).finish()
            }
            PeerEvent::IncomingDataChannel(channel) => f
                .debug_tuple("IncomingDataChannel")
                .field(&channel.label())
                .finish(),
            PeerEvent::ChannelOpen { label } => {
                f.debug_struct("ChannelOpen").field("label", label).finish()
            }
            PeerEvent::ChannelMessage { label, payload } => f
                .debug_struct("ChannelMessage")
                .field("label", label)
                .field("len", &payload.len())
                .finish(),
            PeerEvent::ChannelClosed { label } => {
                f.debug_struct("ChannelClosed").field("label", label).finish()
            }
            PeerEvent::ChannelError { label, message } => f
                .debug_struct("ChannelError")
                .field("label", label)
                .field("message", message)
                .finish(),
        }
    }
}

pub type PeerEventReceiver = mpsc::UnboundedReceiver<PeerEvent>;

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;
    async fn set_local_description(&self, description: SessionDescription)
        -> Result<(), PeerError>;
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError>;
    async fn add_candidate(&self, candidate: Candidate) -> Result<(), PeerError>;
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, PeerError>;
    async fn remote_description_is_set(&self) -> bool;
    fn negotiation_state(&self) -> NegotiationState;
    /// Hands out the event stream. Only the first call returns `Some`.
    fn take_events(&self) -> Option<PeerEventReceiver>;
    async fn close(&self) -> Result<(), PeerError>;
}

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;
    fn is_open(&self) -> bool;
    async fn send(&self, payload: Payload) -> Result<(), PeerError>;
    async fn close(&self) -> Result<(), PeerError>;
}
