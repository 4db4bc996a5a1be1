//! Two-party WebRTC session signaling over a poll-based rendezvous store.
//!
//! Two participants that cannot reach each other yet meet at a shared
//! request/response store. One becomes the caller and publishes an offer,
//! the other answers, and both trade connectivity candidates until the peer
//! connection reports itself connected. Nothing is pushed by the store:
//! everything arrives through fixed-interval polls.
//!
//! ```no_run
//! use std::sync::Arc;
//! use pollrtc::{
//!     HttpSignalingTransport, HttpTransportConfig, PeerConfig, SignalingConfig,
//!     SignalingCoordinator, SignalingEvent, WebRtcPeer,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SignalingConfig::new("http://127.0.0.1:8080");
//! let transport = HttpSignalingTransport::new(HttpTransportConfig::new(&config.base_url))?;
//! let peer = WebRtcPeer::new(PeerConfig::default()).await?;
//! let (coordinator, mut events) =
//!     SignalingCoordinator::new(config, Arc::new(peer), Arc::new(transport))?;
//! coordinator.connect().await?;
//! while let Some(event) = events.recv().await {
//!     if event == SignalingEvent::Open {
//!         coordinator.send("hello").await;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod candidates;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod mock;
pub mod negotiator;
pub mod peer;
pub mod poll;
pub mod role;
pub mod session;
pub mod signal;
pub mod transport;

pub use candidates::{CandidateDisposition, CandidateExchanger, ErrorSink};
pub use config::{RoleStrategy, SignalingConfig, DEFAULT_CHANNEL_LABEL, DEFAULT_POLL_INTERVAL};
pub use coordinator::{SignalingCoordinator, SignalingEvent, SignalingEventReceiver};
pub use error::{PeerError, SignalingError, TransportError};
pub use negotiator::{AnswerOutcome, SessionNegotiator};
pub use peer::{
    DataChannel, NegotiationState, PeerConfig, PeerConnection, PeerConnectionState, PeerEvent,
    WebRtcPeer,
};
pub use poll::{PollKind, PollScheduler, TickOutcome};
pub use role::{ArbitratedRoleResolver, OfferProbeRoleResolver, RoleDecision, RoleResolver};
pub use session::{CoordinatorState, Role, Session};
pub use signal::{Candidate, Payload, SdpKind, SessionDescription, SignalKind};
pub use transport::{
    HttpSignalingTransport, HttpTransportConfig, MemoryRendezvous, SignalingTransport,
};
