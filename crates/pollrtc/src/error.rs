use thiserror::Error;

/// Failure talking to the rendezvous store.
///
/// Absent data is never an error: fetches return `Ok(None)` / `Ok(vec![])`
/// for that. Everything here is something the store or the network did wrong.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("rendezvous request failed: {0}")]
    Request(String),
    #[error("unexpected rendezvous status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed rendezvous payload: {0}")]
    Malformed(String),
    #[error("rendezvous store unavailable")]
    Unavailable,
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            TransportError::Malformed(err.to_string())
        } else {
            TransportError::Request(err.to_string())
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Malformed(err.to_string())
    }
}

/// Failure reported by the peer connection while negotiating.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PeerError {
    #[error("peer connection rejected {step}: {reason}")]
    Rejected { step: &'static str, reason: String },
    #[error("peer connection closed")]
    Closed,
    #[error("peer connection setup failed: {0}")]
    Setup(String),
}

impl PeerError {
    pub fn rejected(step: &'static str, reason: impl ToString) -> Self {
        PeerError::Rejected {
            step,
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignalingError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("negotiation failed: {0}")]
    Negotiation(#[from] PeerError),
    #[error("ignored out-of-order signal: {0}")]
    StateGuard(&'static str),
    #[error("role already assigned for this session")]
    RoleAlreadyAssigned,
    #[error("role not resolved yet")]
    RoleUnresolved,
    #[error("data channel error: {0}")]
    Channel(String),
    #[error("signaling session closed")]
    Closed,
    #[error("signaling session failed")]
    Failed,
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SignalingError {
    /// Errors a poll tick can swallow and retry on the next tick.
    pub fn is_transient(&self) -> bool {
        matches!(self, SignalingError::Transport(_) | SignalingError::StateGuard(_))
    }
}
