//! Rendezvous store seam.
//!
//! Both participants reach the store only through request/response calls;
//! nothing is pushed to them. `Ok(None)` / `Ok(vec![])` mean "nothing yet"
//! and are never conflated with a [`TransportError`].

use async_trait::async_trait;
use serde_json::Value;

use crate::error::TransportError;
use crate::session::Role;
use crate::signal::{Candidate, SessionDescription, SignalKind};

pub mod http;
pub mod memory;

pub use http::{HttpSignalingTransport, HttpTransportConfig};
pub use memory::MemoryRendezvous;

#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Publishes one signal. `role` tags candidates with the sender's role.
    async fn post_signal(
        &self,
        kind: SignalKind,
        role: Option<Role>,
        payload: Option<Value>,
    ) -> Result<Option<Value>, TransportError>;

    async fn fetch_offer(&self) -> Result<Option<SessionDescription>, TransportError>;

    async fn fetch_answer(&self) -> Result<Option<SessionDescription>, TransportError>;

    /// Candidates posted by the peer of `role`, each delivered once.
    async fn fetch_candidates(&self, role: Role) -> Result<Vec<Candidate>, TransportError>;
}

/// Path segment used for candidate traffic of a given role.
pub(crate) fn role_tag(role: Role) -> Result<&'static str, TransportError> {
    match role {
        Role::Caller => Ok("true"),
        Role::Receiver => Ok("false"),
        Role::Undetermined => Err(TransportError::Request(
            "candidate exchange requires a resolved role".into(),
        )),
    }
}
