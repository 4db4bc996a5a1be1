use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use super::SignalingTransport;
use crate::error::TransportError;
use crate::session::Role;
use crate::signal::{Candidate, SessionDescription, SignalKind};

#[derive(Debug, Default)]
struct Store {
    caller_claimed: bool,
    offer: Option<SessionDescription>,
    answer: Option<SessionDescription>,
    caller_candidates: Vec<Candidate>,
    receiver_candidates: Vec<Candidate>,
}

/// Process-local rendezvous store. Clones share the same state, so each
/// participant can hold its own handle.
///
/// The first `check` claims the caller role, offer and answer are sticky
/// (every fetch returns the latest one) and candidates are handed to the
/// opposite role exactly once.
#[derive(Debug, Clone, Default)]
pub struct MemoryRendezvous {
    store: Arc<Mutex<Store>>,
}

impl MemoryRendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` for the first claimant only.
    pub fn claim_caller(&self) -> bool {
        let mut store = self.store.lock();
        let granted = !store.caller_claimed;
        store.caller_claimed = true;
        granted
    }

    pub fn store_offer(&self, offer: SessionDescription) {
        self.store.lock().offer = Some(offer);
    }

    pub fn store_answer(&self, answer: SessionDescription) {
        self.store.lock().answer = Some(answer);
    }

    pub fn offer(&self) -> Option<SessionDescription> {
        self.store.lock().offer.clone()
    }

    pub fn answer(&self) -> Option<SessionDescription> {
        self.store.lock().answer.clone()
    }

    /// Queues a candidate posted by `from`.
    pub fn push_candidate(&self, from: Role, candidate: Candidate) -> Result<(), TransportError> {
        let mut store = self.store.lock();
        match from {
            Role::Caller => store.caller_candidates.push(candidate),
            Role::Receiver => store.receiver_candidates.push(candidate),
            Role::Undetermined => {
                return Err(TransportError::Request(
                    "candidate posted without a role tag".into(),
                ))
            }
        }
        Ok(())
    }

    /// Drains the candidates destined for `requester`, i.e. those posted by
    /// the opposite role.
    pub fn take_candidates_for(&self, requester: Role) -> Result<Vec<Candidate>, TransportError> {
        let mut store = self.store.lock();
        match requester {
            Role::Caller => Ok(std::mem::take(&mut store.receiver_candidates)),
            Role::Receiver => Ok(std::mem::take(&mut store.caller_candidates)),
            Role::Undetermined => Err(TransportError::Request(
                "candidate fetch without a role tag".into(),
            )),
        }
    }

    pub fn reset(&self) {
        *self.store.lock() = Store::default();
    }
}

fn parse<T: serde::de::DeserializeOwned>(
    kind: SignalKind,
    payload: Option<Value>,
) -> Result<T, TransportError> {
    let payload = payload.ok_or_else(|| {
        TransportError::Malformed(format!("{} signal without payload", kind.as_str()))
    })?;
    Ok(serde_json::from_value(payload)?)
}

#[async_trait]
impl SignalingTransport for MemoryRendezvous {
    async fn post_signal(
        &self,
        kind: SignalKind,
        role: Option<Role>,
        payload: Option<Value>,
    ) -> Result<Option<Value>, TransportError> {
        match kind {
            SignalKind::Check => Ok(Some(json!({ "caller": self.claim_caller() }))),
            SignalKind::Offer => {
                self.store_offer(parse(kind, payload)?);
                Ok(None)
            }
            SignalKind::Answer => {
                self.store_answer(parse(kind, payload)?);
                Ok(None)
            }
            SignalKind::Candidate => {
                let role = role.unwrap_or_default();
                self.push_candidate(role, parse(kind, payload)?)?;
                Ok(None)
            }
        }
    }

    async fn fetch_offer(&self) -> Result<Option<SessionDescription>, TransportError> {
        Ok(self.offer())
    }

    async fn fetch_answer(&self) -> Result<Option<SessionDescription>, TransportError> {
        Ok(self.answer())
    }

    async fn fetch_candidates(&self, role: Role) -> Result<Vec<Candidate>, TransportError> {
        self.take_candidates_for(role)
    }
}
