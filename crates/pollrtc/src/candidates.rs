//! Candidate exchange.
//!
//! Remote candidates are never applied before a remote description exists;
//! until then they wait in the pending queue in arrival order.

use std::collections::{HashSet, VecDeque};

use crate::error::{SignalingError, TransportError};
use crate::peer::PeerConnection;
use crate::session::Role;
use crate::signal::{Candidate, SignalKind};
use crate::transport::SignalingTransport;

/// Receives failures that are reported but do not abort the caller.
pub trait ErrorSink: Send + Sync {
    fn report(&self, error: SignalingError);
}

impl<F> ErrorSink for F
where
    F: Fn(SignalingError) + Send + Sync,
{
    fn report(&self, error: SignalingError) {
        self(error)
    }
}

/// What happened to one remote candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    Applied,
    Queued,
    Duplicate,
    Rejected,
}

#[derive(Debug, Default)]
pub struct CandidateExchanger {
    pending: VecDeque<Candidate>,
    seen: Option<HashSet<String>>,
}

impl CandidateExchanger {
    pub fn new(dedupe: bool) -> Self {
        Self {
            pending: VecDeque::new(),
            seen: dedupe.then(HashSet::new),
        }
    }

    /// Publishes one locally discovered candidate tagged with `role`.
    pub async fn publish_local(
        transport: &dyn SignalingTransport,
        role: Role,
        candidate: &Candidate,
    ) -> Result<(), SignalingError> {
        if !role.is_resolved() {
            return Err(SignalingError::RoleUnresolved);
        }
        let payload = serde_json::to_value(candidate).map_err(TransportError::from)?;
        tracing::trace!(
            target = "pollrtc::candidates",
            await = "post_signal(candidate)",
            state = "start",
            %role
        );
        let result = transport
            .post_signal(SignalKind::Candidate, Some(role), Some(payload))
            .await;
        tracing::trace!(
            target = "pollrtc::candidates",
            await = "post_signal(candidate)",
            state = "end",
            ok = result.is_ok()
        );
        result?;
        Ok(())
    }

    /// Applies each candidate if the remote description is set, otherwise
    /// queues it. Rejected candidates are reported and skipped.
    pub async fn accept_remote(
        &mut self,
        peer: &dyn PeerConnection,
        candidates: Vec<Candidate>,
        sink: &dyn ErrorSink,
    ) -> Vec<CandidateDisposition> {
        let mut dispositions = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if self.is_duplicate(&candidate) {
                tracing::debug!(
                    target = "pollrtc::candidates",
                    candidate = %candidate.candidate,
                    "dropping duplicate remote candidate"
                );
                dispositions.push(CandidateDisposition::Duplicate);
                continue;
            }
            if peer.remote_description_is_set().await {
                dispositions.push(apply(peer, candidate, sink).await);
            } else {
                tracing::debug!(
                    target = "pollrtc::candidates",
                    queued = self.pending.len() + 1,
                    "remote description not set; queueing candidate"
                );
                self.pending.push_back(candidate);
                dispositions.push(CandidateDisposition::Queued);
            }
        }
        dispositions
    }

    /// Applies every queued candidate in arrival order, then empties the
    /// queue. No-op while the remote description is unset.
    pub async fn flush(&mut self, peer: &dyn PeerConnection, sink: &dyn ErrorSink) -> usize {
        if self.pending.is_empty() || !peer.remote_description_is_set().await {
            return 0;
        }
        let mut applied = 0;
        while let Some(candidate) = self.pending.pop_front() {
            if apply(peer, candidate, sink).await == CandidateDisposition::Applied {
                applied += 1;
            }
        }
        tracing::debug!(target = "pollrtc::candidates", applied, "flushed pending candidates");
        applied
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        if let Some(seen) = self.seen.as_mut() {
            seen.clear();
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn is_duplicate(&mut self, candidate: &Candidate) -> bool {
        match self.seen.as_mut() {
            Some(seen) => !seen.insert(candidate.candidate.clone()),
            None => false,
        }
    }
}

async fn apply(
    peer: &dyn PeerConnection,
    candidate: Candidate,
    sink: &dyn ErrorSink,
) -> CandidateDisposition {
    tracing::trace!(
        target = "pollrtc::candidates",
        await = "add_candidate",
        state = "start"
    );
    let result = peer.add_candidate(candidate).await;
    tracing::trace!(
        target = "pollrtc::candidates",
        await = "add_candidate",
        state = "end",
        ok = result.is_ok()
    );
    match result {
        Ok(()) => CandidateDisposition::Applied,
        Err(err) => {
            tracing::warn!(target = "pollrtc::candidates", error = %err, "remote candidate rejected");
            sink.report(err.into());
            CandidateDisposition::Rejected
        }
    }
}
