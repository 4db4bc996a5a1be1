//! Offer/answer negotiation against the peer connection.
//!
//! The negotiator only talks to the peer connection and the rendezvous
//! store. Committing descriptions to the [`Session`](crate::session::Session)
//! record is left to the coordinator, which does it after every step here
//! succeeded.

use std::sync::Arc;

use crate::candidates::{CandidateExchanger, ErrorSink};
use crate::error::{SignalingError, TransportError};
use crate::peer::{DataChannel, NegotiationState, PeerConnection};
use crate::signal::{SessionDescription, SignalKind};
use crate::transport::SignalingTransport;

macro_rules! traced {
    ($step:literal, $fut:expr) => {{
        tracing::trace!(target = "pollrtc::negotiator", await = $step, state = "start");
        let result = $fut.await;
        tracing::trace!(
            target = "pollrtc::negotiator",
            await = $step,
            state = "end",
            ok = result.is_ok()
        );
        result
    }};
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerOutcome {
    Applied,
    /// The peer had no outstanding local offer; the answer was a duplicate or
    /// arrived late.
    Ignored,
}

/// Result of the caller's opening move.
pub struct CallerOpening {
    pub offer: SessionDescription,
    pub channel: Arc<dyn DataChannel>,
}

pub struct SessionNegotiator {
    peer: Arc<dyn PeerConnection>,
    transport: Arc<dyn SignalingTransport>,
    channel_label: String,
}

impl SessionNegotiator {
    pub fn new(
        peer: Arc<dyn PeerConnection>,
        transport: Arc<dyn SignalingTransport>,
        channel_label: impl Into<String>,
    ) -> Self {
        Self {
            peer,
            transport,
            channel_label: channel_label.into(),
        }
    }

    /// Opens the data channel, commits a local offer and publishes it.
    pub async fn act_as_caller(&self) -> Result<CallerOpening, SignalingError> {
        let channel = traced!(
            "create_data_channel",
            self.peer.create_data_channel(&self.channel_label)
        )?;
        let offer = traced!("create_offer", self.peer.create_offer())?;
        traced!(
            "set_local_description",
            self.peer.set_local_description(offer.clone())
        )?;
        self.publish(SignalKind::Offer, &offer).await?;
        tracing::info!(target = "pollrtc::negotiator", "offer published");
        Ok(CallerOpening { offer, channel })
    }

    /// Commits the remote offer, answers it, flushes queued candidates and
    /// publishes the answer. Returns the local answer.
    pub async fn act_as_receiver(
        &self,
        offer: SessionDescription,
        candidates: &mut CandidateExchanger,
        sink: &dyn ErrorSink,
    ) -> Result<SessionDescription, SignalingError> {
        let state = self.peer.negotiation_state();
        let fresh = matches!(
            state,
            NegotiationState::NoLocalOffer | NegotiationState::Stable
        ) && !self.peer.remote_description_is_set().await;
        if !fresh {
            tracing::debug!(
                target = "pollrtc::negotiator",
                ?state,
                "offer arrived after negotiation started; ignoring"
            );
            return Err(SignalingError::StateGuard("offer"));
        }
        traced!(
            "set_remote_description",
            self.peer.set_remote_description(offer)
        )?;
        let answer = traced!("create_answer", self.peer.create_answer())?;
        traced!(
            "set_local_description",
            self.peer.set_local_description(answer.clone())
        )?;
        candidates.flush(self.peer.as_ref(), sink).await;
        self.publish(SignalKind::Answer, &answer).await?;
        tracing::info!(target = "pollrtc::negotiator", "answer published");
        Ok(answer)
    }

    /// Applies a remote answer, but only while our offer is outstanding.
    /// Answer polls can deliver the same answer more than once.
    pub async fn apply_answer(
        &self,
        answer: SessionDescription,
        candidates: &mut CandidateExchanger,
        sink: &dyn ErrorSink,
    ) -> Result<AnswerOutcome, SignalingError> {
        let state = self.peer.negotiation_state();
        if state != NegotiationState::HaveLocalOffer {
            tracing::debug!(
                target = "pollrtc::negotiator",
                ?state,
                "answer ignored; no local offer outstanding"
            );
            return Ok(AnswerOutcome::Ignored);
        }
        traced!(
            "set_remote_description",
            self.peer.set_remote_description(answer)
        )?;
        candidates.flush(self.peer.as_ref(), sink).await;
        tracing::info!(target = "pollrtc::negotiator", "answer applied");
        Ok(AnswerOutcome::Applied)
    }

    async fn publish(
        &self,
        kind: SignalKind,
        description: &SessionDescription,
    ) -> Result<(), SignalingError> {
        let payload = serde_json::to_value(description).map_err(TransportError::from)?;
        traced!(
            "post_signal",
            self.transport.post_signal(kind, None, Some(payload))
        )?;
        Ok(())
    }
}
