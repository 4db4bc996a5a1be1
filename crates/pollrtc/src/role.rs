//! Role resolution.
//!
//! Runs once per session, before any offer, answer or candidate traffic.
//! There is no retry here: a failure aborts `connect()`.

use async_trait::async_trait;
use serde_json::Value;

use crate::config::RoleStrategy;
use crate::error::{SignalingError, TransportError};
use crate::session::Role;
use crate::signal::{SessionDescription, SignalKind};
use crate::transport::SignalingTransport;

/// Outcome of role resolution. A probing resolver that found an offer hands
/// it over so the receiver does not need to poll for it.
#[derive(Debug, Clone, PartialEq)]
pub struct RoleDecision {
    pub role: Role,
    pub offer: Option<SessionDescription>,
}

impl RoleDecision {
    pub fn caller() -> Self {
        Self {
            role: Role::Caller,
            offer: None,
        }
    }

    pub fn receiver(offer: Option<SessionDescription>) -> Self {
        Self {
            role: Role::Receiver,
            offer,
        }
    }
}

#[async_trait]
pub trait RoleResolver: Send + Sync {
    async fn resolve(
        &self,
        transport: &dyn SignalingTransport,
    ) -> Result<RoleDecision, SignalingError>;
}

/// Asks the rendezvous store whether we are the caller. The store hands the
/// caller role to the first asker, so both sides can never self-assign it.
#[derive(Debug, Default, Clone, Copy)]
pub struct ArbitratedRoleResolver;

#[async_trait]
impl RoleResolver for ArbitratedRoleResolver {
    async fn resolve(
        &self,
        transport: &dyn SignalingTransport,
    ) -> Result<RoleDecision, SignalingError> {
        tracing::trace!(
            target = "pollrtc::role",
            await = "post_signal(check)",
            state = "start"
        );
        let response = transport.post_signal(SignalKind::Check, None, None).await;
        tracing::trace!(
            target = "pollrtc::role",
            await = "post_signal(check)",
            state = "end",
            ok = response.is_ok()
        );
        let response = response?.ok_or_else(|| {
            TransportError::Malformed("role check returned no body".into())
        })?;
        if is_caller(&response)? {
            Ok(RoleDecision::caller())
        } else {
            Ok(RoleDecision::receiver(None))
        }
    }
}

/// Accepts `true`, `"true"` and `1` for the `caller` flag; browser-side
/// stores are not consistent about it.
fn is_caller(response: &Value) -> Result<bool, TransportError> {
    match response.get("caller") {
        Some(Value::Bool(flag)) => Ok(*flag),
        Some(Value::String(text)) => Ok(text.eq_ignore_ascii_case("true")),
        Some(Value::Number(number)) => Ok(number.as_u64() == Some(1)),
        Some(Value::Null) | None => Err(TransportError::Malformed(format!(
            "role check response has no caller flag: {response}"
        ))),
        Some(other) => Err(TransportError::Malformed(format!(
            "unexpected caller flag {other}"
        ))),
    }
}

/// Fetches the offer; if one exists we are the receiver, otherwise the
/// caller.
///
/// Two participants probing inside the same window both see "no offer" and
/// both become caller. That race is accepted and not reconciled; use
/// [`ArbitratedRoleResolver`] when the store supports the check endpoint.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfferProbeRoleResolver;

#[async_trait]
impl RoleResolver for OfferProbeRoleResolver {
    async fn resolve(
        &self,
        transport: &dyn SignalingTransport,
    ) -> Result<RoleDecision, SignalingError> {
        tracing::trace!(
            target = "pollrtc::role",
            await = "fetch_offer",
            state = "start"
        );
        let offer = transport.fetch_offer().await;
        tracing::trace!(
            target = "pollrtc::role",
            await = "fetch_offer",
            state = "end",
            ok = offer.is_ok()
        );
        match offer? {
            Some(offer) => Ok(RoleDecision::receiver(Some(offer))),
            None => Ok(RoleDecision::caller()),
        }
    }
}

pub fn resolver_for(strategy: RoleStrategy) -> Box<dyn RoleResolver> {
    match strategy {
        RoleStrategy::Arbitrated => Box::new(ArbitratedRoleResolver),
        RoleStrategy::OfferProbe => Box::new(OfferProbeRoleResolver),
    }
}
