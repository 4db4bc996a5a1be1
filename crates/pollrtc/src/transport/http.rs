use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use url::Url;

use super::{role_tag, SignalingTransport};
use crate::error::{SignalingError, TransportError};
use crate::session::Role;
use crate::signal::{Candidate, SessionDescription, SignalKind};

#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    pub base_url: String,
    /// Treat non-success statuses as "no data" instead of an error.
    pub lenient_status: bool,
    /// Per-request timeout enforced by the HTTP client. `None` leaves it to
    /// the platform.
    pub request_timeout: Option<Duration>,
}

impl HttpTransportConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            lenient_status: false,
            request_timeout: None,
        }
    }

    pub fn lenient(mut self, lenient: bool) -> Self {
        self.lenient_status = lenient;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }
}

/// Talks to a rendezvous store laid out as `{base}/signal/...`.
#[derive(Debug, Clone)]
pub struct HttpSignalingTransport {
    client: Client,
    base: Url,
    lenient_status: bool,
}

impl HttpSignalingTransport {
    pub fn new(config: HttpTransportConfig) -> Result<Self, SignalingError> {
        let base = Url::parse(config.base_url.trim_end_matches('/')).map_err(|err| {
            SignalingError::Config(format!("invalid base url {}: {err}", config.base_url))
        })?;
        if base.cannot_be_a_base() {
            return Err(SignalingError::Config(format!(
                "base url {} cannot carry a path",
                config.base_url
            )));
        }
        let mut builder = Client::builder();
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|err| SignalingError::Config(format!("http client: {err}")))?;
        Ok(Self {
            client,
            base,
            lenient_status: config.lenient_status,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, kind: SignalKind, role: Option<Role>) -> Result<Url, TransportError> {
        let mut url = self.base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| TransportError::Request("cannot extend rendezvous url".into()))?;
            segments.pop_if_empty();
            segments.push("signal");
            segments.push(kind.as_str());
            if kind == SignalKind::Candidate {
                let role = role.ok_or_else(|| {
                    TransportError::Request("candidate traffic needs a role tag".into())
                })?;
                segments.push(role_tag(role)?);
            }
        }
        Ok(url)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        kind: SignalKind,
        role: Option<Role>,
    ) -> Result<Option<T>, TransportError> {
        let url = self.endpoint(kind, role)?;
        tracing::trace!(
            target = "pollrtc::transport::http",
            phase = "get",
            kind = kind.as_str(),
            await = "client.send",
            state = "start"
        );
        let send_attempt = self.client.get(url).send().await;
        tracing::trace!(
            target = "pollrtc::transport::http",
            phase = "get",
            kind = kind.as_str(),
            await = "client.send",
            state = "end",
            result = ?send_attempt.as_ref().map(Response::status)
        );
        let response = send_attempt?;
        match response.status() {
            StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let body = response.bytes().await?;
                if body.iter().all(u8::is_ascii_whitespace) {
                    return Ok(None);
                }
                let value: Value = serde_json::from_slice(&body)?;
                if value.is_null() {
                    return Ok(None);
                }
                Ok(Some(serde_json::from_value(value)?))
            }
            status => self.unexpected_status(kind, status, response).await,
        }
    }

    async fn unexpected_status<T>(
        &self,
        kind: SignalKind,
        status: StatusCode,
        response: Response,
    ) -> Result<Option<T>, TransportError> {
        if self.lenient_status {
            tracing::debug!(
                target = "pollrtc::transport::http",
                kind = kind.as_str(),
                %status,
                "treating status as absent"
            );
            return Ok(None);
        }
        let body = response.text().await.unwrap_or_default();
        Err(TransportError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl SignalingTransport for HttpSignalingTransport {
    async fn post_signal(
        &self,
        kind: SignalKind,
        role: Option<Role>,
        payload: Option<Value>,
    ) -> Result<Option<Value>, TransportError> {
        let url = self.endpoint(kind, role)?;
        let mut request = self.client.post(url);
        if let Some(payload) = payload.as_ref() {
            request = request.json(payload);
        }
        tracing::trace!(
            target = "pollrtc::transport::http",
            phase = "post",
            kind = kind.as_str(),
            await = "client.send",
            state = "start"
        );
        let send_attempt = request.send().await;
        tracing::trace!(
            target = "pollrtc::transport::http",
            phase = "post",
            kind = kind.as_str(),
            await = "client.send",
            state = "end",
            result = ?send_attempt.as_ref().map(Response::status)
        );
        let response = send_attempt?;
        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if !status.is_success() {
            return self.unexpected_status(kind, status, response).await;
        }
        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.contains("application/json"));
        if !is_json {
            return Ok(None);
        }
        Ok(Some(response.json::<Value>().await?))
    }

    async fn fetch_offer(&self) -> Result<Option<SessionDescription>, TransportError> {
        self.get(SignalKind::Offer, None).await
    }

    async fn fetch_answer(&self) -> Result<Option<SessionDescription>, TransportError> {
        self.get(SignalKind::Answer, None).await
    }

    async fn fetch_candidates(&self, role: Role) -> Result<Vec<Candidate>, TransportError> {
        Ok(self
            .get::<Vec<Candidate>>(SignalKind::Candidate, Some(role))
            .await?
            .unwrap_or_default())
    }
}
