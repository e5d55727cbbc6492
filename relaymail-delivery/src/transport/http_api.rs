use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::Transport;
use crate::{
    config::TransportDescriptor,
    error::TransportError,
    request::{Envelope, SendReceipt},
};

#[derive(Serialize)]
struct ApiPayload<'a> {
    from: &'a str,
    to: &'a [String],
    subject: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    html: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
}

#[derive(Deserialize)]
struct ApiReply {
    id: Option<String>,
}

/// Submits the message as JSON to an external delivery API with bearer auth.
#[derive(Debug, Clone)]
pub struct HttpApiTransport {
    descriptor: TransportDescriptor,
    client: reqwest::Client,
}

impl HttpApiTransport {
    /// `timeout` bounds the whole request; connecting is bounded separately by
    /// `connect_timeout`.
    pub fn new(
        descriptor: TransportDescriptor,
        connect_timeout: Duration,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        if descriptor.api_key.is_none() {
            return Err(TransportError::Configuration(
                "HTTP API transport requires an API key".to_string(),
            ));
        }

        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(timeout)
            .build()?;

        Ok(Self { descriptor, client })
    }

    fn api_key(&self) -> Result<&SecretString, TransportError> {
        self.descriptor.api_key.as_ref().ok_or_else(|| {
            TransportError::Configuration("HTTP API transport requires an API key".to_string())
        })
    }
}

#[async_trait]
impl Transport for HttpApiTransport {
    fn descriptor(&self) -> &TransportDescriptor {
        &self.descriptor
    }

    async fn attempt_send(&self, envelope: &Envelope) -> Result<SendReceipt, TransportError> {
        let from = envelope
            .from_header
            .as_deref()
            .or(envelope.sender.as_deref())
            .ok_or_else(|| TransportError::Configuration("no sender configured".to_string()))?;

        let payload = ApiPayload {
            from,
            to: &envelope.recipients,
            subject: &envelope.subject,
            html: envelope.html.as_deref(),
            text: envelope.text.as_deref(),
        };

        let response = self
            .client
            .post(&self.descriptor.host)
            .bearer_auth(self.api_key()?.expose_secret())
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(TransportError::ApiRejected {
                status: status.as_u16(),
                body,
            });
        }

        let provider_message_id = serde_json::from_str::<ApiReply>(&body)
            .ok()
            .and_then(|reply| reply.id);

        Ok(SendReceipt {
            provider_message_id,
            raw_provider_response: Some(body),
        })
    }
}
