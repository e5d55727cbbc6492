use async_trait::async_trait;
use relaymail_common::config::{ClientTimeouts, TlsCertificatePolicy};
use relaymail_smtp::{Response, SessionConfig, SmtpSession};

use super::Transport;
use crate::{
    config::TransportDescriptor,
    error::TransportError,
    message::{self, AssembledMessage},
    request::{Envelope, SendReceipt},
};

/// Delivers over SMTP with the TLS policy and credentials of its descriptor.
#[derive(Debug, Clone)]
pub struct SmtpTransport {
    descriptor: TransportDescriptor,
    helo_name: String,
    timeouts: ClientTimeouts,
    certificates: TlsCertificatePolicy,
}

impl SmtpTransport {
    #[must_use]
    pub fn new(
        descriptor: TransportDescriptor,
        helo_name: impl Into<String>,
        timeouts: ClientTimeouts,
        certificates: TlsCertificatePolicy,
    ) -> Self {
        Self {
            descriptor,
            helo_name: helo_name.into(),
            timeouts,
            certificates,
        }
    }

    fn session(&self) -> SmtpSession {
        SmtpSession::new(
            SessionConfig::new(self.descriptor.host.clone(), self.descriptor.port)
                .with_client_name(self.helo_name.clone())
                .with_timeouts(self.timeouts)
                .with_certificates(self.certificates),
        )
    }

    /// Connects, negotiates TLS, authenticates and quits without sending mail.
    pub async fn verify(&self) -> Result<(), TransportError> {
        let mut session = self.session();
        let result = session
            .establish(self.descriptor.tls, self.descriptor.credentials.as_ref())
            .await;
        session.quit().await;
        result.map_err(TransportError::from)
    }

    async fn deliver(
        &self,
        session: &mut SmtpSession,
        sender: &str,
        envelope: &Envelope,
        message: &AssembledMessage,
    ) -> Result<Response, TransportError> {
        session
            .establish(self.descriptor.tls, self.descriptor.credentials.as_ref())
            .await?;
        session.mail_from(sender).await?;
        for recipient in &envelope.recipients {
            session.rcpt_to(recipient).await?;
        }
        Ok(session.data(&message.content).await?)
    }
}

#[async_trait]
impl Transport for SmtpTransport {
    fn descriptor(&self) -> &TransportDescriptor {
        &self.descriptor
    }

    async fn attempt_send(&self, envelope: &Envelope) -> Result<SendReceipt, TransportError> {
        let sender = envelope.sender.as_deref().ok_or_else(|| {
            TransportError::Configuration("no envelope sender configured".to_string())
        })?;

        let message = message::assemble(envelope, &self.helo_name);
        let mut session = self.session();
        let result = self.deliver(&mut session, sender, envelope, &message).await;
        session.quit().await;

        let reply = result?;
        Ok(SendReceipt {
            provider_message_id: Some(message.message_id),
            raw_provider_response: Some(reply.summary()),
        })
    }
}
