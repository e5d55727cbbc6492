//! The delivery engine: validation, envelope construction and the ordered
//! fallback chain.

use std::sync::Arc;

use relaymail_common::address;

use crate::{
    config::{TransportConfig, TransportKind, TransportRole},
    error::{DeliveryError, TransportError, ValidationError},
    recipients::{self, DEFAULT_MAX_RECIPIENTS},
    request::{DeliveryOutcome, EmailRequest, Envelope},
    transport::{HttpApiTransport, SmtpTransport, Transport},
};

pub struct DeliveryEngine {
    transports: Vec<Arc<dyn Transport>>,
    sender: Option<String>,
    max_recipients: usize,
}

impl DeliveryEngine {
    /// `transports` is the fallback chain in priority order; the first entry is
    /// the primary.
    #[must_use]
    pub fn new(transports: Vec<Arc<dyn Transport>>, sender: Option<String>) -> Self {
        Self {
            transports,
            sender,
            max_recipients: DEFAULT_MAX_RECIPIENTS,
        }
    }

    #[must_use]
    pub const fn with_max_recipients(mut self, max_recipients: usize) -> Self {
        self.max_recipients = max_recipients;
        self
    }

    /// Builds one transport per descriptor of `config.chain`.
    ///
    /// # Errors
    ///
    /// Fails if the HTTP client for the API transport cannot be built.
    pub fn from_config(config: &TransportConfig) -> Result<Self, TransportError> {
        let mut transports: Vec<Arc<dyn Transport>> = Vec::with_capacity(config.chain.len());

        for descriptor in &config.chain {
            let transport: Arc<dyn Transport> = match descriptor.kind {
                TransportKind::Smtp => Arc::new(SmtpTransport::new(
                    descriptor.clone(),
                    config.helo_name.clone(),
                    config.timeouts,
                    config.certificates,
                )),
                TransportKind::HttpApi => Arc::new(HttpApiTransport::new(
                    descriptor.clone(),
                    config.timeouts.connect(),
                    config.timeouts.connect() + config.timeouts.read(),
                )?),
            };
            transports.push(transport);
        }

        Ok(Self::new(transports, config.sender.clone()).with_max_recipients(config.max_recipients))
    }

    #[must_use]
    pub fn transports(&self) -> &[Arc<dyn Transport>] {
        &self.transports
    }

    /// Validates `request` and builds the envelope, without touching the
    /// network.
    ///
    /// # Errors
    ///
    /// Returns the [`ValidationError`] describing the first problem found.
    pub fn prepare(&self, request: &EmailRequest) -> Result<Envelope, ValidationError> {
        let normalized = recipients::normalize(&request.to, self.max_recipients)?;
        if !normalized.invalid.is_empty() {
            tracing::warn!(invalid = ?normalized.invalid, "Skipping invalid recipients");
        }

        if request.subject.trim().is_empty() {
            return Err(ValidationError::MissingSubject);
        }

        let non_empty = |body: Option<&String>| body.filter(|b| !b.trim().is_empty()).cloned();
        let html = non_empty(request.html.as_ref());
        let text = non_empty(request.text.as_ref());
        if html.is_none() && text.is_none() {
            return Err(ValidationError::MissingBody);
        }

        let from_header = request
            .from
            .as_deref()
            .map(str::trim)
            .filter(|from| !from.is_empty())
            .map(ToString::to_string)
            .or_else(|| self.sender.clone());

        let sender = self.sender.clone().or_else(|| {
            // No configured sender: fall back to a bare `from` address.
            from_header
                .as_deref()
                .filter(|from| address::is_valid(from))
                .map(str::to_lowercase)
        });

        Ok(Envelope {
            sender,
            from_header,
            to_header: normalized.header(),
            recipients: normalized.envelope(),
            subject: request.subject.trim().to_string(),
            html,
            text,
        })
    }

    /// Sends `request` through the chain until one transport succeeds.
    ///
    /// Any transport failure moves on to the next untried transport. A `550`
    /// on `MAIL FROM` moves to the STARTTLS alternate first. No transport is
    /// tried twice.
    ///
    /// # Errors
    ///
    /// - [`DeliveryError::Validation`] before any network activity
    /// - [`DeliveryError::Exhausted`] once every transport has failed
    pub async fn send(&self, request: &EmailRequest) -> Result<DeliveryOutcome, DeliveryError> {
        let envelope = self.prepare(request)?;

        tracing::info!(
            from = envelope.from_header.as_deref().unwrap_or("<none>"),
            to = ?envelope.recipients,
            host = self.transports.first().map(|t| t.descriptor().host.as_str()).unwrap_or("<none>"),
            "Sending email"
        );

        let mut tried = vec![false; self.transports.len()];
        let mut next = (!self.transports.is_empty()).then_some(0);
        let mut attempts = 0;

        while let Some(index) = next {
            tried[index] = true;
            attempts += 1;

            let transport = &self.transports[index];
            let descriptor = transport.descriptor();

            match transport.attempt_send(&envelope).await {
                Ok(receipt) => {
                    tracing::info!(
                        transport = %descriptor.id(),
                        fallback = index != 0,
                        message_id = receipt.provider_message_id.as_deref().unwrap_or("<none>"),
                        "Email delivered"
                    );
                    return Ok(DeliveryOutcome {
                        succeeded: true,
                        transport_kind: descriptor.kind,
                        transport_used: Some(descriptor.id()),
                        provider_message_id: receipt.provider_message_id,
                        raw_provider_response: receipt.raw_provider_response,
                        used_fallback: index != 0,
                    });
                }
                Err(error) => {
                    tracing::warn!(
                        transport = %descriptor.id(),
                        error = %error,
                        "Delivery attempt failed"
                    );

                    let alternate = if error.is_relay_policy_rejection() {
                        self.alternate(&tried)
                    } else {
                        None
                    };
                    if alternate.is_some() {
                        tracing::info!("Relay refused the sender, retrying over STARTTLS");
                    }
                    next = alternate.or_else(|| next_untried(&tried));
                }
            }
        }

        tracing::error!(
            attempts,
            to = ?envelope.recipients,
            "All delivery transports failed"
        );
        Err(DeliveryError::Exhausted { attempts })
    }

    fn alternate(&self, tried: &[bool]) -> Option<usize> {
        self.transports
            .iter()
            .position(|t| t.descriptor().role == TransportRole::StartTlsAlternate)
            .filter(|&index| !tried[index])
    }
}

/// The highest-priority transport not yet attempted.
fn next_untried(tried: &[bool]) -> Option<usize> {
    tried.iter().position(|&attempted| !attempted)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use relaymail_common::config::TlsPolicy;
    use relaymail_smtp::ClientError;
    use secrecy::SecretString;

    use super::*;
    use crate::{
        config::TransportDescriptor,
        request::SendReceipt,
    };

    enum Behaviour {
        Succeed,
        ConnectFailure,
        RelayRejection,
        ProviderFailure,
    }

    struct MockTransport {
        descriptor: TransportDescriptor,
        behaviour: Behaviour,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Transport for MockTransport {
        fn descriptor(&self) -> &TransportDescriptor {
            &self.descriptor
        }

        async fn attempt_send(&self, _envelope: &Envelope) -> Result<SendReceipt, TransportError> {
            self.log.lock().unwrap().push(self.descriptor.id());
            match self.behaviour {
                Behaviour::Succeed => Ok(SendReceipt {
                    provider_message_id: Some(format!("id-{}", self.descriptor.port)),
                    raw_provider_response: Some("250 OK".to_string()),
                }),
                Behaviour::ConnectFailure => Err(ClientError::Connect {
                    address: self.descriptor.id(),
                    reason: "connection refused".to_string(),
                }
                .into()),
                Behaviour::RelayRejection => Err(ClientError::Rejected {
                    command: "MAIL FROM".to_string(),
                    code: 550,
                    message: "relay not permitted for provider-secret-host".to_string(),
                }
                .into()),
                Behaviour::ProviderFailure => Err(TransportError::ApiRejected {
                    status: 422,
                    body: "{\"message\": \"provider-secret-detail\"}".to_string(),
                }),
            }
        }
    }

    fn chain(
        behaviours: [Behaviour; 3],
    ) -> (DeliveryEngine, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let [primary, alternate, api] = behaviours;
        let descriptors = [
            (
                TransportDescriptor::smtp(
                    TransportRole::Primary,
                    "mail.example.com",
                    465,
                    TlsPolicy::Implicit,
                    None,
                ),
                primary,
            ),
            (
                TransportDescriptor::smtp(
                    TransportRole::StartTlsAlternate,
                    "mail.example.com",
                    587,
                    TlsPolicy::Required,
                    None,
                ),
                alternate,
            ),
            (
                TransportDescriptor::http_api(
                    "https://api.example.com/emails",
                    SecretString::new("key".to_string()),
                ),
                api,
            ),
        ];

        let transports = descriptors
            .into_iter()
            .map(|(descriptor, behaviour)| {
                Arc::new(MockTransport {
                    descriptor,
                    behaviour,
                    log: Arc::clone(&log),
                }) as Arc<dyn Transport>
            })
            .collect();

        (
            DeliveryEngine::new(transports, Some("noreply@example.com".to_string())),
            log,
        )
    }

    fn request() -> EmailRequest {
        EmailRequest::new("Ana <ana@x.com>, bob@x.com", "Report").with_text("Hello")
    }

    #[tokio::test]
    async fn test_primary_success_is_single_attempt() {
        let (engine, log) = chain([
            Behaviour::Succeed,
            Behaviour::Succeed,
            Behaviour::Succeed,
        ]);
        let outcome = engine.send(&request()).await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["smtp://mail.example.com:465"]);
        assert!(outcome.succeeded);
        assert!(!outcome.used_fallback);
        assert_eq!(outcome.transport_kind, TransportKind::Smtp);
        assert_eq!(outcome.provider_message_id.as_deref(), Some("id-465"));
    }

    #[tokio::test]
    async fn test_relay_rejection_goes_to_alternate() {
        let (engine, log) = chain([
            Behaviour::RelayRejection,
            Behaviour::Succeed,
            Behaviour::Succeed,
        ]);
        let outcome = engine.send(&request()).await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["smtp://mail.example.com:465", "smtp://mail.example.com:587"]
        );
        assert!(outcome.used_fallback);
        assert_eq!(
            outcome.transport_used.as_deref(),
            Some("smtp://mail.example.com:587")
        );
    }

    #[tokio::test]
    async fn test_alternate_failure_falls_through_to_api() {
        let (engine, log) = chain([
            Behaviour::ConnectFailure,
            Behaviour::RelayRejection,
            Behaviour::Succeed,
        ]);
        let outcome = engine.send(&request()).await.unwrap();

        assert_eq!(log.lock().unwrap().len(), 3);
        assert_eq!(outcome.transport_kind, TransportKind::HttpApi);
        assert!(outcome.used_fallback);
    }

    #[tokio::test]
    async fn test_exhaustion_hides_provider_detail() {
        let (engine, log) = chain([
            Behaviour::RelayRejection,
            Behaviour::ConnectFailure,
            Behaviour::ProviderFailure,
        ]);
        let error = engine.send(&request()).await.unwrap_err();

        assert_eq!(log.lock().unwrap().len(), 3);
        assert_eq!(error.status(), 500);
        assert_eq!(error.public_message(), "internal send failure");
        assert!(!error.public_message().contains("provider-secret"));
        assert!(matches!(error, DeliveryError::Exhausted { attempts: 3 }));
    }

    #[tokio::test]
    async fn test_validation_failure_makes_no_attempt() {
        let (engine, log) = chain([
            Behaviour::Succeed,
            Behaviour::Succeed,
            Behaviour::Succeed,
        ]);

        let error = engine
            .send(&EmailRequest::new("not-an-address", "Report").with_text("Hello"))
            .await
            .unwrap_err();
        assert_eq!(error.status(), 400);

        let error = engine
            .send(&EmailRequest::new("a@x.com", "  ").with_text("Hello"))
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            DeliveryError::Validation(ValidationError::MissingSubject)
        ));

        let error = engine
            .send(&EmailRequest::new("a@x.com", "Report"))
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            DeliveryError::Validation(ValidationError::MissingBody)
        ));

        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_envelope_separates_header_and_addresses() {
        let (engine, _) = chain([
            Behaviour::Succeed,
            Behaviour::Succeed,
            Behaviour::Succeed,
        ]);
        let envelope = engine
            .prepare(&request().with_from("Ops <ops@example.com>"))
            .unwrap();

        assert_eq!(envelope.to_header, "Ana <ana@x.com>, bob@x.com");
        assert_eq!(envelope.recipients, vec!["ana@x.com", "bob@x.com"]);
        assert_eq!(envelope.sender.as_deref(), Some("noreply@example.com"));
        assert_eq!(envelope.from_header.as_deref(), Some("Ops <ops@example.com>"));
    }

    #[tokio::test]
    async fn test_empty_chain_is_exhausted() {
        let engine = DeliveryEngine::new(Vec::new(), None);
        let error = engine.send(&request()).await.unwrap_err();
        assert!(matches!(error, DeliveryError::Exhausted { attempts: 0 }));
    }
}
