use serde::{Deserialize, Serialize};

use crate::{config::TransportKind, recipients::RecipientInput};

/// An inbound "send email" request: `{ to, subject, html?, text?, from? }`.
#[derive(Debug, Clone, Deserialize)]
pub struct EmailRequest {
    pub to: RecipientInput,
    pub subject: String,
    #[serde(default)]
    pub html: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
}

impl EmailRequest {
    pub fn new(to: impl Into<RecipientInput>, subject: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            subject: subject.into(),
            html: None,
            text: None,
            from: None,
        }
    }

    #[must_use]
    pub fn with_html(mut self, html: impl Into<String>) -> Self {
        self.html = Some(html.into());
        self
    }

    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    #[must_use]
    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }
}

/// A validated request, ready for any transport.
///
/// `to_header` carries display names; `recipients` carries only bare
/// lowercase addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// `MAIL FROM` address.
    pub sender: Option<String>,
    /// `From:` header value.
    pub from_header: Option<String>,
    pub to_header: String,
    pub recipients: Vec<String>,
    pub subject: String,
    pub html: Option<String>,
    pub text: Option<String>,
}

/// What a transport reports back on success.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendReceipt {
    pub provider_message_id: Option<String>,
    pub raw_provider_response: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub succeeded: bool,
    pub transport_kind: TransportKind,
    /// Identity of the descriptor that delivered, e.g. `smtp://host:587`.
    pub transport_used: Option<String>,
    pub provider_message_id: Option<String>,
    pub raw_provider_response: Option<String>,
    /// `true` when any transport other than the primary delivered.
    pub used_fallback: bool,
}

/// The caller-facing success payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryResult {
    pub ok: bool,
    pub provider: TransportKind,
    #[serde(rename = "messageId", skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<bool>,
}

impl From<&DeliveryOutcome> for DeliveryResult {
    fn from(outcome: &DeliveryOutcome) -> Self {
        Self {
            ok: outcome.succeeded,
            provider: outcome.transport_kind,
            message_id: outcome.provider_message_id.clone(),
            response: outcome.raw_provider_response.clone(),
            fallback: outcome.used_fallback.then_some(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_request_deserialize() {
        let request: EmailRequest = serde_json::from_str(
            r#"{"to": "a@example.com", "subject": "Hi", "text": "Hello"}"#,
        )
        .unwrap();
        assert_eq!(request.subject, "Hi");
        assert_eq!(request.text.as_deref(), Some("Hello"));
        assert!(request.html.is_none());
        assert!(request.from.is_none());
    }

    #[test]
    fn test_result_json() {
        let outcome = DeliveryOutcome {
            succeeded: true,
            transport_kind: TransportKind::HttpApi,
            transport_used: Some("https://api.example.com/emails".to_string()),
            provider_message_id: Some("abc".to_string()),
            raw_provider_response: None,
            used_fallback: true,
        };
        let json = serde_json::to_value(DeliveryResult::from(&outcome)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "ok": true,
                "provider": "http-api",
                "messageId": "abc",
                "fallback": true,
            })
        );

        let primary = DeliveryOutcome {
            used_fallback: false,
            transport_kind: TransportKind::Smtp,
            ..outcome
        };
        let json = serde_json::to_value(DeliveryResult::from(&primary)).unwrap();
        assert_eq!(json.get("fallback"), None);
        assert_eq!(json["provider"], "smtp");
    }
}
