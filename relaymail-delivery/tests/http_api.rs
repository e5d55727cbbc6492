//! HTTP API transport against a mock endpoint.

use std::time::Duration;

use pretty_assertions::assert_eq;
use relaymail_delivery::{
    Envelope, HttpApiTransport, Transport, TransportDescriptor, TransportError,
};
use secrecy::SecretString;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{body_json, header, method, path},
};

fn envelope() -> Envelope {
    Envelope {
        sender: Some("noreply@example.com".to_string()),
        from_header: Some("Ops <ops@example.com>".to_string()),
        to_header: "Ana <ana@x.com>".to_string(),
        recipients: vec!["ana@x.com".to_string()],
        subject: "Report".to_string(),
        html: Some("<p>Hi</p>".to_string()),
        text: None,
    }
}

fn transport(server: &MockServer) -> HttpApiTransport {
    let descriptor = TransportDescriptor::http_api(
        format!("{}/emails", server.uri()),
        SecretString::new("re_test_key".to_string()),
    );
    HttpApiTransport::new(descriptor, Duration::from_secs(2), Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn test_submit_returns_provider_id() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/emails"))
        .and(header("authorization", "Bearer re_test_key"))
        .and(body_json(serde_json::json!({
            "from": "Ops <ops@example.com>",
            "to": ["ana@x.com"],
            "subject": "Report",
            "html": "<p>Hi</p>",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "msg_123"})))
        .expect(1)
        .mount(&server)
        .await;

    let receipt = transport(&server).attempt_send(&envelope()).await.unwrap();

    assert_eq!(receipt.provider_message_id.as_deref(), Some("msg_123"));
    assert_eq!(
        receipt.raw_provider_response.as_deref(),
        Some(r#"{"id":"msg_123"}"#)
    );
}

#[tokio::test]
async fn test_non_success_status_is_a_transport_failure() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(422).set_body_string("invalid from address"))
        .mount(&server)
        .await;

    let error = transport(&server)
        .attempt_send(&envelope())
        .await
        .unwrap_err();

    match error {
        TransportError::ApiRejected { status, body } => {
            assert_eq!(status, 422);
            assert_eq!(body, "invalid from address");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_body_without_id() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(202).set_body_string("queued"))
        .mount(&server)
        .await;

    let receipt = transport(&server).attempt_send(&envelope()).await.unwrap();
    assert_eq!(receipt.provider_message_id, None);
    assert_eq!(receipt.raw_provider_response.as_deref(), Some("queued"));
}
