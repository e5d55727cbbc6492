//! Diagnostic runs never fail; they report.

use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use relaymail_common::config::ClientTimeouts;
use relaymail_delivery::{
    DeliveryEngine, DiagnosticRequest, DiagnosticRunner, EmailRequest, MapSource, TransportConfig,
    TransportKind,
};
use relaymail_smtp::Credentials;
use relaymail_testing::{MockSmtpServer, SmtpCommand};
use secrecy::SecretString;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path},
};

fn short_timeouts() -> ClientTimeouts {
    ClientTimeouts::uniform(2)
}

fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn test_unreachable_host_reports_error() {
    let port = closed_port();
    let runner = DiagnosticRunner::new("127.0.0.1", port)
        .with_timeouts(short_timeouts())
        .with_credentials(Credentials::new("ops@example.com", "secret"));

    let started = Instant::now();
    let report = runner.run(&DiagnosticRequest::default()).await;

    assert!(!report.success);
    assert!(started.elapsed() <= Duration::from_secs(6));
    assert_eq!(report.log[0], format!("Connecting to 127.0.0.1:{port}..."));
    assert!(report.log.last().unwrap().starts_with("ERROR: "));
}

#[tokio::test]
async fn test_starttls_refusal_transcript() {
    let server = MockSmtpServer::builder()
        .with_starttls_response(454, "TLS not available")
        .build()
        .await
        .unwrap();
    let runner = DiagnosticRunner::new("127.0.0.1", 1).with_timeouts(short_timeouts());

    let request = DiagnosticRequest {
        port: Some(server.port()),
        user: Some("ops@example.com".to_string()),
        pass: Some(SecretString::new("secret".to_string())),
        ..DiagnosticRequest::default()
    };
    let report = runner.run(&request).await;

    assert!(!report.success);
    assert_eq!(
        report.log,
        vec![
            format!("Connecting to 127.0.0.1:{}...", server.port()),
            "S: 220 Mock SMTP Server".to_string(),
            "C: EHLO localhost".to_string(),
            "S: 250-mock.local".to_string(),
            "S: 250 AUTH LOGIN".to_string(),
            "C: STARTTLS".to_string(),
            "S: 454 TLS not available".to_string(),
            "ERROR: STARTTLS not accepted: 454 TLS not available".to_string(),
        ]
    );
    assert_eq!(
        server.commands().await,
        vec![SmtpCommand::Ehlo("localhost".to_string()), SmtpCommand::StartTls]
    );
    assert!(server.wait_for_client_close(Duration::from_secs(2)).await);
}

#[tokio::test]
async fn test_public_ip_is_first_line() {
    let ip_service = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ip": "203.0.113.7"})))
        .mount(&ip_service)
        .await;

    let runner = DiagnosticRunner::new("127.0.0.1", closed_port())
        .with_timeouts(short_timeouts())
        .with_credentials(Credentials::new("ops@example.com", "secret"))
        .with_public_ip_url(Some(format!("{}/?format=json", ip_service.uri())));

    let report = runner.run(&DiagnosticRequest::default()).await;

    assert_eq!(report.log[0], "Testing from IP: 203.0.113.7");
    assert!(report.log[1].starts_with("Connecting to 127.0.0.1:"));
    assert!(!report.success);
}

#[tokio::test]
async fn test_public_ip_failure_is_not_fatal() {
    let ip_service = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&ip_service)
        .await;

    let runner = DiagnosticRunner::new("127.0.0.1", closed_port())
        .with_timeouts(short_timeouts())
        .with_credentials(Credentials::new("ops@example.com", "secret"))
        .with_public_ip_url(Some(ip_service.uri()));

    let report = runner.run(&DiagnosticRequest::default()).await;

    assert!(report.log[0].starts_with("Could not fetch public IP: "));
    assert!(report.log[1].starts_with("Connecting to "));
    assert!(report.log.last().unwrap().starts_with("ERROR: "));
}

#[tokio::test]
async fn test_diagnostics_verify_certificates_that_delivery_accepts() {
    let server = MockSmtpServer::builder().with_starttls().build().await.unwrap();
    // No SMTP_REJECT_UNAUTHORIZED: production delivery accepts any certificate.
    let config = TransportConfig::from_source(
        &MapSource::new()
            .with("SMTP_HOST", "127.0.0.1")
            .with("SMTP_PORT", server.port().to_string())
            .with("FALLBACK_SMTP_PORT", closed_port().to_string())
            .with("SMTP_USER", "ops@example.com")
            .with("SMTP_PASS", "secret")
            .with("SMTP_READ_TIMEOUT_SECS", "2")
            .with("PUBLIC_IP_URL", "off"),
    );
    assert!(config.certificates.accept_invalid_certs);

    let report = DiagnosticRunner::from_config(&config)
        .run(&DiagnosticRequest::default())
        .await;

    assert!(!report.success);
    assert!(report.log.contains(&"S: 220 Ready to start TLS".to_string()));
    assert!(report.log.last().unwrap().starts_with("ERROR: "));
    assert!(!report.log.iter().any(|line| line == "TLS connection established"));
    assert_eq!(server.tls_handshakes(), 0);

    let outcome = DeliveryEngine::from_config(&config)
        .unwrap()
        .send(&EmailRequest::new("ana@x.com", "Report").with_text("Hello"))
        .await
        .unwrap();

    assert_eq!(outcome.transport_kind, TransportKind::Smtp);
    assert!(!outcome.used_fallback);
    assert_eq!(server.tls_handshakes(), 1);
    let commands = server.commands().await;
    assert_eq!(
        commands.iter().filter(|c| **c == SmtpCommand::StartTls).count(),
        2
    );
    assert!(commands.contains(&SmtpCommand::Data));
}
