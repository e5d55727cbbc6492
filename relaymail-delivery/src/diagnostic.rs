//! Step-by-step STARTTLS diagnostics that report a transcript instead of
//! failing.
//!
//! The runner always requires STARTTLS and always verifies the server
//! certificate, whatever the production delivery policy says.

use std::time::Duration;

use relaymail_common::config::{ClientTimeouts, TlsCertificatePolicy, TlsPolicy};
use relaymail_smtp::{ClientError, Credentials, SessionConfig, SmtpSession, Transcript};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::config::{DEFAULT_HELO_NAME, DEFAULT_HOST, DEFAULT_PORT, TransportConfig};

const PUBLIC_IP_TIMEOUT: Duration = Duration::from_secs(5);

/// Operator input; anything absent comes from the runner's defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiagnosticRequest {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub pass: Option<SecretString>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticReport {
    pub log: Vec<String>,
    pub success: bool,
    #[serde(skip)]
    pub transcript: Transcript,
}

impl DiagnosticReport {
    fn missing_credentials() -> Self {
        Self {
            log: vec!["Missing credentials".to_string()],
            success: false,
            transcript: Transcript::new(),
        }
    }

    fn from_transcript(transcript: Transcript, success: bool) -> Self {
        Self {
            log: transcript.log_lines(),
            success,
            transcript,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiagnosticRunner {
    host: String,
    port: u16,
    client_name: String,
    timeouts: ClientTimeouts,
    credentials: Option<Credentials>,
    public_ip_url: Option<String>,
}

impl DiagnosticRunner {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            client_name: DEFAULT_HELO_NAME.to_string(),
            timeouts: ClientTimeouts::default(),
            credentials: None,
            public_ip_url: None,
        }
    }

    /// Defaults to the primary relay and configured credentials.
    #[must_use]
    pub fn from_config(config: &TransportConfig) -> Self {
        let (host, port) = config
            .primary()
            .map_or((DEFAULT_HOST.to_string(), DEFAULT_PORT), |d| (d.host.clone(), d.port));

        Self {
            host,
            port,
            client_name: config.helo_name.clone(),
            timeouts: config.timeouts,
            credentials: config.credentials.clone(),
            public_ip_url: config.public_ip_url.clone(),
        }
    }

    #[must_use]
    pub fn with_client_name(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = client_name.into();
        self
    }

    #[must_use]
    pub const fn with_timeouts(mut self, timeouts: ClientTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    #[must_use]
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// `None` skips the public IP line.
    #[must_use]
    pub fn with_public_ip_url(mut self, url: Option<String>) -> Self {
        self.public_ip_url = url;
        self
    }

    fn credentials_for(&self, request: &DiagnosticRequest) -> Option<Credentials> {
        let default_user = self.credentials.as_ref().map(|c| c.user().to_string());
        let default_pass = self
            .credentials
            .as_ref()
            .map(|c| c.password().expose_secret().clone());

        let user = request.user.clone().or(default_user)?;
        let pass = request
            .pass
            .as_ref()
            .map(|p| p.expose_secret().clone())
            .or(default_pass)?;

        (!user.trim().is_empty() && !pass.is_empty()).then(|| Credentials::new(user, pass))
    }

    /// Runs the diagnostic. Never fails: every problem ends up in the log as an
    /// `ERROR:` line with `success == false`.
    pub async fn run(&self, request: &DiagnosticRequest) -> DiagnosticReport {
        let Some(credentials) = self.credentials_for(request) else {
            return DiagnosticReport::missing_credentials();
        };

        let host = request.host.clone().unwrap_or_else(|| self.host.clone());
        let port = request.port.unwrap_or(self.port);

        let mut session = SmtpSession::new(
            SessionConfig::new(host, port)
                .with_client_name(self.client_name.clone())
                .with_timeouts(self.timeouts)
                .with_certificates(TlsCertificatePolicy::verify()),
        );

        if let Some(url) = &self.public_ip_url {
            let line = match public_ip(url).await {
                Ok(ip) => format!("Testing from IP: {ip}"),
                Err(e) => format!("Could not fetch public IP: {e}"),
            };
            session.transcript_mut().note(line);
        }

        match drive(&mut session, &credentials).await {
            Ok(accepted) => {
                session.quit().await;
                DiagnosticReport::from_transcript(session.into_transcript(), accepted)
            }
            Err(e) => {
                tracing::debug!(error = %e, "Diagnostic session failed");
                session.close().await;
                let mut transcript = session.into_transcript();
                transcript.error(&e);
                DiagnosticReport::from_transcript(transcript, false)
            }
        }
    }
}

/// Walks the session to `MAIL FROM`. A rejected `MAIL FROM` is a finding, not
/// an error.
async fn drive(session: &mut SmtpSession, credentials: &Credentials) -> Result<bool, ClientError> {
    session
        .establish(TlsPolicy::Required, Some(credentials))
        .await?;

    match session.mail_from(credentials.user()).await {
        Ok(_) => {
            session.transcript_mut().note("MAIL FROM accepted");
            Ok(true)
        }
        Err(ClientError::Rejected { code, message, .. }) => {
            session
                .transcript_mut()
                .note(format!("MAIL FROM rejected: {code} {message}"));
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

#[derive(Deserialize)]
struct IpReply {
    ip: String,
}

async fn public_ip(url: &str) -> Result<String, reqwest::Error> {
    let client = reqwest::Client::builder()
        .timeout(PUBLIC_IP_TIMEOUT)
        .build()?;
    let reply = client
        .get(url)
        .send()
        .await?
        .error_for_status()?
        .json::<IpReply>()
        .await?;
    Ok(reply.ip)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn test_missing_credentials_skips_connection() {
        let runner = DiagnosticRunner::new("127.0.0.1", 1);
        let report = runner.run(&DiagnosticRequest::default()).await;

        assert_eq!(report.log, vec!["Missing credentials"]);
        assert!(!report.success);
        assert!(report.transcript.is_empty());
    }

    #[tokio::test]
    async fn test_blank_password_counts_as_missing() {
        let runner = DiagnosticRunner::new("127.0.0.1", 1);
        let request = DiagnosticRequest {
            user: Some("ops@example.com".to_string()),
            pass: Some(SecretString::new(String::new())),
            ..DiagnosticRequest::default()
        };
        assert_eq!(runner.run(&request).await.log, vec!["Missing credentials"]);
    }

    #[test]
    fn test_report_json_omits_transcript() {
        let report = DiagnosticReport::missing_credentials();
        assert_eq!(
            serde_json::to_value(&report).unwrap(),
            serde_json::json!({"log": ["Missing credentials"], "success": false})
        );
    }
}
