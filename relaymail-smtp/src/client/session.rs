//! The SMTP session state machine.

use std::fmt;

use relaymail_common::{
    config::{ClientTimeouts, TlsCertificatePolicy, TlsPolicy},
    incoming, internal, outgoing,
};
use tokio::net::TcpStream;

use super::{
    connection::ClientConnection,
    credentials::Credentials,
    error::{ClientError, Result},
    response::Response,
    transcript::Transcript,
};

/// Initial size of the read buffer for SMTP replies.
const BUFFER_SIZE: usize = 8192;

/// Upper bound on a single buffered reply (1MB).
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// Shown in place of `AUTH LOGIN` payloads.
const REDACTED: &str = "****";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected,
    Greeted,
    TlsNegotiating,
    Secured,
    Authenticated,
    EnvelopeSent,
    RecipientsAccepted,
    MessageSent,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connected => "CONNECTED",
            Self::Greeted => "GREETED",
            Self::TlsNegotiating => "TLS_NEGOTIATING",
            Self::Secured => "SECURED",
            Self::Authenticated => "AUTHENTICATED",
            Self::EnvelopeSent => "ENVELOPE_SENT",
            Self::RecipientsAccepted => "RECIPIENTS_ACCEPTED",
            Self::MessageSent => "MESSAGE_SENT",
            Self::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// Where and how to connect.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    /// Name announced in `EHLO`.
    pub client_name: String,
    pub timeouts: ClientTimeouts,
    pub certificates: TlsCertificatePolicy,
}

impl SessionConfig {
    /// Defaults: `EHLO localhost`, standard timeouts, certificates verified.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            client_name: "localhost".to_string(),
            timeouts: ClientTimeouts::default(),
            certificates: TlsCertificatePolicy::verify(),
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
    pub const fn with_certificates(mut self, certificates: TlsCertificatePolicy) -> Self {
        self.certificates = certificates;
        self
    }

    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// One logical SMTP connection, driven one round trip at a time.
pub struct SmtpSession {
    config: SessionConfig,
    connection: Option<ClientConnection>,
    buffer: Vec<u8>,
    buffer_pos: usize,
    state: SessionState,
    capabilities: Option<Response>,
    transcript: Transcript,
}

impl SmtpSession {
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            connection: None,
            buffer: vec![0u8; BUFFER_SIZE],
            buffer_pos: 0,
            state: SessionState::Disconnected,
            capabilities: None,
            transcript: Transcript::new(),
        }
    }

    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Whether a socket is currently held.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.connection.is_some()
    }

    #[must_use]
    pub fn is_secured(&self) -> bool {
        self.connection.as_ref().is_some_and(ClientConnection::is_tls)
    }

    #[must_use]
    pub const fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub const fn transcript_mut(&mut self) -> &mut Transcript {
        &mut self.transcript
    }

    #[must_use]
    pub fn into_transcript(self) -> Transcript {
        self.transcript
    }

    /// Whether the most recent EHLO reply advertised `STARTTLS`.
    #[must_use]
    pub fn supports_starttls(&self) -> bool {
        self.capabilities
            .as_ref()
            .is_some_and(|ehlo| ehlo.advertises("STARTTLS"))
    }

    fn expect_state(&self, operation: &'static str, allowed: &[SessionState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(ClientError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    /// `DISCONNECTED -> CONNECTED`
    pub async fn connect(&mut self) -> Result<()> {
        self.expect_state("connect", &[SessionState::Disconnected])?;

        let address = self.config.address();
        let after = self.config.timeouts.connect();
        self.transcript.note(format!("Connecting to {address}..."));
        internal!(level = DEBUG, address = %address, "Connecting");

        let stream = match tokio::time::timeout(
            after,
            TcpStream::connect((self.config.host.as_str(), self.config.port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(ClientError::Connect {
                    address,
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                return Err(ClientError::Connect {
                    address,
                    reason: format!("TCP connect timeout after {after:?}"),
                });
            }
        };

        self.connection = Some(ClientConnection::Plain(stream));
        self.state = SessionState::Connected;
        Ok(())
    }

    /// Wraps the fresh connection in TLS before the banner (SMTPS).
    pub async fn start_implicit_tls(&mut self) -> Result<()> {
        self.expect_state("implicit TLS", &[SessionState::Connected])?;
        self.upgrade().await
    }

    /// `CONNECTED -> GREETED`. The banner must be a 2xx reply.
    pub async fn read_greeting(&mut self) -> Result<Response> {
        self.expect_state("read greeting", &[SessionState::Connected])?;

        let banner = self.read_response("greeting").await?;
        if !banner.is_success() {
            return Err(rejected("CONNECT", &banner));
        }

        self.state = SessionState::Greeted;
        Ok(banner)
    }

    /// Sends `EHLO`; valid right after the banner and again once secured.
    pub async fn ehlo(&mut self) -> Result<Response> {
        self.expect_state("EHLO", &[SessionState::Greeted, SessionState::Secured])?;

        let command = format!("EHLO {}", self.config.client_name);
        let response = self.round_trip(&command, &command).await?;
        if !response.is_success() {
            return Err(rejected("EHLO", &response));
        }

        self.capabilities = Some(response.clone());
        Ok(response)
    }

    /// `GREETED -> TLS_NEGOTIATING -> SECURED`.
    ///
    /// The reply to `STARTTLS` must begin with `220`. After the handshake the
    /// server forgets everything learned from the previous `EHLO`, so callers
    /// must issue [`ehlo`](Self::ehlo) again.
    pub async fn starttls(&mut self) -> Result<()> {
        self.expect_state("STARTTLS", &[SessionState::Greeted])?;

        let response = self.round_trip("STARTTLS", "STARTTLS").await?;
        if response.code != 220 {
            return Err(ClientError::StartTlsRejected(response.summary()));
        }

        self.upgrade().await?;
        self.transcript.note("TLS connection established");
        Ok(())
    }

    async fn upgrade(&mut self) -> Result<()> {
        let previous = self.state;
        self.state = SessionState::TlsNegotiating;

        let connection = self.connection.take().ok_or(ClientError::ConnectionClosed)?;
        let after = self.config.timeouts.tls();
        let upgrade = connection.upgrade_to_tls(&self.config.host, self.config.certificates);

        let connection = match tokio::time::timeout(after, upgrade).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ClientError::Tls(format!(
                    "TLS handshake timeout after {after:?}"
                )));
            }
        };

        self.connection = Some(connection);
        self.capabilities = None;
        self.buffer_pos = 0;
        self.state = if previous == SessionState::Connected {
            SessionState::Connected
        } else {
            SessionState::Secured
        };
        internal!(level = DEBUG, server = %self.config.address(), "TLS established");
        Ok(())
    }

    /// `AUTH LOGIN`, then the base64 username, then the base64 password, each
    /// as its own round trip. The payloads never reach the transcript.
    pub async fn auth_login(&mut self, credentials: &Credentials) -> Result<()> {
        self.expect_state("AUTH LOGIN", &[SessionState::Greeted, SessionState::Secured])?;

        let challenge = self.round_trip("AUTH LOGIN", "AUTH LOGIN").await?;
        if challenge.code != 334 {
            return Err(rejected("AUTH LOGIN", &challenge));
        }

        let challenge = self
            .round_trip(&credentials.encoded_user(), REDACTED)
            .await?;
        if challenge.code != 334 {
            return Err(rejected("AUTH LOGIN username", &challenge));
        }

        let outcome = self
            .round_trip(&credentials.encoded_password(), REDACTED)
            .await?;
        if !outcome.is_success() {
            return Err(rejected("AUTH LOGIN password", &outcome));
        }

        self.state = SessionState::Authenticated;
        Ok(())
    }

    /// Connect, greet, EHLO, negotiate TLS as `tls` demands, and authenticate
    /// when credentials are given. The socket is released if any step fails.
    pub async fn establish(
        &mut self,
        tls: TlsPolicy,
        credentials: Option<&Credentials>,
    ) -> Result<()> {
        let result = self.establish_steps(tls, credentials).await;
        if result.is_err() {
            self.close().await;
        }
        result
    }

    async fn establish_steps(
        &mut self,
        tls: TlsPolicy,
        credentials: Option<&Credentials>,
    ) -> Result<()> {
        self.connect().await?;
        if tls.is_implicit() {
            self.start_implicit_tls().await?;
        }
        self.read_greeting().await?;
        self.ehlo().await?;

        if tls.is_implicit() {
            // Already encrypted; no STARTTLS on an SMTPS connection.
            self.state = SessionState::Secured;
        } else if tls.requires_starttls() || self.supports_starttls() {
            self.starttls().await?;
            self.ehlo().await?;
        }

        if let Some(credentials) = credentials {
            self.auth_login(credentials).await?;
        }
        Ok(())
    }

    /// `-> ENVELOPE_SENT`. Success is exactly a reply beginning with `250`.
    pub async fn mail_from(&mut self, sender: &str) -> Result<Response> {
        self.expect_state(
            "MAIL FROM",
            &[
                SessionState::Greeted,
                SessionState::Secured,
                SessionState::Authenticated,
            ],
        )?;

        let command = format!("MAIL FROM:<{sender}>");
        let response = self.round_trip(&command, &command).await?;
        if response.code != 250 {
            return Err(rejected("MAIL FROM", &response));
        }

        self.state = SessionState::EnvelopeSent;
        Ok(response)
    }

    /// `ENVELOPE_SENT -> RECIPIENTS_ACCEPTED`; accepts 250 and 251.
    pub async fn rcpt_to(&mut self, recipient: &str) -> Result<Response> {
        self.expect_state(
            "RCPT TO",
            &[SessionState::EnvelopeSent, SessionState::RecipientsAccepted],
        )?;

        let command = format!("RCPT TO:<{recipient}>");
        let response = self.round_trip(&command, &command).await?;
        if !matches!(response.code, 250 | 251) {
            return Err(rejected("RCPT TO", &response));
        }

        self.state = SessionState::RecipientsAccepted;
        Ok(response)
    }

    /// `RECIPIENTS_ACCEPTED -> MESSAGE_SENT`: `DATA`, the dot-stuffed message,
    /// and the terminating `.`.
    pub async fn data(&mut self, message: &str) -> Result<Response> {
        self.expect_state("DATA", &[SessionState::RecipientsAccepted])?;

        let go_ahead = self.round_trip("DATA", "DATA").await?;
        if go_ahead.code != 354 {
            return Err(rejected("DATA", &go_ahead));
        }

        let payload = dot_stuff(message);
        outgoing!("<{} bytes of message data>", payload.len());
        self.transcript
            .client(format!("<{} bytes of message data>", payload.len()));
        self.send_raw(payload.as_bytes(), "message data").await?;
        self.send_raw(b".\r\n", "end of message data").await?;
        self.transcript.client(".");

        let accepted = self.read_response("message data").await?;
        if !accepted.is_success() {
            return Err(rejected("DATA", &accepted));
        }

        self.state = SessionState::MessageSent;
        Ok(accepted)
    }

    /// Best-effort `QUIT` followed by [`close`](Self::close). Failures here
    /// never change the outcome of the session.
    pub async fn quit(&mut self) {
        if self.connection.is_some() && self.state != SessionState::Connected {
            if let Err(e) = self.round_trip("QUIT", "QUIT").await {
                internal!(level = DEBUG, error = %e, "QUIT failed");
            }
        }
        self.close().await;
    }

    /// Releases the socket. Safe on a session that never connected and on one
    /// that is already closed.
    pub async fn close(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.shutdown(self.config.timeouts.write()).await;
        }
        self.buffer_pos = 0;
        self.state = SessionState::Closed;
    }

    /// Writes `command` and reads exactly one reply. `shown` is what the
    /// transcript and logs record for the command.
    async fn round_trip(&mut self, command: &str, shown: &str) -> Result<Response> {
        outgoing!("{shown}");
        self.transcript.client(shown);
        self.send_raw(format!("{command}\r\n").as_bytes(), shown).await?;
        self.read_response(shown).await
    }

    async fn send_raw(&mut self, data: &[u8], operation: &str) -> Result<()> {
        let after = self.config.timeouts.write();
        let connection = self
            .connection
            .as_mut()
            .ok_or(ClientError::ConnectionClosed)?;

        tokio::time::timeout(after, connection.send(data))
            .await
            .unwrap_or_else(|_| {
                Err(ClientError::Timeout {
                    operation: format!("Writing {operation}"),
                    after,
                })
            })
    }

    async fn read_response(&mut self, operation: &str) -> Result<Response> {
        let after = self.config.timeouts.read();
        let response = match tokio::time::timeout(after, self.read_complete_response()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ClientError::Timeout {
                    operation: format!("Reading reply to {operation}"),
                    after,
                });
            }
        };

        for line in response.wire_lines() {
            incoming!("{line}");
            self.transcript.server(line);
        }
        Ok(response)
    }

    async fn read_complete_response(&mut self) -> Result<Response> {
        loop {
            if let Some((response, consumed)) =
                Response::parse_response(&self.buffer[..self.buffer_pos])?
            {
                self.buffer.copy_within(consumed..self.buffer_pos, 0);
                self.buffer_pos -= consumed;
                return Ok(response);
            }

            if self.buffer_pos >= self.buffer.len() {
                let new_size = self.buffer.len() * 2;
                if new_size > MAX_BUFFER_SIZE {
                    return Err(ClientError::Parse(format!(
                        "Response too large (exceeds {MAX_BUFFER_SIZE} bytes)"
                    )));
                }
                self.buffer.resize(new_size, 0);
            }

            let connection = self
                .connection
                .as_mut()
                .ok_or(ClientError::ConnectionClosed)?;
            let n = connection.read(&mut self.buffer[self.buffer_pos..]).await?;
            self.buffer_pos += n;
        }
    }
}

fn rejected(command: &str, response: &Response) -> ClientError {
    ClientError::Rejected {
        command: command.to_string(),
        code: response.code,
        message: response.lines.join(" / "),
    }
}

/// Normalises line endings to CRLF, doubles leading dots, and guarantees a
/// trailing CRLF so the terminator lands on its own line.
fn dot_stuff(message: &str) -> String {
    let mut out = String::with_capacity(message.len() + 64);
    for line in message.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.starts_with('.') {
            out.push('.');
        }
        out.push_str(line);
        out.push_str("\r\n");
    }
    if message.ends_with('\n') {
        // split() yields a trailing empty segment for the final newline.
        out.truncate(out.len() - 2);
    }
    out
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_dot_stuff() {
        assert_eq!(dot_stuff("Hello\n.World\n"), "Hello\r\n..World\r\n");
        assert_eq!(dot_stuff("a\r\nb"), "a\r\nb\r\n");
        assert_eq!(dot_stuff("."), "..\r\n");
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::TlsNegotiating.to_string(), "TLS_NEGOTIATING");
        assert_eq!(SessionState::EnvelopeSent.to_string(), "ENVELOPE_SENT");
    }

    #[tokio::test]
    async fn test_out_of_order_command_is_rejected() {
        let mut session = SmtpSession::new(SessionConfig::new("127.0.0.1", 25));
        let error = session.mail_from("a@example.com").await.unwrap_err();
        assert!(matches!(
            error,
            ClientError::InvalidState {
                operation: "MAIL FROM",
                state: SessionState::Disconnected
            }
        ));
    }

    #[tokio::test]
    async fn test_close_without_connect() {
        let mut session = SmtpSession::new(SessionConfig::new("127.0.0.1", 25));
        session.close().await;
        session.close().await;
        assert!(!session.is_open());
        assert_eq!(session.state(), SessionState::Closed);
    }
}
