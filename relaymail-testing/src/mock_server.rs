//! Scripted SMTP server for client tests.
//!
//! The server answers each command with a configured reply, records what it
//! received, and reports when a client hung up so tests can assert that the
//! socket was released. With [`MockSmtpServerBuilder::with_starttls`] it
//! advertises `STARTTLS` and completes the handshake with a freshly generated
//! self-signed certificate.

use std::{
    fmt::Write,
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use rcgen::CertifiedKey;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::RwLock,
    time::timeout,
};
use tokio_rustls::{
    TlsAcceptor,
    rustls::{
        ServerConfig,
        crypto::ring,
        pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer},
    },
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// SMTP command received by the mock server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    Ehlo(String),
    StartTls,
    AuthLogin,
    /// A base64 line sent in answer to a `334` challenge
    AuthPayload(String),
    MailFrom(String),
    RcptTo(String),
    Data,
    /// Message content (after DATA), with line endings preserved
    MessageContent(String),
    Quit,
    Other(String),
}

#[derive(Debug, Clone)]
struct SmtpResponse {
    code: u16,
    message: String,
}

impl SmtpResponse {
    fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        format!("{} {}\r\n", self.code, self.message).into_bytes()
    }
}

#[derive(Clone)]
struct MockServerConfig {
    greeting: SmtpResponse,
    ehlo_code: u16,
    capabilities: Vec<String>,
    starttls_response: SmtpResponse,
    auth_challenges: (SmtpResponse, SmtpResponse),
    auth_response: SmtpResponse,
    mail_from_response: SmtpResponse,
    rcpt_to_response: SmtpResponse,
    data_response: SmtpResponse,
    data_end_response: SmtpResponse,
    quit_response: SmtpResponse,

    tls: bool,
    hang_on_command: Option<usize>,
    drop_after_commands: Option<usize>,
    stall_after_data: bool,
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            greeting: SmtpResponse::new(220, "Mock SMTP Server"),
            ehlo_code: 250,
            capabilities: vec!["mock.local".to_string(), "AUTH LOGIN".to_string()],
            starttls_response: SmtpResponse::new(502, "Command not implemented"),
            auth_challenges: (
                SmtpResponse::new(334, "VXNlcm5hbWU6"),
                SmtpResponse::new(334, "UGFzc3dvcmQ6"),
            ),
            auth_response: SmtpResponse::new(235, "Authentication successful"),
            mail_from_response: SmtpResponse::new(250, "OK"),
            rcpt_to_response: SmtpResponse::new(250, "OK"),
            data_response: SmtpResponse::new(354, "Start mail input; end with <CRLF>.<CRLF>"),
            data_end_response: SmtpResponse::new(250, "OK: Message accepted"),
            quit_response: SmtpResponse::new(221, "Bye"),
            tls: false,
            hang_on_command: None,
            drop_after_commands: None,
            stall_after_data: false,
        }
    }
}

impl MockServerConfig {
    fn ehlo_bytes(&self) -> Vec<u8> {
        let mut response = String::new();
        let last = self.capabilities.len().saturating_sub(1);
        for (i, cap) in self.capabilities.iter().enumerate() {
            let separator = if i == last { ' ' } else { '-' };
            let _ = write!(&mut response, "{}{separator}{cap}\r\n", self.ehlo_code);
        }
        response.into_bytes()
    }
}

#[derive(Default)]
struct Shared {
    commands: RwLock<Vec<SmtpCommand>>,
    connections: AtomicUsize,
    client_hangups: AtomicUsize,
    tls_handshakes: AtomicUsize,
}

impl Shared {
    async fn record(&self, command: SmtpCommand) {
        self.commands.write().await.push(command);
    }

    fn hangup(&self) {
        self.client_hangups.fetch_add(1, Ordering::SeqCst);
    }
}

/// Per-connection progress, carried across the STARTTLS upgrade.
#[derive(Default)]
struct Progress {
    command_index: usize,
    auth_step: u8,
}

enum Next {
    Done,
    StartTls,
}

pub struct MockSmtpServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
    shutdown: Arc<AtomicBool>,
}

impl MockSmtpServer {
    #[must_use]
    pub fn builder() -> MockSmtpServerBuilder {
        MockSmtpServerBuilder {
            config: MockServerConfig::default(),
        }
    }

    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.addr.port()
    }

    pub async fn commands(&self) -> Vec<SmtpCommand> {
        self.shared.commands.read().await.clone()
    }

    /// Number of TCP connections accepted so far
    #[must_use]
    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// Number of completed server-side TLS handshakes
    #[must_use]
    pub fn tls_handshakes(&self) -> usize {
        self.shared.tls_handshakes.load(Ordering::SeqCst)
    }

    /// Whether every accepted connection has been closed by the client
    #[must_use]
    pub fn all_clients_closed(&self) -> bool {
        self.shared.client_hangups.load(Ordering::SeqCst) == self.connections()
    }

    /// Polls until every client has hung up, or `limit` passes
    pub async fn wait_for_client_close(&self, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        while tokio::time::Instant::now() < deadline {
            if self.connections() > 0 && self.all_clients_closed() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    async fn handle_client(
        stream: TcpStream,
        config: Arc<MockServerConfig>,
        acceptor: Option<TlsAcceptor>,
        shared: Arc<Shared>,
    ) -> Result<(), BoxError> {
        let mut progress = Progress::default();
        let mut plain = BufReader::new(stream);

        plain.write_all(&config.greeting.to_bytes()).await?;
        plain.flush().await?;

        if let Next::Done = Self::serve(&mut plain, &config, &shared, &mut progress).await? {
            return Ok(());
        }
        let Some(acceptor) = acceptor else {
            return Ok(());
        };

        let tls = match acceptor.accept(plain.into_inner()).await {
            Ok(tls) => tls,
            Err(e) => {
                tracing::debug!("Mock server TLS handshake failed: {}", e);
                shared.hangup();
                return Ok(());
            }
        };
        shared.tls_handshakes.fetch_add(1, Ordering::SeqCst);

        let mut secured = BufReader::new(tls);
        Self::serve(&mut secured, &config, &shared, &mut progress).await?;
        Ok(())
    }

    /// Answers commands until the client leaves or asks for a TLS upgrade.
    async fn serve<S>(
        stream: &mut BufReader<S>,
        config: &MockServerConfig,
        shared: &Shared,
        progress: &mut Progress,
    ) -> Result<Next, BoxError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut line = String::new();

        loop {
            line.clear();

            if config.drop_after_commands == Some(progress.command_index) {
                return Ok(Next::Done);
            }

            let bytes_read = match timeout(Duration::from_secs(30), stream.read_line(&mut line)).await
            {
                Ok(result) => result?,
                Err(_) => return Ok(Next::Done),
            };
            if bytes_read == 0 {
                shared.hangup();
                return Ok(Next::Done);
            }

            if config.hang_on_command == Some(progress.command_index) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                return Ok(Next::Done);
            }
            progress.command_index += 1;

            let cmd_line = line.trim_end_matches(['\r', '\n']);
            tracing::debug!("Mock server received: {}", cmd_line);

            if progress.auth_step > 0 {
                shared
                    .record(SmtpCommand::AuthPayload(cmd_line.to_string()))
                    .await;
                let reply = if progress.auth_step == 1 {
                    progress.auth_step = 2;
                    config.auth_challenges.1.to_bytes()
                } else {
                    progress.auth_step = 0;
                    config.auth_response.to_bytes()
                };
                stream.write_all(&reply).await?;
                stream.flush().await?;
                continue;
            }

            let (verb, argument) = cmd_line.split_once(' ').unwrap_or((cmd_line, ""));
            let verb = verb.to_uppercase();

            let (response, command) = match verb.as_str() {
                "EHLO" => (config.ehlo_bytes(), SmtpCommand::Ehlo(argument.to_string())),
                "STARTTLS" => (config.starttls_response.to_bytes(), SmtpCommand::StartTls),
                "AUTH" if argument.eq_ignore_ascii_case("LOGIN") => {
                    if config.auth_challenges.0.code == 334 {
                        progress.auth_step = 1;
                    }
                    (config.auth_challenges.0.to_bytes(), SmtpCommand::AuthLogin)
                }
                "MAIL" => (
                    config.mail_from_response.to_bytes(),
                    SmtpCommand::MailFrom(argument.to_string()),
                ),
                "RCPT" => (
                    config.rcpt_to_response.to_bytes(),
                    SmtpCommand::RcptTo(argument.to_string()),
                ),
                "DATA" => (config.data_response.to_bytes(), SmtpCommand::Data),
                "QUIT" => {
                    shared.record(SmtpCommand::Quit).await;
                    stream.write_all(&config.quit_response.to_bytes()).await?;
                    stream.flush().await?;
                    // Hold the socket until the client releases it.
                    let mut rest = String::new();
                    while stream.read_line(&mut rest).await.unwrap_or(0) > 0 {
                        rest.clear();
                    }
                    shared.hangup();
                    return Ok(Next::Done);
                }
                _ => (
                    SmtpResponse::new(500, "Unknown command").to_bytes(),
                    SmtpCommand::Other(cmd_line.to_string()),
                ),
            };

            shared.record(command.clone()).await;
            stream.write_all(&response).await?;
            stream.flush().await?;

            if command == SmtpCommand::StartTls
                && config.tls
                && config.starttls_response.code == 220
            {
                return Ok(Next::StartTls);
            }

            if command == SmtpCommand::Data && config.data_response.code == 354 {
                if config.stall_after_data {
                    // Stop reading so the client's writes back up.
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    return Ok(Next::Done);
                }

                let mut content = String::new();
                let mut data_line = String::new();
                loop {
                    data_line.clear();
                    if stream.read_line(&mut data_line).await? == 0 {
                        shared.hangup();
                        return Ok(Next::Done);
                    }
                    if data_line == ".\r\n" {
                        break;
                    }
                    content.push_str(&data_line);
                }
                shared.record(SmtpCommand::MessageContent(content)).await;
                stream
                    .write_all(&config.data_end_response.to_bytes())
                    .await?;
                stream.flush().await?;
            }
        }
    }
}

/// A TLS acceptor with a new self-signed certificate for `localhost` and
/// `127.0.0.1`. No client trusts it unless verification is disabled.
fn self_signed_acceptor() -> io::Result<TlsAcceptor> {
    let CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string(), "127.0.0.1".to_string()])
            .map_err(io::Error::other)?;
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

    let config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(io::Error::other)?
        .with_no_client_auth()
        .with_single_cert(vec![cert.der().clone()], key)
        .map_err(io::Error::other)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

pub struct MockSmtpServerBuilder {
    config: MockServerConfig,
}

impl MockSmtpServerBuilder {
    #[must_use]
    pub fn with_greeting(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.greeting = SmtpResponse::new(code, message);
        self
    }

    #[must_use]
    pub fn with_ehlo_response(mut self, code: u16, capabilities: Vec<String>) -> Self {
        self.config.ehlo_code = code;
        self.config.capabilities = capabilities;
        self
    }

    #[must_use]
    pub fn with_starttls_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.starttls_response = SmtpResponse::new(code, message);
        self
    }

    /// Advertise `STARTTLS`, accept it with `220`, and complete the handshake
    /// with a self-signed certificate
    #[must_use]
    pub fn with_starttls(mut self) -> Self {
        self.config.tls = true;
        self.config.starttls_response = SmtpResponse::new(220, "Ready to start TLS");
        if !self.config.capabilities.iter().any(|c| c == "STARTTLS") {
            self.config.capabilities.push("STARTTLS".to_string());
        }
        self
    }

    /// Final reply to the password line of `AUTH LOGIN`
    #[must_use]
    pub fn with_auth_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.auth_response = SmtpResponse::new(code, message);
        self
    }

    #[must_use]
    pub fn with_mail_from_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.mail_from_response = SmtpResponse::new(code, message);
        self
    }

    #[must_use]
    pub fn with_rcpt_to_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.rcpt_to_response = SmtpResponse::new(code, message);
        self
    }

    #[must_use]
    pub fn with_data_end_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.data_end_response = SmtpResponse::new(code, message);
        self
    }

    /// Never answer the Nth command (0-indexed)
    #[must_use]
    pub const fn with_hang_on_command(mut self, command_index: usize) -> Self {
        self.config.hang_on_command = Some(command_index);
        self
    }

    /// Close the connection after N commands
    #[must_use]
    pub const fn with_drop_after_commands(mut self, count: usize) -> Self {
        self.config.drop_after_commands = Some(count);
        self
    }

    /// Answer `DATA` with `354`, then stop reading while keeping the socket open
    #[must_use]
    pub const fn with_stall_after_data(mut self) -> Self {
        self.config.stall_after_data = true;
        self
    }

    /// Bind to a random local port and start serving
    ///
    /// # Errors
    ///
    /// Returns an error if the server fails to bind to a port or, with
    /// STARTTLS enabled, to build its certificate
    pub async fn build(self) -> io::Result<MockSmtpServer> {
        let acceptor = if self.config.tls {
            Some(self_signed_acceptor()?)
        } else {
            None
        };

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let config = Arc::new(self.config);
        let shared = Arc::new(Shared::default());
        let shutdown = Arc::new(AtomicBool::new(false));

        let shared_clone = Arc::clone(&shared);
        let shutdown_clone = Arc::clone(&shutdown);

        tokio::spawn(async move {
            loop {
                if shutdown_clone.load(Ordering::Relaxed) {
                    break;
                }

                let accept_result = timeout(Duration::from_millis(100), listener.accept()).await;

                if let Ok(Ok((stream, _peer))) = accept_result {
                    shared_clone.connections.fetch_add(1, Ordering::SeqCst);
                    let config = Arc::clone(&config);
                    let acceptor = acceptor.clone();
                    let shared = Arc::clone(&shared_clone);

                    tokio::spawn(async move {
                        if let Err(e) =
                            MockSmtpServer::handle_client(stream, config, acceptor, shared).await
                        {
                            tracing::debug!("Mock server client error: {}", e);
                        }
                    });
                }
            }
        });

        Ok(MockSmtpServer {
            addr,
            shared,
            shutdown,
        })
    }
}
