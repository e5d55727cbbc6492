//! SMTP protocol client for submission over an upgradeable connection.
//!
//! A [`SmtpSession`] owns a single logical connection and walks it through an
//! explicit state machine:
//!
//! ```text
//! Disconnected -> Connected -> Greeted -> [TlsNegotiating -> Secured]
//!     -> Authenticated -> EnvelopeSent -> RecipientsAccepted -> MessageSent -> Closed
//! ```
//!
//! Every command is a single round trip: the command line is written with a
//! CRLF terminator, then exactly one reply is read. A reply is buffered until
//! its final line (`250 ` rather than `250-`) arrives, so multi-line EHLO
//! replies and fragmented TCP reads are handled. Each read is bounded by
//! [`ClientTimeouts::read`](relaymail_common::config::ClientTimeouts::read).
//!
//! The plaintext socket moves into the TLS stream at the STARTTLS boundary, so
//! there is only ever one owner to release. [`SmtpSession::close`] shuts it
//! down and is safe to call on a session that never connected.
//!
//! # Example
//!
//! ```no_run
//! use relaymail_common::config::TlsPolicy;
//! use relaymail_smtp::{Credentials, SessionConfig, SmtpSession};
//!
//! # async fn example() -> Result<(), relaymail_smtp::ClientError> {
//! let config = SessionConfig::new("mail.example.com", 587);
//! let mut session = SmtpSession::new(config);
//!
//! let credentials = Credentials::new("noreply@example.com", "secret");
//! let result = async {
//!     session.establish(TlsPolicy::Required, Some(&credentials)).await?;
//!     session.mail_from("noreply@example.com").await
//! }
//! .await;
//!
//! session.quit().await;
//! let reply = result?;
//! assert!(reply.is_success());
//! # Ok(())
//! # }
//! ```

mod connection;
mod credentials;
mod error;
mod response;
mod session;
mod transcript;

pub use credentials::Credentials;
pub use error::{ClientError, ErrorKind, Result};
pub use response::{Response, ResponseLine};
pub use session::{SessionConfig, SessionState, SmtpSession};
pub use transcript::{Direction, Transcript, TranscriptEntry};
