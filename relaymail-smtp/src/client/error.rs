//! Error types for the SMTP client.

use std::{io, time::Duration};

use thiserror::Error;

use super::session::SessionState;

/// Broad failure classes used by callers to decide on fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The TCP connection could not be established.
    Connect,
    /// The TLS handshake failed or timed out.
    Tls,
    /// The server replied unexpectedly, stopped replying, or closed the
    /// connection mid-session.
    Protocol,
}

/// Errors that can occur during an SMTP session.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Failed to connect to {address}: {reason}")]
    Connect { address: String, reason: String },

    #[error("TLS error: {0}")]
    Tls(String),

    /// The STARTTLS reply did not begin with 220.
    #[error("STARTTLS not accepted: {0}")]
    StartTlsRejected(String),

    /// A command was answered with a status code other than the expected one.
    #[error("{command} rejected: {code} {message}")]
    Rejected {
        command: String,
        code: u16,
        message: String,
    },

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("Failed to parse SMTP response: {0}")]
    Parse(String),

    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    #[error("{operation} is not valid in state {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("UTF-8 error: {0}")]
    Utf8(#[from] std::str::Utf8Error),
}

impl ClientError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Connect { .. } => ErrorKind::Connect,
            Self::Tls(_) => ErrorKind::Tls,
            Self::StartTlsRejected(_)
            | Self::Rejected { .. }
            | Self::Timeout { .. }
            | Self::Parse(_)
            | Self::ConnectionClosed
            | Self::InvalidState { .. }
            | Self::Io(_)
            | Self::Utf8(_) => ErrorKind::Protocol,
        }
    }

    /// The SMTP reply code, when the failure was a rejected command.
    #[must_use]
    pub const fn code(&self) -> Option<u16> {
        match self {
            Self::Rejected { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// The command that was rejected, if any.
    #[must_use]
    pub fn command(&self) -> Option<&str> {
        match self {
            Self::Rejected { command, .. } => Some(command),
            Self::StartTlsRejected(_) => Some("STARTTLS"),
            _ => None,
        }
    }

    /// `550` on `MAIL FROM`: the relay refused the sender under its policy,
    /// which is not a network fault.
    #[must_use]
    pub fn is_relay_policy_rejection(&self) -> bool {
        matches!(self, Self::Rejected { command, code: 550, .. } if command == "MAIL FROM")
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_policy_rejection() {
        let error = ClientError::Rejected {
            command: "MAIL FROM".to_string(),
            code: 550,
            message: "Sender not authorised".to_string(),
        };
        assert!(error.is_relay_policy_rejection());
        assert_eq!(error.kind(), ErrorKind::Protocol);
        assert_eq!(error.code(), Some(550));
    }

    #[test]
    fn test_other_rejections_are_not_policy() {
        let rcpt = ClientError::Rejected {
            command: "RCPT TO".to_string(),
            code: 550,
            message: "No such user".to_string(),
        };
        assert!(!rcpt.is_relay_policy_rejection());

        let temporary = ClientError::Rejected {
            command: "MAIL FROM".to_string(),
            code: 451,
            message: "Try again".to_string(),
        };
        assert!(!temporary.is_relay_policy_rejection());
    }

    #[test]
    fn test_kinds() {
        let connect = ClientError::Connect {
            address: "127.0.0.1:25".to_string(),
            reason: "refused".to_string(),
        };
        assert_eq!(connect.kind(), ErrorKind::Connect);
        assert_eq!(ClientError::Tls("bad cert".into()).kind(), ErrorKind::Tls);
        assert_eq!(
            ClientError::StartTlsRejected("454 TLS unavailable".into()).to_string(),
            "STARTTLS not accepted: 454 TLS unavailable"
        );
    }
}
